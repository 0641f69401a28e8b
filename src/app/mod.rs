mod config;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use config::AppConfig;
pub use error::AppError;
pub use runtime::SystemClock;

pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        http_workers = ?config.http_workers,
        single_active_rental = config.single_active_rental,
        min_balance_cents = config.min_balance_cents,
        hourly_rate_cents = config.hourly_rate_cents,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
