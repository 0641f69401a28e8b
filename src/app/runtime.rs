use std::path::Path;
use std::sync::{Arc, Mutex};

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use chrono::Utc;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations, schema_version};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::services::SqliteRentalService;
use crate::domain::ledger::RentalLedger;
use crate::domain::models::TimestampMs;
use crate::domain::rental_state::Clock;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    if let Some(parent) = Path::new(&config.db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(AppError::database_init)?;
    }

    let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;
    let version = schema_version(&connection).map_err(AppError::database_init)?;
    tracing::info!(db_path = %config.db_path, schema_version = version, "database ready");

    let service = SqliteRentalService::new(Arc::new(Mutex::new(connection)));
    let ledger = RentalLedger::new(
        service.clone(),
        SystemClock,
        config.rental_policy(),
        config.pricing(),
    );
    let api_state = ApiState { service, ledger };

    tracing::info!(bind = %config.http_bind, "http server starting");

    let bind = config.http_bind.clone();
    let workers = config.http_workers;
    let server_result = actix_web::rt::System::new().block_on(async move {
        let server = HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .wrap(middleware::Logger::default())
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        });
        let server = match workers {
            Some(workers) => server.workers(workers),
            None => server,
        };

        server.bind(&bind)?.run().await
    });

    server_result.map_err(AppError::runtime)
}

#[cfg(test)]
mod tests {
    use super::SystemClock;
    use crate::domain::rental_state::Clock;

    #[test]
    fn system_clock_reports_current_epoch_millis() {
        let before = chrono::Utc::now().timestamp_millis();
        let now = SystemClock.now();
        let after = chrono::Utc::now().timestamp_millis();

        assert!(now.0 >= before);
        assert!(now.0 <= after);
    }
}
