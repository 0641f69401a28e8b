use crate::app::AppError;
use crate::domain::ledger::RentalPolicy;
use crate::domain::pricing::HourlyRate;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub http_bind: String,
    pub http_workers: Option<usize>,
    pub single_active_rental: bool,
    pub min_balance_cents: i64,
    pub hourly_rate_cents: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_workers = match non_empty(&lookup, "HTTP_WORKERS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(AppError::config("HTTP_WORKERS must be a positive number"));
                }
                Ok(workers) => Some(workers),
            },
            None => None,
        };

        let min_balance_cents = parse_or_default(&lookup, "MIN_BALANCE_CENTS", 0_i64)?;
        if min_balance_cents < 0 {
            return Err(AppError::config("MIN_BALANCE_CENTS must not be negative"));
        }

        let hourly_rate_cents = parse_or_default(&lookup, "HOURLY_RATE_CENTS", 100_i64)?;
        if hourly_rate_cents < 0 {
            return Err(AppError::config("HOURLY_RATE_CENTS must not be negative"));
        }

        Ok(Self {
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "./data/powerbank.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            http_workers,
            single_active_rental: parse_flag(&lookup, "SINGLE_ACTIVE_RENTAL", true)?,
            min_balance_cents,
            hourly_rate_cents,
        })
    }

    pub fn rental_policy(&self) -> RentalPolicy {
        RentalPolicy {
            single_active_rental: self.single_active_rental,
            minimum_balance_cents: self.min_balance_cents,
        }
    }

    pub fn pricing(&self) -> Option<HourlyRate> {
        HourlyRate::new(self.hourly_rate_cents)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::config(format!("{key} must be true or false"))),
        },
        None => Ok(default),
    }
}
