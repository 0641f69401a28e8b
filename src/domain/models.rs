use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type UserId = i64;
pub type StationId = i64;
pub type PowerBankId = i64;
pub type RentalId = i64;
pub type PaymentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn to_iso8601(self) -> String {
        let datetime = DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse_iso8601(value: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(value).map(|datetime| Self(datetime.timestamp_millis()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerBankStatus {
    Available,
    Rented,
    Maintenance,
}

impl PowerBankStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Rented => "rented",
            Self::Maintenance => "maintenance",
        }
    }
}

impl FromStr for PowerBankStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "available" => Ok(Self::Available),
            "rented" => Ok(Self::Rented),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(UnknownStatus {
                kind: "power bank",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PowerBankStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RentalStatus {
    Active,
    Completed,
}

impl RentalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for RentalStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(UnknownStatus {
                kind: "rental",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(UnknownStatus {
                kind: "payment",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub location: String,
    pub capacity: u32,
    pub available_count: u32,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStation {
    pub name: String,
    pub location: String,
    pub capacity: u32,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationUpdate {
    pub name: Option<String>,
    pub location: Option<String>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerBank {
    pub id: PowerBankId,
    pub station_id: StationId,
    pub serial_number: String,
    pub capacity_mah: Option<u32>,
    pub current_charge_mah: Option<u32>,
    pub status: PowerBankStatus,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPowerBank {
    pub station_id: StationId,
    pub serial_number: String,
    pub capacity_mah: Option<u32>,
    pub current_charge_mah: Option<u32>,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerBankFilter {
    pub station_id: Option<StationId>,
    pub status: Option<PowerBankStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerBankUpdate {
    pub capacity_mah: Option<u32>,
}

/// Optional contact details kept alongside an account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub balance_cents: i64,
    pub is_admin: bool,
    pub profile: UserProfile,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub balance_cents: i64,
    pub is_admin: bool,
    pub profile: UserProfile,
    pub created_at: TimestampMs,
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub profile: UserProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rental {
    pub id: RentalId,
    pub user_id: UserId,
    pub power_bank_id: PowerBankId,
    pub start_station_id: StationId,
    pub return_station_id: Option<StationId>,
    pub started_at: TimestampMs,
    pub ended_at: Option<TimestampMs>,
    pub status: RentalStatus,
}

impl Rental {
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|ended_at| ended_at.0 - self.started_at.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRental {
    pub user_id: UserId,
    pub power_bank_id: PowerBankId,
    pub start_station_id: StationId,
    pub started_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalFilter {
    pub user_id: Option<UserId>,
    pub status: Option<RentalStatus>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: PaymentId,
    pub rental_id: RentalId,
    pub user_id: UserId,
    pub amount_cents: i64,
    pub duration_seconds: i64,
    pub reference: String,
    pub status: PaymentStatus,
    pub created_at: TimestampMs,
    pub settled_at: Option<TimestampMs>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub rental_id: RentalId,
    pub user_id: UserId,
    pub amount_cents: i64,
    pub duration_seconds: i64,
    pub reference: String,
    pub created_at: TimestampMs,
}

#[cfg(test)]
mod tests {
    use super::{PowerBankStatus, RentalStatus, TimestampMs};

    #[test]
    fn formats_timestamps_as_utc_millis() {
        assert_eq!(
            TimestampMs(1_700_000_000_000).to_iso8601(),
            "2023-11-14T22:13:20.000Z"
        );
    }

    #[test]
    fn parses_formatted_timestamps_back() {
        let parsed = TimestampMs::parse_iso8601("2023-11-14T22:13:20.125Z")
            .expect("timestamp should parse");
        assert_eq!(parsed, TimestampMs(1_700_000_000_125));
    }

    #[test]
    fn rejects_unknown_status_strings() {
        let err = "lost".parse::<PowerBankStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown power bank status: lost");
        assert!("Active".parse::<RentalStatus>().is_err());
    }
}
