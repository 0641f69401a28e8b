use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::models::{
    NewPayment, NewPowerBank, NewRental, NewStation, NewUser, Payment, PaymentId, PaymentStatus,
    PowerBank, PowerBankFilter, PowerBankId, PowerBankStatus, Rental, RentalFilter, RentalId,
    RentalStatus, Station, StationId, StationUpdate, TimestampMs, UnknownStatus, User, UserId,
    UserProfile, UserUpdate,
};
use crate::domain::store::{LedgerTx, StoreError};

pub const LATEST_SCHEMA_VERSION: u32 = 3;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS stations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    location TEXT NOT NULL,
    capacity INTEGER NOT NULL CHECK (capacity >= 0),
    available_count INTEGER NOT NULL DEFAULT 0
        CHECK (available_count >= 0 AND available_count <= capacity),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS power_banks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    station_id INTEGER NOT NULL REFERENCES stations (id),
    serial_number TEXT NOT NULL UNIQUE,
    capacity_mah INTEGER CHECK (capacity_mah IS NULL OR capacity_mah > 0),
    current_charge_mah INTEGER CHECK (current_charge_mah IS NULL OR current_charge_mah >= 0),
    status TEXT NOT NULL CHECK (status IN ('available', 'rented', 'maintenance')),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_power_banks_station_status
ON power_banks (station_id, status);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    balance_cents INTEGER NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rentals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users (id),
    power_bank_id INTEGER NOT NULL REFERENCES power_banks (id),
    start_station_id INTEGER NOT NULL REFERENCES stations (id),
    return_station_id INTEGER REFERENCES stations (id),
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL CHECK (status IN ('active', 'completed')),
    CHECK ((status = 'active') = (ended_at IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_rentals_one_active_per_power_bank
ON rentals (power_bank_id) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_rentals_user_started_at_desc
ON rentals (user_id, started_at DESC);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rental_id INTEGER NOT NULL UNIQUE REFERENCES rentals (id),
    user_id INTEGER NOT NULL REFERENCES users (id),
    amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
    duration_seconds INTEGER NOT NULL CHECK (duration_seconds >= 0),
    reference TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed')),
    created_at TEXT NOT NULL,
    settled_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_payments_user_status
ON payments (user_id, status);
"#,
    ),
    (
        3,
        r#"
ALTER TABLE users ADD COLUMN first_name TEXT;
ALTER TABLE users ADD COLUMN last_name TEXT;
ALTER TABLE users ADD COLUMN phone_number TEXT;
ALTER TABLE users ADD COLUMN address TEXT;
"#,
    ),
];

const STATION_COLUMNS: &str = "id, name, location, capacity, available_count, created_at";
const POWER_BANK_COLUMNS: &str =
    "id, station_id, serial_number, capacity_mah, current_charge_mah, status, created_at";
const USER_COLUMNS: &str = "id, username, email, balance_cents, is_admin, created_at, first_name, last_name, phone_number, address";
const RENTAL_COLUMNS: &str = "id, user_id, power_bank_id, start_station_id, return_station_id, started_at, ended_at, status";
const PAYMENT_COLUMNS: &str = "id, rental_id, user_id, amount_cents, duration_seconds, reference, status, created_at, settled_at";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

impl DbError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(error, _))
                if error.code == ErrorCode::ConstraintViolation
        )
    }
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub users: i64,
    pub stations: i64,
    pub power_banks: i64,
    pub rentals: i64,
    pub active_rentals: i64,
    pub payments: i64,
}

/// A station whose stored counter disagrees with its available units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationCountDrift {
    pub station_id: StationId,
    pub stored: i64,
    pub derived: i64,
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<TimestampMs> {
    let raw: String = row.get(idx)?;
    TimestampMs::parse_iso8601(&raw)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error)))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<TimestampMs>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        TimestampMs::parse_iso8601(&value).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
        })
    })
    .transpose()
}

fn status_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownStatus>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error)))
}

fn station_from_row(row: &Row<'_>) -> rusqlite::Result<Station> {
    Ok(Station {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        capacity: row.get(3)?,
        available_count: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
    })
}

fn power_bank_from_row(row: &Row<'_>) -> rusqlite::Result<PowerBank> {
    Ok(PowerBank {
        id: row.get(0)?,
        station_id: row.get(1)?,
        serial_number: row.get(2)?,
        capacity_mah: row.get(3)?,
        current_charge_mah: row.get(4)?,
        status: status_at(row, 5)?,
        created_at: timestamp_at(row, 6)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        balance_cents: row.get(3)?,
        is_admin: row.get(4)?,
        profile: UserProfile {
            first_name: row.get(6)?,
            last_name: row.get(7)?,
            phone_number: row.get(8)?,
            address: row.get(9)?,
        },
        created_at: timestamp_at(row, 5)?,
    })
}

fn rental_from_row(row: &Row<'_>) -> rusqlite::Result<Rental> {
    Ok(Rental {
        id: row.get(0)?,
        user_id: row.get(1)?,
        power_bank_id: row.get(2)?,
        start_station_id: row.get(3)?,
        return_station_id: row.get(4)?,
        started_at: timestamp_at(row, 5)?,
        ended_at: optional_timestamp_at(row, 6)?,
        status: status_at(row, 7)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        rental_id: row.get(1)?,
        user_id: row.get(2)?,
        amount_cents: row.get(3)?,
        duration_seconds: row.get(4)?,
        reference: row.get(5)?,
        status: status_at(row, 6)?,
        created_at: timestamp_at(row, 7)?,
        settled_at: optional_timestamp_at(row, 8)?,
    })
}

pub fn insert_station(connection: &Connection, new_station: &NewStation) -> Result<Station, DbError> {
    connection.execute(
        "INSERT INTO stations (name, location, capacity, available_count, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
        params![
            new_station.name,
            new_station.location,
            new_station.capacity,
            new_station.created_at.to_iso8601(),
        ],
    )?;

    Ok(Station {
        id: connection.last_insert_rowid(),
        name: new_station.name.clone(),
        location: new_station.location.clone(),
        capacity: new_station.capacity,
        available_count: 0,
        created_at: new_station.created_at,
    })
}

pub fn get_station(connection: &Connection, station_id: StationId) -> Result<Option<Station>, DbError> {
    let station = connection
        .query_row(
            &format!("SELECT {STATION_COLUMNS} FROM stations WHERE id = ?1"),
            params![station_id],
            station_from_row,
        )
        .optional()?;
    Ok(station)
}

pub fn list_stations(connection: &Connection) -> Result<Vec<Station>, DbError> {
    let mut statement =
        connection.prepare(&format!("SELECT {STATION_COLUMNS} FROM stations ORDER BY id"))?;
    let rows = statement.query_map([], station_from_row)?;

    let mut stations = Vec::new();
    for row in rows {
        stations.push(row?);
    }

    Ok(stations)
}

pub fn update_station(
    connection: &Connection,
    station_id: StationId,
    update: &StationUpdate,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE stations
         SET name = COALESCE(?2, name),
             location = COALESCE(?3, location),
             capacity = COALESCE(?4, capacity)
         WHERE id = ?1",
        params![station_id, update.name, update.location, update.capacity],
    )?;
    Ok(changed == 1)
}

pub fn adjust_available_count(
    connection: &Connection,
    station_id: StationId,
    delta: i64,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE stations SET available_count = available_count + ?2 WHERE id = ?1",
        params![station_id, delta],
    )?;
    Ok(changed == 1)
}

pub fn count_docked(connection: &Connection, station_id: StationId) -> Result<u32, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM power_banks WHERE station_id = ?1 AND status != 'rented'",
        params![station_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn insert_power_bank(
    connection: &Connection,
    new_power_bank: &NewPowerBank,
) -> Result<PowerBank, DbError> {
    let status = PowerBankStatus::Available;
    connection.execute(
        "INSERT INTO power_banks (station_id, serial_number, capacity_mah, current_charge_mah, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new_power_bank.station_id,
            new_power_bank.serial_number,
            new_power_bank.capacity_mah,
            new_power_bank.current_charge_mah,
            status.as_str(),
            new_power_bank.created_at.to_iso8601(),
        ],
    )?;

    Ok(PowerBank {
        id: connection.last_insert_rowid(),
        station_id: new_power_bank.station_id,
        serial_number: new_power_bank.serial_number.clone(),
        capacity_mah: new_power_bank.capacity_mah,
        current_charge_mah: new_power_bank.current_charge_mah,
        status,
        created_at: new_power_bank.created_at,
    })
}

pub fn get_power_bank(
    connection: &Connection,
    power_bank_id: PowerBankId,
) -> Result<Option<PowerBank>, DbError> {
    let power_bank = connection
        .query_row(
            &format!("SELECT {POWER_BANK_COLUMNS} FROM power_banks WHERE id = ?1"),
            params![power_bank_id],
            power_bank_from_row,
        )
        .optional()?;
    Ok(power_bank)
}

pub fn list_power_banks(
    connection: &Connection,
    filter: &PowerBankFilter,
) -> Result<Vec<PowerBank>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {POWER_BANK_COLUMNS}
         FROM power_banks
         WHERE (?1 IS NULL OR station_id = ?1)
           AND (?2 IS NULL OR status = ?2)
         ORDER BY id"
    ))?;
    let rows = statement.query_map(
        params![filter.station_id, filter.status.map(PowerBankStatus::as_str)],
        power_bank_from_row,
    )?;

    let mut power_banks = Vec::new();
    for row in rows {
        power_banks.push(row?);
    }

    Ok(power_banks)
}

pub fn transition_power_bank(
    connection: &Connection,
    power_bank_id: PowerBankId,
    from: PowerBankStatus,
    to: PowerBankStatus,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE power_banks SET status = ?3 WHERE id = ?1 AND status = ?2",
        params![power_bank_id, from.as_str(), to.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn update_power_bank_capacity(
    connection: &Connection,
    power_bank_id: PowerBankId,
    capacity_mah: u32,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE power_banks SET capacity_mah = ?2 WHERE id = ?1",
        params![power_bank_id, capacity_mah],
    )?;
    Ok(changed == 1)
}

pub fn relocate_power_bank(
    connection: &Connection,
    power_bank_id: PowerBankId,
    station_id: StationId,
    current_charge_mah: Option<u32>,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE power_banks
         SET station_id = ?2,
             current_charge_mah = COALESCE(?3, current_charge_mah)
         WHERE id = ?1",
        params![power_bank_id, station_id, current_charge_mah],
    )?;
    Ok(changed == 1)
}

pub fn insert_user(connection: &Connection, new_user: &NewUser) -> Result<User, DbError> {
    connection.execute(
        "INSERT INTO users (username, email, balance_cents, is_admin, created_at, first_name, last_name, phone_number, address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            new_user.username,
            new_user.email,
            new_user.balance_cents,
            new_user.is_admin,
            new_user.created_at.to_iso8601(),
            new_user.profile.first_name,
            new_user.profile.last_name,
            new_user.profile.phone_number,
            new_user.profile.address,
        ],
    )?;

    Ok(User {
        id: connection.last_insert_rowid(),
        username: new_user.username.clone(),
        email: new_user.email.clone(),
        balance_cents: new_user.balance_cents,
        is_admin: new_user.is_admin,
        profile: new_user.profile.clone(),
        created_at: new_user.created_at,
    })
}

pub fn get_user(connection: &Connection, user_id: UserId) -> Result<Option<User>, DbError> {
    let user = connection
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn update_user(
    connection: &Connection,
    user_id: UserId,
    update: &UserUpdate,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE users
         SET email = COALESCE(?2, email),
             first_name = COALESCE(?3, first_name),
             last_name = COALESCE(?4, last_name),
             phone_number = COALESCE(?5, phone_number),
             address = COALESCE(?6, address)
         WHERE id = ?1",
        params![
            user_id,
            update.email,
            update.profile.first_name,
            update.profile.last_name,
            update.profile.phone_number,
            update.profile.address,
        ],
    )?;
    Ok(changed == 1)
}

pub fn credit_balance(
    connection: &Connection,
    user_id: UserId,
    amount_cents: i64,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE users SET balance_cents = balance_cents + ?2 WHERE id = ?1",
        params![user_id, amount_cents],
    )?;
    Ok(changed == 1)
}

pub fn debit_balance(
    connection: &Connection,
    user_id: UserId,
    amount_cents: i64,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE users SET balance_cents = balance_cents - ?2 WHERE id = ?1 AND balance_cents >= ?2",
        params![user_id, amount_cents],
    )?;
    Ok(changed == 1)
}

pub fn insert_rental(connection: &Connection, new_rental: &NewRental) -> Result<Rental, DbError> {
    let status = RentalStatus::Active;
    connection.execute(
        "INSERT INTO rentals (user_id, power_bank_id, start_station_id, started_at, status) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            new_rental.user_id,
            new_rental.power_bank_id,
            new_rental.start_station_id,
            new_rental.started_at.to_iso8601(),
            status.as_str(),
        ],
    )?;

    Ok(Rental {
        id: connection.last_insert_rowid(),
        user_id: new_rental.user_id,
        power_bank_id: new_rental.power_bank_id,
        start_station_id: new_rental.start_station_id,
        return_station_id: None,
        started_at: new_rental.started_at,
        ended_at: None,
        status,
    })
}

pub fn get_rental(connection: &Connection, rental_id: RentalId) -> Result<Option<Rental>, DbError> {
    let rental = connection
        .query_row(
            &format!("SELECT {RENTAL_COLUMNS} FROM rentals WHERE id = ?1"),
            params![rental_id],
            rental_from_row,
        )
        .optional()?;
    Ok(rental)
}

pub fn list_rentals(connection: &Connection, filter: &RentalFilter) -> Result<Vec<Rental>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {RENTAL_COLUMNS}
         FROM rentals
         WHERE (?1 IS NULL OR user_id = ?1)
           AND (?2 IS NULL OR status = ?2)
         ORDER BY started_at DESC, id DESC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = statement.query_map(
        params![
            filter.user_id,
            filter.status.map(RentalStatus::as_str),
            i64::from(filter.limit),
            i64::from(filter.offset),
        ],
        rental_from_row,
    )?;

    let mut rentals = Vec::new();
    for row in rows {
        rentals.push(row?);
    }

    Ok(rentals)
}

pub fn count_active_rentals(connection: &Connection, user_id: UserId) -> Result<u32, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM rentals WHERE user_id = ?1 AND status = 'active'",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn complete_rental(
    connection: &Connection,
    rental_id: RentalId,
    return_station_id: StationId,
    ended_at: TimestampMs,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE rentals
         SET status = 'completed', ended_at = ?3, return_station_id = ?2
         WHERE id = ?1 AND status = 'active'",
        params![rental_id, return_station_id, ended_at.to_iso8601()],
    )?;
    Ok(changed == 1)
}

pub fn insert_payment(connection: &Connection, new_payment: &NewPayment) -> Result<Payment, DbError> {
    let status = PaymentStatus::Pending;
    connection.execute(
        "INSERT INTO payments (rental_id, user_id, amount_cents, duration_seconds, reference, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new_payment.rental_id,
            new_payment.user_id,
            new_payment.amount_cents,
            new_payment.duration_seconds,
            new_payment.reference,
            status.as_str(),
            new_payment.created_at.to_iso8601(),
        ],
    )?;

    Ok(Payment {
        id: connection.last_insert_rowid(),
        rental_id: new_payment.rental_id,
        user_id: new_payment.user_id,
        amount_cents: new_payment.amount_cents,
        duration_seconds: new_payment.duration_seconds,
        reference: new_payment.reference.clone(),
        status,
        created_at: new_payment.created_at,
        settled_at: None,
    })
}

pub fn get_payment(connection: &Connection, payment_id: PaymentId) -> Result<Option<Payment>, DbError> {
    let payment = connection
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
            params![payment_id],
            payment_from_row,
        )
        .optional()?;
    Ok(payment)
}

pub fn settle_payment(
    connection: &Connection,
    payment_id: PaymentId,
    settled_at: TimestampMs,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE payments SET status = 'completed', settled_at = ?2 WHERE id = ?1 AND status = 'pending'",
        params![payment_id, settled_at.to_iso8601()],
    )?;
    Ok(changed == 1)
}

pub fn count_rows(connection: &Connection) -> Result<TableCounts, DbError> {
    let counts = connection.query_row(
        "SELECT
            (SELECT COUNT(*) FROM users),
            (SELECT COUNT(*) FROM stations),
            (SELECT COUNT(*) FROM power_banks),
            (SELECT COUNT(*) FROM rentals),
            (SELECT COUNT(*) FROM rentals WHERE status = 'active'),
            (SELECT COUNT(*) FROM payments)",
        [],
        |row| {
            Ok(TableCounts {
                users: row.get(0)?,
                stations: row.get(1)?,
                power_banks: row.get(2)?,
                rentals: row.get(3)?,
                active_rentals: row.get(4)?,
                payments: row.get(5)?,
            })
        },
    )?;
    Ok(counts)
}

pub fn station_count_drift(connection: &Connection) -> Result<Vec<StationCountDrift>, DbError> {
    let mut statement = connection.prepare(
        "SELECT s.id, s.available_count, COUNT(p.id)
         FROM stations s
         LEFT JOIN power_banks p ON p.station_id = s.id AND p.status = 'available'
         GROUP BY s.id, s.available_count
         HAVING s.available_count != COUNT(p.id)
         ORDER BY s.id",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(StationCountDrift {
            station_id: row.get(0)?,
            stored: row.get(1)?,
            derived: row.get(2)?,
        })
    })?;

    let mut drift = Vec::new();
    for row in rows {
        drift.push(row?);
    }

    Ok(drift)
}

/// [`LedgerTx`] over a connection that already has a transaction open.
pub struct SqliteLedgerTx<'a> {
    connection: &'a Connection,
}

impl<'a> SqliteLedgerTx<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }
}

impl LedgerTx for SqliteLedgerTx<'_> {
    fn user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        get_user(self.connection, user_id).map_err(StoreError::new)
    }

    fn station(&self, station_id: StationId) -> Result<Option<Station>, StoreError> {
        get_station(self.connection, station_id).map_err(StoreError::new)
    }

    fn power_bank(&self, power_bank_id: PowerBankId) -> Result<Option<PowerBank>, StoreError> {
        get_power_bank(self.connection, power_bank_id).map_err(StoreError::new)
    }

    fn rental(&self, rental_id: RentalId) -> Result<Option<Rental>, StoreError> {
        get_rental(self.connection, rental_id).map_err(StoreError::new)
    }

    fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError> {
        get_payment(self.connection, payment_id).map_err(StoreError::new)
    }

    fn rentals(&self, filter: &RentalFilter) -> Result<Vec<Rental>, StoreError> {
        list_rentals(self.connection, filter).map_err(StoreError::new)
    }

    fn count_active_rentals(&self, user_id: UserId) -> Result<u32, StoreError> {
        count_active_rentals(self.connection, user_id).map_err(StoreError::new)
    }

    fn count_docked(&self, station_id: StationId) -> Result<u32, StoreError> {
        count_docked(self.connection, station_id).map_err(StoreError::new)
    }

    fn transition_power_bank(
        &self,
        power_bank_id: PowerBankId,
        from: PowerBankStatus,
        to: PowerBankStatus,
    ) -> Result<bool, StoreError> {
        transition_power_bank(self.connection, power_bank_id, from, to).map_err(StoreError::new)
    }

    fn relocate_power_bank(
        &self,
        power_bank_id: PowerBankId,
        station_id: StationId,
        current_charge_mah: Option<u32>,
    ) -> Result<(), StoreError> {
        let moved =
            relocate_power_bank(self.connection, power_bank_id, station_id, current_charge_mah)
                .map_err(StoreError::new)?;
        if !moved {
            return Err(StoreError::new(format!(
                "power bank {power_bank_id} vanished during relocation"
            )));
        }
        Ok(())
    }

    fn adjust_available_count(&self, station_id: StationId, delta: i64) -> Result<(), StoreError> {
        let adjusted =
            adjust_available_count(self.connection, station_id, delta).map_err(StoreError::new)?;
        if !adjusted {
            return Err(StoreError::new(format!(
                "station {station_id} vanished while adjusting availability"
            )));
        }
        Ok(())
    }

    fn insert_rental(&self, new_rental: &NewRental) -> Result<Rental, StoreError> {
        insert_rental(self.connection, new_rental).map_err(StoreError::new)
    }

    fn complete_rental(
        &self,
        rental_id: RentalId,
        return_station_id: StationId,
        ended_at: TimestampMs,
    ) -> Result<bool, StoreError> {
        complete_rental(self.connection, rental_id, return_station_id, ended_at)
            .map_err(StoreError::new)
    }

    fn insert_payment(&self, new_payment: &NewPayment) -> Result<Payment, StoreError> {
        insert_payment(self.connection, new_payment).map_err(StoreError::new)
    }

    fn debit_balance(&self, user_id: UserId, amount_cents: i64) -> Result<bool, StoreError> {
        debit_balance(self.connection, user_id, amount_cents).map_err(StoreError::new)
    }

    fn settle_payment(
        &self,
        payment_id: PaymentId,
        settled_at: TimestampMs,
    ) -> Result<bool, StoreError> {
        settle_payment(self.connection, payment_id, settled_at).map_err(StoreError::new)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rusqlite::params;

    use super::{
        LATEST_SCHEMA_VERSION, MIGRATIONS, StationCountDrift, adjust_available_count, get_rental,
        get_user, insert_power_bank, insert_rental, insert_station, insert_user, list_power_banks,
        list_rentals, open_connection, run_migrations, schema_version, station_count_drift,
        transition_power_bank,
    };
    use crate::domain::models::{
        NewPowerBank, NewRental, NewStation, NewUser, PowerBankFilter, PowerBankStatus,
        RentalFilter, RentalStatus, TimestampMs, UserProfile,
    };

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    fn migrated_connection(name: &str) -> rusqlite::Connection {
        let db_path = temp_db_path(name);
        let mut connection =
            open_connection(db_path.to_string_lossy().as_ref()).expect("db connection should open");
        run_migrations(&mut connection).expect("migrations should succeed");
        connection
    }

    fn new_station(name: &str, capacity: u32) -> NewStation {
        NewStation {
            name: name.to_string(),
            location: format!("{name} street"),
            capacity,
            created_at: TimestampMs(1_700_000_000_000),
        }
    }

    fn new_power_bank(station_id: i64, serial_number: &str) -> NewPowerBank {
        NewPowerBank {
            station_id,
            serial_number: serial_number.to_string(),
            capacity_mah: Some(10_000),
            current_charge_mah: None,
            created_at: TimestampMs(1_700_000_000_000),
        }
    }

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            balance_cents: 0,
            is_admin: false,
            profile: UserProfile::default(),
            created_at: TimestampMs(1_700_000_000_000),
        }
    }

    #[test]
    fn migrates_fresh_database_to_latest_version() {
        let connection = migrated_connection("fresh.sqlite");

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);

        for table in ["stations", "power_banks", "users", "rentals", "payments"] {
            let table_exists: i64 = connection
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .expect("table check should work");
            assert_eq!(table_exists, 1, "table {table} should exist");
        }

        let index_exists: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='idx_rentals_one_active_per_power_bank'",
                [],
                |row| row.get(0),
            )
            .expect("rentals index check should work");
        assert_eq!(index_exists, 1);
    }

    #[test]
    fn upgrades_version_two_users_with_empty_profiles() {
        let db_path = temp_db_path("upgrade-v2.sqlite");
        let mut connection =
            open_connection(db_path.to_string_lossy().as_ref()).expect("db connection should open");
        for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version <= 2) {
            connection.execute_batch(sql).expect("old migration should apply");
            connection
                .pragma_update(None, "user_version", version)
                .expect("version should be set");
        }
        connection
            .execute(
                "INSERT INTO users (username, email, balance_cents, is_admin, created_at)
                 VALUES ('alice', 'alice@example.com', 250, 0, '2023-11-14T22:13:20.000Z')",
                [],
            )
            .expect("legacy user insert");
        let user_id = connection.last_insert_rowid();

        run_migrations(&mut connection).expect("upgrade should succeed");

        assert_eq!(
            schema_version(&connection).expect("schema version should be queryable"),
            LATEST_SCHEMA_VERSION
        );
        let user = get_user(&connection, user_id)
            .expect("query should succeed")
            .expect("user should survive the upgrade");
        assert_eq!(user.balance_cents, 250);
        assert_eq!(user.profile, UserProfile::default());
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut connection = migrated_connection("idempotent.sqlite");

        run_migrations(&mut connection).expect("second migration run should succeed");

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn keeps_existing_data_when_migrations_rerun() {
        let mut connection = migrated_connection("rerun.sqlite");
        insert_station(&connection, &new_station("Central", 4)).expect("insert should succeed");

        run_migrations(&mut connection).expect("second migration run should succeed");

        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM stations", [], |row| row.get(0))
            .expect("count query should succeed");
        assert_eq!(count, 1);
    }

    #[test]
    fn rejects_newer_schema_versions() {
        let mut connection = migrated_connection("newer.sqlite");
        connection
            .pragma_update(None, "user_version", LATEST_SCHEMA_VERSION + 1)
            .expect("pragma update should succeed");

        let err = run_migrations(&mut connection).expect_err("newer schema should be rejected");
        assert_eq!(
            err.to_string(),
            format!(
                "unsupported schema version {}; latest supported is {LATEST_SCHEMA_VERSION}",
                LATEST_SCHEMA_VERSION + 1
            )
        );
    }

    #[test]
    fn second_active_rental_for_same_unit_violates_index() {
        let connection = migrated_connection("one-active.sqlite");
        let station = insert_station(&connection, &new_station("Central", 4))
            .expect("station insert should succeed");
        let power_bank = insert_power_bank(&connection, &new_power_bank(station.id, "PB-1"))
            .expect("power bank insert should succeed");
        let alice = insert_user(&connection, &new_user("alice")).expect("user insert");
        let bob = insert_user(&connection, &new_user("bob")).expect("user insert");

        let rental = NewRental {
            user_id: alice.id,
            power_bank_id: power_bank.id,
            start_station_id: station.id,
            started_at: TimestampMs(1_700_000_000_000),
        };
        insert_rental(&connection, &rental).expect("first active rental should insert");

        let err = insert_rental(
            &connection,
            &NewRental {
                user_id: bob.id,
                ..rental
            },
        )
        .expect_err("second active rental should be rejected");
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn station_counter_cannot_leave_capacity_bounds() {
        let connection = migrated_connection("counter-bounds.sqlite");
        let station = insert_station(&connection, &new_station("Central", 1))
            .expect("station insert should succeed");

        let err = adjust_available_count(&connection, station.id, -1)
            .expect_err("negative counter should be rejected");
        assert!(err.is_constraint_violation());

        assert!(adjust_available_count(&connection, station.id, 1).expect("increment"));
        let err = adjust_available_count(&connection, station.id, 1)
            .expect_err("counter above capacity should be rejected");
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn status_transition_is_compare_and_swap() {
        let connection = migrated_connection("cas.sqlite");
        let station = insert_station(&connection, &new_station("Central", 2))
            .expect("station insert should succeed");
        let power_bank = insert_power_bank(&connection, &new_power_bank(station.id, "PB-1"))
            .expect("power bank insert should succeed");

        assert!(
            transition_power_bank(
                &connection,
                power_bank.id,
                PowerBankStatus::Available,
                PowerBankStatus::Rented
            )
            .expect("transition should run")
        );
        assert!(
            !transition_power_bank(
                &connection,
                power_bank.id,
                PowerBankStatus::Available,
                PowerBankStatus::Rented
            )
            .expect("transition should run")
        );
    }

    #[test]
    fn lists_power_banks_by_station_and_status() {
        let connection = migrated_connection("list-power-banks.sqlite");
        let north = insert_station(&connection, &new_station("North", 4)).expect("insert");
        let south = insert_station(&connection, &new_station("South", 4)).expect("insert");
        let first = insert_power_bank(&connection, &new_power_bank(north.id, "PB-1")).expect("insert");
        insert_power_bank(&connection, &new_power_bank(north.id, "PB-2")).expect("insert");
        insert_power_bank(&connection, &new_power_bank(south.id, "PB-3")).expect("insert");
        transition_power_bank(
            &connection,
            first.id,
            PowerBankStatus::Available,
            PowerBankStatus::Maintenance,
        )
        .expect("transition should run");

        let at_north = list_power_banks(
            &connection,
            &PowerBankFilter {
                station_id: Some(north.id),
                status: None,
            },
        )
        .expect("query should succeed");
        assert_eq!(at_north.len(), 2);

        let available_north = list_power_banks(
            &connection,
            &PowerBankFilter {
                station_id: Some(north.id),
                status: Some(PowerBankStatus::Available),
            },
        )
        .expect("query should succeed");
        assert_eq!(available_north.len(), 1);
        assert_eq!(available_north[0].serial_number, "PB-2");

        let everything =
            list_power_banks(&connection, &PowerBankFilter::default()).expect("query");
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn lists_rentals_newest_first_with_limit_and_offset() {
        let connection = migrated_connection("list-rentals.sqlite");
        let station = insert_station(&connection, &new_station("Central", 4)).expect("insert");
        let user = insert_user(&connection, &new_user("alice")).expect("insert");

        let mut ids = Vec::new();
        for idx in 0..3 {
            let power_bank = insert_power_bank(
                &connection,
                &new_power_bank(station.id, &format!("PB-{idx}")),
            )
            .expect("insert");
            let rental = insert_rental(
                &connection,
                &NewRental {
                    user_id: user.id,
                    power_bank_id: power_bank.id,
                    start_station_id: station.id,
                    started_at: TimestampMs(1_700_000_000_000 + idx * 60_000),
                },
            )
            .expect("insert");
            ids.push(rental.id);
        }

        let page = list_rentals(
            &connection,
            &RentalFilter {
                user_id: Some(user.id),
                status: Some(RentalStatus::Active),
                limit: 2,
                offset: 1,
            },
        )
        .expect("query should succeed");

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[1]);
        assert_eq!(page[1].id, ids[0]);

        let stored = get_rental(&connection, ids[2])
            .expect("query should succeed")
            .expect("rental should exist");
        assert_eq!(stored.started_at, TimestampMs(1_700_000_120_000));
        assert_eq!(stored.ended_at, None);
    }

    #[test]
    fn detects_station_counter_drift() {
        let connection = migrated_connection("drift.sqlite");
        let station = insert_station(&connection, &new_station("Central", 4)).expect("insert");
        insert_power_bank(&connection, &new_power_bank(station.id, "PB-1")).expect("insert");

        let drift = station_count_drift(&connection).expect("query should succeed");
        assert_eq!(
            drift,
            vec![StationCountDrift {
                station_id: station.id,
                stored: 0,
                derived: 1,
            }]
        );

        adjust_available_count(&connection, station.id, 1).expect("adjust should succeed");
        assert!(station_count_drift(&connection).expect("query").is_empty());
    }
}
