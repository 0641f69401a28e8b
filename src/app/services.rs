use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, SqliteLedgerTx, StationCountDrift, TableCounts};
use crate::domain::ledger::{Entity, LedgerError};
use crate::domain::models::{
    NewPowerBank, NewStation, NewUser, Payment, PaymentId, PowerBank, PowerBankFilter, PowerBankId,
    PowerBankUpdate, Station, StationId, StationUpdate, User, UserId, UserUpdate,
};
use crate::domain::rental_state::PowerBankTransition;
use crate::domain::store::{LedgerStore, LedgerTx, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
    #[error(transparent)]
    Rejected(#[from] LedgerError),
}

impl ServiceError {
    fn not_found(entity: Entity, id: i64) -> Self {
        Self::Rejected(LedgerError::NotFound { entity, id })
    }

    fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::Rejected(LedgerError::invalid_input(message))
    }

    /// Unique and check constraints surface as caller mistakes.
    fn from_write(error: DbError, message: &str) -> Self {
        if error.is_constraint_violation() {
            Self::invalid_input(message)
        } else {
            Self::Database(error)
        }
    }
}

pub trait DirectoryQueryHandler {
    fn get_user(&self, user_id: UserId) -> Result<Option<User>, ServiceError>;
    fn get_station(&self, station_id: StationId) -> Result<Option<Station>, ServiceError>;
    fn list_stations(&self) -> Result<Vec<Station>, ServiceError>;
    fn get_power_bank(&self, power_bank_id: PowerBankId) -> Result<Option<PowerBank>, ServiceError>;
    fn list_power_banks(&self, filter: &PowerBankFilter) -> Result<Vec<PowerBank>, ServiceError>;
    fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, ServiceError>;
    fn get_schema_version(&self) -> Result<u32, ServiceError>;
    fn count_rows(&self) -> Result<TableCounts, ServiceError>;
    fn find_station_count_drift(&self) -> Result<Vec<StationCountDrift>, ServiceError>;
}

pub trait DirectoryCommandHandler {
    fn register_user(&self, new_user: &NewUser) -> Result<User, ServiceError>;
    fn update_user(&self, user_id: UserId, update: &UserUpdate) -> Result<User, ServiceError>;
    fn top_up_balance(&self, user_id: UserId, amount_cents: i64) -> Result<User, ServiceError>;
    fn create_station(&self, new_station: &NewStation) -> Result<Station, ServiceError>;
    fn update_station(
        &self,
        station_id: StationId,
        update: &StationUpdate,
    ) -> Result<Station, ServiceError>;
    fn create_power_bank(&self, new_power_bank: &NewPowerBank) -> Result<PowerBank, ServiceError>;
    fn update_power_bank(
        &self,
        power_bank_id: PowerBankId,
        update: &PowerBankUpdate,
    ) -> Result<PowerBank, ServiceError>;
    fn set_maintenance(
        &self,
        power_bank_id: PowerBankId,
        enable: bool,
    ) -> Result<PowerBank, ServiceError>;
}

#[derive(Clone)]
pub struct SqliteRentalService {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRentalService {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }

    fn with_transaction<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = op(&transaction)?;
        transaction.commit().map_err(DbError::from)?;
        Ok(value)
    }
}

impl LedgerStore for SqliteRentalService {
    fn transaction<T, E>(&self, op: impl FnOnce(&dyn LedgerTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| StoreError::new("database lock poisoned"))?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::new)?;

        let value = op(&SqliteLedgerTx::new(&transaction))?;

        transaction.commit().map_err(StoreError::new)?;
        Ok(value)
    }
}

impl DirectoryQueryHandler for SqliteRentalService {
    fn get_user(&self, user_id: UserId) -> Result<Option<User>, ServiceError> {
        self.with_connection(|connection| db::get_user(connection, user_id))
    }

    fn get_station(&self, station_id: StationId) -> Result<Option<Station>, ServiceError> {
        self.with_connection(|connection| db::get_station(connection, station_id))
    }

    fn list_stations(&self) -> Result<Vec<Station>, ServiceError> {
        self.with_connection(db::list_stations)
    }

    fn get_power_bank(&self, power_bank_id: PowerBankId) -> Result<Option<PowerBank>, ServiceError> {
        self.with_connection(|connection| db::get_power_bank(connection, power_bank_id))
    }

    fn list_power_banks(&self, filter: &PowerBankFilter) -> Result<Vec<PowerBank>, ServiceError> {
        self.with_connection(|connection| db::list_power_banks(connection, filter))
    }

    fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, ServiceError> {
        self.with_connection(|connection| db::get_payment(connection, payment_id))
    }

    fn get_schema_version(&self) -> Result<u32, ServiceError> {
        self.with_connection(db::schema_version)
    }

    fn count_rows(&self) -> Result<TableCounts, ServiceError> {
        self.with_connection(db::count_rows)
    }

    fn find_station_count_drift(&self) -> Result<Vec<StationCountDrift>, ServiceError> {
        self.with_connection(db::station_count_drift)
    }
}

impl DirectoryCommandHandler for SqliteRentalService {
    fn register_user(&self, new_user: &NewUser) -> Result<User, ServiceError> {
        if new_user.username.trim().is_empty() {
            return Err(ServiceError::invalid_input("username must not be empty"));
        }
        if new_user.email.trim().is_empty() {
            return Err(ServiceError::invalid_input("email must not be empty"));
        }
        if new_user.balance_cents < 0 {
            return Err(ServiceError::invalid_input("initial balance must not be negative"));
        }

        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        db::insert_user(&connection, new_user)
            .map_err(|error| ServiceError::from_write(error, "username or email already taken"))
    }

    fn update_user(&self, user_id: UserId, update: &UserUpdate) -> Result<User, ServiceError> {
        if let Some(email) = &update.email
            && email.trim().is_empty()
        {
            return Err(ServiceError::invalid_input("email must not be empty"));
        }

        self.with_transaction(|transaction| {
            let updated = db::update_user(transaction, user_id, update)
                .map_err(|error| ServiceError::from_write(error, "email already taken"))?;
            if !updated {
                return Err(ServiceError::not_found(Entity::User, user_id));
            }
            db::get_user(transaction, user_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::User, user_id))
        })
    }

    fn top_up_balance(&self, user_id: UserId, amount_cents: i64) -> Result<User, ServiceError> {
        if amount_cents <= 0 {
            return Err(ServiceError::invalid_input("top up amount must be positive"));
        }

        self.with_transaction(|transaction| {
            let user = db::get_user(transaction, user_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::User, user_id))?;
            // SQLite would silently widen an overflowing sum to REAL.
            let Some(balance_cents) = user.balance_cents.checked_add(amount_cents) else {
                return Err(ServiceError::invalid_input(format!(
                    "top up of {amount_cents} cents would overflow the balance"
                )));
            };

            if !db::credit_balance(transaction, user_id, amount_cents)? {
                return Err(ServiceError::not_found(Entity::User, user_id));
            }
            Ok(User {
                balance_cents,
                ..user
            })
        })
    }

    fn create_station(&self, new_station: &NewStation) -> Result<Station, ServiceError> {
        if new_station.name.trim().is_empty() {
            return Err(ServiceError::invalid_input("station name must not be empty"));
        }
        if new_station.capacity == 0 {
            return Err(ServiceError::invalid_input("station capacity must be positive"));
        }

        self.with_connection(|connection| db::insert_station(connection, new_station))
    }

    fn update_station(
        &self,
        station_id: StationId,
        update: &StationUpdate,
    ) -> Result<Station, ServiceError> {
        if let Some(name) = &update.name
            && name.trim().is_empty()
        {
            return Err(ServiceError::invalid_input("station name must not be empty"));
        }

        self.with_transaction(|transaction| {
            if db::get_station(transaction, station_id)?.is_none() {
                return Err(ServiceError::not_found(Entity::Station, station_id));
            }

            if let Some(capacity) = update.capacity {
                let docked = db::count_docked(transaction, station_id)?;
                if capacity == 0 || capacity < docked {
                    return Err(ServiceError::invalid_input(format!(
                        "capacity {capacity} cannot hold the {docked} units docked at station {station_id}"
                    )));
                }
            }

            db::update_station(transaction, station_id, update)?;
            db::get_station(transaction, station_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::Station, station_id))
        })
    }

    fn create_power_bank(&self, new_power_bank: &NewPowerBank) -> Result<PowerBank, ServiceError> {
        if new_power_bank.serial_number.trim().is_empty() {
            return Err(ServiceError::invalid_input("serial number must not be empty"));
        }
        if let (Some(capacity), Some(charge)) =
            (new_power_bank.capacity_mah, new_power_bank.current_charge_mah)
            && charge > capacity
        {
            return Err(ServiceError::invalid_input(format!(
                "charge {charge} mAh exceeds capacity {capacity} mAh"
            )));
        }

        let station_id = new_power_bank.station_id;
        self.with_transaction(|transaction| {
            let station = db::get_station(transaction, station_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::Station, station_id))?;
            if db::count_docked(transaction, station_id)? >= station.capacity {
                return Err(LedgerError::StationFull { station_id }.into());
            }

            let power_bank = db::insert_power_bank(transaction, new_power_bank).map_err(|error| {
                ServiceError::from_write(error, "serial number already registered")
            })?;
            db::adjust_available_count(transaction, station_id, 1)?;

            Ok(power_bank)
        })
    }

    fn update_power_bank(
        &self,
        power_bank_id: PowerBankId,
        update: &PowerBankUpdate,
    ) -> Result<PowerBank, ServiceError> {
        if update.capacity_mah == Some(0) {
            return Err(ServiceError::invalid_input("capacity must be positive"));
        }

        self.with_transaction(|transaction| {
            let power_bank = db::get_power_bank(transaction, power_bank_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::PowerBank, power_bank_id))?;

            let Some(capacity_mah) = update.capacity_mah else {
                return Ok(power_bank);
            };
            if let Some(charge) = power_bank.current_charge_mah
                && charge > capacity_mah
            {
                return Err(ServiceError::invalid_input(format!(
                    "stored charge {charge} mAh exceeds new capacity {capacity_mah} mAh"
                )));
            }

            db::update_power_bank_capacity(transaction, power_bank_id, capacity_mah)?;
            tracing::info!(power_bank_id, capacity_mah, "power bank capacity updated");

            Ok(PowerBank {
                capacity_mah: Some(capacity_mah),
                ..power_bank
            })
        })
    }

    fn set_maintenance(
        &self,
        power_bank_id: PowerBankId,
        enable: bool,
    ) -> Result<PowerBank, ServiceError> {
        let transition = PowerBankTransition::for_maintenance(enable);

        self.with_transaction(|transaction| {
            let power_bank = db::get_power_bank(transaction, power_bank_id)?
                .ok_or_else(|| ServiceError::not_found(Entity::PowerBank, power_bank_id))?;

            if power_bank.status == transition.to_status() {
                return Ok(power_bank);
            }

            let Some(status) = transition.apply(power_bank.status) else {
                return Err(LedgerError::Unavailable {
                    power_bank_id,
                    status: power_bank.status,
                }
                .into());
            };

            if !db::transition_power_bank(transaction, power_bank_id, power_bank.status, status)? {
                return Err(LedgerError::Unavailable {
                    power_bank_id,
                    status: power_bank.status,
                }
                .into());
            }
            db::adjust_available_count(
                transaction,
                power_bank.station_id,
                transition.available_delta(),
            )?;

            tracing::info!(power_bank_id, enable, "power bank maintenance toggled");

            Ok(PowerBank {
                status,
                ..power_bank
            })
        })
    }
}
