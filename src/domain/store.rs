//! Storage capabilities the rental ledger needs.
//!
//! A [`LedgerStore`] hands out a [`LedgerTx`] for the duration of one
//! transaction. Everything done through the handle commits together when the
//! closure returns `Ok`, and is discarded when it returns `Err`.

use thiserror::Error;

use crate::domain::models::{
    NewPayment, NewRental, Payment, PaymentId, PowerBank, PowerBankId, PowerBankStatus, Rental,
    RentalFilter, RentalId, Station, StationId, TimestampMs, User, UserId,
};

#[derive(Debug, Error)]
#[error("storage failure: {0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new<E: std::fmt::Display>(error: E) -> Self {
        Self(error.to_string())
    }
}

pub trait LedgerTx {
    fn user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;
    fn station(&self, station_id: StationId) -> Result<Option<Station>, StoreError>;
    fn power_bank(&self, power_bank_id: PowerBankId) -> Result<Option<PowerBank>, StoreError>;
    fn rental(&self, rental_id: RentalId) -> Result<Option<Rental>, StoreError>;
    fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>, StoreError>;
    fn rentals(&self, filter: &RentalFilter) -> Result<Vec<Rental>, StoreError>;

    fn count_active_rentals(&self, user_id: UserId) -> Result<u32, StoreError>;
    /// Units physically at the station, i.e. not out on rental.
    fn count_docked(&self, station_id: StationId) -> Result<u32, StoreError>;

    /// Compare-and-swap on the power bank status. Returns `false` without
    /// writing when the stored status is not `from`.
    fn transition_power_bank(
        &self,
        power_bank_id: PowerBankId,
        from: PowerBankStatus,
        to: PowerBankStatus,
    ) -> Result<bool, StoreError>;
    fn relocate_power_bank(
        &self,
        power_bank_id: PowerBankId,
        station_id: StationId,
        current_charge_mah: Option<u32>,
    ) -> Result<(), StoreError>;
    fn adjust_available_count(&self, station_id: StationId, delta: i64) -> Result<(), StoreError>;

    fn insert_rental(&self, new_rental: &NewRental) -> Result<Rental, StoreError>;
    /// Marks an active rental completed. Returns `false` when it was not active.
    fn complete_rental(
        &self,
        rental_id: RentalId,
        return_station_id: StationId,
        ended_at: TimestampMs,
    ) -> Result<bool, StoreError>;

    fn insert_payment(&self, new_payment: &NewPayment) -> Result<Payment, StoreError>;
    /// Debits only when the balance covers the amount.
    fn debit_balance(&self, user_id: UserId, amount_cents: i64) -> Result<bool, StoreError>;
    fn settle_payment(
        &self,
        payment_id: PaymentId,
        settled_at: TimestampMs,
    ) -> Result<bool, StoreError>;
}

pub trait LedgerStore {
    fn transaction<T, E>(&self, op: impl FnOnce(&dyn LedgerTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;
}
