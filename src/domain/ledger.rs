//! Rental ledger: the only place that moves power banks between `Available`
//! and `Rented`.
//!
//! Every operation runs inside one [`LedgerStore::transaction`], so the power
//! bank, the rental, the station counter and any payment either all change or
//! none do. Status flips are compare-and-swap writes; losing a race surfaces
//! as [`LedgerError::Unavailable`] rather than a double rental.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{
    NewPayment, NewRental, Payment, PaymentId, PaymentStatus, PowerBankId, PowerBankStatus,
    Rental, RentalFilter, RentalId, RentalStatus, StationId, UserId,
};
use crate::domain::pricing::HourlyRate;
use crate::domain::rental_state::{Clock, PowerBankTransition, completion_time};
use crate::domain::store::{LedgerStore, StoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Station,
    PowerBank,
    Rental,
    Payment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Station => "station",
            Self::PowerBank => "power bank",
            Self::Rental => "rental",
            Self::Payment => "payment",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Forbidden,
    NotActive,
    InsufficientFunds,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Forbidden => "forbidden",
            Self::NotActive => "not_active",
            Self::InsufficientFunds => "insufficient_funds",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },
    #[error("power bank {power_bank_id} is not available (status: {status})")]
    Unavailable {
        power_bank_id: PowerBankId,
        status: PowerBankStatus,
    },
    #[error("station {station_id} has no free slot")]
    StationFull { station_id: StationId },
    #[error("user {user_id} already has an active rental")]
    ActiveRentalLimit { user_id: UserId },
    #[error("{entity} {id} does not belong to user {user_id}")]
    Forbidden {
        entity: Entity,
        id: i64,
        user_id: UserId,
    },
    #[error("rental {rental_id} is not active")]
    NotActive { rental_id: RentalId },
    #[error("payment {payment_id} is already settled")]
    AlreadySettled { payment_id: PaymentId },
    #[error("insufficient funds: {required_cents} cents required, {available_cents} available")]
    InsufficientFunds {
        required_cents: i64,
        available_cents: i64,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn invalid_input<E: fmt::Display>(message: E) -> Self {
        Self::InvalidInput(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unavailable { .. } | Self::StationFull { .. } | Self::ActiveRentalLimit { .. } => {
                ErrorKind::Unavailable
            }
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::NotActive { .. } | Self::AlreadySettled { .. } => ErrorKind::NotActive,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalPolicy {
    /// Reject a new rental while the user still holds an active one.
    pub single_active_rental: bool,
    /// Balance a user must hold to start a rental. Not debited.
    pub minimum_balance_cents: i64,
}

impl Default for RentalPolicy {
    fn default() -> Self {
        Self {
            single_active_rental: true,
            minimum_balance_cents: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnRequest {
    pub rental_id: RentalId,
    pub user_id: UserId,
    pub return_station_id: Option<StationId>,
    pub current_charge_mah: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnReceipt {
    pub rental: Rental,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone)]
pub struct RentalLedger<S, C> {
    store: S,
    clock: C,
    policy: RentalPolicy,
    pricing: Option<HourlyRate>,
}

impl<S, C> RentalLedger<S, C>
where
    S: LedgerStore,
    C: Clock,
{
    pub fn new(store: S, clock: C, policy: RentalPolicy, pricing: Option<HourlyRate>) -> Self {
        Self {
            store,
            clock,
            policy,
            pricing,
        }
    }

    pub fn policy(&self) -> RentalPolicy {
        self.policy
    }

    pub fn start_rental(
        &self,
        user_id: UserId,
        power_bank_id: PowerBankId,
    ) -> Result<Rental, LedgerError> {
        let started_at = self.clock.now();
        let policy = self.policy;
        let transition = PowerBankTransition::Rent;

        let rental = self.store.transaction(|tx| -> Result<Rental, LedgerError> {
            let power_bank = tx.power_bank(power_bank_id)?.ok_or(LedgerError::NotFound {
                entity: Entity::PowerBank,
                id: power_bank_id,
            })?;
            if transition.apply(power_bank.status).is_none() {
                return Err(LedgerError::Unavailable {
                    power_bank_id,
                    status: power_bank.status,
                });
            }

            let user = tx.user(user_id)?.ok_or(LedgerError::NotFound {
                entity: Entity::User,
                id: user_id,
            })?;
            if policy.single_active_rental && tx.count_active_rentals(user_id)? > 0 {
                return Err(LedgerError::ActiveRentalLimit { user_id });
            }
            if user.balance_cents < policy.minimum_balance_cents {
                return Err(LedgerError::InsufficientFunds {
                    required_cents: policy.minimum_balance_cents,
                    available_cents: user.balance_cents,
                });
            }

            if !tx.transition_power_bank(
                power_bank_id,
                transition.from_status(),
                transition.to_status(),
            )? {
                let status = tx
                    .power_bank(power_bank_id)?
                    .map_or(PowerBankStatus::Rented, |current| current.status);
                return Err(LedgerError::Unavailable {
                    power_bank_id,
                    status,
                });
            }
            tx.adjust_available_count(power_bank.station_id, transition.available_delta())?;

            let rental = tx.insert_rental(&NewRental {
                user_id,
                power_bank_id,
                start_station_id: power_bank.station_id,
                started_at,
            })?;
            Ok(rental)
        })?;

        tracing::info!(
            rental_id = rental.id,
            user_id,
            power_bank_id,
            station_id = rental.start_station_id,
            started_at = %rental.started_at.to_iso8601(),
            "rental started"
        );

        Ok(rental)
    }

    pub fn return_rental(&self, request: &ReturnRequest) -> Result<ReturnReceipt, LedgerError> {
        let now = self.clock.now();
        let pricing = self.pricing;
        let transition = PowerBankTransition::Return;

        let receipt = self.store.transaction(|tx| -> Result<ReturnReceipt, LedgerError> {
            let rental = tx.rental(request.rental_id)?.ok_or(LedgerError::NotFound {
                entity: Entity::Rental,
                id: request.rental_id,
            })?;
            if rental.user_id != request.user_id {
                return Err(LedgerError::Forbidden {
                    entity: Entity::Rental,
                    id: rental.id,
                    user_id: request.user_id,
                });
            }
            let ended_at = completion_time(&rental, now).ok_or(LedgerError::NotActive {
                rental_id: rental.id,
            })?;

            let power_bank = tx.power_bank(rental.power_bank_id)?.ok_or(LedgerError::NotFound {
                entity: Entity::PowerBank,
                id: rental.power_bank_id,
            })?;
            if let (Some(charge), Some(capacity)) =
                (request.current_charge_mah, power_bank.capacity_mah)
                && charge > capacity
            {
                return Err(LedgerError::invalid_input(format!(
                    "current charge {charge} mAh exceeds capacity {capacity} mAh"
                )));
            }

            let destination = request.return_station_id.unwrap_or(power_bank.station_id);
            let station = tx.station(destination)?.ok_or(LedgerError::NotFound {
                entity: Entity::Station,
                id: destination,
            })?;
            if tx.count_docked(destination)? >= station.capacity {
                return Err(LedgerError::StationFull {
                    station_id: destination,
                });
            }

            if !tx.complete_rental(rental.id, destination, ended_at)? {
                return Err(LedgerError::NotActive {
                    rental_id: rental.id,
                });
            }
            if !tx.transition_power_bank(
                power_bank.id,
                transition.from_status(),
                transition.to_status(),
            )? {
                return Err(LedgerError::Unavailable {
                    power_bank_id: power_bank.id,
                    status: power_bank.status,
                });
            }
            tx.relocate_power_bank(power_bank.id, destination, request.current_charge_mah)?;
            tx.adjust_available_count(destination, transition.available_delta())?;

            let rental = Rental {
                return_station_id: Some(destination),
                ended_at: Some(ended_at),
                status: RentalStatus::Completed,
                ..rental
            };

            let payment = match pricing {
                Some(rate) => {
                    let quote = rate.quote(ended_at.0 - rental.started_at.0);
                    Some(tx.insert_payment(&NewPayment {
                        rental_id: rental.id,
                        user_id: rental.user_id,
                        amount_cents: quote.amount_cents,
                        duration_seconds: quote.duration_seconds,
                        reference: Uuid::new_v4().to_string(),
                        created_at: ended_at,
                    })?)
                }
                None => None,
            };

            Ok(ReturnReceipt { rental, payment })
        })?;

        tracing::info!(
            rental_id = receipt.rental.id,
            user_id = receipt.rental.user_id,
            power_bank_id = receipt.rental.power_bank_id,
            return_station_id = receipt.rental.return_station_id,
            duration_ms = receipt.rental.duration_ms(),
            amount_cents = receipt.payment.as_ref().map(|payment| payment.amount_cents),
            "rental returned"
        );

        Ok(receipt)
    }

    /// Reads a rental regardless of owner. Callers enforce access.
    pub fn find_rental(&self, rental_id: RentalId) -> Result<Rental, LedgerError> {
        self.store
            .transaction(|tx| tx.rental(rental_id).map_err(LedgerError::from))?
            .ok_or(LedgerError::NotFound {
                entity: Entity::Rental,
                id: rental_id,
            })
    }

    pub fn get_rental(&self, rental_id: RentalId, user_id: UserId) -> Result<Rental, LedgerError> {
        let rental = self.find_rental(rental_id)?;

        if rental.user_id != user_id {
            return Err(LedgerError::Forbidden {
                entity: Entity::Rental,
                id: rental_id,
                user_id,
            });
        }

        Ok(rental)
    }

    /// Newest first. Re-issuing the same call walks the same pages again.
    pub fn list_rentals(
        &self,
        user_id: UserId,
        status: Option<RentalStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Rental>, LedgerError> {
        self.query_rentals(Some(user_id), status, limit, offset)
    }

    /// Like [`Self::list_rentals`] but across users when `user_id` is `None`.
    pub fn query_rentals(
        &self,
        user_id: Option<UserId>,
        status: Option<RentalStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Rental>, LedgerError> {
        let filter = RentalFilter {
            user_id,
            status,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
            offset,
        };

        self.store
            .transaction(|tx| tx.rentals(&filter).map_err(LedgerError::from))
    }

    pub fn settle_payment(
        &self,
        payment_id: PaymentId,
        user_id: UserId,
    ) -> Result<Payment, LedgerError> {
        let settled_at = self.clock.now();

        let payment = self.store.transaction(|tx| -> Result<Payment, LedgerError> {
            let payment = tx.payment(payment_id)?.ok_or(LedgerError::NotFound {
                entity: Entity::Payment,
                id: payment_id,
            })?;
            if payment.user_id != user_id {
                return Err(LedgerError::Forbidden {
                    entity: Entity::Payment,
                    id: payment_id,
                    user_id,
                });
            }
            if payment.status != PaymentStatus::Pending {
                return Err(LedgerError::AlreadySettled { payment_id });
            }

            if !tx.debit_balance(user_id, payment.amount_cents)? {
                let available_cents = tx.user(user_id)?.map_or(0, |user| user.balance_cents);
                return Err(LedgerError::InsufficientFunds {
                    required_cents: payment.amount_cents,
                    available_cents,
                });
            }
            if !tx.settle_payment(payment_id, settled_at)? {
                return Err(LedgerError::AlreadySettled { payment_id });
            }

            Ok(Payment {
                status: PaymentStatus::Completed,
                settled_at: Some(settled_at),
                ..payment
            })
        })?;

        tracing::info!(
            payment_id,
            user_id,
            rental_id = payment.rental_id,
            amount_cents = payment.amount_cents,
            "payment settled"
        );

        Ok(payment)
    }
}
