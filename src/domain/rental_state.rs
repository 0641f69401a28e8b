use crate::domain::models::{PowerBankStatus, Rental, RentalStatus, TimestampMs};

pub trait Clock {
    fn now(&self) -> TimestampMs;
}

/// Status changes a power bank can go through.
///
/// `Rent` and `Return` belong to the ledger; the maintenance pair is only
/// driven by administrative commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerBankTransition {
    Rent,
    Return,
    EnterMaintenance,
    LeaveMaintenance,
}

impl PowerBankTransition {
    pub fn from_status(self) -> PowerBankStatus {
        match self {
            Self::Rent | Self::EnterMaintenance => PowerBankStatus::Available,
            Self::Return => PowerBankStatus::Rented,
            Self::LeaveMaintenance => PowerBankStatus::Maintenance,
        }
    }

    pub fn to_status(self) -> PowerBankStatus {
        match self {
            Self::Rent => PowerBankStatus::Rented,
            Self::Return | Self::LeaveMaintenance => PowerBankStatus::Available,
            Self::EnterMaintenance => PowerBankStatus::Maintenance,
        }
    }

    /// Change applied to the owning station's available counter.
    pub fn available_delta(self) -> i64 {
        match (self.from_status(), self.to_status()) {
            (PowerBankStatus::Available, _) => -1,
            (_, PowerBankStatus::Available) => 1,
            _ => 0,
        }
    }

    /// Returns the target status when the transition is legal from `current`.
    pub fn apply(self, current: PowerBankStatus) -> Option<PowerBankStatus> {
        (current == self.from_status()).then(|| self.to_status())
    }

    pub fn for_maintenance(enable: bool) -> Self {
        if enable {
            Self::EnterMaintenance
        } else {
            Self::LeaveMaintenance
        }
    }
}

/// Picks the end time for a rental being completed at `now`.
///
/// Returns `None` when the rental is already completed. The end time is kept
/// strictly after the start time even if the clock has not advanced.
pub fn completion_time(rental: &Rental, now: TimestampMs) -> Option<TimestampMs> {
    if rental.status != RentalStatus::Active {
        return None;
    }

    Some(now.max(TimestampMs(rental.started_at.0 + 1)))
}

#[cfg(test)]
mod tests {
    use super::{PowerBankTransition, completion_time};
    use crate::domain::models::{PowerBankStatus, Rental, RentalStatus, TimestampMs};

    fn active_rental(started_at: i64) -> Rental {
        Rental {
            id: 1,
            user_id: 10,
            power_bank_id: 20,
            start_station_id: 30,
            return_station_id: None,
            started_at: TimestampMs(started_at),
            ended_at: None,
            status: RentalStatus::Active,
        }
    }

    #[test]
    fn rent_only_applies_to_available_units() {
        assert_eq!(
            PowerBankTransition::Rent.apply(PowerBankStatus::Available),
            Some(PowerBankStatus::Rented)
        );
        assert_eq!(PowerBankTransition::Rent.apply(PowerBankStatus::Rented), None);
        assert_eq!(
            PowerBankTransition::Rent.apply(PowerBankStatus::Maintenance),
            None
        );
    }

    #[test]
    fn rented_units_cannot_enter_maintenance() {
        assert_eq!(
            PowerBankTransition::EnterMaintenance.apply(PowerBankStatus::Rented),
            None
        );
        assert_eq!(
            PowerBankTransition::LeaveMaintenance.apply(PowerBankStatus::Maintenance),
            Some(PowerBankStatus::Available)
        );
    }

    #[test]
    fn available_delta_tracks_entering_and_leaving_available() {
        assert_eq!(PowerBankTransition::Rent.available_delta(), -1);
        assert_eq!(PowerBankTransition::Return.available_delta(), 1);
        assert_eq!(PowerBankTransition::EnterMaintenance.available_delta(), -1);
        assert_eq!(PowerBankTransition::LeaveMaintenance.available_delta(), 1);
    }

    #[test]
    fn completion_time_uses_clock_when_it_moved_forward() {
        let rental = active_rental(1_000);
        assert_eq!(
            completion_time(&rental, TimestampMs(5_000)),
            Some(TimestampMs(5_000))
        );
    }

    #[test]
    fn completion_time_stays_after_start_on_stalled_clock() {
        let rental = active_rental(1_000);
        assert_eq!(
            completion_time(&rental, TimestampMs(1_000)),
            Some(TimestampMs(1_001))
        );
        assert_eq!(
            completion_time(&rental, TimestampMs(900)),
            Some(TimestampMs(1_001))
        );
    }

    #[test]
    fn completed_rentals_cannot_complete_again() {
        let mut rental = active_rental(1_000);
        rental.status = RentalStatus::Completed;
        rental.ended_at = Some(TimestampMs(2_000));

        assert_eq!(completion_time(&rental, TimestampMs(3_000)), None);
    }
}
