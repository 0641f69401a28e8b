const MILLIS_PER_HOUR: i128 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeQuote {
    pub amount_cents: i64,
    pub duration_seconds: i64,
}

/// Linear per-hour tariff, rounded up to the next cent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyRate {
    cents_per_hour: i64,
}

impl HourlyRate {
    /// A zero or negative rate means rentals are not charged.
    pub fn new(cents_per_hour: i64) -> Option<Self> {
        (cents_per_hour > 0).then_some(Self { cents_per_hour })
    }

    pub fn cents_per_hour(&self) -> i64 {
        self.cents_per_hour
    }

    pub fn quote(&self, duration_ms: i64) -> ChargeQuote {
        let duration_ms = duration_ms.max(0);
        let numerator = i128::from(duration_ms) * i128::from(self.cents_per_hour);
        let amount = (numerator + MILLIS_PER_HOUR - 1) / MILLIS_PER_HOUR;

        ChargeQuote {
            amount_cents: i64::try_from(amount).unwrap_or(i64::MAX),
            duration_seconds: duration_ms / 1_000,
        }
    }
}
