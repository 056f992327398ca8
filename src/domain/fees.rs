/// Token amounts are whole integer units; there is no fractional unit.
pub type Units = i64;

/// Basis points divisor: 10_000 bps = 100%.
pub const BASIS_POINTS_DIVISOR: Units = 10_000;

/// How a collected payment is divided between the platform and the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    /// Routed to the owner account immediately on collection.
    pub platform: Units,
    /// Left in the ledger's holding account, including any rounding remainder.
    pub retained: Units,
}

impl FeeSplit {
    pub fn total(&self) -> Units {
        self.platform + self.retained
    }
}

/// Split `amount` into the platform share (`floor(amount * bps / 10000)`)
/// and the retained remainder.
pub fn split_fee(amount: Units, platform_fee_bps: Units) -> FeeSplit {
    let platform = amount * platform_fee_bps / BASIS_POINTS_DIVISOR;
    FeeSplit {
        platform,
        retained: amount - platform,
    }
}
