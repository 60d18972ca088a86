//! Decimal money helpers.
//!
//! Quantities and prices carry 8 fractional digits; rounding at
//! persistence boundaries is banker's rounding to the stored scale.
//! The CHF/USD conversion rate is a configuration constant threaded
//! through explicitly (no live FX feed).

use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds a quantity or price to the 8-digit stored scale.
pub fn round8(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven)
}

/// Converts CHF capital into USD notional for position sizing.
pub fn chf_to_usd(chf: Decimal, chf_to_usd_rate: Decimal) -> Decimal {
    if chf_to_usd_rate.is_zero() {
        return Decimal::ZERO;
    }
    chf / chf_to_usd_rate
}

/// Converts a USD amount (P&L, exchange balance) into CHF for risk
/// accounting. The rate divides in both directions here, mirroring the
/// accounting convention of the rest of the system.
pub fn usd_to_chf(usd: Decimal, chf_to_usd_rate: Decimal) -> Decimal {
    if chf_to_usd_rate.is_zero() {
        return Decimal::ZERO;
    }
    usd / chf_to_usd_rate
}
