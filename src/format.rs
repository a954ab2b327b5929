// src/format.rs
//! Presentation-boundary formatting of base-unit amounts. Integer-only so
//! wei-scale values never lose precision before they are rendered.

use alloy::primitives::{I256, U256};

/// Seconds in an average month (365 / 12 days), the unit streams are quoted in
pub const SECONDS_PER_MONTH: u64 = 2_628_000;

/// Render `amount` base units as a decimal string with at most `display_decimals`
/// fractional digits. Extra digits are truncated (rounded toward zero) and
/// trailing zeros are trimmed.
pub fn format_units(amount: U256, decimals: u8, display_decimals: u8) -> String {
    let scale = U256::from(10u64).pow(U256::from(decimals));
    let whole = amount / scale;
    let frac = amount % scale;

    if decimals == 0 || display_decimals == 0 {
        return whole.to_string();
    }

    let mut frac_str = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    frac_str.truncate(display_decimals.min(decimals) as usize);
    let frac_str = frac_str.trim_end_matches('0');

    if frac_str.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, frac_str)
    }
}

/// Same as [`format_units`] with a leading `-` for negative values
pub fn format_signed_units(amount: I256, decimals: u8, display_decimals: u8) -> String {
    let formatted = format_units(amount.unsigned_abs(), decimals, display_decimals);
    if amount.is_negative() && formatted != "0" {
        format!("-{}", formatted)
    } else {
        formatted
    }
}

/// Convert a per-second flow rate into a per-month rate (saturating)
pub fn flow_rate_per_month(rate_per_second: I256) -> I256 {
    rate_per_second.saturating_mul(I256::from_raw(U256::from(SECONDS_PER_MONTH)))
}
