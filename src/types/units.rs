//! Unit Conversion Utilities
//!
//! Helpers for EVM quantities: native coins have 18 decimals and nodes
//! report integer wei as 0x-prefixed hex.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Decimals of the native coin on every supported chain
pub const NATIVE_DECIMALS: u32 = 18;

/// Wei per native coin
pub const WEI_PER_NATIVE: u64 = 1_000_000_000_000_000_000;

/// Convert wei to native units (e.g. 1e18 -> 1)
pub fn wei_to_native(wei: u128) -> Option<Decimal> {
    let wei = i128::try_from(wei).ok()?;
    Decimal::try_from_i128_with_scale(wei, NATIVE_DECIMALS)
        .ok()
        .map(|d| d.normalize())
}

/// Convert native units to wei, truncating below one wei
pub fn native_to_wei(amount: Decimal) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    amount
        .checked_mul(Decimal::from(WEI_PER_NATIVE))?
        .trunc()
        .to_u128()
}

/// Parse a JSON-RPC hex quantity ("0x1a")
pub fn parse_quantity(s: &str) -> Option<u128> {
    let digits = s.trim().strip_prefix("0x").or_else(|| s.trim().strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Format a block number or other quantity as hex
pub fn to_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

/// Parse a non-negative decimal amount ("1.0", " 0.25 ")
pub fn parse_amount(s: &str) -> Option<Decimal> {
    let amount: Decimal = s.trim().replace('_', "").parse().ok()?;
    if amount.is_sign_negative() {
        return None;
    }
    Some(amount)
}

/// Canonical display form without trailing zeros
pub fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}
