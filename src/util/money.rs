//! Conversions between human-readable USDC amounts and atomic token units.
//!
//! Amounts cross two boundaries: spending rules are stored as decimal
//! strings ("5.00"), while the x402 wire and the ERC-20 contract speak in
//! atomic units (USDC has 6 decimals). Both directions live here so the
//! rounding and formatting rules stay in one place.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Errors that can occur when converting a decimal amount string to atomic units.
#[derive(Debug, thiserror::Error)]
pub enum MoneyError {
    /// The input string could not be parsed as a number.
    #[error("Invalid amount format: {0:?}")]
    InvalidFormat(String),
    /// Negative values are not allowed.
    #[error("Negative amount is not allowed: {0:?}")]
    Negative(String),
    /// The input has more decimal places than the token supports.
    #[error("Amount {amount:?} has {scale} decimal places, token supports {decimals}")]
    TooPrecise {
        amount: String,
        scale: u32,
        decimals: u32,
    },
}

/// Parse a human-readable decimal amount (e.g. `"5.00"`) into atomic units
/// for a token with the given number of decimals.
pub fn parse_decimal(input: &str, decimals: u32) -> Result<U256, MoneyError> {
    let parsed =
        Decimal::from_str(input.trim()).map_err(|_| MoneyError::InvalidFormat(input.into()))?;
    if parsed.is_sign_negative() {
        return Err(MoneyError::Negative(input.into()));
    }
    let scale = parsed.scale();
    if scale > decimals {
        return Err(MoneyError::TooPrecise {
            amount: input.into(),
            scale,
            decimals,
        });
    }
    let mantissa = parsed.mantissa().unsigned_abs();
    let factor = U256::from(10u64).pow(U256::from(decimals - scale));
    Ok(U256::from(mantissa) * factor)
}

/// Format atomic token units as a human-readable decimal string.
///
/// No scientific notation; at least one fractional digit (`"0.0"` for zero);
/// trailing zeros in the fraction are trimmed but the leading zero of the
/// integer part is kept.
pub fn format_atomic(atomic: U256, decimals: u32) -> String {
    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = atomic / divisor;
    let remainder = atomic % divisor;
    let mut fraction = remainder.to_string();
    while fraction.len() < decimals as usize {
        fraction.insert(0, '0');
    }
    while fraction.len() > 1 && fraction.ends_with('0') {
        fraction.pop();
    }
    format!("{whole}.{fraction}")
}
