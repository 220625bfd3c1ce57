//! Exact fixed-point arithmetic for currency amounts
//!
//! Amounts live as `Decimal` (ETH with up to 18 fractional digits) and
//! cross to/from wei base units only at the chain boundary. Human-readable
//! strings are produced only at display boundaries. Nothing here routes
//! through binary floating point, so repeated small-amount accumulation
//! introduces no drift.

use ethers::types::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

const WEI_SCALE: u32 = 18;
const WEI_PER_ETH: Decimal = dec!(1_000_000_000_000_000_000);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount {0} is out of the representable range")]
    OutOfRange(String),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("amount {0} is not a whole number of base units")]
    SubWeiPrecision(String),
    #[error("amount {0} is negative")]
    Negative(String),
}

/// Convert a wei amount from the chain into an exact ETH `Decimal`.
pub fn wei_to_eth(wei: U256) -> Result<Decimal, LedgerError> {
    if wei > U256::from(u128::MAX) {
        return Err(LedgerError::OutOfRange(wei.to_string()));
    }
    let raw = i128::try_from(wei.as_u128()).map_err(|_| LedgerError::OutOfRange(wei.to_string()))?;
    Decimal::try_from_i128_with_scale(raw, WEI_SCALE)
        .map_err(|_| LedgerError::OutOfRange(wei.to_string()))
}

/// Convert an ETH amount back into wei base units.
///
/// Fails on negative amounts and on amounts finer than one wei.
pub fn eth_to_wei(amount: Decimal) -> Result<U256, LedgerError> {
    if amount.is_sign_negative() {
        return Err(LedgerError::Negative(amount.to_string()));
    }
    let scaled = amount
        .checked_mul(WEI_PER_ETH)
        .ok_or(LedgerError::Overflow)?;
    if scaled.fract() != Decimal::ZERO {
        return Err(LedgerError::SubWeiPrecision(amount.to_string()));
    }
    U256::from_dec_str(&scaled.normalize().to_string())
        .map_err(|_| LedgerError::OutOfRange(amount.to_string()))
}

/// Exact checked addition of two amounts.
pub fn add(a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

/// USD value of an ETH amount at the given USD/ETH spot price.
pub fn usd_value(amount_eth: Decimal, price: Decimal) -> Result<Decimal, LedgerError> {
    amount_eth
        .checked_mul(price)
        .map(|v| v.normalize())
        .ok_or(LedgerError::Overflow)
}

/// Display-boundary formatting: trailing zeros trimmed, no exponent.
pub fn format_eth(amount: Decimal) -> String {
    amount.normalize().to_string()
}
