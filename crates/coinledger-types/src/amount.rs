//! Fixed-point amount helpers.
//!
//! Every balance, price and fee is a [`Decimal`] with at most
//! [`AMOUNT_SCALE`](crate::constants::AMOUNT_SCALE) fractional digits.
//! No floating point is used anywhere in balance arithmetic.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::{CoinledgerError, Result, constants::AMOUNT_SCALE};

/// Reject zero, negative, or over-precise amounts.
///
/// # Errors
/// Returns [`CoinledgerError::InvalidArgument`] naming `what`.
pub fn require_positive(what: &str, value: Decimal) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(CoinledgerError::invalid(format!(
            "{what} must be positive, got {value}"
        )));
    }
    if value.normalize().scale() > AMOUNT_SCALE {
        return Err(CoinledgerError::invalid(format!(
            "{what} has more than {AMOUNT_SCALE} fractional digits: {value}"
        )));
    }
    Ok(value)
}

/// Truncate toward zero at 8 fractional digits.
#[must_use]
pub fn truncate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero)
}

/// `amount × price`, truncated.
#[must_use]
pub fn notional(amount: Decimal, price: Decimal) -> Decimal {
    truncate(amount * price)
}

/// `total × part / whole`, truncated. Zero when `whole` is zero.
#[must_use]
pub fn pro_rata(total: Decimal, part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    truncate(total * part / whole)
}

/// Render an amount without trailing zeros (`1.50000000` → `1.5`).
#[must_use]
pub fn display(value: Decimal) -> String {
    truncate(value).normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_amounts_pass() {
        assert!(require_positive("amount", Decimal::new(1, 8)).is_ok());
        assert!(require_positive("amount", Decimal::new(150, 2)).is_ok());
    }

    #[test]
    fn zero_and_negative_rejected() {
        assert!(require_positive("amount", Decimal::ZERO).is_err());
        assert!(require_positive("price", Decimal::new(-1, 0)).is_err());
    }

    #[test]
    fn nine_digits_rejected_but_trailing_zeros_allowed() {
        assert!(require_positive("amount", Decimal::new(1, 9)).is_err());
        assert!(require_positive("amount", Decimal::new(1_000, 11)).is_ok());
    }

    #[test]
    fn notional_truncates() {
        // 0.33333333 * 3 = 0.99999999 exactly
        assert_eq!(
            notional(Decimal::new(33_333_333, 8), Decimal::new(3, 0)),
            Decimal::new(99_999_999, 8)
        );
        // 0.00000001 * 0.5 = 0.000000005 -> 0
        assert_eq!(
            notional(Decimal::new(1, 8), Decimal::new(5, 1)),
            Decimal::ZERO
        );
    }

    #[test]
    fn pro_rata_splits() {
        let share = pro_rata(Decimal::new(10, 0), Decimal::ONE, Decimal::new(3, 0));
        assert_eq!(share, Decimal::new(333_333_333, 8));
        assert_eq!(pro_rata(Decimal::ONE, Decimal::ONE, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn display_strips_zeros() {
        assert_eq!(display(Decimal::new(150_000_000, 8)), "1.5");
        assert_eq!(display(Decimal::new(3, 0)), "3");
    }
}
