//! Fixed-point currency amounts.
//!
//! An [`Amount`] is a whole `value` plus a `fraction` in units of
//! 1/[`AMOUNT_FRACTIONAL_BASE`]. Arithmetic never wraps and never goes
//! negative: every operation that would leave the representable range
//! clamps to the nearest bound and reports it through [`AmountOp::saturated`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{AMOUNT_FRACTIONAL_BASE, AMOUNT_FRACTIONAL_LENGTH, AMOUNT_MAX_VALUE};
use crate::error::AmountError;

/// A non-negative amount of a single currency.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct Amount {
    pub currency: String,
    pub value: u64,
    pub fraction: u32,
}

/// Result of a saturating operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmountOp {
    pub amount: Amount,
    /// True when the exact result was out of range and got clamped.
    pub saturated: bool,
}

impl AmountOp {
    fn exact(amount: Amount) -> Self {
        Self { amount, saturated: false }
    }

    fn clamped(amount: Amount) -> Self {
        Self { amount, saturated: true }
    }
}

impl Amount {
    /// Build a normalized amount, carrying excess fraction into the value.
    pub fn new(currency: impl Into<String>, value: u64, fraction: u32) -> Result<Self, AmountError> {
        let carry = u64::from(fraction / AMOUNT_FRACTIONAL_BASE);
        let value = value.checked_add(carry).ok_or(AmountError::ValueTooLarge)?;
        if value > AMOUNT_MAX_VALUE {
            return Err(AmountError::ValueTooLarge);
        }
        Ok(Self {
            currency: currency.into(),
            value,
            fraction: fraction % AMOUNT_FRACTIONAL_BASE,
        })
    }

    pub fn zero(currency: impl Into<String>) -> Self {
        Self { currency: currency.into(), value: 0, fraction: 0 }
    }

    /// The largest representable amount of a currency.
    pub fn max_representable(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            value: AMOUNT_MAX_VALUE,
            fraction: AMOUNT_FRACTIONAL_BASE - 1,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn check_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }

    fn with_units(&self, units: u128) -> AmountOp {
        let base = u128::from(AMOUNT_FRACTIONAL_BASE);
        let value = units / base;
        if value > u128::from(AMOUNT_MAX_VALUE) {
            return AmountOp::clamped(Amount::max_representable(self.currency.clone()));
        }
        AmountOp::exact(Amount {
            currency: self.currency.clone(),
            value: value as u64,
            fraction: (units % base) as u32,
        })
    }

    /// Total number of fractional units, ignoring the currency.
    pub fn units(&self) -> u128 {
        u128::from(self.value) * u128::from(AMOUNT_FRACTIONAL_BASE) + u128::from(self.fraction)
    }

    pub fn add(&self, other: &Amount) -> Result<AmountOp, AmountError> {
        self.check_currency(other)?;
        Ok(self.with_units(self.units() + other.units()))
    }

    pub fn sub(&self, other: &Amount) -> Result<AmountOp, AmountError> {
        self.check_currency(other)?;
        match self.units().checked_sub(other.units()) {
            Some(units) => Ok(self.with_units(units)),
            None => Ok(AmountOp::clamped(Amount::zero(self.currency.clone()))),
        }
    }

    /// `add`, discarding the saturation flag.
    pub fn saturating_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        Ok(self.add(other)?.amount)
    }

    /// `sub`, discarding the saturation flag.
    pub fn saturating_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        Ok(self.sub(other)?.amount)
    }

    pub fn mult(&self, n: u64) -> AmountOp {
        self.with_units(self.units().saturating_mul(u128::from(n)))
    }

    /// Divide into `n` equal parts, rounding the fraction down.
    pub fn divide(&self, n: u64) -> Result<Amount, AmountError> {
        if n == 0 {
            return Err(AmountError::DivisionByZero);
        }
        if n == 1 {
            return Ok(self.clone());
        }
        let n = u128::from(n);
        let rest = u128::from(self.value) % n;
        let fraction = (rest * u128::from(AMOUNT_FRACTIONAL_BASE) + u128::from(self.fraction)) / n;
        Ok(Amount {
            currency: self.currency.clone(),
            value: (u128::from(self.value) / n) as u64,
            fraction: fraction as u32,
        })
    }

    pub fn cmp_amount(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.check_currency(other)?;
        Ok(self.units().cmp(&other.units()))
    }

    pub fn min(&self, other: &Amount) -> Result<Amount, AmountError> {
        match self.cmp_amount(other)? {
            Ordering::Greater => Ok(other.clone()),
            _ => Ok(self.clone()),
        }
    }

    pub fn max(&self, other: &Amount) -> Result<Amount, AmountError> {
        match self.cmp_amount(other)? {
            Ordering::Less => Ok(other.clone()),
            _ => Ok(self.clone()),
        }
    }

    /// Saturating sum of a sequence of amounts in `currency`.
    pub fn sum<'a, I>(currency: &str, amounts: I) -> Result<AmountOp, AmountError>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        let mut acc = AmountOp::exact(Amount::zero(currency));
        for a in amounts {
            let next = acc.amount.add(a)?;
            acc = AmountOp {
                amount: next.amount,
                saturated: acc.saturated || next.saturated,
            };
        }
        Ok(acc)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.value)?;
        if self.fraction != 0 {
            let digits = format!("{:0width$}", self.fraction, width = AMOUNT_FRACTIONAL_LENGTH);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Parse `CUR:V` or `CUR:V.F` with at most eight fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AmountError::InvalidFormat(s.to_string());
        let (currency, number) = s.split_once(':').ok_or_else(invalid)?;
        let currency_ok = !currency.is_empty()
            && currency
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '*' | '-'));
        if !currency_ok {
            return Err(invalid());
        }
        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, Some(f)),
            None => (number, None),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = whole.parse().map_err(|_| AmountError::ValueTooLarge)?;
        let fraction = match frac {
            None => 0,
            Some(f) => {
                if f.is_empty()
                    || f.len() > AMOUNT_FRACTIONAL_LENGTH
                    || !f.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(invalid());
                }
                let padded = format!("{f:0<width$}", width = AMOUNT_FRACTIONAL_LENGTH);
                padded.parse::<u32>().map_err(|_| invalid())?
            }
        };
        Amount::new(currency, value, fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(a("EUR:1.5"), Amount { currency: "EUR".into(), value: 1, fraction: 50_000_000 });
        assert_eq!(a("EUR:1.5").to_string(), "EUR:1.5");
        assert_eq!(a("KUDOS:10").to_string(), "KUDOS:10");
        assert_eq!(a("EUR:0.00000001").to_string(), "EUR:0.00000001");
    }

    #[test]
    fn parse_rejects_bad_input() {
        for bad in ["EUR", ":1", "EUR:", "EUR:1.", "EUR:1.123456789", "EUR:-1", "E R:1", "EUR:1.x"] {
            assert!(bad.parse::<Amount>().is_err(), "{bad} should not parse");
        }
        assert_eq!("EUR:9007199254740993".parse::<Amount>(), Err(AmountError::ValueTooLarge));
    }

    #[test]
    fn add_carries_fraction() {
        let r = a("EUR:0.6").add(&a("EUR:0.7")).unwrap();
        assert_eq!(r.amount, a("EUR:1.3"));
        assert!(!r.saturated);
    }

    #[test]
    fn add_saturates_at_max() {
        let max = Amount::max_representable("EUR");
        let r = max.add(&a("EUR:0.00000001")).unwrap();
        assert!(r.saturated);
        assert_eq!(r.amount, max);
    }

    #[test]
    fn sub_saturates_at_zero() {
        let r = a("EUR:1").sub(&a("EUR:1.5")).unwrap();
        assert!(r.saturated);
        assert!(r.amount.is_zero());

        let r = a("EUR:1").sub(&a("EUR:0.25")).unwrap();
        assert!(!r.saturated);
        assert_eq!(r.amount, a("EUR:0.75"));
    }

    #[test]
    fn currency_mismatch_is_error() {
        assert!(matches!(
            a("EUR:1").add(&a("USD:1")),
            Err(AmountError::CurrencyMismatch { .. })
        ));
        assert!(a("EUR:1").cmp_amount(&a("USD:1")).is_err());
    }

    #[test]
    fn divide_rounds_fraction_down() {
        assert_eq!(a("EUR:1").divide(3).unwrap(), a("EUR:0.33333333"));
        assert_eq!(a("EUR:5.5").divide(2).unwrap(), a("EUR:2.75"));
        assert_eq!(a("EUR:5.5").divide(1).unwrap(), a("EUR:5.5"));
        assert_eq!(a("EUR:1").divide(0), Err(AmountError::DivisionByZero));
    }

    #[test]
    fn mult_and_saturation() {
        let r = a("EUR:0.3").mult(4);
        assert_eq!(r.amount, a("EUR:1.2"));
        assert!(!r.saturated);
        assert!(a("EUR:4503599627370496").mult(2).saturated);
    }

    #[test]
    fn min_max_and_sum() {
        assert_eq!(a("EUR:1").min(&a("EUR:2")).unwrap(), a("EUR:1"));
        assert_eq!(a("EUR:1").max(&a("EUR:2")).unwrap(), a("EUR:2"));
        let parts = [a("EUR:1.1"), a("EUR:2.2"), a("EUR:0.7")];
        assert_eq!(Amount::sum("EUR", &parts).unwrap().amount, a("EUR:4"));
    }

    #[test]
    fn units_count_fractional_steps() {
        assert_eq!(a("EUR:0").units(), 0);
        assert_eq!(a("EUR:0.00000001").units(), 1);
        assert_eq!(a("EUR:2.5").units(), 250_000_000);
        assert!(a("EUR:1.01").units() > a("EUR:1").units());
    }

    #[test]
    fn new_normalizes() {
        let n = Amount::new("EUR", 1, 150_000_000).unwrap();
        assert_eq!(n, a("EUR:2.5"));
    }
}
