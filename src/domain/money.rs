use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub};

/// A monetary value in the payment's currency.
///
/// Wraps `rust_decimal::Decimal` so no float ever reaches matching or invoice
/// arithmetic. Rounding to cents is always half away from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Rounds to two decimal places, half away from zero.
    pub fn round2(self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Whether `other` lies within `tolerance` of this amount (inclusive).
    pub fn within(&self, other: Money, tolerance: Decimal) -> bool {
        (self.0 - other.0).abs() <= tolerance
    }

    pub fn max(self, other: Money) -> Money {
        if self >= other { self } else { other }
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Mul<Decimal> for Money {
    type Output = Self;
    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round2_half_away_from_zero() {
        assert_eq!(Money::new(dec!(2.345)).round2(), Money::new(dec!(2.35)));
        assert_eq!(Money::new(dec!(2.355)).round2(), Money::new(dec!(2.36)));
        assert_eq!(Money::new(dec!(-2.345)).round2(), Money::new(dec!(-2.35)));
        assert_eq!(Money::new(dec!(2.344)).round2(), Money::new(dec!(2.34)));
    }

    #[test]
    fn test_within_tolerance_is_inclusive() {
        let a = Money::new(dec!(150.00));
        assert!(a.within(Money::new(dec!(150.01)), dec!(0.01)));
        assert!(a.within(Money::new(dec!(149.99)), dec!(0.01)));
        assert!(!a.within(Money::new(dec!(150.02)), dec!(0.01)));
    }

    #[test]
    fn test_money_arithmetic_and_sum() {
        let total: Money = [dec!(10.10), dec!(5.05), dec!(0.85)]
            .into_iter()
            .map(Money::new)
            .sum();
        assert_eq!(total, Money::new(dec!(16.00)));
        assert_eq!(total - Money::new(dec!(6)), Money::new(dec!(10)));
        assert_eq!(Money::new(dec!(100)) * dec!(0.033), Money::new(dec!(3.3)));
        assert_eq!(total.to_string(), "16.00");
    }
}
