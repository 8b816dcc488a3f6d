//! Integer minor-unit money type.
//!
//! Design Notes (spec.md §9) call for representing money as integer
//! cents/fen internally to avoid float drift in the invariant checks of
//! §8, converting to float only at the JSON boundary.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

const SCALE: f64 = 100.0;

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub fn from_major(major: f64) -> Self {
        Money((major * SCALE).round() as i64)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE
    }

    pub fn max(self, other: Money) -> Money {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `self * rate`, rounded to the nearest minor unit.
    pub fn scale(self, rate: f64) -> Money {
        Money((self.0 as f64 * rate).round() as i64)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Mul<i64> for Money {
    type Output = Money;
    fn mul(self, rhs: i64) -> Money {
        Money(self.0 * rhs)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_minor_roundtrip() {
        let m = Money::from_major(100_000.0);
        assert_eq!(m.minor(), 10_000_000);
        assert_eq!(m.as_f64(), 100_000.0);
    }

    #[test]
    fn commission_rounding() {
        let notional = Money::from_major(1234.56);
        let fee = notional.scale(0.001).max(Money::ZERO);
        assert_eq!(fee.as_f64(), 1.23);
    }
}
