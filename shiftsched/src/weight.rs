use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use std::cmp::Ordering;

use crate::helpe::*;

pub const N_SLOTS: usize = 7;
const CENTRE: usize = N_SLOTS / 2;

/// The currency of liveness.
///
/// A plain `f64` is not enough once callers start mixing real
/// allocation sizes with priority hints: a tiny hint added to a huge
/// size gets lost, and a huge hint drowns every size. An [AllocWeight]
/// keeps values of different significance in different slots and
/// compares them lexicographically, slot `0` being the most significant.
///
/// The "natural" slot is the centre one, so there are three slots of
/// stronger and three slots of weaker significance available.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocWeight {
    v: [f64; N_SLOTS],
}

impl AllocWeight {
    /// `relative_lexico` is in `[-3, 3]`. Negative values are more
    /// significant than a natural weight, positive ones less.
    pub fn new(v: f64, relative_lexico: i64) -> Self {
        debug_assert!(relative_lexico.unsigned_abs() as usize <= CENTRE,
            "Relative lexicographic offset out of range");
        let mut res = Self::zero();
        let idx = (CENTRE as i64 + relative_lexico).clamp(0, N_SLOTS as i64 - 1);
        res.v[idx as usize] = v;

        res
    }

    #[inline(always)]
    pub fn from_slots(v: [f64; N_SLOTS]) -> Self { Self { v } }

    #[inline(always)]
    pub fn zero() -> Self { Self { v: [0.0; N_SLOTS] } }

    #[inline(always)]
    pub fn negative_one() -> Self { Self::new(-1.0, 0) }

    /// Larger than any weight produced by real graphs.
    pub fn numeric_max_limit() -> Self {
        Self { v: [f64::MAX / 1e3; N_SLOTS] }
    }

    #[inline(always)]
    pub fn slots(&self) -> &[f64; N_SLOTS] { &self.v }

    #[inline(always)]
    pub fn centre(&self) -> f64 { self.v[CENTRE] }

    pub fn absolute(&self) -> Self {
        let mut res = *self;
        res.v.iter_mut().for_each(|x| *x = x.abs());

        res
    }

    /// Sum of the absolute values of all slots.
    pub fn l1(&self) -> f64 {
        self.v.iter().map(|x| x.abs()).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.v.iter().all(|&x| x == 0.0)
    }

    /// Bit-exact key, for hashing and caching.
    pub fn to_bits(&self) -> [u64; N_SLOTS] {
        let mut res = [0; N_SLOTS];
        for (r, x) in res.iter_mut().zip(self.v.iter()) {
            // Fold -0.0 into 0.0.
            *r = if *x == 0.0 { 0 } else { x.to_bits() };
        }

        res
    }
}

impl PartialOrd for AllocWeight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        for (a, b) in self.v.iter().zip(other.v.iter()) {
            match a.partial_cmp(b)? {
                Ordering::Equal => continue,
                o               => return Some(o),
            }
        }

        Some(Ordering::Equal)
    }
}

impl Hash for AllocWeight {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl Add for AllocWeight {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for AllocWeight {
    fn add_assign(&mut self, rhs: Self) {
        self.v.iter_mut().zip(rhs.v.iter()).for_each(|(a, b)| *a += b);
    }
}

impl Sub for AllocWeight {
    type Output = Self;
    fn sub(mut self, rhs: Self) -> Self {
        self -= rhs;
        self
    }
}

impl SubAssign for AllocWeight {
    fn sub_assign(&mut self, rhs: Self) {
        self.v.iter_mut().zip(rhs.v.iter()).for_each(|(a, b)| *a -= b);
    }
}

impl Neg for AllocWeight {
    type Output = Self;
    fn neg(mut self) -> Self {
        self.v.iter_mut().for_each(|x| *x = -*x);
        self
    }
}

impl Mul<f64> for AllocWeight {
    type Output = Self;
    fn mul(mut self, rhs: f64) -> Self {
        self *= rhs;
        self
    }
}

impl Mul<AllocWeight> for f64 {
    type Output = AllocWeight;
    fn mul(self, rhs: AllocWeight) -> AllocWeight { rhs * self }
}

impl MulAssign<f64> for AllocWeight {
    fn mul_assign(&mut self, rhs: f64) {
        self.v.iter_mut().for_each(|x| *x *= rhs);
    }
}

impl Div<f64> for AllocWeight {
    type Output = Self;
    fn div(mut self, rhs: f64) -> Self {
        self /= rhs;
        self
    }
}

impl DivAssign<f64> for AllocWeight {
    fn div_assign(&mut self, rhs: f64) {
        self.v.iter_mut().for_each(|x| *x /= rhs);
    }
}

/// Element-wise. Slots whose divisor is zero are left untouched.
impl DivAssign for AllocWeight {
    fn div_assign(&mut self, rhs: Self) {
        for (a, b) in self.v.iter_mut().zip(rhs.v.iter()) {
            if *b != 0.0 {
                *a /= b;
            }
        }
    }
}

impl std::iter::Sum for AllocWeight {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, x| acc + x)
    }
}

impl From<f64> for AllocWeight {
    fn from(v: f64) -> Self { Self::new(v, 0) }
}

impl fmt::Display for AllocWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let only_centre = self.v.iter()
            .enumerate()
            .all(|(i, &x)| i == CENTRE || x == 0.0);
        if only_centre {
            write!(f, "{}", self.v[CENTRE])
        } else {
            write!(f, "({})", self.v.iter().join(","))
        }
    }
}
