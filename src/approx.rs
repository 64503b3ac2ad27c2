//! Graded approximate equality for floating point buffers.
//!
//! Comparisons return an [`ApproxEquality`] grade rather than a bool, so a
//! caller can decide how much drift is acceptable: fused versus unfused
//! kernels are expected to agree [`Precise`](ApproxEquality::Precise)ly,
//! while finite-difference checks only reach
//! [`Relative`](ApproxEquality::Relative).

/// Largest absolute error graded `Relative` on `f32`.
pub const F32_MAX_ERROR: f32 = 1e-3;
/// Largest absolute error graded `Partial` on `f32`.
pub const F32_AVG_ERROR: f32 = 1e-5;
/// Largest absolute error graded `Precise` on `f32`.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Largest absolute error graded `Relative` on `f64`.
pub const F64_MAX_ERROR: f64 = 1e-3;
/// Largest absolute error graded `Partial` on `f64`.
pub const F64_AVG_ERROR: f64 = 1e-6;
/// Largest absolute error graded `Precise` on `f64`.
pub const F64_MIN_ERROR: f64 = 1e-12;

/// Closeness grade, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within rounding noise.
    Precise = 0,
    /// Within accumulated rounding of a short reduction.
    Partial = 1,
    /// Within finite-difference or cross-device tolerance.
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

/// Grades the distance between two values.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// Worst grade over all compared elements.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

macro_rules! impl_scalar {
    ($t:ty, $min:expr, $avg:expr, $max:expr) => {
        impl RelativeEq for $t {
            fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
                let diff = (self - rhs).abs();
                if diff <= $min {
                    ApproxEquality::Precise
                } else if diff <= $avg {
                    ApproxEquality::Partial
                } else if diff <= $max {
                    ApproxEquality::Relative
                } else {
                    ApproxEquality::Scarce
                }
            }
        }
    };
}

impl_scalar!(f32, F32_MIN_ERROR, F32_AVG_ERROR, F32_MAX_ERROR);
impl_scalar!(f64, F64_MIN_ERROR, F64_AVG_ERROR, F64_MAX_ERROR);

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .try_fold(ApproxEquality::Precise, |worst, grade| match grade {
                ApproxEquality::Scarce => Err(grade),
                _ => Ok(worst.max(grade)),
            })
            .unwrap_or_else(|scarce| scarce)
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<Vec<U>> for Vec<T> {
    fn approx_eq(&self, rhs: &Vec<U>) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

/// Whether `a` and `b` are graded `Precise`.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    approx_within(a, b, ApproxEquality::Precise)
}

/// Whether `a` and `b` are graded `level` or better.
pub fn approx_within<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B, level: ApproxEquality) -> bool {
    a.approx_eq(b) <= level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_scalars() {
        assert_eq!(1.0f32.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f32.approx_eq(&1.000_005), ApproxEquality::Partial);
        assert_eq!(1.0f64.approx_eq(&1.000_5), ApproxEquality::Relative);
        assert_eq!(1.0f64.approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn slices_take_the_worst_grade() {
        let a = [1.0f64, 2.0, 3.0];
        assert_eq!(a[..].approx_eq(&[1.0, 2.000_000_1, 3.0][..]), ApproxEquality::Partial);
        assert_eq!(a[..].approx_eq(&[1.5, 2.0, 3.0][..]), ApproxEquality::Scarce);
        assert_eq!(a[..].approx_eq(&[1.0, 2.0][..]), ApproxEquality::Scarce);
        assert!(approx_within(&a[..], &[1.0, 2.0, 3.000_5][..], ApproxEquality::Relative));
        assert!(!approx_eq(&a[..], &[1.0, 2.0, 3.000_5][..]));
    }
}
