use std::fmt::{Debug, Display};

use num_traits::{Float as NumFloat, FloatConst, FromPrimitive};

/// Marker trait for the floating-point types curvature is computed in (`f32`, `f64`).
///
/// Bundles the numeric and utility traits needed throughout lowrank.
pub trait Float:
    NumFloat + FloatConst + FromPrimitive + Copy + Send + Sync + Default + Debug + Display + 'static
{
    /// Lift an `f64` literal into this type.
    #[inline]
    fn lit(x: f64) -> Self {
        <Self as FromPrimitive>::from_f64(x).unwrap_or_else(Self::nan)
    }

    /// Lift a count (batch size, number of samples) into this type.
    #[inline]
    fn count(n: usize) -> Self {
        <Self as FromPrimitive>::from_usize(n).unwrap_or_else(Self::nan)
    }
}

impl Float for f32 {}
impl Float for f64 {}
