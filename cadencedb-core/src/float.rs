//! Floating-point near-equality

/// Maximum distance, in representable values, for two doubles to be equal
pub const MAX_ULPS_DIFF: u64 = 4;

/// Compare two doubles, tolerating accumulated rounding error.
///
/// Values closer than `f64::EPSILON` are equal, which also covers
/// `0.0 == -0.0` and values near zero where ULP distances explode. Otherwise
/// values of the same sign are equal when at most [`MAX_ULPS_DIFF`]
/// representable doubles lie between them. NaN is never equal to anything.
pub fn almost_equals(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }

    if (a - b).abs() < f64::EPSILON {
        return true;
    }

    // Adjacent doubles of the same sign have adjacent bit patterns.
    let a_bits = a.to_bits();
    let b_bits = b.to_bits();
    const SIGN_MASK: u64 = 1 << 63;
    if (a_bits & SIGN_MASK) != (b_bits & SIGN_MASK) {
        return false;
    }

    a_bits.abs_diff(b_bits) <= MAX_ULPS_DIFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_almost_equals_absorbs_rounding() {
        let d1 = 0.2;
        let d2 = 1.0 / 5f64.sqrt() / 5f64.sqrt();
        assert_ne!(d1, d2);
        assert!(almost_equals(d1, d2));
    }

    #[test]
    fn test_almost_equals_rejects_distant_values() {
        let d1 = 0.1;
        let d2 = 0.100000000000001;
        assert_ne!(d1, d2);
        assert!(!almost_equals(d1, d2));
    }

    #[test]
    fn test_almost_equals_edge_cases() {
        assert!(almost_equals(0.0, -0.0));
        assert!(!almost_equals(f64::NAN, f64::NAN));
        assert!(!almost_equals(1.0, -1.0));
        assert!(almost_equals(1e300, f64::from_bits(1e300f64.to_bits() + 4)));
        assert!(!almost_equals(1e300, f64::from_bits(1e300f64.to_bits() + 5)));
    }
}
