//! Integer-scaled load factor arithmetic.
//!
//! Thresholds are computed with a Q16 fixed-point multiplier so the hot path
//! never touches floating point. The multiplier-and-shift form is exact for
//! every capacity this crate can allocate.

use cfg_if::cfg_if;

/// Fixed-point scale: load factors are stored as `factor * 65536`.
pub(crate) const AMPLIFY_SHIFT: u32 = 16;

/// Lowest accepted max load factor (0.2).
pub(crate) const MIN_Q16: u32 = (0.2 * (1u32 << AMPLIFY_SHIFT) as f32) as u32;

/// Highest accepted max load factor (0.8).
pub(crate) const MAX_Q16: u32 = (0.8 * (1u32 << AMPLIFY_SHIFT) as f32) as u32;

cfg_if! {
    if #[cfg(feature = "load-factor-eighty")] {
        pub(crate) const DEFAULT_Q16: u32 = MAX_Q16;
    } else if #[cfg(feature = "load-factor-fifty")] {
        pub(crate) const DEFAULT_Q16: u32 = 1 << (AMPLIFY_SHIFT - 1);
    } else {
        pub(crate) const DEFAULT_Q16: u32 = 1 << (AMPLIFY_SHIFT - 1);
    }
}

/// Converts a caller-supplied factor to Q16, clamped to the supported range.
#[inline]
pub(crate) fn clamp_q16(mlf: f32) -> u32 {
    let q16 = (mlf * (1u32 << AMPLIFY_SHIFT) as f32) as u32;
    q16.clamp(MIN_Q16, MAX_Q16)
}

/// Returns the Q16 factor as an `f32` for reporting.
#[inline]
pub(crate) fn to_f32(q16: u32) -> f32 {
    q16 as f32 / (1u32 << AMPLIFY_SHIFT) as f32
}

/// Number of elements a table of `capacity` slots may hold before growing.
#[inline]
pub(crate) fn threshold(capacity: usize, q16: u32) -> usize {
    (capacity * q16 as usize) >> AMPLIFY_SHIFT
}

/// Smallest slot count whose threshold admits `elements`.
#[inline]
pub(crate) fn capacity_needed(elements: usize, q16: u32) -> usize {
    // ceil(elements * 2^16 / q16) so that threshold(result) >= elements.
    (elements << AMPLIFY_SHIFT).div_ceil(q16 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping() {
        assert_eq!(clamp_q16(0.0), MIN_Q16);
        assert_eq!(clamp_q16(1.0), MAX_Q16);
        assert_eq!(clamp_q16(0.5), 32768);
    }

    #[test]
    fn threshold_round_trips_capacity() {
        for &q16 in &[MIN_Q16, 32768, MAX_Q16] {
            for elements in [1usize, 7, 100, 10_000] {
                let capacity = capacity_needed(elements, q16).next_power_of_two();
                assert!(threshold(capacity, q16) >= elements);
            }
        }
    }

    #[test]
    fn threshold_is_strictly_below_capacity() {
        for capacity in [16usize, 32, 1024, 1 << 20] {
            assert!(threshold(capacity, MAX_Q16) < capacity);
        }
    }
}
