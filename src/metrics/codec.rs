//! Lossy logarithmic compression of histogram samples.
//!
//! A sample is stored as `round(100 * ln(1 + |v|))` with its sign preserved,
//! which keeps the decoded value within about 1% of the recorded sample for
//! magnitudes between roughly 0.51 and 1e142. Outside that range the encoding
//! loses accuracy (small values) or saturates the 16-bit key (huge values).
//!
//! ```
//! use logmetrics::metrics::codec::{compress, decompress};
//!
//! let bucket = compress(1_000.0);
//! let decoded = decompress(bucket);
//! assert!((decoded - 1_000.0).abs() / 1_000.0 < 0.01);
//! ```

/// Buckets per natural-log unit.
pub const PRECISION: f64 = 100.0;

/// Maps a sample to its bucket key.
#[inline]
pub fn compress(value: f64) -> i16 {
    // `as` saturates at the i16 bounds and maps NaN to 0
    let bucket = (PRECISION * value.abs().ln_1p() + 0.5) as i16;
    if value < 0.0 {
        -bucket
    } else {
        bucket
    }
}

/// Maps a bucket key back to a representative sample.
#[inline]
pub fn decompress(bucket: i16) -> f64 {
    let magnitude = (f64::from(bucket).abs() / PRECISION).exp_m1();
    if bucket < 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_round_trips() {
        assert_eq!(compress(0.0), 0);
        assert_eq!(decompress(0), 0.0);
    }

    #[test]
    fn test_relative_error_within_one_percent() {
        for value in [0.75, 1.0, 3.0, 42.0, 1_000.0, 123_456.0, 9.9e9, 1e12] {
            let decoded = decompress(compress(value));
            let error = (decoded - value).abs() / value;
            assert!(error <= 0.01, "value {} decoded to {} ({})", value, decoded, error);
        }
    }

    #[test]
    fn test_sign_is_preserved() {
        assert_eq!(compress(-250.0), -compress(250.0));
        assert!(decompress(compress(-250.0)) < 0.0);
    }

    #[test]
    fn test_monotonic_in_magnitude() {
        let mut previous = compress(0.0);
        let mut value = 0.5;
        while value < 1e15 {
            let bucket = compress(value);
            assert!(bucket >= previous);
            previous = bucket;
            value *= 1.37;
        }
    }

    #[test]
    fn test_huge_values_saturate() {
        assert_eq!(compress(f64::MAX), i16::MAX);
        assert_eq!(compress(f64::NEG_INFINITY), -i16::MAX);
    }
}
