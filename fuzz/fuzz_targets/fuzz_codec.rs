#![no_main]

use libfuzzer_sys::fuzz_target;
use logmetrics::metrics::{compress, decompress};

fuzz_target!(|data: [u8; 8]| {
    let value = f64::from_le_bytes(data);

    // Any sample, including NaN and infinities, must encode without panicking
    let bucket = compress(value);
    let decoded = decompress(bucket);

    assert_eq!(compress(-value), -bucket);
    if value.is_finite() && (1.0..1e12).contains(&value.abs()) {
        assert!((decoded - value).abs() / value.abs() <= 0.02);
    }
});
