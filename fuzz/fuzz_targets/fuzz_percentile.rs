#![no_main]

use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use logmetrics::metrics::Proportions;

fuzz_target!(|input: (Vec<(i16, u16)>, u16)| {
    let (pairs, q) = input;
    let mut buckets: HashMap<i16, u64> = HashMap::new();
    for (bucket, count) in pairs {
        *buckets.entry(bucket).or_insert(0) += u64::from(count);
    }

    let proportions = Proportions::from_buckets(&buckets);
    let quantile = f64::from(q) / f64::from(u16::MAX);

    // Quantiles in [0, 1] always resolve when there is at least one sample
    match proportions.quantile(quantile) {
        Ok(_) => assert!(proportions.total_count() > 0),
        Err(_) => assert_eq!(proportions.total_count(), 0),
    }
});
