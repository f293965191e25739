use moult::HashMap;

// Run the test on different geometries of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>)) {
    // A minimal table that migrates almost immediately.
    test(&(|| HashMap::builder().capacity(1).density(0.5).build()));

    // A sparse table with short probe sequences.
    test(&(|| HashMap::builder().capacity(16).density(0.3).build()));

    // A dense table to stress probing and fullness detection.
    test(&(|| HashMap::builder().capacity(64).density(0.7).build()));
}
