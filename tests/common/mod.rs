//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// `start..start + count` as f32 values
pub fn f32_range(start: usize, count: usize) -> Vec<f32> {
    (start..start + count).map(|v| v as f32).collect()
}

/// Assert two float slices are approximately equal
pub fn assert_f32_slice_eq(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() < 1e-6,
            "Element {}: expected {} to be approximately equal to {}",
            i,
            a,
            e
        );
    }
}
