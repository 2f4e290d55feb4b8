//! The dispatched kernels must agree with the scalar reference for every
//! length, including lengths that leave a tail after the vector loop.

use proptest::prelude::*;
use quiver_db::simd::{self, scalar};

fn pair(max_len: usize) -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
    (0..=max_len).prop_flat_map(|n| {
        (
            prop::collection::vec(-100.0f32..100.0, n),
            prop::collection::vec(-100.0f32..100.0, n),
        )
    })
}

fn tolerance(a: &[f32], b: &[f32]) -> f32 {
    let magnitude: f32 = a.iter().zip(b).map(|(x, y)| (x * y).abs()).sum();
    1e-4 * magnitude.max(1.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_dot_product_matches_scalar((a, b) in pair(300)) {
        let fast = simd::dot_product(&a, &b);
        let reference = scalar::dot_product(&a, &b);
        prop_assert!(
            (fast - reference).abs() <= tolerance(&a, &b),
            "n={} fast={} scalar={}", a.len(), fast, reference
        );
    }

    #[test]
    fn prop_l2_matches_scalar((a, b) in pair(300)) {
        let fast = simd::l2_distance_squared(&a, &b);
        let reference = scalar::l2_distance_squared(&a, &b);
        prop_assert!(
            (fast - reference).abs() <= 1e-4 * reference.max(1.0),
            "n={} fast={} scalar={}", a.len(), fast, reference
        );
        prop_assert!(simd::l2_distance(&a, &b) >= 0.0);
    }

    #[test]
    fn prop_dot_product_is_symmetric((a, b) in pair(64)) {
        let ab = simd::dot_product(&a, &b);
        let ba = simd::dot_product(&b, &a);
        prop_assert!((ab - ba).abs() <= tolerance(&a, &b));
    }
}

#[test]
fn tail_lengths_match_scalar() {
    for n in [1, 3, 4, 7, 8, 127, 768] {
        let a: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).cos()).collect();

        let fast = simd::dot_product(&a, &b);
        let reference = scalar::dot_product(&a, &b);
        assert!(
            (fast - reference).abs() <= tolerance(&a, &b),
            "n={n} fast={fast} scalar={reference}"
        );
    }
}
