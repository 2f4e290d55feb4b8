//! SIMD distance kernels
//!
//! Explicit intrinsics for aarch64 (NEON) and x86_64 (AVX2+FMA), with a
//! scalar fallback. The implementation is chosen once, on first use, and
//! cached as a table of function pointers.
//!
//! | Platform     | ISA      | Width           | Intrinsics                              |
//! |--------------|----------|-----------------|-----------------------------------------|
//! | aarch64      | NEON     | 128-bit (4×f32) | `vld1q_f32`, `vfmaq_f32`, `vaddvq_f32`  |
//! | x86_64+AVX2  | AVX2+FMA | 256-bit (8×f32) | `_mm256_fmadd_ps`, `_mm256_sub_ps`      |
//! | other        | scalar   | 1×f32           | auto-vectorized iterator                |
//!
//! Vector kernels sum in a different order than the scalar loop, so results
//! may differ from [`scalar`] in the last bits.

use std::fmt;
use std::sync::OnceLock;

/// The kernel family selected for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    Avx2Fma,
    Neon,
    Scalar,
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KernelKind::Avx2Fma => "avx2+fma",
            KernelKind::Neon => "neon",
            KernelKind::Scalar => "scalar",
        })
    }
}

type Kernel = fn(&[f32], &[f32]) -> f32;

struct Kernels {
    kind: KernelKind,
    dot: Kernel,
    l2_squared: Kernel,
}

static KERNELS: OnceLock<Kernels> = OnceLock::new();

fn kernels() -> &'static Kernels {
    KERNELS.get_or_init(|| {
        let selected = detect();
        tracing::debug!(kernel = %selected.kind, "selected distance kernels");
        selected
    })
}

#[cfg(target_arch = "x86_64")]
fn detect() -> Kernels {
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        Kernels {
            kind: KernelKind::Avx2Fma,
            dot: avx2::dot_product,
            l2_squared: avx2::l2_distance_squared,
        }
    } else {
        scalar_kernels()
    }
}

#[cfg(target_arch = "aarch64")]
fn detect() -> Kernels {
    // NEON is mandatory on aarch64.
    Kernels {
        kind: KernelKind::Neon,
        dot: neon::dot_product,
        l2_squared: neon::l2_distance_squared,
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect() -> Kernels {
    scalar_kernels()
}

#[cfg_attr(target_arch = "aarch64", allow(dead_code))]
fn scalar_kernels() -> Kernels {
    Kernels {
        kind: KernelKind::Scalar,
        dot: scalar::dot_product,
        l2_squared: scalar::l2_distance_squared,
    }
}

// ============================================================================
// aarch64 NEON intrinsics
// ============================================================================

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    pub(super) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        // SAFETY: NEON is always present on aarch64; loads stay within the
        // first `chunks * 4` elements of equal-length slices.
        unsafe { dot_product_neon(a, b) }
    }

    pub(super) fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        // SAFETY: as above.
        unsafe { l2_distance_squared_neon(a, b) }
    }

    /// 4 floats per iteration
    #[inline(always)]
    unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let chunks = n / 4;

        let mut acc = vdupq_n_f32(0.0);
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = vld1q_f32(a_ptr.add(i * 4));
            let vb = vld1q_f32(b_ptr.add(i * 4));
            acc = vfmaq_f32(acc, va, vb); // acc += va * vb
        }

        let mut sum = vaddvq_f32(acc);
        for i in chunks * 4..n {
            sum += a[i] * b[i];
        }
        sum
    }

    #[inline(always)]
    unsafe fn l2_distance_squared_neon(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let chunks = n / 4;

        let mut acc = vdupq_n_f32(0.0);
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = vld1q_f32(a_ptr.add(i * 4));
            let vb = vld1q_f32(b_ptr.add(i * 4));
            let diff = vsubq_f32(va, vb);
            acc = vfmaq_f32(acc, diff, diff);
        }

        let mut sum = vaddvq_f32(acc);
        for i in chunks * 4..n {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }
}

// ============================================================================
// x86_64 AVX2 intrinsics
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    pub(super) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        // SAFETY: only installed after avx2 and fma were detected at runtime.
        unsafe { dot_product_avx2(a, b) }
    }

    pub(super) fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        // SAFETY: as above.
        unsafe { l2_distance_squared_avx2(a, b) }
    }

    /// Horizontal sum of 8 lanes
    #[target_feature(enable = "avx2,fma")]
    #[inline]
    unsafe fn hsum(acc: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(acc, 1);
        let lo = _mm256_castps256_ps128(acc);
        let sum128 = _mm_add_ps(lo, hi);
        let shuf = _mm_movehdup_ps(sum128);
        let sums = _mm_add_ps(sum128, shuf);
        let shuf2 = _mm_movehl_ps(sums, sums);
        _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
    }

    /// 8 floats per iteration, unaligned loads
    #[target_feature(enable = "avx2,fma")]
    #[inline]
    unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let chunks = n / 8;

        let mut acc = _mm256_setzero_ps();
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = _mm256_loadu_ps(a_ptr.add(i * 8));
            let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
            acc = _mm256_fmadd_ps(va, vb, acc); // acc += va * vb
        }

        let mut sum = hsum(acc);
        for i in chunks * 8..n {
            sum += a[i] * b[i];
        }
        sum
    }

    #[target_feature(enable = "avx2,fma")]
    #[inline]
    unsafe fn l2_distance_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let chunks = n / 8;

        let mut acc = _mm256_setzero_ps();
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = _mm256_loadu_ps(a_ptr.add(i * 8));
            let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
            let diff = _mm256_sub_ps(va, vb);
            acc = _mm256_fmadd_ps(diff, diff, acc); // acc += diff * diff
        }

        let mut sum = hsum(acc);
        for i in chunks * 8..n {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }
}

/// Reference implementations, always available.
pub mod scalar {
    #[inline]
    pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[inline]
    pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
    }

    #[inline]
    pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
        l2_distance_squared(a, b).sqrt()
    }
}

// ============================================================================
// Public dispatch functions
// ============================================================================

/// The kernel family used by [`dot_product`] and the L2 functions.
pub fn active_kernel() -> KernelKind {
    kernels().kind
}

/// Σ aᵢ·bᵢ
///
/// # Panics
///
/// Panics if the slices differ in length.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector length mismatch");
    (kernels().dot)(a, b)
}

/// ||a - b||², no square root.
///
/// # Panics
///
/// Panics if the slices differ in length.
#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector length mismatch");
    (kernels().l2_squared)(a, b)
}

/// ||a - b||
///
/// # Panics
///
/// Panics if the slices differ in length.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: f32, expected: f32, scale: f32) -> bool {
        (actual - expected).abs() <= 1e-4 * scale.max(1.0)
    }

    fn sample(n: usize, seed: u32) -> Vec<f32> {
        (0..n)
            .map(|i| ((i as u32).wrapping_mul(2654435761).wrapping_add(seed) % 2000) as f32 / 1000.0 - 1.0)
            .collect()
    }

    #[test]
    fn test_dot_product_basic() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];

        // 1*5 + 2*6 + 3*7 + 4*8 = 70
        assert!((dot_product(&a, &b) - 70.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_distance() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];

        // 3-4-5 triangle
        assert!((l2_distance(&a, &b) - 5.0).abs() < 1e-6);
        assert!((l2_distance_squared(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_vectors() {
        assert_eq!(dot_product(&[], &[]), 0.0);
        assert_eq!(l2_distance(&[], &[]), 0.0);
    }

    #[test]
    fn test_l2_distance_same_point() {
        let a = sample(37, 1);
        assert!(l2_distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn test_matches_scalar_across_lengths() {
        for n in [1, 3, 4, 7, 8, 9, 15, 16, 127, 768, 1536] {
            let a = sample(n, 7);
            let b = sample(n, 99);

            let magnitude: f32 = a.iter().zip(&b).map(|(x, y)| (x * y).abs()).sum();
            assert!(
                close(dot_product(&a, &b), scalar::dot_product(&a, &b), magnitude),
                "dot product diverged at n={n}"
            );

            let l2_scale = scalar::l2_distance_squared(&a, &b);
            assert!(
                close(l2_distance_squared(&a, &b), l2_scale, l2_scale),
                "l2 diverged at n={n}"
            );
        }
    }

    #[test]
    fn test_unaligned_slices() {
        let a = sample(40, 3);
        let b = sample(40, 5);
        // Offset by one float so AVX loads are never 32-byte aligned.
        let expected = scalar::dot_product(&a[1..], &b[1..]);
        assert!(close(dot_product(&a[1..], &b[1..]), expected, 40.0));
    }

    #[test]
    #[should_panic(expected = "vector length mismatch")]
    fn test_dot_product_length_mismatch() {
        dot_product(&[1.0, 2.0], &[1.0]);
    }

    #[test]
    #[should_panic(expected = "vector length mismatch")]
    fn test_l2_length_mismatch() {
        l2_distance(&[1.0], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_active_kernel_is_stable() {
        let first = active_kernel();
        assert_eq!(first, active_kernel());

        #[cfg(target_arch = "aarch64")]
        assert_eq!(first, KernelKind::Neon);
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        assert_eq!(first, KernelKind::Scalar);
    }
}
