//! SIMD capability detection and vectorized f32 loops.
//!
//! The CPU provider's `[F32]` elementwise kernels call into these routines when
//! both operands have the output's shape. Feature detection happens once at
//! provider construction; every entry point falls back to a scalar loop.

#[cfg(target_arch = "x86_64")]
use std::arch::is_x86_feature_detected;

/// CPU SIMD capabilities detected at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimdCapabilities {
    /// SSE2 (baseline on x86_64).
    pub sse2: bool,
    /// AVX (256-bit float vectors).
    pub avx: bool,
    /// AVX2.
    pub avx2: bool,
    /// Fused multiply-add.
    pub fma: bool,
    /// AArch64 NEON.
    pub neon: bool,
}

impl SimdCapabilities {
    /// Widest float vector in bytes.
    pub fn vector_width(&self) -> usize {
        if self.avx || self.avx2 {
            32
        } else if self.sse2 || self.neon {
            16
        } else {
            8
        }
    }
}

/// Detect SIMD support on the current CPU.
pub fn detect_simd_capabilities() -> SimdCapabilities {
    #[cfg(target_arch = "x86_64")]
    {
        SimdCapabilities {
            sse2: is_x86_feature_detected!("sse2"),
            avx: is_x86_feature_detected!("avx"),
            avx2: is_x86_feature_detected!("avx2"),
            fma: is_x86_feature_detected!("fma"),
            neon: false,
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        SimdCapabilities {
            neon: true,
            fma: true,
            ..SimdCapabilities::default()
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        SimdCapabilities::default()
    }
}

/// Elementwise binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
}

impl BinaryOp {
    /// Parse a graph op type.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Add" => Some(Self::Add),
            "Sub" => Some(Self::Sub),
            "Mul" => Some(Self::Mul),
            "Div" => Some(Self::Div),
            _ => None,
        }
    }

    /// Apply to one pair of scalars.
    #[inline]
    pub fn apply<T>(self, a: T, b: T) -> T
    where
        T: std::ops::Add<Output = T>
            + std::ops::Sub<Output = T>
            + std::ops::Mul<Output = T>
            + std::ops::Div<Output = T>,
    {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
        }
    }
}

/// `result[i] = op(a[i], b[i])` using the widest available vectors.
///
/// # Panics
///
/// If the three slices differ in length.
pub fn simd_binary_f32(
    op: BinaryOp,
    a: &[f32],
    b: &[f32],
    result: &mut [f32],
    capabilities: &SimdCapabilities,
) {
    assert_eq!(a.len(), b.len());
    assert_eq!(a.len(), result.len());

    #[cfg(target_arch = "x86_64")]
    {
        if capabilities.avx {
            // SAFETY: AVX support was detected at runtime.
            unsafe { x86::avx_binary(op, a, b, result) };
            return;
        }
        if capabilities.sse2 {
            // SAFETY: SSE2 support was detected at runtime.
            unsafe { x86::sse_binary(op, a, b, result) };
            return;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = capabilities;

    scalar_binary_f32(op, a, b, result);
}

/// `result[i] = max(a[i], 0)`.
pub fn simd_relu_f32(a: &[f32], result: &mut [f32], capabilities: &SimdCapabilities) {
    assert_eq!(a.len(), result.len());

    #[cfg(target_arch = "x86_64")]
    {
        if capabilities.avx {
            // SAFETY: AVX support was detected at runtime.
            unsafe { x86::avx_relu(a, result) };
            return;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = capabilities;

    for (r, &x) in result.iter_mut().zip(a) {
        *r = x.max(0.0);
    }
}

fn scalar_binary_f32(op: BinaryOp, a: &[f32], b: &[f32], result: &mut [f32]) {
    for ((r, &x), &y) in result.iter_mut().zip(a).zip(b) {
        *r = op.apply(x, y);
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    use super::{scalar_binary_f32, BinaryOp};

    #[target_feature(enable = "avx")]
    pub unsafe fn avx_binary(op: BinaryOp, a: &[f32], b: &[f32], result: &mut [f32]) {
        let len = a.len();
        let simd_len = len & !7;
        let mut i = 0;
        while i < simd_len {
            let x = _mm256_loadu_ps(a.as_ptr().add(i));
            let y = _mm256_loadu_ps(b.as_ptr().add(i));
            let r = match op {
                BinaryOp::Add => _mm256_add_ps(x, y),
                BinaryOp::Sub => _mm256_sub_ps(x, y),
                BinaryOp::Mul => _mm256_mul_ps(x, y),
                BinaryOp::Div => _mm256_div_ps(x, y),
            };
            _mm256_storeu_ps(result.as_mut_ptr().add(i), r);
            i += 8;
        }
        scalar_binary_f32(op, &a[simd_len..], &b[simd_len..], &mut result[simd_len..]);
    }

    #[target_feature(enable = "sse2")]
    pub unsafe fn sse_binary(op: BinaryOp, a: &[f32], b: &[f32], result: &mut [f32]) {
        let len = a.len();
        let simd_len = len & !3;
        let mut i = 0;
        while i < simd_len {
            let x = _mm_loadu_ps(a.as_ptr().add(i));
            let y = _mm_loadu_ps(b.as_ptr().add(i));
            let r = match op {
                BinaryOp::Add => _mm_add_ps(x, y),
                BinaryOp::Sub => _mm_sub_ps(x, y),
                BinaryOp::Mul => _mm_mul_ps(x, y),
                BinaryOp::Div => _mm_div_ps(x, y),
            };
            _mm_storeu_ps(result.as_mut_ptr().add(i), r);
            i += 4;
        }
        scalar_binary_f32(op, &a[simd_len..], &b[simd_len..], &mut result[simd_len..]);
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn avx_relu(a: &[f32], result: &mut [f32]) {
        let len = a.len();
        let simd_len = len & !7;
        let zero = _mm256_setzero_ps();
        let mut i = 0;
        while i < simd_len {
            let x = _mm256_loadu_ps(a.as_ptr().add(i));
            _mm256_storeu_ps(result.as_mut_ptr().add(i), _mm256_max_ps(x, zero));
            i += 8;
        }
        for j in simd_len..len {
            result[j] = a[j].max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_capabilities() -> Vec<SimdCapabilities> {
        let detected = detect_simd_capabilities();
        let mut caps = vec![SimdCapabilities::default(), detected];
        if detected.avx {
            caps.push(SimdCapabilities {
                avx: false,
                avx2: false,
                ..detected
            });
        }
        caps
    }

    #[test]
    fn test_simd_detection() {
        let caps = detect_simd_capabilities();
        #[cfg(target_arch = "x86_64")]
        assert!(caps.sse2);
        assert!(caps.vector_width().is_power_of_two());
    }

    #[test]
    fn test_binary_ops_match_scalar() {
        let a: Vec<f32> = (0..19).map(|i| i as f32 + 1.0).collect();
        let b: Vec<f32> = (0..19).map(|i| (i % 5) as f32 + 0.5).collect();

        for caps in all_capabilities() {
            for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
                let mut out = vec![0.0; a.len()];
                simd_binary_f32(op, &a, &b, &mut out, &caps);
                for i in 0..a.len() {
                    assert_eq!(out[i], op.apply(a[i], b[i]), "{op:?} at {i} with {caps:?}");
                }
            }
        }
    }

    #[test]
    fn test_relu() {
        let a = [-3.0f32, -0.5, 0.0, 0.5, 2.0, -1.0, 7.0, -8.0, 9.0];
        for caps in all_capabilities() {
            let mut out = [0.0f32; 9];
            simd_relu_f32(&a, &mut out, &caps);
            assert_eq!(out, [0.0, 0.0, 0.0, 0.5, 2.0, 0.0, 7.0, 0.0, 9.0]);
        }
    }
}
