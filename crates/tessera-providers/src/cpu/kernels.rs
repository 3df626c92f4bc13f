//! CPU kernel implementations.
//!
//! Elementwise kernels follow numpy broadcasting. Outputs above
//! [`PARALLEL_THRESHOLD`] elements are split across the rayon pool the
//! provider installs around each launch.

use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use rayon::prelude::*;
use tessera_core::{
    kernel_factory, numel, DataType, Element, Kernel, KernelContext, KernelCreateInfo, KernelDef,
    KernelRegistry, TensorView, TensorViewMut,
};

use super::simd::{simd_binary_f32, simd_relu_f32, BinaryOp, SimdCapabilities};

/// Element count above which kernels split work across threads.
pub const PARALLEL_THRESHOLD: usize = 1 << 15;

const CHUNK: usize = 4096;

/// Element types the generic arithmetic kernels accept.
pub const NUMERIC_TYPES: [DataType; 5] = [
    DataType::F32,
    DataType::F64,
    DataType::I32,
    DataType::I64,
    DataType::U8,
];

/// Arithmetic over one element type.
pub trait Arith: Element + PartialOrd {
    /// Additive identity.
    const ZERO: Self;

    /// Apply a binary op; `None` on integer division by zero.
    fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self>;

    /// Arithmetic negation (wrapping for integers).
    fn negate(self) -> Self;
}

macro_rules! impl_arith_float {
    ($($t:ty),*) => {$(
        impl Arith for $t {
            const ZERO: Self = 0.0;

            #[inline]
            fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self> {
                Some(op.apply(a, b))
            }

            #[inline]
            fn negate(self) -> Self {
                -self
            }
        }
    )*};
}

macro_rules! impl_arith_int {
    ($($t:ty),*) => {$(
        impl Arith for $t {
            const ZERO: Self = 0;

            #[inline]
            fn binary(op: BinaryOp, a: Self, b: Self) -> Option<Self> {
                match op {
                    BinaryOp::Add => Some(a.wrapping_add(b)),
                    BinaryOp::Sub => Some(a.wrapping_sub(b)),
                    BinaryOp::Mul => Some(a.wrapping_mul(b)),
                    BinaryOp::Div => a.checked_div(b),
                }
            }

            #[inline]
            fn negate(self) -> Self {
                self.wrapping_neg()
            }
        }
    )*};
}

impl_arith_float!(f32, f64);
impl_arith_int!(i32, i64, u8);

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => bail!("shapes {:?} and {:?} are not broadcastable", a, b),
        };
    }
    Ok(out)
}

/// Strides of `shape` viewed through the broadcast `out` shape (zero where
/// the input is broadcast).
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    let mut strides = vec![0; out.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        if shape[i] != 1 {
            strides[i + offset] = stride;
        }
        stride *= shape[i];
    }
    strides
}

fn source_index(mut linear: usize, out: &[usize], strides: &[usize]) -> usize {
    let mut index = 0;
    for d in (0..out.len()).rev() {
        let extent = out[d];
        index += (linear % extent) * strides[d];
        linear /= extent;
    }
    index
}

/// Broadcasting `out = f(a, b)`.
fn broadcast_binary<T, F>(
    a: &[T],
    a_shape: &[usize],
    b: &[T],
    b_shape: &[usize],
    out: &mut [T],
    out_shape: &[usize],
    f: F,
) -> Result<()>
where
    T: Arith,
    F: Fn(T, T) -> Option<T> + Sync,
{
    let a_strides = broadcast_strides(a_shape, out_shape);
    let b_strides = broadcast_strides(b_shape, out_shape);
    let same = a_shape == out_shape && b_shape == out_shape;

    let fill = |start: usize, chunk: &mut [T]| -> Result<()> {
        for (k, slot) in chunk.iter_mut().enumerate() {
            let i = start + k;
            let (x, y) = if same {
                (a[i], b[i])
            } else {
                (
                    a[source_index(i, out_shape, &a_strides)],
                    b[source_index(i, out_shape, &b_strides)],
                )
            };
            *slot = f(x, y).ok_or_else(|| anyhow!("integer division by zero"))?;
        }
        Ok(())
    };

    if out.len() >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(CHUNK)
            .enumerate()
            .try_for_each(|(c, chunk)| fill(c * CHUNK, chunk))
    } else {
        fill(0, out)
    }
}

fn map_unary<T, F>(x: &[T], out: &mut [T], f: F)
where
    T: Arith,
    F: Fn(T) -> T + Sync,
{
    if out.len() >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(CHUNK)
            .zip(x.par_chunks(CHUNK))
            .for_each(|(o, i)| o.iter_mut().zip(i).for_each(|(o, &v)| *o = f(v)));
    } else {
        out.iter_mut().zip(x).for_each(|(o, &v)| *o = f(v));
    }
}

fn binary_typed<T: Arith>(
    op: BinaryOp,
    a: TensorView<'_>,
    b: TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> Result<()> {
    let out_shape = out.shape();
    broadcast_binary(
        a.as_slice::<T>()?,
        a.shape(),
        b.as_slice::<T>()?,
        b.shape(),
        out.as_slice_mut::<T>()?,
        out_shape,
        |x, y| T::binary(op, x, y),
    )
}

/// Broadcasting `Add`, `Sub`, `Mul` and `Div`.
///
/// With SIMD capabilities set, same-shape `f32` operands take the vectorized
/// path; everything else runs the generic broadcast loop.
#[derive(Debug, Clone)]
pub struct BinaryKernel {
    op: BinaryOp,
    simd: Option<SimdCapabilities>,
}

impl BinaryKernel {
    /// Generic kernel for any numeric type.
    pub fn generic(op: BinaryOp) -> Self {
        Self { op, simd: None }
    }

    /// `f32` kernel using the given vector units.
    pub fn simd_f32(op: BinaryOp, capabilities: SimdCapabilities) -> Self {
        Self {
            op,
            simd: Some(capabilities),
        }
    }
}

impl Kernel for BinaryKernel {
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        ensure!(
            input_shapes.len() == 2,
            "{:?} takes 2 inputs, got {}",
            self.op,
            input_shapes.len()
        );
        Ok(vec![broadcast_shape(input_shapes[0], input_shapes[1])?])
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let a = ctx.input(0)?;
        let b = ctx.input(1)?;
        let op = self.op;
        let out = ctx.output(0)?;

        if let Some(caps) = &self.simd {
            if a.shape() == out.shape() && b.shape() == out.shape() {
                let x = a.as_slice::<f32>()?;
                let y = b.as_slice::<f32>()?;
                let o = out.as_slice_mut::<f32>()?;
                if o.len() >= PARALLEL_THRESHOLD {
                    o.par_chunks_mut(CHUNK)
                        .zip(x.par_chunks(CHUNK).zip(y.par_chunks(CHUNK)))
                        .for_each(|(o, (x, y))| simd_binary_f32(op, x, y, o, caps));
                } else {
                    simd_binary_f32(op, x, y, o, caps);
                }
                return Ok(());
            }
        }

        match a.dtype() {
            DataType::F32 => binary_typed::<f32>(op, a, b, out),
            DataType::F64 => binary_typed::<f64>(op, a, b, out),
            DataType::I32 => binary_typed::<i32>(op, a, b, out),
            DataType::I64 => binary_typed::<i64>(op, a, b, out),
            DataType::U8 => binary_typed::<u8>(op, a, b, out),
            other => bail!("{:?} does not support {}", op, other),
        }
    }
}

/// Elementwise unary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `max(x, 0)`
    Relu,
    /// `-x`
    Neg,
    /// `1 / (1 + e^-x)`
    Sigmoid,
}

/// Elementwise unary kernel.
#[derive(Debug, Clone)]
pub struct UnaryKernel {
    op: UnaryOp,
    simd: Option<SimdCapabilities>,
}

impl UnaryKernel {
    /// Create a unary kernel; SIMD capabilities speed up `f32` Relu.
    pub fn new(op: UnaryOp, simd: Option<SimdCapabilities>) -> Self {
        Self { op, simd }
    }

    fn apply<T: Arith>(&self, x: &[T], out: &mut [T]) {
        match self.op {
            UnaryOp::Relu => map_unary(x, out, |v| if v > T::ZERO { v } else { T::ZERO }),
            UnaryOp::Neg => map_unary(x, out, T::negate),
            UnaryOp::Sigmoid => unreachable!("sigmoid is float-only"),
        }
    }
}

impl Kernel for UnaryKernel {
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        ensure!(input_shapes.len() == 1, "{:?} takes 1 input", self.op);
        Ok(vec![input_shapes[0].to_vec()])
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let out = ctx.output(0)?;

        match (self.op, x.dtype()) {
            (UnaryOp::Sigmoid, DataType::F32) => map_unary(
                x.as_slice::<f32>()?,
                out.as_slice_mut::<f32>()?,
                |v| 1.0 / (1.0 + (-v).exp()),
            ),
            (UnaryOp::Sigmoid, DataType::F64) => map_unary(
                x.as_slice::<f64>()?,
                out.as_slice_mut::<f64>()?,
                |v| 1.0 / (1.0 + (-v).exp()),
            ),
            (UnaryOp::Sigmoid, other) => bail!("Sigmoid does not support {other}"),
            (UnaryOp::Relu, DataType::F32) if self.simd.is_some() => {
                let caps = self.simd.unwrap_or_default();
                simd_relu_f32(x.as_slice::<f32>()?, out.as_slice_mut::<f32>()?, &caps);
            }
            (_, DataType::F32) => self.apply(x.as_slice::<f32>()?, out.as_slice_mut::<f32>()?),
            (_, DataType::F64) => self.apply(x.as_slice::<f64>()?, out.as_slice_mut::<f64>()?),
            (_, DataType::I32) => self.apply(x.as_slice::<i32>()?, out.as_slice_mut::<i32>()?),
            (_, DataType::I64) => self.apply(x.as_slice::<i64>()?, out.as_slice_mut::<i64>()?),
            (_, DataType::U8) => self.apply(x.as_slice::<u8>()?, out.as_slice_mut::<u8>()?),
            (op, other) => bail!("{op:?} does not support {other}"),
        }
        Ok(())
    }
}

/// Copies its input; accepts any element type.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKernel;

impl Kernel for IdentityKernel {
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        ensure!(input_shapes.len() == 1, "Identity takes 1 input");
        Ok(vec![input_shapes[0].to_vec()])
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let x = ctx.input(0)?;
        let out = ctx.output(0)?;
        ensure!(x.dtype() == out.dtype(), "Identity cannot convert {} to {}", x.dtype(), out.dtype());
        out.bytes_mut().copy_from_slice(x.bytes());
        Ok(())
    }
}

/// 2-D `f32` matrix product `[M, K] x [K, N] -> [M, N]`, rows in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatMulKernel;

impl Kernel for MatMulKernel {
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        ensure!(input_shapes.len() == 2, "MatMul takes 2 inputs");
        let (a, b) = (input_shapes[0], input_shapes[1]);
        ensure!(
            a.len() == 2 && b.len() == 2,
            "MatMul expects 2-D operands, got {:?} and {:?}",
            a,
            b
        );
        ensure!(
            a[1] == b[0],
            "MatMul inner dimensions differ: {:?} x {:?}",
            a,
            b
        );
        Ok(vec![vec![a[0], b[1]]])
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let a = ctx.input(0)?;
        let b = ctx.input(1)?;
        let (k, n) = (a.shape()[1], b.shape()[1]);
        let x = a.as_slice::<f32>()?;
        let y = b.as_slice::<f32>()?;
        let out = ctx.output(0)?.as_slice_mut::<f32>()?;
        if n == 0 {
            return Ok(());
        }

        let row = |(i, dst): (usize, &mut [f32])| {
            dst.fill(0.0);
            for p in 0..k {
                let av = x[i * k + p];
                let brow = &y[p * n..(p + 1) * n];
                for (d, &bv) in dst.iter_mut().zip(brow) {
                    *d += av * bv;
                }
            }
        };
        if numel(&[a.shape()[0], k, n]) >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(n).enumerate().for_each(row);
        } else {
            out.chunks_mut(n).enumerate().for_each(row);
        }
        Ok(())
    }
}

fn uniform_types(info: &KernelCreateInfo<'_>) -> Result<()> {
    if let Some(first) = info.input_types.first() {
        ensure!(
            info.input_types.iter().all(|t| t == first),
            "node '{}' mixes input types {:?}",
            info.node.name,
            info.input_types
        );
    }
    Ok(())
}

/// Register the CPU kernel set.
pub fn register_cpu_kernels(
    registry: &mut KernelRegistry,
    simd: Option<SimdCapabilities>,
) -> tessera_core::Result<()> {
    for (name, op) in [
        ("Add", BinaryOp::Add),
        ("Sub", BinaryOp::Sub),
        ("Mul", BinaryOp::Mul),
        ("Div", BinaryOp::Div),
    ] {
        registry.register(
            KernelDef::new(name).type_constraint(NUMERIC_TYPES),
            kernel_factory(move |info| {
                uniform_types(info)?;
                Ok(Arc::new(BinaryKernel::generic(op)) as Arc<dyn Kernel>)
            }),
        )?;
        if let Some(caps) = simd {
            registry.register(
                KernelDef::new(name).type_constraint([DataType::F32]),
                kernel_factory(move |_| {
                    Ok(Arc::new(BinaryKernel::simd_f32(op, caps)) as Arc<dyn Kernel>)
                }),
            )?;
        }
    }

    for (name, op) in [("Relu", UnaryOp::Relu), ("Neg", UnaryOp::Neg)] {
        registry.register(
            KernelDef::new(name).type_constraint(NUMERIC_TYPES),
            kernel_factory(move |_| Ok(Arc::new(UnaryKernel::new(op, simd)) as Arc<dyn Kernel>)),
        )?;
    }
    registry.register(
        KernelDef::new("Sigmoid").type_constraint([DataType::F32, DataType::F64]),
        kernel_factory(|_| Ok(Arc::new(UnaryKernel::new(UnaryOp::Sigmoid, None)) as Arc<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::new("Identity"),
        kernel_factory(|_| Ok(Arc::new(IdentityKernel) as Arc<dyn Kernel>)),
    )?;
    registry.register(
        KernelDef::new("MatMul").type_constraint([DataType::F32]),
        kernel_factory(|_| Ok(Arc::new(MatMulKernel) as Arc<dyn Kernel>)),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kernel: &dyn Kernel, inputs: &[(&[f32], &[usize])]) -> Result<(Vec<f32>, Vec<usize>)> {
        let shapes: Vec<&[usize]> = inputs.iter().map(|(_, s)| *s).collect();
        let out_shape = kernel.infer_output_shapes(&shapes)?.remove(0);
        let mut out = vec![0.0f32; out_shape.iter().product()];
        {
            let views = inputs
                .iter()
                .map(|(d, s)| TensorView::new(bytemuck::cast_slice(d), DataType::F32, s))
                .collect();
            let mut ctx = KernelContext {
                node: 0,
                node_name: "test",
                inputs: views,
                outputs: vec![TensorViewMut::new(
                    bytemuck::cast_slice_mut(&mut out),
                    DataType::F32,
                    &out_shape,
                )],
            };
            kernel.compute(&mut ctx)?;
        }
        Ok((out, out_shape))
    }

    #[test]
    fn test_broadcast_shape() -> Result<()> {
        assert_eq!(broadcast_shape(&[2, 3], &[3])?, vec![2, 3]);
        assert_eq!(broadcast_shape(&[4, 1], &[1, 5])?, vec![4, 5]);
        assert_eq!(broadcast_shape(&[], &[2])?, vec![2]);
        assert!(broadcast_shape(&[2, 3], &[2]).is_err());
        Ok(())
    }

    #[test]
    fn test_broadcast_add() -> Result<()> {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [10.0, 20.0, 30.0];
        let (out, shape) = run(
            &BinaryKernel::generic(BinaryOp::Add),
            &[(&a, &[2, 3]), (&b, &[3])],
        )?;
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
        Ok(())
    }

    #[test]
    fn test_simd_kernel_falls_back_when_broadcasting() -> Result<()> {
        let caps = super::super::simd::detect_simd_capabilities();
        let kernel = BinaryKernel::simd_f32(BinaryOp::Mul, caps);
        let a = [1.0, 2.0, 3.0, 4.0];
        let col = [10.0, 100.0];
        let (out, _) = run(&kernel, &[(&a, &[2, 2]), (&col, &[2, 1])])?;
        assert_eq!(out, vec![10.0, 20.0, 300.0, 400.0]);
        Ok(())
    }

    #[test]
    fn test_large_parallel_sub() -> Result<()> {
        let n = PARALLEL_THRESHOLD * 2 + 3;
        let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let b = vec![1.0f32; n];
        let (out, _) = run(&BinaryKernel::generic(BinaryOp::Sub), &[(&a, &[n]), (&b, &[n])])?;
        assert_eq!(out[0], -1.0);
        assert_eq!(out[n - 1], (n - 2) as f32);
        Ok(())
    }

    #[test]
    fn test_integer_division_by_zero() {
        let a = [4i32, 9];
        let b = [2i32, 0];
        let mut out = [0i32; 2];
        let mut ctx = KernelContext {
            node: 0,
            node_name: "div",
            inputs: vec![
                TensorView::new(bytemuck::cast_slice(&a), DataType::I32, &[2]),
                TensorView::new(bytemuck::cast_slice(&b), DataType::I32, &[2]),
            ],
            outputs: vec![TensorViewMut::new(
                bytemuck::cast_slice_mut(&mut out),
                DataType::I32,
                &[2],
            )],
        };
        let err = BinaryKernel::generic(BinaryOp::Div)
            .compute(&mut ctx)
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_unary_kernels() -> Result<()> {
        let x = [-2.0, 0.0, 3.0];
        let (relu, _) = run(&UnaryKernel::new(UnaryOp::Relu, None), &[(&x, &[3])])?;
        assert_eq!(relu, vec![0.0, 0.0, 3.0]);
        let (neg, _) = run(&UnaryKernel::new(UnaryOp::Neg, None), &[(&x, &[3])])?;
        assert_eq!(neg, vec![2.0, -0.0, -3.0]);
        let (sig, _) = run(&UnaryKernel::new(UnaryOp::Sigmoid, None), &[(&x, &[3])])?;
        assert!((sig[1] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_matmul() -> Result<()> {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let (out, shape) = run(&MatMulKernel, &[(&a, &[2, 3]), (&b, &[3, 2])])?;
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(out, vec![58.0, 64.0, 139.0, 154.0]);
        assert!(MatMulKernel.infer_output_shapes(&[&[2, 3], &[2, 3]]).is_err());
        Ok(())
    }

    #[test]
    fn test_registration_prefers_simd_for_f32() -> Result<()> {
        let mut registry = KernelRegistry::new();
        register_cpu_kernels(&mut registry, Some(SimdCapabilities::default()))?;
        let node = tessera_core::OpNode {
            index: 0,
            name: "add".into(),
            op_type: "Add".into(),
            attributes: Default::default(),
            inputs: vec![],
            outputs: vec![],
        };
        let (def, _) = registry.resolve(&node, &[DataType::F32, DataType::F32]).expect("f32");
        assert_eq!(def.type_constraints().len(), 1);
        let (def, _) = registry.resolve(&node, &[DataType::I64, DataType::I64]).expect("i64");
        assert_eq!(def.type_constraints().len(), NUMERIC_TYPES.len());
        assert!(registry.resolve(&node, &[DataType::Bool, DataType::Bool]).is_none());
        Ok(())
    }
}
