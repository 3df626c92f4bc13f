//! Kernel trait, tensor views and launch records.
//!
//! A [`Kernel`] is created once per node at load time by a [`KernelFactory`]
//! and shared by every run. At run time the execution frame packs the realized
//! buffers of one node into a [`KernelLaunch`] and hands it to the node's
//! provider, which either executes it inline or queues it on a stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};

use crate::error::CoreError;
use crate::graph::{Graph, OpNode};
use crate::tensor::{element_matches, Element};
use crate::types::{numel, DataType, NodeId, Shape};

/// Read-only view of one kernel input.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    data: &'a [u8],
    dtype: DataType,
    shape: &'a [usize],
}

impl<'a> TensorView<'a> {
    /// Create a view over raw bytes.
    pub fn new(data: &'a [u8], dtype: DataType, shape: &'a [usize]) -> Self {
        Self { data, dtype, shape }
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Dimensions.
    pub fn shape(&self) -> &'a [usize] {
        self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        numel(self.shape)
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Typed elements.
    pub fn as_slice<T: Element>(&self) -> anyhow::Result<&'a [T]> {
        if !element_matches::<T>(self.dtype) {
            return Err(anyhow!("expected {} input, got {}", T::DTYPE, self.dtype));
        }
        bytemuck::try_cast_slice(self.data).map_err(|e| anyhow!("misaligned input buffer: {e}"))
    }
}

/// Writable view of one kernel output.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    data: &'a mut [u8],
    dtype: DataType,
    shape: &'a [usize],
}

impl<'a> TensorViewMut<'a> {
    /// Create a view over raw bytes.
    pub fn new(data: &'a mut [u8], dtype: DataType, shape: &'a [usize]) -> Self {
        Self { data, dtype, shape }
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Dimensions.
    pub fn shape(&self) -> &'a [usize] {
        self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        numel(self.shape)
    }

    /// Raw bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    /// Typed elements.
    pub fn as_slice_mut<T: Element>(&mut self) -> anyhow::Result<&mut [T]> {
        if !element_matches::<T>(self.dtype) {
            return Err(anyhow!("expected {} output, got {}", T::DTYPE, self.dtype));
        }
        bytemuck::try_cast_slice_mut(&mut *self.data)
            .map_err(|e| anyhow!("misaligned output buffer: {e}"))
    }
}

/// Everything a kernel sees during one invocation.
#[derive(Debug)]
pub struct KernelContext<'a> {
    /// Index of the node being executed.
    pub node: NodeId,
    /// Name of the node being executed.
    pub node_name: &'a str,
    /// Inputs in operand order.
    pub inputs: Vec<TensorView<'a>>,
    /// Outputs, shaped as returned by [`Kernel::infer_output_shapes`].
    pub outputs: Vec<TensorViewMut<'a>>,
}

impl<'a> KernelContext<'a> {
    /// Input `i`, or an error naming the missing operand.
    pub fn input(&self, i: usize) -> anyhow::Result<TensorView<'a>> {
        self.inputs
            .get(i)
            .copied()
            .with_context(|| format!("missing input {i}"))
    }

    /// Output `i`, or an error naming the missing operand.
    pub fn output(&mut self, i: usize) -> anyhow::Result<&mut TensorViewMut<'a>> {
        self.outputs
            .get_mut(i)
            .with_context(|| format!("missing output {i}"))
    }
}

/// A provider-bound implementation of one graph operation.
///
/// Kernels are shared by concurrent runs and must keep no per-run state.
pub trait Kernel: Send + Sync {
    /// Output shapes for the given concrete input shapes.
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> anyhow::Result<Vec<Vec<usize>>>;

    /// Compute outputs from inputs.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()>;
}

/// What a [`KernelFactory`] is given when binding a kernel to a node.
#[derive(Debug, Clone, Copy)]
pub struct KernelCreateInfo<'a> {
    /// The node being bound.
    pub node: &'a OpNode,
    /// The graph the node belongs to.
    pub graph: &'a Graph,
    /// Element types of the node inputs.
    pub input_types: &'a [DataType],
}

impl<'a> KernelCreateInfo<'a> {
    /// Declared shapes of the node outputs.
    pub fn output_shapes(&self) -> Vec<&'a Shape> {
        self.node
            .outputs
            .iter()
            .filter_map(|&v| self.graph.value(v).map(|info| &info.shape))
            .collect()
    }

    /// Declared element types of the node outputs.
    pub fn output_types(&self) -> Vec<DataType> {
        self.graph.output_types(self.node)
    }
}

/// Creates a kernel for a matched node.
pub type KernelFactory =
    Arc<dyn Fn(&KernelCreateInfo<'_>) -> anyhow::Result<Arc<dyn Kernel>> + Send + Sync>;

/// Wrap a closure as a [`KernelFactory`].
pub fn kernel_factory<F>(f: F) -> KernelFactory
where
    F: Fn(&KernelCreateInfo<'_>) -> anyhow::Result<Arc<dyn Kernel>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A realized input buffer.
#[derive(Debug, Clone)]
pub struct RawTensor {
    /// Start of the data.
    pub ptr: *const u8,
    /// Length in bytes.
    pub len: usize,
    /// Element type.
    pub dtype: DataType,
    /// Concrete shape.
    pub shape: Vec<usize>,
}

/// A realized output buffer.
#[derive(Debug, Clone)]
pub struct RawTensorMut {
    /// Start of the data.
    pub ptr: *mut u8,
    /// Length in bytes.
    pub len: usize,
    /// Element type.
    pub dtype: DataType,
    /// Concrete shape.
    pub shape: Vec<usize>,
}

/// One node's kernel invocation with its buffers bound.
pub struct KernelLaunch {
    node: NodeId,
    node_name: Arc<str>,
    op_type: Arc<str>,
    kernel: Arc<dyn Kernel>,
    inputs: Vec<RawTensor>,
    outputs: Vec<RawTensorMut>,
}

// SAFETY: the pointers inside a launch are only dereferenced by `execute`. The
// constructor contract requires the buffers to stay valid until the launch has
// run and the owning provider has been synchronized for the run.
unsafe impl Send for KernelLaunch {}

impl std::fmt::Debug for KernelLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelLaunch")
            .field("node", &self.node)
            .field("node_name", &self.node_name)
            .field("op_type", &self.op_type)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl KernelLaunch {
    /// Bind a kernel to realized buffers.
    ///
    /// # Safety
    ///
    /// Every input pointer must be valid for reads of `len` bytes and every
    /// output pointer valid for writes of `len` bytes, suitably aligned for the
    /// element type, until the launch has executed and the provider it was
    /// launched on has been synchronized. Outputs must not overlap each other
    /// or any input.
    pub unsafe fn new(
        node: NodeId,
        node_name: Arc<str>,
        op_type: Arc<str>,
        kernel: Arc<dyn Kernel>,
        inputs: Vec<RawTensor>,
        outputs: Vec<RawTensorMut>,
    ) -> Self {
        Self {
            node,
            node_name,
            op_type,
            kernel,
            inputs,
            outputs,
        }
    }

    /// Index of the launched node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Name of the launched node.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Operation type of the launched node.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Input buffers.
    pub fn inputs(&self) -> &[RawTensor] {
        &self.inputs
    }

    /// Output buffers.
    pub fn outputs(&self) -> &[RawTensorMut] {
        &self.outputs
    }

    /// Build a dispatch failure attributed to this launch.
    pub fn failure(&self, err: &anyhow::Error) -> CoreError {
        CoreError::dispatch(self.node, &self.node_name, &self.op_type, err)
    }

    /// Run the kernel on the calling thread.
    ///
    /// Kernel errors and panics both become [`CoreError::DispatchFailure`].
    pub fn execute(self) -> Result<(), CoreError> {
        // SAFETY: validity of every pointer is guaranteed by the contract of
        // `KernelLaunch::new`; zero-length buffers carry aligned dangling
        // pointers.
        let inputs: Vec<TensorView<'_>> = self
            .inputs
            .iter()
            .map(|t| unsafe {
                TensorView::new(std::slice::from_raw_parts(t.ptr, t.len), t.dtype, &t.shape)
            })
            .collect();
        let outputs: Vec<TensorViewMut<'_>> = self
            .outputs
            .iter()
            .map(|t| unsafe {
                TensorViewMut::new(
                    std::slice::from_raw_parts_mut(t.ptr, t.len),
                    t.dtype,
                    &t.shape,
                )
            })
            .collect();

        let mut ctx = KernelContext {
            node: self.node,
            node_name: &self.node_name,
            inputs,
            outputs,
        };
        let kernel = &self.kernel;
        let outcome = catch_unwind(AssertUnwindSafe(|| kernel.compute(&mut ctx)));
        drop(ctx);

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.failure(&err)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(self.failure(&anyhow!("kernel panicked: {message}")))
            }
        }
    }
}

/// Shared status of one run across every provider it touches.
///
/// Asynchronous providers record the first failure here; launches for a run
/// that has already failed are skipped.
#[derive(Debug)]
pub struct LaunchTracker {
    run_id: u64,
    failed: AtomicBool,
    first_error: Mutex<Option<CoreError>>,
}

impl LaunchTracker {
    /// Create a tracker for one run.
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Whether a failure has been recorded.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Record a failure; only the first one is kept.
    pub fn record_failure(&self, err: CoreError) {
        let mut slot = match self.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    /// The first recorded failure, if any.
    pub fn first_error(&self) -> Option<CoreError> {
        match self.first_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
