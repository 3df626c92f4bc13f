//! Per-run execution state.
//!
//! A frame realizes every value of the graph for one run: graph inputs are
//! borrowed from the caller, arena values are slices of the run's arenas and
//! the remaining values get their own allocation from the producing provider.
//! Nodes are launched strictly in graph order. Before a node runs on one
//! provider, every other asynchronous provider with outstanding launches is
//! synchronized, so cross-provider reads always see completed writes.
//!
//! Cleanup happens in `Drop`, on success and failure alike: outstanding
//! launches are awaited before any buffer is freed or an arena goes back to
//! the pool.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tessera_core::types::dangling_aligned;
use tessera_core::{
    checked_byte_size, CoreError, DataType, KernelLaunch, LaunchTracker, OpNode, Placement,
    RawTensor, RawTensorMut, Result, Tensor, TensorBuffer, ValueId,
};
use tracing::{debug, trace, warn};

use crate::model::{CompiledModel, CompiledNode};
use crate::pool::{ArenaAllocFailure, ArenaSet, ShapeSignature};

/// A realized value.
struct Binding {
    ptr: *mut u8,
    len: usize,
    dtype: DataType,
    shape: Vec<usize>,
    /// Standalone storage and the slot whose allocator owns it.
    owned: Option<(usize, TensorBuffer)>,
}

impl Binding {
    fn raw(&self) -> RawTensor {
        RawTensor {
            ptr: self.ptr.cast_const(),
            len: self.len,
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
    }

    fn raw_mut(&self) -> RawTensorMut {
        RawTensorMut {
            ptr: self.ptr,
            len: self.len,
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
    }
}

pub(crate) struct ExecutionFrame<'m> {
    model: &'m CompiledModel,
    tracker: Arc<LaunchTracker>,
    signature: ShapeSignature,
    arenas: Option<ArenaSet>,
    bindings: Vec<Option<Binding>>,
    /// Standalone buffers released while a launch reading them may still be queued.
    deferred: Vec<(usize, TensorBuffer)>,
    /// Asynchronous slots with launches not yet synchronized.
    pending: Vec<bool>,
    touched: Vec<bool>,
}

impl<'m> ExecutionFrame<'m> {
    /// Run the model once.
    ///
    /// `inputs` must already have been validated against the graph inputs.
    pub(crate) fn execute(
        model: &'m CompiledModel,
        run_id: u64,
        inputs: &HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>> {
        let signature = ShapeSignature::of(model.plan().arenas());
        let arenas = model
            .pool()
            .acquire(&signature)
            .map_err(|failure| arena_failure(model, failure))?;
        let slots = model.providers().len();

        let mut frame = ExecutionFrame {
            model,
            tracker: Arc::new(LaunchTracker::new(run_id)),
            signature,
            arenas: Some(arenas),
            bindings: (0..model.graph().values().len()).map(|_| None).collect(),
            deferred: Vec::new(),
            pending: vec![false; slots],
            touched: vec![false; slots],
        };

        frame.bind_inputs(inputs)?;
        frame.dispatch()?;
        frame.synchronize_touched()?;
        frame.collect_outputs()
    }

    fn bind_inputs(&mut self, inputs: &HashMap<String, Tensor>) -> Result<()> {
        let graph = self.model.graph();
        for &value in graph.inputs() {
            let info = graph
                .value(value)
                .ok_or_else(|| CoreError::internal(format!("graph input {value} has no value info")))?;
            let tensor = inputs
                .get(&info.name)
                .ok_or_else(|| CoreError::invalid_argument(format!("missing input '{}'", info.name)))?;
            let bytes = tensor.as_bytes();
            self.bindings[value] = Some(Binding {
                ptr: bytes.as_ptr().cast_mut(),
                len: bytes.len(),
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
                owned: None,
            });
        }
        Ok(())
    }

    fn binding(&self, value: ValueId) -> Result<&Binding> {
        self.bindings
            .get(value)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::internal(format!("value {value} used before it was realized")))
    }

    fn dispatch(&mut self) -> Result<()> {
        let model = self.model;
        for compiled in model.nodes() {
            let node = model
                .graph()
                .node(compiled.node)
                .ok_or_else(|| CoreError::internal(format!("compiled node {} missing", compiled.node)))?;

            self.wait_for_other_providers(compiled.slot)?;

            let shapes = self.infer_output_shapes(compiled, node)?;
            let outputs = self.realize_outputs(compiled, node, shapes)?;
            let inputs = node
                .inputs
                .iter()
                .map(|&v| self.binding(v).map(Binding::raw))
                .collect::<Result<Vec<_>>>()?;

            // SAFETY: inputs point into caller tensors, run arenas or standalone
            // buffers, all of which this frame keeps alive until every provider
            // it launched on has been synchronized (see `Drop`). The planner
            // never lets an output share storage with a value live at the same
            // node, so outputs overlap neither each other nor any input.
            let launch = unsafe {
                KernelLaunch::new(
                    compiled.node,
                    compiled.name.clone(),
                    compiled.op_type.clone(),
                    compiled.kernel.clone(),
                    inputs,
                    outputs,
                )
            };

            let provider = &model.providers()[compiled.slot];
            trace!(
                node = compiled.node,
                name = %compiled.name,
                op = %compiled.op_type,
                provider = %provider.provider_key(),
                "Launching node"
            );
            self.touched[compiled.slot] = true;
            if provider.is_async() {
                self.pending[compiled.slot] = true;
            }
            provider.launch(launch, &self.tracker)?;

            self.release_after(compiled.node);
        }
        Ok(())
    }

    fn failure(&self, compiled: &CompiledNode, err: &anyhow::Error) -> CoreError {
        CoreError::dispatch(compiled.node, &compiled.name, &compiled.op_type, err)
    }

    fn infer_output_shapes(&self, compiled: &CompiledNode, node: &OpNode) -> Result<Vec<Vec<usize>>> {
        let input_shapes = node
            .inputs
            .iter()
            .map(|&v| self.binding(v).map(|b| b.shape.as_slice()))
            .collect::<Result<Vec<_>>>()?;
        let shapes = compiled
            .kernel
            .infer_output_shapes(&input_shapes)
            .map_err(|e| self.failure(compiled, &e))?;

        if shapes.len() != node.outputs.len() {
            return Err(self.failure(
                compiled,
                &anyhow!(
                    "kernel produced {} output shapes for {} outputs",
                    shapes.len(),
                    node.outputs.len()
                ),
            ));
        }
        for (&value, shape) in node.outputs.iter().zip(&shapes) {
            let info = self.model.graph().value(value).ok_or_else(|| {
                CoreError::internal(format!("node output {value} has no value info"))
            })?;
            if !info.shape.accepts(shape) {
                return Err(self.failure(
                    compiled,
                    &anyhow!(
                        "output '{}' has shape {:?} but is declared {}",
                        info.name,
                        shape,
                        info.shape
                    ),
                ));
            }
        }
        Ok(shapes)
    }

    fn realize_outputs(
        &mut self,
        compiled: &CompiledNode,
        node: &OpNode,
        shapes: Vec<Vec<usize>>,
    ) -> Result<Vec<RawTensorMut>> {
        let model = self.model;
        let mut outputs = Vec::with_capacity(shapes.len());

        for (&value, shape) in node.outputs.iter().zip(shapes) {
            let info = model
                .graph()
                .value(value)
                .ok_or_else(|| CoreError::internal(format!("node output {value} has no value info")))?;
            let plan = model
                .plan()
                .value(value)
                .ok_or_else(|| CoreError::internal(format!("value {value} missing from plan")))?;
            let len = checked_byte_size(&shape, info.dtype).ok_or_else(|| {
                self.failure(
                    compiled,
                    &anyhow!("output '{}' of shape {:?} overflows usize", info.name, shape),
                )
            })?;

            let (ptr, owned) = match plan.placement {
                Placement::Arena { arena, offset, size } => {
                    if len > size {
                        return Err(CoreError::internal(format!(
                            "value '{}' needs {len} bytes but {size} were planned",
                            info.name
                        )));
                    }
                    (self.arena_slice(arena, offset, size)?, None)
                }
                Placement::Standalone => {
                    let allocator = model.providers()[compiled.slot].get_allocator();
                    let alignment = allocator.constraints().alignment;
                    let buffer = allocator.allocate(len, alignment).map_err(|e| {
                        self.failure(
                            compiled,
                            &e.context(format!("failed to allocate output '{}'", info.name)),
                        )
                    })?;
                    (buffer.ptr.as_ptr(), Some((compiled.slot, buffer)))
                }
                Placement::GraphInput => {
                    return Err(CoreError::internal(format!(
                        "node {} writes graph input '{}'",
                        compiled.node, info.name
                    )));
                }
            };

            let binding = Binding {
                ptr,
                len,
                dtype: info.dtype,
                shape,
                owned,
            };
            outputs.push(binding.raw_mut());
            self.bindings[value] = Some(binding);
        }
        Ok(outputs)
    }

    fn arena_slice(&self, arena: usize, offset: usize, size: usize) -> Result<*mut u8> {
        let arenas = self
            .arenas
            .as_ref()
            .ok_or_else(|| CoreError::internal("run arenas already released"))?;
        if size == 0 {
            let alignment = self.model.plan().arenas().get(arena).map_or(1, |a| a.alignment);
            return Ok(dangling_aligned(alignment).as_ptr());
        }
        let base = arenas
            .base(arena)
            .ok_or_else(|| CoreError::internal(format!("no arena for provider slot {arena}")))?;
        if offset + size > arenas.size(arena) {
            return Err(CoreError::internal(format!(
                "slice {offset}+{size} exceeds arena {arena} of {} bytes",
                arenas.size(arena)
            )));
        }
        // SAFETY: the slice lies inside the arena allocation (checked above).
        Ok(unsafe { base.as_ptr().add(offset) })
    }

    /// Synchronize every asynchronous provider other than `slot` that still has
    /// launches in flight.
    fn wait_for_other_providers(&mut self, slot: usize) -> Result<()> {
        let model = self.model;
        for (other, provider) in model.providers().iter().enumerate() {
            if other != slot && self.pending[other] {
                debug!(provider = %provider.provider_key(), "Synchronizing producer");
                self.pending[other] = false;
                provider.synchronize(&self.tracker)?;
            }
        }
        if !self.any_pending() {
            self.free_deferred();
        }
        Ok(())
    }

    fn any_pending(&self) -> bool {
        self.pending.iter().any(|&p| p)
    }

    fn release_after(&mut self, node: usize) {
        let model = self.model;
        for value in model.plan().standalone_released_after(node) {
            let Some(owned) = self
                .bindings
                .get_mut(value)
                .and_then(Option::as_mut)
                .and_then(|b| b.owned.take())
            else {
                continue;
            };
            if self.pending.iter().any(|&p| p) {
                self.deferred.push(owned);
            } else {
                self.free_buffer(owned);
            }
        }
    }

    /// Synchronize every provider this run launched on and report the first
    /// failure.
    fn synchronize_touched(&mut self) -> Result<()> {
        let model = self.model;
        let mut first_error = None;
        for (slot, provider) in model.providers().iter().enumerate() {
            if !self.touched[slot] {
                continue;
            }
            self.pending[slot] = false;
            if let Err(e) = provider.synchronize(&self.tracker) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn collect_outputs(&self) -> Result<HashMap<String, Tensor>> {
        let graph = self.model.graph();
        let mut outputs = HashMap::with_capacity(graph.outputs().len());
        for &value in graph.outputs() {
            let info = graph
                .value(value)
                .ok_or_else(|| CoreError::internal(format!("graph output {value} has no value info")))?;
            let binding = self.binding(value)?;
            // SAFETY: every provider has been synchronized, so the buffer holds
            // the final contents and nothing writes to it any more.
            let bytes = unsafe { std::slice::from_raw_parts(binding.ptr.cast_const(), binding.len) };
            let tensor = Tensor::from_bytes(info.dtype, binding.shape.clone(), bytes)?;
            outputs.insert(info.name.clone(), tensor);
        }
        Ok(outputs)
    }

    fn free_buffer(&self, (slot, buffer): (usize, TensorBuffer)) {
        let provider = &self.model.providers()[slot];
        if let Err(e) = provider.get_allocator().deallocate(buffer) {
            warn!(provider = %provider.provider_key(), error = %e, "Failed to free buffer");
        }
    }

    fn free_deferred(&mut self) {
        for owned in std::mem::take(&mut self.deferred) {
            self.free_buffer(owned);
        }
    }
}

impl Drop for ExecutionFrame<'_> {
    fn drop(&mut self) {
        let model = self.model;
        for (slot, provider) in model.providers().iter().enumerate() {
            if self.pending[slot] {
                self.pending[slot] = false;
                if let Err(e) = provider.synchronize(&self.tracker) {
                    debug!(provider = %provider.provider_key(), error = %e, "Run failed on provider");
                }
            }
        }

        self.free_deferred();
        for binding in self.bindings.iter_mut().flatten() {
            if let Some(owned) = binding.owned.take() {
                let provider = &model.providers()[owned.0];
                if let Err(e) = provider.get_allocator().deallocate(owned.1) {
                    warn!(provider = %provider.provider_key(), error = %e, "Failed to free buffer");
                }
            }
        }
        if let Some(arenas) = self.arenas.take() {
            model.pool().release(self.signature.clone(), arenas);
        }
    }
}

/// Attribute an arena that could not be allocated to the first node writing
/// into it.
fn arena_failure(model: &CompiledModel, failure: ArenaAllocFailure) -> CoreError {
    let writer = model.nodes().iter().find(|compiled| {
        model.graph().node(compiled.node).is_some_and(|node| {
            node.outputs.iter().any(|&v| {
                model.plan().value(v).is_some_and(|p| {
                    matches!(p.placement, Placement::Arena { arena, .. } if arena == failure.slot)
                })
            })
        })
    });
    match writer {
        Some(compiled) => CoreError::dispatch(
            compiled.node,
            &compiled.name,
            &compiled.op_type,
            &failure.error,
        ),
        None => CoreError::internal(format!("{:#}", failure.error)),
    }
}
