//! Tessera core runtime abstractions
//!
//! This crate defines the pieces every execution backend and the session layer
//! agree on: the error taxonomy, the graph model, kernels and their registry,
//! the execution provider and allocator traits, and the static memory planner.
//!
//! ## Architecture
//!
//! - **Graph**: typed values and op nodes in execution order, built with
//!   [`GraphBuilder`] and wrapped in an [`Artifact`]
//! - **Kernels**: [`Kernel`] implementations created per node by factories held
//!   in a provider's [`KernelRegistry`]
//! - **Providers**: [`ExecutionProvider`] backends owning a [`TensorAllocator`]
//! - **Planning**: [`MemoryPlanner`] assigns arena offsets from value lifetimes
//!
//! ## Example
//!
//! ```rust
//! use tessera_core::{DataType, GraphBuilder, MemoryPlanner, AllocatorConstraints, Shape};
//!
//! let mut b = GraphBuilder::new();
//! b.add_input("x", DataType::F32, Shape::fixed([4]))?;
//! b.add_value("h", DataType::F32, Shape::fixed([4]))?;
//! b.add_value("y", DataType::F32, Shape::fixed([4]))?;
//! b.add_node("relu", "Relu", &["x"], &["h"])?;
//! b.add_node("neg", "Neg", &["h"], &["y"])?;
//! b.add_output("y")?;
//! let graph = b.build()?;
//!
//! let plan = MemoryPlanner::new().plan(&graph, &[0, 0], &[AllocatorConstraints::default()])?;
//! plan.verify()?;
//! assert_eq!(plan.arena_bytes(), 64);
//! # Ok::<(), tessera_core::CoreError>(())
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod tensor;
pub mod types;

pub use error::{CoreError, Result, StatusCode, StatusExt};
pub use graph::{Artifact, Graph, GraphBuilder, OpNode, ValueInfo, NATIVE_KERNEL_OP, NATIVE_MODULE_ATTR};
pub use kernel::{
    kernel_factory, Kernel, KernelContext, KernelCreateInfo, KernelFactory, KernelLaunch,
    LaunchTracker, RawTensor, RawTensorMut, TensorView, TensorViewMut,
};
pub use planner::{ArenaPlan, LiveRange, MemoryPlan, MemoryPlanner, Placement, ValuePlan};
pub use provider::{AllocatorConstraints, ExecutionProvider, TensorAllocator};
pub use registry::{KernelDef, KernelRegistry};
pub use tensor::{Element, Tensor, TensorData};
pub use types::{
    checked_byte_size, checked_numel, numel, AttributeValue, DataType, Dim, MemoryInfo, MemoryType, NodeId, ProviderKey, Shape,
    TensorBuffer, ValueId,
};
