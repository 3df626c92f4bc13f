//! # Tessera Runtime
//!
//! Loads a compiled artifact onto a set of execution providers and runs it.
//!
//! ## Architecture
//!
//! - **Session**: owns the provider registry and the compiled model; compile
//!   once, run many
//! - **Compilation**: resolves one kernel per node across providers in priority
//!   order, then plans arena memory for intermediate values
//! - **Execution frame**: per-run buffer bindings and dispatch; arenas are
//!   pooled by arena layout between runs
//! - **Async**: [`AsyncSession`] moves blocking work onto tokio's blocking pool
//!
//! ## Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use tessera_core::{Artifact, DataType, GraphBuilder, Shape, Tensor};
//! use tessera_providers::CpuProviderOptions;
//! use tessera_runtime::{Session, SessionOptions};
//!
//! let mut b = GraphBuilder::new();
//! b.add_input("a", DataType::F32, Shape::fixed([2]))?;
//! b.add_input("b", DataType::F32, Shape::fixed([2]))?;
//! b.add_value("sum", DataType::F32, Shape::fixed([2]))?;
//! b.add_node("add", "Add", &["a", "b"], &["sum"])?;
//! b.add_output("sum")?;
//!
//! let options = SessionOptions::new().with_provider(CpuProviderOptions::default(), 0);
//! let session = Session::new(options);
//! session.load(Artifact::new(b.build()?))?;
//!
//! let outputs = session.run(HashMap::from([
//!     ("a".to_string(), Tensor::from_f32(vec![1.0, 2.0], vec![2])?),
//!     ("b".to_string(), Tensor::from_f32(vec![3.0, 4.0], vec![2])?),
//! ]))?;
//! assert_eq!(outputs["sum"].to_vec_f32()?, vec![4.0, 6.0]);
//! session.close()?;
//! # Ok::<(), tessera_core::CoreError>(())
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(clippy::all)]

pub mod async_session;
mod frame;
mod model;
pub mod options;
pub mod pool;
pub mod session;
pub mod statistics;

pub use async_session::AsyncSession;
pub use model::KernelAssignment;
pub use options::{ProviderSpec, SessionOptions};
pub use pool::{ArenaAllocFailure, ArenaPoolStats, ShapeSignature};
pub use session::{register_cpu_provider, register_stream_provider, Session, SessionState};
pub use statistics::SessionStatistics;

pub use tessera_core::{Artifact, CoreError, Result, StatusCode, Tensor};
