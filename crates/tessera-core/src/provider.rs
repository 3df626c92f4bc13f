//! Execution provider and allocator abstractions.
//!
//! An [`ExecutionProvider`] is one hardware backend. It owns a
//! [`TensorAllocator`] and a [`KernelRegistry`] and decides how a bound
//! [`KernelLaunch`] is executed: inline on the caller (or a provider thread
//! pool) for synchronous backends, or queued on a stream for asynchronous ones.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::Graph;
use crate::kernel::{KernelLaunch, LaunchTracker};
use crate::registry::KernelRegistry;
use crate::types::{MemoryInfo, MemoryType, ProviderKey, TensorBuffer};

/// Limits a provider's allocator imposes on memory planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConstraints {
    /// Required alignment of every buffer and arena offset; a power of two.
    pub alignment: usize,
    /// Largest arena the allocator can back, if bounded.
    pub max_arena_bytes: Option<usize>,
}

impl Default for AllocatorConstraints {
    fn default() -> Self {
        Self {
            alignment: 64,
            max_arena_bytes: None,
        }
    }
}

/// Raw memory allocation for tensors.
pub trait TensorAllocator: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes aligned to at least `alignment`.
    fn allocate(&self, size: usize, alignment: usize) -> anyhow::Result<TensorBuffer>;

    /// Return a buffer obtained from [`TensorAllocator::allocate`].
    fn deallocate(&self, buffer: TensorBuffer) -> anyhow::Result<()>;

    /// Current usage.
    fn get_memory_info(&self) -> MemoryInfo;

    /// Memory kind of the buffers handed out.
    fn memory_type(&self) -> MemoryType;

    /// Planning constraints.
    fn constraints(&self) -> AllocatorConstraints;
}

/// A pluggable hardware backend.
///
/// Implementations must be usable from many runs at once; any mutable state
/// (allocator pools, stream queues) is synchronized internally.
pub trait ExecutionProvider: Send + Sync {
    /// Unique `(type, name)` identity.
    fn provider_key(&self) -> &ProviderKey;

    /// Provider type tag.
    fn provider_type(&self) -> &str {
        &self.provider_key().provider_type
    }

    /// Effective construction options, flattened to strings.
    fn get_options(&self) -> BTreeMap<String, String>;

    /// The allocator backing this provider's buffers.
    fn get_allocator(&self) -> Arc<dyn TensorAllocator>;

    /// Kernels built at construction.
    fn get_kernel_registry(&self) -> &KernelRegistry;

    /// Offer the graph's native-code module, if any.
    ///
    /// Returns an overlay registry of extra kernels when the provider can use
    /// the module. Providers without native-code support return `Ok(None)`.
    fn negotiate_native_module(&self, _graph: &Graph) -> Result<Option<KernelRegistry>> {
        Ok(None)
    }

    /// Execute or enqueue one kernel launch.
    ///
    /// Synchronous providers run the launch before returning and report its
    /// failure directly. Asynchronous providers return once the launch is
    /// queued and report failures through `tracker` at the next
    /// [`ExecutionProvider::synchronize`].
    fn launch(&self, launch: KernelLaunch, _tracker: &Arc<LaunchTracker>) -> Result<()> {
        launch.execute()
    }

    /// Whether launches complete asynchronously to the caller.
    fn is_async(&self) -> bool {
        false
    }

    /// Block until every launch of the tracked run has completed, then return
    /// the run's first failure, if any.
    fn synchronize(&self, tracker: &Arc<LaunchTracker>) -> Result<()> {
        match tracker.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release backend resources. Further launches fail.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionProvider")
            .field("key", self.provider_key())
            .field("kernels", &self.get_kernel_registry().len())
            .finish()
    }
}
