//! Tessera execution provider framework
//!
//! This crate provides the concrete execution providers of the Tessera
//! runtime, including:
//! - Provider registry with priority-ordered kernel lookup
//! - Memory allocator implementations with pooling and SIMD alignment
//! - CPU execution provider with SIMD kernels, a private thread pool and
//!   native-code kernel modules
//! - Stream execution provider emulating an asynchronous accelerator
//! - Validated provider options and the factory protocol that builds
//!   providers from them
//!
//! ## Example
//!
//! ```rust
//! use tessera_providers::{
//!     create_cpu_provider_with_config, CpuProviderOptions, ProviderRegistry,
//! };
//!
//! let registry = ProviderRegistry::new();
//! let cpu = create_cpu_provider_with_config(CpuProviderOptions::default().with_thread_count(2))?;
//! registry.register_provider(cpu, 0)?;
//! assert_eq!(registry.get_statistics().provider_count, 1);
//! # Ok::<(), tessera_core::CoreError>(())
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(clippy::all)]

pub mod allocator;
pub mod cpu;
pub mod options;
pub mod registry;
pub mod stream;

pub use allocator::{
    AlignedMemoryAllocator, AllocatorStats, DeviceMemoryAllocator, PoolConfig, PoolStats,
    PooledMemoryAllocator, SIMD_ALIGNMENT,
};
pub use cpu::{
    create_cpu_provider, create_cpu_provider_with_config, detect_simd_capabilities,
    CpuExecutionProvider, DylibLoader, NativeKernelFn, NativeModule, NativeModuleLoader,
    NativeTensor, NativeTensorMut, SimdCapabilities, CPU_PROVIDER_TYPE,
};
pub use options::{
    CpuProviderOptions, ProviderFactories, ProviderFactory, ProviderOptions, StreamProviderOptions,
};
pub use registry::{ProviderRegistry, RegistryStatistics, ResolvedKernel};
pub use stream::{
    create_stream_provider_with_config, StreamExecutionProvider, StreamStatistics,
    STREAM_PROVIDER_TYPE,
};

pub use tessera_core::ExecutionProvider;

/// Create a registry holding one default CPU provider.
pub fn create_cpu_only_system() -> tessera_core::Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();
    registry.register_provider(create_cpu_provider()?, 0)?;
    tracing::info!("Registered CPU-only provider system");
    Ok(registry)
}
