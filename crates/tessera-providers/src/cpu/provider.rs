//! CPU execution provider implementation.
//!
//! Kernels run on a dedicated rayon pool: each launch is installed into the
//! pool, so data-parallel kernels split their work across the provider's
//! threads instead of the global rayon pool.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tessera_core::{
    AttributeValue, CoreError, ExecutionProvider, Graph, KernelLaunch, KernelRegistry,
    LaunchTracker, ProviderKey, Result, TensorAllocator, NATIVE_MODULE_ATTR,
};
use tracing::{debug, info, warn};

use super::kernels::register_cpu_kernels;
use super::native::{native_kernel_registry, DylibLoader, NativeModuleLoader};
use super::simd::{detect_simd_capabilities, SimdCapabilities};
use crate::allocator::{PoolConfig, PooledMemoryAllocator};
use crate::options::CpuProviderOptions;

/// Provider type tag of [`CpuExecutionProvider`].
pub const CPU_PROVIDER_TYPE: &str = "cpu";

/// CPU execution provider with SIMD kernels and a private thread pool.
pub struct CpuExecutionProvider {
    key: ProviderKey,
    options: CpuProviderOptions,
    /// SIMD capabilities detected at initialization.
    simd_capabilities: SimdCapabilities,
    /// `None` once shut down.
    thread_pool: RwLock<Option<Arc<ThreadPool>>>,
    allocator: Arc<PooledMemoryAllocator>,
    kernels: KernelRegistry,
    loader: Arc<dyn NativeModuleLoader>,
}

impl std::fmt::Debug for CpuExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuExecutionProvider")
            .field("key", &self.key)
            .field("simd", &self.simd_capabilities)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl CpuExecutionProvider {
    /// Create a CPU provider with default options.
    pub fn new() -> Result<Self> {
        Self::with_config(CpuProviderOptions::default())
    }

    /// Create a CPU provider from validated options.
    pub fn with_config(options: CpuProviderOptions) -> Result<Self> {
        Self::with_native_loader(options, Arc::new(DylibLoader))
    }

    /// Create a CPU provider that loads native modules through `loader`.
    pub fn with_native_loader(
        options: CpuProviderOptions,
        loader: Arc<dyn NativeModuleLoader>,
    ) -> Result<Self> {
        options.validate()?;

        let simd_capabilities = if options.enable_simd {
            detect_simd_capabilities()
        } else {
            SimdCapabilities::default()
        };
        debug!(?simd_capabilities, "Detected SIMD capabilities");

        let thread_count = options.effective_thread_count();
        let thread_pool_name = options.thread_pool_name.clone();
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(move |i| format!("{thread_pool_name}-worker-{i}"))
            .build()
            .map_err(|e| CoreError::invalid_option(format!("failed to create thread pool: {e}")))?;

        let allocator = PooledMemoryAllocator::new(
            PoolConfig {
                max_arena_bytes: options.max_arena_bytes,
                ..PoolConfig::default()
            },
            options.alignment,
        )
        .map_err(|e| CoreError::invalid_option(e.to_string()))?;

        let mut kernels = KernelRegistry::new();
        let simd = options.enable_simd.then_some(simd_capabilities);
        register_cpu_kernels(&mut kernels, simd)?;

        let key = ProviderKey::new(CPU_PROVIDER_TYPE, options.name.clone());
        info!(
            provider = %key,
            threads = thread_count,
            kernels = kernels.len(),
            "Created CPU execution provider"
        );

        Ok(Self {
            key,
            options,
            simd_capabilities,
            thread_pool: RwLock::new(Some(Arc::new(thread_pool))),
            allocator: Arc::new(allocator),
            kernels,
            loader,
        })
    }

    /// Options the provider was built from.
    pub fn get_config(&self) -> &CpuProviderOptions {
        &self.options
    }

    /// SIMD capabilities in use.
    pub fn get_simd_capabilities(&self) -> &SimdCapabilities {
        &self.simd_capabilities
    }

    /// Worker threads in the pool, or 0 after shutdown.
    pub fn thread_count(&self) -> usize {
        self.pool().map_or(0, |p| p.current_num_threads())
    }

    /// The pooled allocator, with its hit statistics.
    pub fn pooled_allocator(&self) -> &Arc<PooledMemoryAllocator> {
        &self.allocator
    }

    fn pool(&self) -> Option<Arc<ThreadPool>> {
        self.thread_pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_key(&self) -> &ProviderKey {
        &self.key
    }

    fn get_options(&self) -> BTreeMap<String, String> {
        self.options.to_map()
    }

    fn get_allocator(&self) -> Arc<dyn TensorAllocator> {
        self.allocator.clone()
    }

    fn get_kernel_registry(&self) -> &KernelRegistry {
        &self.kernels
    }

    fn negotiate_native_module(&self, graph: &Graph) -> Result<Option<KernelRegistry>> {
        let Some(path) = graph.attributes().get(NATIVE_MODULE_ATTR) else {
            return Ok(None);
        };
        let AttributeValue::String(path) = path else {
            warn!(provider = %self.key, "Native module attribute is not a path; ignoring");
            return Ok(None);
        };
        if !self.options.allow_native_modules {
            debug!(provider = %self.key, %path, "Native modules disabled; ignoring");
            return Ok(None);
        }

        match self.loader.load(path) {
            Ok(module) => {
                info!(provider = %self.key, %path, "Accepted native module");
                native_kernel_registry(module).map(Some)
            }
            Err(e) => {
                warn!(provider = %self.key, %path, error = %e, "Native module unusable; continuing without it");
                Ok(None)
            }
        }
    }

    fn launch(&self, launch: KernelLaunch, _tracker: &Arc<LaunchTracker>) -> Result<()> {
        let pool = self.pool().ok_or_else(|| {
            CoreError::internal(format!("provider {} is shut down", self.key))
        })?;
        pool.install(|| launch.execute())
    }

    fn shutdown(&self) -> Result<()> {
        let pool = self
            .thread_pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            self.allocator.clear_pools();
            info!(provider = %self.key, "Shut down CPU execution provider");
        }
        Ok(())
    }
}

/// Create a default CPU execution provider.
pub fn create_cpu_provider() -> Result<Arc<dyn ExecutionProvider>> {
    Ok(Arc::new(CpuExecutionProvider::new()?))
}

/// Create a CPU execution provider from options.
pub fn create_cpu_provider_with_config(
    options: CpuProviderOptions,
) -> Result<Arc<dyn ExecutionProvider>> {
    Ok(Arc::new(CpuExecutionProvider::with_config(options)?))
}
