//! CPU execution provider module.
//!
//! Multi-threaded CPU execution with SIMD elementwise kernels and optional
//! native-code kernels loaded from the artifact.

pub mod kernels;
pub mod native;
pub mod provider;
pub mod simd;

pub use kernels::{broadcast_shape, register_cpu_kernels, BinaryKernel, UnaryKernel, UnaryOp};
pub use native::{
    native_kernel_registry, DylibLoader, NativeKernelFn, NativeModule, NativeModuleLoader,
    NativeTensor, NativeTensorMut,
};
pub use provider::{
    create_cpu_provider, create_cpu_provider_with_config, CpuExecutionProvider, CPU_PROVIDER_TYPE,
};
pub use simd::{detect_simd_capabilities, BinaryOp, SimdCapabilities};
