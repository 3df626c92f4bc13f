//! Native-code kernels attached to an artifact.
//!
//! The compiler may emit a shared library next to the graph and name it in
//! the `tessera.native_module` module attribute. Each `NativeKernel` node is
//! bound to the exported symbol carrying the node's name, called through the
//! C ABI below.

use std::fmt;
use std::os::raw::c_void;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use libloading::Library;
use tessera_core::{
    kernel_factory, DataType, Kernel, KernelContext, KernelDef, KernelRegistry, NATIVE_KERNEL_OP,
};
use tracing::debug;

/// Read-only tensor handed to native code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeTensor {
    /// Element type tag, see [`dtype_tag`].
    pub dtype: u32,
    /// Number of dimensions.
    pub rank: u32,
    /// `rank` dimensions.
    pub dims: *const usize,
    /// Element data.
    pub data: *const c_void,
    /// Data length in bytes.
    pub len: usize,
}

/// Writable tensor handed to native code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeTensorMut {
    /// Element type tag, see [`dtype_tag`].
    pub dtype: u32,
    /// Number of dimensions.
    pub rank: u32,
    /// `rank` dimensions.
    pub dims: *const usize,
    /// Element data.
    pub data: *mut c_void,
    /// Data length in bytes.
    pub len: usize,
}

/// Entry point of one native kernel; returns 0 on success.
pub type NativeKernelFn =
    unsafe extern "C" fn(*const NativeTensor, usize, *const NativeTensorMut, usize) -> i32;

/// Stable element type tag used across the C ABI.
pub fn dtype_tag(dtype: DataType) -> u32 {
    match dtype {
        DataType::F32 => 0,
        DataType::F64 => 1,
        DataType::I32 => 2,
        DataType::I64 => 3,
        DataType::U8 => 4,
        DataType::Bool => 5,
    }
}

/// A loaded native-code module.
pub trait NativeModule: Send + Sync + fmt::Debug {
    /// Where the module was loaded from.
    fn path(&self) -> &str;

    /// Look up a kernel entry point by name.
    fn symbol(&self, name: &str) -> Result<NativeKernelFn>;
}

/// Loads native-code modules named by artifacts.
pub trait NativeModuleLoader: Send + Sync + fmt::Debug {
    /// Load the module at `path`.
    fn load(&self, path: &str) -> Result<Arc<dyn NativeModule>>;
}

/// Loads modules as dynamic libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

struct DylibModule {
    path: String,
    library: Library,
}

impl fmt::Debug for DylibModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibModule").field("path", &self.path).finish()
    }
}

impl NativeModule for DylibModule {
    fn path(&self) -> &str {
        &self.path
    }

    fn symbol(&self, name: &str) -> Result<NativeKernelFn> {
        // SAFETY: the artifact contract declares every NativeKernel symbol
        // with the `NativeKernelFn` signature. The returned pointer stays
        // valid while `self.library` is loaded; kernels hold an `Arc` to the
        // module for that reason.
        unsafe {
            self.library
                .get::<NativeKernelFn>(name.as_bytes())
                .map(|symbol| *symbol)
        }
        .map_err(|e| anyhow!("symbol '{name}' not found in {}: {e}", self.path))
    }
}

impl NativeModuleLoader for DylibLoader {
    fn load(&self, path: &str) -> Result<Arc<dyn NativeModule>> {
        // SAFETY: loading runs the library's initializers. Modules come from
        // the compiler that produced the artifact and are trusted as such.
        let library = unsafe { Library::new(path) }
            .map_err(|e| anyhow!("failed to load native module {path}: {e}"))?;
        debug!(path, "Loaded native module");
        Ok(Arc::new(DylibModule {
            path: path.to_string(),
            library,
        }))
    }
}

/// A kernel implemented by a native entry point.
struct NativeKernel {
    // Keeps the library mapped for as long as `entry` may be called.
    _module: Arc<dyn NativeModule>,
    symbol: String,
    entry: NativeKernelFn,
    /// Declared static output shapes; `None` where the declaration is symbolic.
    declared: Vec<Option<Vec<usize>>>,
}

impl Kernel for NativeKernel {
    fn infer_output_shapes(&self, input_shapes: &[&[usize]]) -> Result<Vec<Vec<usize>>> {
        self.declared
            .iter()
            .map(|shape| match shape {
                Some(dims) => Ok(dims.clone()),
                None => input_shapes
                    .first()
                    .map(|s| s.to_vec())
                    .ok_or_else(|| anyhow!("'{}' has a symbolic output and no inputs", self.symbol)),
            })
            .collect()
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let inputs: Vec<NativeTensor> = ctx
            .inputs
            .iter()
            .map(|view| NativeTensor {
                dtype: dtype_tag(view.dtype()),
                rank: view.shape().len() as u32,
                dims: view.shape().as_ptr(),
                data: view.bytes().as_ptr().cast(),
                len: view.bytes().len(),
            })
            .collect();
        let outputs: Vec<NativeTensorMut> = ctx
            .outputs
            .iter_mut()
            .map(|view| {
                let dtype = dtype_tag(view.dtype());
                let shape = view.shape();
                let bytes = view.bytes_mut();
                NativeTensorMut {
                    dtype,
                    rank: shape.len() as u32,
                    dims: shape.as_ptr(),
                    data: bytes.as_mut_ptr().cast(),
                    len: bytes.len(),
                }
            })
            .collect();

        // SAFETY: every descriptor points into a view borrowed from `ctx`,
        // which outlives the call; outputs are disjoint from inputs.
        let status = unsafe {
            (self.entry)(
                inputs.as_ptr(),
                inputs.len(),
                outputs.as_ptr(),
                outputs.len(),
            )
        };
        if status != 0 {
            bail!("native kernel '{}' returned status {status}", self.symbol);
        }
        Ok(())
    }
}

/// Overlay registry binding `NativeKernel` nodes to `module`.
///
/// Symbol lookup happens when a node's kernel is created, so a missing symbol
/// surfaces as a kernel resolution failure for that node.
pub fn native_kernel_registry(module: Arc<dyn NativeModule>) -> tessera_core::Result<KernelRegistry> {
    let mut registry = KernelRegistry::new();
    registry.register(
        KernelDef::new(NATIVE_KERNEL_OP),
        kernel_factory(move |info| {
            let entry = module.symbol(&info.node.name)?;
            let declared = info
                .output_shapes()
                .into_iter()
                .map(|shape| shape.static_dims())
                .collect();
            Ok(Arc::new(NativeKernel {
                _module: module.clone(),
                symbol: info.node.name.clone(),
                entry,
                declared,
            }) as Arc<dyn Kernel>)
        }),
    )?;
    Ok(registry)
}
