//! Stream-based accelerator provider.
//!
//! A host-emulated device: memory comes from a capacity-limited allocator and
//! kernels execute on device streams, asynchronously to the caller. Every run
//! is pinned to one stream, so its launches execute in issue order.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tessera_core::{
    kernel_factory, CoreError, DataType, ExecutionProvider, Kernel, KernelDef, KernelLaunch,
    KernelRegistry, LaunchTracker, ProviderKey, Result, TensorAllocator,
};
use tracing::{debug, info};

use super::worker::DeviceStream;
use crate::allocator::DeviceMemoryAllocator;
use crate::cpu::{BinaryKernel, BinaryOp, UnaryKernel, UnaryOp};
use crate::options::StreamProviderOptions;

/// Provider type tag of [`StreamExecutionProvider`].
pub const STREAM_PROVIDER_TYPE: &str = "stream";

/// Launch counters summed over all streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatistics {
    /// Launches executed.
    pub executed: u64,
    /// Launches skipped because their run had already failed.
    pub skipped: u64,
    /// Launches that failed.
    pub failed: u64,
}

/// Asynchronous provider backed by device streams.
#[derive(Debug)]
pub struct StreamExecutionProvider {
    key: ProviderKey,
    options: StreamProviderOptions,
    streams: Vec<DeviceStream>,
    allocator: Arc<DeviceMemoryAllocator>,
    kernels: KernelRegistry,
}

fn device_kernels() -> Result<KernelRegistry> {
    let mut kernels = KernelRegistry::new();
    for (name, op) in [("Add", BinaryOp::Add), ("Mul", BinaryOp::Mul)] {
        kernels.register(
            KernelDef::new(name).type_constraint([DataType::F32]),
            kernel_factory(move |_| Ok(Arc::new(BinaryKernel::generic(op)) as Arc<dyn Kernel>)),
        )?;
    }
    kernels.register(
        KernelDef::new("Relu").type_constraint([DataType::F32]),
        kernel_factory(|_| Ok(Arc::new(UnaryKernel::new(UnaryOp::Relu, None)) as Arc<dyn Kernel>)),
    )?;
    Ok(kernels)
}

impl StreamExecutionProvider {
    /// Create a stream provider from validated options.
    pub fn with_config(options: StreamProviderOptions) -> Result<Self> {
        options.validate()?;

        let allocator = DeviceMemoryAllocator::new(options.memory_limit, options.alignment)
            .map_err(|e| CoreError::invalid_option(e.to_string()))?;
        let key = ProviderKey::new(STREAM_PROVIDER_TYPE, options.name.clone());
        let streams = (0..options.stream_count)
            .map(|i| DeviceStream::spawn(&format!("{}{}", options.name, options.device_index), i))
            .collect::<Result<Vec<_>>>()?;
        let kernels = device_kernels()?;

        info!(
            provider = %key,
            device = options.device_index,
            streams = streams.len(),
            memory_limit = options.memory_limit,
            "Created stream execution provider"
        );

        Ok(Self {
            key,
            options,
            streams,
            allocator: Arc::new(allocator),
            kernels,
        })
    }

    /// Number of device streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The stream a run is pinned to.
    pub fn stream_for_run(&self, run_id: u64) -> usize {
        (run_id % self.streams.len() as u64) as usize
    }

    /// The device allocator.
    pub fn device_allocator(&self) -> &Arc<DeviceMemoryAllocator> {
        &self.allocator
    }

    /// Launch counters summed over all streams.
    pub fn get_statistics(&self) -> StreamStatistics {
        self.streams
            .iter()
            .fold(StreamStatistics::default(), |mut acc, s| {
                let c = s.counters();
                acc.executed += c.executed.load(Ordering::Relaxed);
                acc.skipped += c.skipped.load(Ordering::Relaxed);
                acc.failed += c.failed.load(Ordering::Relaxed);
                acc
            })
    }

    fn stream(&self, tracker: &LaunchTracker) -> &DeviceStream {
        &self.streams[self.stream_for_run(tracker.run_id())]
    }
}

impl ExecutionProvider for StreamExecutionProvider {
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

    fn launch(&self, launch: KernelLaunch, tracker: &Arc<LaunchTracker>) -> Result<()> {
        let stream = self.stream(tracker);
        debug!(
            provider = %self.key,
            stream = stream.index(),
            node = launch.node(),
            "Enqueued launch"
        );
        stream.enqueue(launch, tracker.clone())
    }

    fn is_async(&self) -> bool {
        true
    }

    fn synchronize(&self, tracker: &Arc<LaunchTracker>) -> Result<()> {
        self.stream(tracker).fence()?;
        match tracker.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> Result<()> {
        for stream in &self.streams {
            stream.shutdown();
        }
        info!(provider = %self.key, "Shut down stream execution provider");
        Ok(())
    }
}

/// Create a stream execution provider from options.
pub fn create_stream_provider_with_config(
    options: StreamProviderOptions,
) -> Result<Arc<dyn ExecutionProvider>> {
    Ok(Arc::new(StreamExecutionProvider::with_config(options)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fails;

    impl Kernel for Fails {
        fn infer_output_shapes(&self, s: &[&[usize]]) -> anyhow::Result<Vec<Vec<usize>>> {
            Ok(vec![s[0].to_vec()])
        }

        fn compute(&self, _: &mut tessera_core::KernelContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("device fault")
        }
    }

    fn add_launch(a: &[f32], b: &[f32], out: &mut [f32], node: usize) -> KernelLaunch {
        launch_with(Arc::new(BinaryKernel::generic(BinaryOp::Add)), a, b, out, node)
    }

    fn launch_with(
        kernel: Arc<dyn Kernel>,
        a: &[f32],
        b: &[f32],
        out: &mut [f32],
        node: usize,
    ) -> KernelLaunch {
        let raw = |d: &[f32]| tessera_core::RawTensor {
            ptr: d.as_ptr().cast(),
            len: std::mem::size_of_val(d),
            dtype: DataType::F32,
            shape: vec![d.len()],
        };
        unsafe {
            KernelLaunch::new(
                node,
                Arc::from("add"),
                Arc::from("Add"),
                kernel,
                vec![raw(a), raw(b)],
                vec![tessera_core::RawTensorMut {
                    ptr: out.as_mut_ptr().cast(),
                    len: std::mem::size_of_val(out),
                    dtype: DataType::F32,
                    shape: vec![out.len()],
                }],
            )
        }
    }

    #[test]
    fn test_launch_completes_at_synchronize() -> Result<()> {
        let provider =
            StreamExecutionProvider::with_config(StreamProviderOptions::default().with_stream_count(3))?;
        assert!(provider.is_async());
        assert_eq!(provider.stream_count(), 3);

        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let mut out = [0.0f32; 2];
        let tracker = Arc::new(LaunchTracker::new(5));
        provider.launch(add_launch(&a, &b, &mut out, 0), &tracker)?;
        provider.synchronize(&tracker)?;
        assert_eq!(out, [4.0, 6.0]);
        assert_eq!(provider.get_statistics().executed, 1);
        Ok(())
    }

    #[test]
    fn test_failure_reported_and_later_launches_skipped() -> Result<()> {
        let provider = StreamExecutionProvider::with_config(StreamProviderOptions::default())?;
        let a = [1.0f32, 2.0];
        let mut out = [0.0f32; 2];
        let mut out2 = [0.0f32; 2];
        let tracker = Arc::new(LaunchTracker::new(0));

        provider.launch(launch_with(Arc::new(Fails), &a, &a, &mut out, 3), &tracker)?;
        provider.launch(add_launch(&a, &a, &mut out2, 4), &tracker)?;
        let err = provider.synchronize(&tracker).unwrap_err();
        assert!(matches!(err, CoreError::DispatchFailure { node: 3, .. }));
        assert!(err.to_string().contains("device fault"));
        assert_eq!(out2, [0.0, 0.0]);
        assert_eq!(provider.get_statistics().skipped, 1);
        Ok(())
    }

    #[test]
    fn test_runs_pinned_round_robin() -> Result<()> {
        let provider =
            StreamExecutionProvider::with_config(StreamProviderOptions::default().with_stream_count(4))?;
        assert_eq!(provider.stream_for_run(0), 0);
        assert_eq!(provider.stream_for_run(6), 2);
        Ok(())
    }

    #[test]
    fn test_launch_after_shutdown_fails() -> Result<()> {
        let provider = StreamExecutionProvider::with_config(StreamProviderOptions::default())?;
        provider.shutdown()?;
        let a = [1.0f32];
        let mut out = [0.0f32];
        let tracker = Arc::new(LaunchTracker::new(0));
        let err = provider
            .launch(add_launch(&a, &a, &mut out, 0), &tracker)
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
        Ok(())
    }
}
