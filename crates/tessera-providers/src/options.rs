//! Provider options records and the provider factory protocol.
//!
//! Every provider type is built from a flat, validated options record. Records
//! deserialize from JSON with unknown fields rejected; [`ProviderOptions`] tags
//! them by provider type so a session configuration can list several.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_core::{CoreError, ExecutionProvider, Result};

use crate::allocator::SIMD_ALIGNMENT;

/// Largest accepted CPU thread count.
pub const MAX_THREADS: usize = 1024;
/// Largest accepted stream count.
pub const MAX_STREAMS: usize = 16;
/// Number of addressable emulated devices.
pub const MAX_DEVICES: u32 = 16;

fn check_alignment(alignment: usize) -> Result<()> {
    if alignment < 8 || !alignment.is_power_of_two() {
        return Err(CoreError::invalid_option(format!(
            "alignment must be a power of two >= 8, got {alignment}"
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_option("provider name must not be empty"));
    }
    Ok(())
}

/// Options of the CPU execution provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CpuProviderOptions {
    /// Instance name, unique among CPU providers of a session.
    pub name: String,
    /// Worker threads (None = one per core, minus one for the caller).
    pub thread_count: Option<usize>,
    /// Buffer and arena alignment in bytes.
    pub alignment: usize,
    /// Largest arena the allocator will back.
    pub max_arena_bytes: Option<usize>,
    /// Use vectorized f32 kernels when the CPU supports them.
    pub enable_simd: bool,
    /// Accept native-code modules attached to the graph.
    pub allow_native_modules: bool,
    /// Thread name prefix for the worker pool.
    pub thread_pool_name: String,
}

impl Default for CpuProviderOptions {
    fn default() -> Self {
        Self {
            name: "cpu".to_string(),
            thread_count: None,
            alignment: SIMD_ALIGNMENT,
            max_arena_bytes: None,
            enable_simd: true,
            allow_native_modules: true,
            thread_pool_name: "tessera-cpu".to_string(),
        }
    }
}

impl CpuProviderOptions {
    /// Set the instance name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker thread count.
    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = Some(threads);
        self
    }

    /// Set the buffer alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Bound the arena size.
    pub fn with_max_arena_bytes(mut self, bytes: usize) -> Self {
        self.max_arena_bytes = Some(bytes);
        self
    }

    /// Enable or disable SIMD kernels.
    pub fn with_simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        if let Some(threads) = self.thread_count {
            if threads == 0 || threads > MAX_THREADS {
                return Err(CoreError::invalid_option(format!(
                    "thread_count must be in 1..={MAX_THREADS}, got {threads}"
                )));
            }
        }
        check_alignment(self.alignment)?;
        if self.max_arena_bytes == Some(0) {
            return Err(CoreError::invalid_option("max_arena_bytes must be positive"));
        }
        Ok(())
    }

    /// Thread count after defaulting.
    pub fn effective_thread_count(&self) -> usize {
        self.thread_count
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).max(1))
    }

    /// Flattened form reported by `get_options`.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("name".into(), self.name.clone());
        map.insert("thread_count".into(), self.effective_thread_count().to_string());
        map.insert("alignment".into(), self.alignment.to_string());
        if let Some(max) = self.max_arena_bytes {
            map.insert("max_arena_bytes".into(), max.to_string());
        }
        map.insert("enable_simd".into(), self.enable_simd.to_string());
        map.insert(
            "allow_native_modules".into(),
            self.allow_native_modules.to_string(),
        );
        map.insert("thread_pool_name".into(), self.thread_pool_name.clone());
        map
    }
}

/// Options of the stream (emulated accelerator) provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamProviderOptions {
    /// Instance name, unique among stream providers of a session.
    pub name: String,
    /// Emulated device ordinal.
    pub device_index: u32,
    /// Number of device streams (worker threads).
    pub stream_count: usize,
    /// Device memory capacity in bytes.
    pub memory_limit: usize,
    /// Buffer and arena alignment in bytes.
    pub alignment: usize,
}

impl Default for StreamProviderOptions {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            device_index: 0,
            stream_count: 2,
            memory_limit: 1 << 30,
            alignment: 256,
        }
    }
}

impl StreamProviderOptions {
    /// Set the instance name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of streams.
    pub fn with_stream_count(mut self, streams: usize) -> Self {
        self.stream_count = streams;
        self
    }

    /// Set the device memory capacity.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        if self.device_index >= MAX_DEVICES {
            return Err(CoreError::invalid_option(format!(
                "device_index must be below {MAX_DEVICES}, got {}",
                self.device_index
            )));
        }
        if self.stream_count == 0 || self.stream_count > MAX_STREAMS {
            return Err(CoreError::invalid_option(format!(
                "stream_count must be in 1..={MAX_STREAMS}, got {}",
                self.stream_count
            )));
        }
        if self.memory_limit == 0 {
            return Err(CoreError::invalid_option("memory_limit must be positive"));
        }
        check_alignment(self.alignment)
    }

    /// Flattened form reported by `get_options`.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        [
            ("name", self.name.clone()),
            ("device_index", self.device_index.to_string()),
            ("stream_count", self.stream_count.to_string()),
            ("memory_limit", self.memory_limit.to_string()),
            ("alignment", self.alignment.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Options of any built-in provider, tagged by provider type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderOptions {
    /// `"type": "cpu"`
    Cpu(CpuProviderOptions),
    /// `"type": "stream"`
    Stream(StreamProviderOptions),
}

impl ProviderOptions {
    /// Provider type tag.
    pub fn provider_type(&self) -> &'static str {
        match self {
            Self::Cpu(_) => crate::cpu::CPU_PROVIDER_TYPE,
            Self::Stream(_) => crate::stream::STREAM_PROVIDER_TYPE,
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        match self {
            Self::Cpu(o) => &o.name,
            Self::Stream(o) => &o.name,
        }
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cpu(o) => o.validate(),
            Self::Stream(o) => o.validate(),
        }
    }
}

impl From<CpuProviderOptions> for ProviderOptions {
    fn from(options: CpuProviderOptions) -> Self {
        Self::Cpu(options)
    }
}

impl From<StreamProviderOptions> for ProviderOptions {
    fn from(options: StreamProviderOptions) -> Self {
        Self::Stream(options)
    }
}

/// Builds a provider from its options.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderOptions) -> Result<Arc<dyn ExecutionProvider>> + Send + Sync>;

/// Provider constructors by type tag.
///
/// Owned by a session; there is no process-wide registration.
#[derive(Clone, Default)]
pub struct ProviderFactories {
    factories: HashMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ProviderFactories")
            .field("types", &types)
            .finish()
    }
}

impl ProviderFactories {
    /// An empty factory set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for the built-in CPU and stream providers.
    pub fn with_defaults() -> Self {
        let mut factories = Self::new();
        factories.register(crate::cpu::CPU_PROVIDER_TYPE, |options| match options {
            ProviderOptions::Cpu(o) => crate::create_cpu_provider_with_config(o.clone()),
            other => Err(mismatch(crate::cpu::CPU_PROVIDER_TYPE, other)),
        });
        factories.register(crate::stream::STREAM_PROVIDER_TYPE, |options| match options {
            ProviderOptions::Stream(o) => crate::create_stream_provider_with_config(o.clone()),
            other => Err(mismatch(crate::stream::STREAM_PROVIDER_TYPE, other)),
        });
        factories
    }

    /// Install or replace the factory for `provider_type`.
    pub fn register<F>(&mut self, provider_type: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderOptions) -> Result<Arc<dyn ExecutionProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(provider_type.into(), Arc::new(factory));
    }

    /// Whether a factory exists for `provider_type`.
    pub fn supports(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    /// Validate `options` and build the provider.
    pub fn create(&self, options: &ProviderOptions) -> Result<Arc<dyn ExecutionProvider>> {
        options.validate()?;
        let factory = self.factories.get(options.provider_type()).ok_or_else(|| {
            CoreError::invalid_option(format!(
                "no factory for provider type '{}'",
                options.provider_type()
            ))
        })?;
        factory(options)
    }
}

fn mismatch(expected: &str, options: &ProviderOptions) -> CoreError {
    CoreError::invalid_option(format!(
        "{expected} factory given {} options",
        options.provider_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_option_bounds() {
        assert!(CpuProviderOptions::default().validate().is_ok());
        for bad in [
            CpuProviderOptions::default().with_thread_count(0),
            CpuProviderOptions::default().with_thread_count(MAX_THREADS + 1),
            CpuProviderOptions::default().with_alignment(4),
            CpuProviderOptions::default().with_alignment(48),
            CpuProviderOptions::default().with_name(""),
        ] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, CoreError::InvalidOption(_)), "{bad:?}");
        }
        assert!(CpuProviderOptions::default()
            .with_thread_count(MAX_THREADS)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_stream_option_bounds() {
        assert!(StreamProviderOptions::default().validate().is_ok());
        let mut bad = StreamProviderOptions::default();
        bad.device_index = MAX_DEVICES;
        assert!(bad.validate().is_err());
        assert!(StreamProviderOptions::default()
            .with_stream_count(0)
            .validate()
            .is_err());
        assert!(StreamProviderOptions::default()
            .with_stream_count(MAX_STREAMS + 1)
            .validate()
            .is_err());
        assert!(StreamProviderOptions::default()
            .with_memory_limit(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_tagged_options_from_json() -> anyhow::Result<()> {
        let cpu: ProviderOptions =
            serde_json::from_str(r#"{"type": "cpu", "thread_count": 4, "name": "host"}"#)?;
        assert_eq!(
            cpu,
            ProviderOptions::Cpu(
                CpuProviderOptions::default()
                    .with_thread_count(4)
                    .with_name("host")
            )
        );
        assert_eq!(cpu.provider_type(), "cpu");

        let stream: ProviderOptions = serde_json::from_str(r#"{"type": "stream"}"#)?;
        assert_eq!(stream.name(), "stream");

        assert!(serde_json::from_str::<ProviderOptions>(r#"{"type": "cpu", "threads": 4}"#).is_err());
        assert!(serde_json::from_str::<ProviderOptions>(r#"{"type": "tpu"}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_factory_validates_before_building() {
        let factories = ProviderFactories::with_defaults();
        assert!(factories.supports("cpu") && factories.supports("stream"));
        let err = factories
            .create(&CpuProviderOptions::default().with_thread_count(0).into())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOption(_)));
    }

    #[test]
    fn test_missing_factory() {
        let factories = ProviderFactories::new();
        let err = factories
            .create(&StreamProviderOptions::default().into())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOption(ref m) if m.contains("stream")));
    }
}
