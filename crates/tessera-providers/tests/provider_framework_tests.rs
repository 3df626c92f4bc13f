//! Tests for the provider framework: registry ordering, the factory protocol
//! and allocator behavior behind the providers.

use std::sync::Arc;

use anyhow::Result;
use tessera_core::{
    CoreError, DataType, ExecutionProvider, MemoryType, OpNode, ProviderKey, TensorAllocator,
};
use tessera_providers::{
    create_cpu_only_system, CpuProviderOptions, DeviceMemoryAllocator, PoolConfig,
    PooledMemoryAllocator, ProviderFactories, ProviderOptions, ProviderRegistry,
    StreamExecutionProvider, StreamProviderOptions,
};

fn node(op: &str) -> OpNode {
    OpNode {
        index: 0,
        name: op.to_lowercase(),
        op_type: op.into(),
        attributes: Default::default(),
        inputs: vec![],
        outputs: vec![],
    }
}

// ============================================================================
// Registry Tests
// ============================================================================

#[test]
fn test_cpu_only_system() -> Result<()> {
    let registry = create_cpu_only_system()?;
    let stats = registry.get_statistics();
    assert_eq!(stats.provider_count, 1);
    assert!(stats.total_kernels > 0);
    assert_eq!(stats.preference_order, vec![ProviderKey::new("cpu", "cpu")]);
    registry.shutdown()?;
    Ok(())
}

#[test]
fn test_stream_preferred_when_higher_priority() -> Result<()> {
    let factories = ProviderFactories::with_defaults();
    let registry = ProviderRegistry::new();
    registry.register_provider(factories.create(&CpuProviderOptions::default().into())?, 0)?;
    registry.register_provider(factories.create(&StreamProviderOptions::default().into())?, 10)?;

    let f32_types = [DataType::F32, DataType::F32];
    let add = registry
        .resolve_kernel(&node("Add"), &f32_types, &[])
        .expect("Add");
    assert_eq!(add.provider.provider_type(), "stream");
    assert_eq!(add.slot, 0);

    // The stream device only has f32 kernels; i64 falls back to the CPU.
    let i64_add = registry
        .resolve_kernel(&node("Add"), &[DataType::I64, DataType::I64], &[])
        .expect("i64 Add");
    assert_eq!(i64_add.provider.provider_type(), "cpu");

    let matmul = registry
        .resolve_kernel(&node("MatMul"), &f32_types, &[])
        .expect("MatMul");
    assert_eq!(matmul.slot, 1);

    registry.shutdown()?;
    Ok(())
}

#[test]
fn test_same_type_distinct_names() -> Result<()> {
    let factories = ProviderFactories::with_defaults();
    let registry = ProviderRegistry::new();
    for name in ["a", "b"] {
        let options = CpuProviderOptions::default()
            .with_name(name)
            .with_thread_count(1);
        registry.register_provider(factories.create(&options.into())?, 0)?;
    }
    let dup = factories.create(&CpuProviderOptions::default().with_name("a").into())?;
    let err = registry.register_provider(dup, 0).unwrap_err();
    assert!(matches!(err, CoreError::DuplicateProvider(_)));
    assert_eq!(registry.providers().len(), 2);
    Ok(())
}

// ============================================================================
// Factory Protocol Tests
// ============================================================================

#[test]
fn test_session_config_from_json() -> Result<()> {
    let json = r#"[
        {"type": "cpu", "name": "host", "thread_count": 2, "enable_simd": false},
        {"type": "stream", "stream_count": 4, "memory_limit": 1048576}
    ]"#;
    let options: Vec<ProviderOptions> = serde_json::from_str(json)?;
    let factories = ProviderFactories::with_defaults();

    let providers = options
        .iter()
        .map(|o| factories.create(o))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(providers[0].provider_key(), &ProviderKey::new("cpu", "host"));
    assert_eq!(providers[0].get_options()["enable_simd"], "false");
    assert_eq!(providers[1].get_options()["stream_count"], "4");
    assert_eq!(providers[1].get_allocator().memory_type(), MemoryType::Device);
    Ok(())
}

#[test]
fn test_custom_factory_overrides_default() -> Result<()> {
    let mut factories = ProviderFactories::with_defaults();
    factories.register("stream", |options| match options {
        ProviderOptions::Stream(o) => {
            let single = o.clone().with_stream_count(1);
            Ok(Arc::new(StreamExecutionProvider::with_config(single)?) as Arc<dyn ExecutionProvider>)
        }
        _ => Err(CoreError::invalid_option("expected stream options")),
    });
    let provider = factories.create(&StreamProviderOptions::default().with_stream_count(8).into())?;
    assert_eq!(provider.get_options()["stream_count"], "1");
    Ok(())
}

// ============================================================================
// Allocator Tests
// ============================================================================

#[test]
fn test_pooled_allocator_hit_rate() -> Result<()> {
    let allocator = PooledMemoryAllocator::new(PoolConfig::default(), 64)?;
    let first = allocator.allocate(1000, 64)?;
    assert_eq!(first.size, 1024);
    allocator.deallocate(first)?;
    let second = allocator.allocate(1000, 64)?;
    allocator.deallocate(second)?;

    assert!((allocator.get_hit_rate() - 0.5).abs() < f64::EPSILON);
    allocator.clear_pools();
    assert_eq!(allocator.get_pool_stats().pool_size, 0);
    Ok(())
}

#[test]
fn test_device_allocator_capacity() -> Result<()> {
    let allocator = DeviceMemoryAllocator::new(4096, 256)?;
    let a = allocator.allocate(3000, 64)?;
    assert_eq!(a.alignment, 256);
    assert!(allocator.allocate(2000, 64).is_err());
    allocator.deallocate(a)?;
    let b = allocator.allocate(4096, 64)?;
    allocator.deallocate(b)?;
    assert_eq!(allocator.constraints().max_arena_bytes, Some(4096));
    Ok(())
}
