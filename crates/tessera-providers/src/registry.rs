//! Provider registry and management system.
//!
//! The registry holds the execution providers attached to a session in
//! priority order. Kernel lookup walks that order and the first provider with
//! a matching kernel wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use tessera_core::{
    CoreError, DataType, ExecutionProvider, KernelFactory, KernelRegistry, OpNode, ProviderKey,
    Result,
};
use tracing::{debug, info, warn};

/// A kernel chosen for a node.
#[derive(Clone)]
pub struct ResolvedKernel {
    /// Position of the provider in the preference order.
    pub slot: usize,
    /// The provider that owns the kernel.
    pub provider: Arc<dyn ExecutionProvider>,
    /// Display form of the matched kernel definition.
    pub kernel: String,
    /// Factory that builds the kernel for the node.
    pub factory: KernelFactory,
}

impl std::fmt::Debug for ResolvedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKernel")
            .field("slot", &self.slot)
            .field("provider", self.provider.provider_key())
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Execution providers attached to one session.
pub struct ProviderRegistry {
    providers: DashMap<ProviderKey, Arc<dyn ExecutionProvider>>,
    /// Keys with their priority, highest priority first.
    preference_order: RwLock<Vec<(ProviderKey, i32)>>,
    frozen: AtomicBool,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("preference_order", &self.get_preference_order())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            preference_order: RwLock::new(Vec::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register an execution provider.
    ///
    /// Higher `priority` providers are consulted first; equal priorities keep
    /// registration order.
    ///
    /// # Errors
    /// * [`CoreError::DuplicateProvider`] if the `(type, name)` key is taken
    /// * [`CoreError::InvalidArgument`] once the registry has been frozen
    pub fn register_provider(
        &self,
        provider: Arc<dyn ExecutionProvider>,
        priority: i32,
    ) -> Result<()> {
        let key = provider.provider_key().clone();
        let mut order = self
            .preference_order
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_frozen() {
            return Err(CoreError::invalid_argument(format!(
                "cannot register provider {key}: session already loaded"
            )));
        }
        if self.providers.contains_key(&key) {
            return Err(CoreError::DuplicateProvider(key.to_string()));
        }

        let kernels = provider.get_kernel_registry().len();
        self.providers.insert(key.clone(), provider);
        let pos = order.partition_point(|(_, p)| *p >= priority);
        order.insert(pos, (key.clone(), priority));

        info!(provider = %key, priority, kernels, "Registered execution provider");
        Ok(())
    }

    /// Remove a provider and shut it down.
    pub fn unregister_provider(&self, key: &ProviderKey) -> Result<()> {
        if self.is_frozen() {
            return Err(CoreError::invalid_argument(format!(
                "cannot unregister provider {key}: session already loaded"
            )));
        }
        let (_, provider) = self
            .providers
            .remove(key)
            .ok_or_else(|| CoreError::invalid_argument(format!("provider {key} not found")))?;
        self.preference_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(k, _)| k != key);

        provider.shutdown()?;
        info!(provider = %key, "Unregistered execution provider");
        Ok(())
    }

    /// Look up a provider by key.
    pub fn get_provider(&self, key: &ProviderKey) -> Option<Arc<dyn ExecutionProvider>> {
        self.providers.get(key).map(|p| p.value().clone())
    }

    /// Providers in preference order.
    pub fn providers(&self) -> Vec<Arc<dyn ExecutionProvider>> {
        self.preference_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(k, _)| self.get_provider(k))
            .collect()
    }

    /// Keys in preference order.
    pub fn get_preference_order(&self) -> Vec<ProviderKey> {
        self.preference_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Reject further registrations.
    pub fn freeze(&self) {
        // Taking the write lock orders this after any in-flight registration.
        let _order = self
            .preference_order
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.frozen.store(true, Ordering::Release);
        debug!(providers = self.providers.len(), "Provider registry frozen");
    }

    /// Whether [`ProviderRegistry::freeze`] has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Find the first provider, in preference order, with a kernel for `node`.
    ///
    /// `overlays` is indexed by preference slot; a provider's overlay (its
    /// negotiated native kernels) is consulted before its built-in registry.
    pub fn resolve_kernel(
        &self,
        node: &OpNode,
        input_types: &[DataType],
        overlays: &[Option<KernelRegistry>],
    ) -> Option<ResolvedKernel> {
        for (slot, provider) in self.providers().into_iter().enumerate() {
            let overlay = overlays.get(slot).and_then(Option::as_ref);
            let found = overlay
                .and_then(|o| o.resolve(node, input_types))
                .or_else(|| provider.get_kernel_registry().resolve(node, input_types))
                .map(|(def, factory)| (def.to_string(), factory));

            if let Some((kernel, factory)) = found {
                debug!(
                    node = node.index,
                    op = %node.op_type,
                    provider = %provider.provider_key(),
                    %kernel,
                    "Resolved kernel"
                );
                return Some(ResolvedKernel {
                    slot,
                    provider,
                    kernel,
                    factory,
                });
            }
        }
        None
    }

    /// Registry statistics.
    pub fn get_statistics(&self) -> RegistryStatistics {
        let total_kernels = self
            .providers
            .iter()
            .map(|entry| entry.value().get_kernel_registry().len())
            .sum();

        RegistryStatistics {
            provider_count: self.providers.len(),
            total_kernels,
            preference_order: self.get_preference_order(),
        }
    }

    /// Shut every provider down. Failures are logged; the first is returned.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for provider in self.providers() {
            if let Err(e) = provider.shutdown() {
                warn!(provider = %provider.provider_key(), error = %e, "Failed to shut down provider");
                first_error.get_or_insert(e);
            }
        }
        info!("Provider registry shutdown complete");
        first_error.map_or(Ok(()), Err)
    }
}

/// Statistics about the provider registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatistics {
    /// Number of registered providers.
    pub provider_count: usize,
    /// Kernels registered across all providers.
    pub total_kernels: usize,
    /// Current provider preference order.
    pub preference_order: Vec<ProviderKey>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::AlignedMemoryAllocator;
    use tessera_core::{kernel_factory, Kernel, KernelContext, KernelDef, TensorAllocator};

    struct Noop;

    impl Kernel for Noop {
        fn infer_output_shapes(&self, s: &[&[usize]]) -> anyhow::Result<Vec<Vec<usize>>> {
            Ok(s.iter().map(|d| d.to_vec()).collect())
        }

        fn compute(&self, _: &mut KernelContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockProvider {
        key: ProviderKey,
        kernels: KernelRegistry,
    }

    impl MockProvider {
        fn new(provider_type: &str, name: &str, ops: &[&str]) -> Arc<dyn ExecutionProvider> {
            let mut kernels = KernelRegistry::new();
            for op in ops {
                kernels
                    .register(
                        KernelDef::new(*op),
                        kernel_factory(|_| Ok(Arc::new(Noop) as Arc<dyn Kernel>)),
                    )
                    .unwrap();
            }
            Arc::new(Self {
                key: ProviderKey::new(provider_type, name),
                kernels,
            })
        }
    }

    impl ExecutionProvider for MockProvider {
        fn provider_key(&self) -> &ProviderKey {
            &self.key
        }

        fn get_options(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn get_allocator(&self) -> Arc<dyn TensorAllocator> {
            Arc::new(AlignedMemoryAllocator::new())
        }

        fn get_kernel_registry(&self) -> &KernelRegistry {
            &self.kernels
        }
    }

    fn node(op: &str) -> OpNode {
        OpNode {
            index: 0,
            name: "n".into(),
            op_type: op.into(),
            attributes: BTreeMap::new(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn test_provider_registration() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "cpu", &["Add", "Mul"]), 0)?;

        assert_eq!(registry.len(), 1);
        let stats = registry.get_statistics();
        assert_eq!(stats.provider_count, 1);
        assert_eq!(stats.total_kernels, 2);
        assert!(registry
            .get_provider(&ProviderKey::new("cpu", "cpu"))
            .is_some());
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "a", &[]), 0)?;
        registry.register_provider(MockProvider::new("cpu", "b", &[]), 0)?;
        let err = registry
            .register_provider(MockProvider::new("cpu", "a", &["Add"]), 5)
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateProvider(ref k) if k == "cpu:a"));
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[test]
    fn test_priority_order_is_stable() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "low", &[]), 0)?;
        registry.register_provider(MockProvider::new("stream", "high", &[]), 10)?;
        registry.register_provider(MockProvider::new("cpu", "low2", &[]), 0)?;
        registry.register_provider(MockProvider::new("stream", "high2", &[]), 10)?;

        let names: Vec<String> = registry
            .get_preference_order()
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names, vec!["high", "high2", "low", "low2"]);
        Ok(())
    }

    #[test]
    fn test_first_provider_with_kernel_wins() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "cpu", &["Add", "Relu"]), 0)?;
        registry.register_provider(MockProvider::new("stream", "gpu", &["Add"]), 10)?;

        let add = registry.resolve_kernel(&node("Add"), &[], &[]).expect("Add");
        assert_eq!(add.slot, 0);
        assert_eq!(add.provider.provider_key().name, "gpu");

        let relu = registry.resolve_kernel(&node("Relu"), &[], &[]).expect("Relu");
        assert_eq!(relu.slot, 1);
        assert!(registry.resolve_kernel(&node("Conv"), &[], &[]).is_none());
        Ok(())
    }

    #[test]
    fn test_overlay_consulted_first() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "cpu", &["Add"]), 0)?;
        let mut overlay = KernelRegistry::new();
        overlay.register(
            KernelDef::new("Custom"),
            kernel_factory(|_| Ok(Arc::new(Noop) as Arc<dyn Kernel>)),
        )?;

        let overlays = vec![Some(overlay)];
        let found = registry
            .resolve_kernel(&node("Custom"), &[], &overlays)
            .expect("overlay kernel");
        assert_eq!(found.kernel, "Custom");
        Ok(())
    }

    #[test]
    fn test_frozen_registry_rejects_changes() -> Result<()> {
        let registry = ProviderRegistry::new();
        registry.register_provider(MockProvider::new("cpu", "cpu", &[]), 0)?;
        registry.freeze();

        let err = registry
            .register_provider(MockProvider::new("cpu", "late", &[]), 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        assert!(registry
            .unregister_provider(&ProviderKey::new("cpu", "cpu"))
            .is_err());
        registry.shutdown()?;
        Ok(())
    }
}
