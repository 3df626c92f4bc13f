//! Load-time compilation: kernel resolution and memory planning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tessera_core::{
    Artifact, CoreError, ExecutionProvider, Graph, Kernel, KernelCreateInfo, KernelRegistry,
    MemoryPlan, MemoryPlanner, NodeId, OpNode, ProviderKey, Result,
};
use tessera_providers::ProviderRegistry;
use tracing::{debug, info, warn};

use crate::options::SessionOptions;
use crate::pool::ArenaPool;

/// Which provider and kernel definition execute a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelAssignment {
    /// Node index.
    pub node: NodeId,
    /// Node name.
    pub node_name: String,
    /// Operation type.
    pub op_type: String,
    /// Provider executing the node.
    pub provider: ProviderKey,
    /// Matched kernel definition.
    pub kernel: String,
}

/// A node bound to its kernel.
pub(crate) struct CompiledNode {
    pub(crate) node: NodeId,
    pub(crate) slot: usize,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) kernel_name: String,
    pub(crate) name: Arc<str>,
    pub(crate) op_type: Arc<str>,
}

/// Everything a run needs, fixed at load and shared read-only by every run.
pub(crate) struct CompiledModel {
    graph: Graph,
    nodes: Vec<CompiledNode>,
    plan: MemoryPlan,
    providers: Vec<Arc<dyn ExecutionProvider>>,
    pool: ArenaPool,
    /// Set when the session closed while runs still held this model.
    shutdown_on_drop: AtomicBool,
}

fn kernel_not_found(node: &OpNode, reason: String) -> CoreError {
    CoreError::KernelNotFound {
        node: node.index,
        node_name: node.name.clone(),
        op_type: node.op_type.clone(),
        reason,
    }
}

impl CompiledModel {
    /// Resolve a kernel for every node and plan memory.
    ///
    /// `registry` must already be frozen so provider slots stay stable.
    pub(crate) fn compile(
        artifact: Artifact,
        registry: &ProviderRegistry,
        options: &SessionOptions,
    ) -> Result<Self> {
        let graph = artifact.into_graph();
        let providers = registry.providers();

        let overlays = providers
            .iter()
            .map(|p| p.negotiate_native_module(&graph))
            .collect::<Result<Vec<Option<KernelRegistry>>>>()?;

        let mut nodes = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let input_types = graph.input_types(node);
            let resolved = registry
                .resolve_kernel(node, &input_types, &overlays)
                .ok_or_else(|| {
                    kernel_not_found(
                        node,
                        format!("no registered provider supports input types {input_types:?}"),
                    )
                })?;

            let info = KernelCreateInfo {
                node,
                graph: &graph,
                input_types: &input_types,
            };
            let kernel = (resolved.factory)(&info).map_err(|e| {
                kernel_not_found(
                    node,
                    format!(
                        "kernel {} of provider {} rejected the node: {e:#}",
                        resolved.kernel,
                        resolved.provider.provider_key()
                    ),
                )
            })?;

            nodes.push(CompiledNode {
                node: node.index,
                slot: resolved.slot,
                kernel,
                kernel_name: resolved.kernel,
                name: Arc::from(node.name.as_str()),
                op_type: Arc::from(node.op_type.as_str()),
            });
        }

        let assignment: Vec<usize> = nodes.iter().map(|n| n.slot).collect();
        let allocators: Vec<_> = providers.iter().map(|p| p.get_allocator()).collect();
        let constraints: Vec<_> = allocators.iter().map(|a| a.constraints()).collect();
        let plan = MemoryPlanner::new().plan(&graph, &assignment, &constraints)?;
        plan.verify()?;

        info!(
            nodes = nodes.len(),
            arena_bytes = plan.arena_bytes(),
            unshared_bytes = plan.unshared_bytes(),
            peak_live_bytes = plan.peak_live_bytes(),
            "Compiled graph"
        );
        debug!(%plan, "Memory plan");

        let pooled = if options.enable_arena_pool {
            options.max_pooled_arenas
        } else {
            0
        };
        let pool = ArenaPool::new(plan.arenas(), allocators, pooled);

        Ok(Self {
            graph,
            nodes,
            plan,
            providers,
            pool,
            shutdown_on_drop: AtomicBool::new(false),
        })
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub(crate) fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    pub(crate) fn providers(&self) -> &[Arc<dyn ExecutionProvider>] {
        &self.providers
    }

    pub(crate) fn pool(&self) -> &ArenaPool {
        &self.pool
    }

    /// Shut every provider down; the first failure is returned.
    pub(crate) fn shutdown_providers(&self) -> Result<()> {
        let mut first_error = None;
        for provider in &self.providers {
            if let Err(e) = provider.shutdown() {
                warn!(provider = %provider.provider_key(), error = %e, "Failed to shut down provider");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Defer provider shutdown until the last in-flight run lets go.
    pub(crate) fn shutdown_when_dropped(&self) {
        self.shutdown_on_drop.store(true, Ordering::Release);
    }

    pub(crate) fn assignments(&self) -> Vec<KernelAssignment> {
        self.nodes
            .iter()
            .map(|n| KernelAssignment {
                node: n.node,
                node_name: n.name.to_string(),
                op_type: n.op_type.to_string(),
                provider: self.providers[n.slot].provider_key().clone(),
                kernel: n.kernel_name.clone(),
            })
            .collect()
    }
}

impl Drop for CompiledModel {
    fn drop(&mut self) {
        if self.shutdown_on_drop.swap(false, Ordering::AcqRel) {
            // Errors were already logged.
            let _ = self.shutdown_providers();
        }
    }
}
