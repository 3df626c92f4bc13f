//! Sessions: compile once, run many.
//!
//! A [`Session`] moves through `Unloaded → Loading → Ready → Closed`, with
//! `Failed` as a terminal state holding the error that caused it. Loading
//! resolves one kernel per node and plans memory; after that the compiled
//! model is read-only and any number of threads may call [`Session::run`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tessera_core::{
    Artifact, CoreError, Dim, ExecutionProvider, Graph, MemoryPlan, Result, Tensor,
};
use tessera_providers::{
    CpuProviderOptions, ProviderFactories, ProviderOptions, ProviderRegistry,
    StreamProviderOptions,
};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::frame::ExecutionFrame;
use crate::model::{CompiledModel, KernelAssignment};
use crate::options::SessionOptions;
use crate::statistics::{SessionStatistics, StatisticsRecorder};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created; providers may still be registered.
    Unloaded,
    /// `load` is in progress.
    Loading,
    /// Compiled and accepting runs.
    Ready,
    /// Closed; every operation fails with [`CoreError::SessionClosed`].
    Closed,
    /// Loading failed, or a run hit an internal error.
    Failed(CoreError),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "Unloaded"),
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

/// A compiled graph bound to its execution providers.
pub struct Session {
    id: Uuid,
    options: SessionOptions,
    factories: ProviderFactories,
    registry: ProviderRegistry,
    state: RwLock<SessionState>,
    model: RwLock<Option<Arc<CompiledModel>>>,
    statistics: StatisticsRecorder,
    next_run_id: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Create an unloaded session using the built-in provider factories.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_factories(options, ProviderFactories::with_defaults())
    }

    /// Create an unloaded session with an explicit set of provider factories.
    pub fn with_factories(options: SessionOptions, factories: ProviderFactories) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, providers = options.providers.len(), "Created session");
        Self {
            id,
            options,
            factories,
            registry: ProviderRegistry::new(),
            state: RwLock::new(SessionState::Unloaded),
            model: RwLock::new(None),
            statistics: StatisticsRecorder::default(),
            next_run_id: AtomicU64::new(0),
        }
    }

    /// Unique session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        read(&self.state).clone()
    }

    /// The options this session was created with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The factories used to construct providers.
    pub fn factories(&self) -> &ProviderFactories {
        &self.factories
    }

    /// The providers attached to this session.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Attach a provider. Only valid before `load`.
    pub fn register_provider(
        &self,
        provider: Arc<dyn ExecutionProvider>,
        priority: i32,
    ) -> Result<()> {
        match &*read(&self.state) {
            SessionState::Unloaded => {}
            SessionState::Closed => return Err(CoreError::SessionClosed),
            other => {
                return Err(CoreError::invalid_argument(format!(
                    "providers can only be registered before load; session is {other}"
                )))
            }
        }
        self.registry.register_provider(provider, priority)
    }

    /// Compile `artifact` for the registered providers.
    ///
    /// Any failure leaves the session in [`SessionState::Failed`] holding the
    /// error, which later runs return.
    pub fn load(&self, artifact: Artifact) -> Result<()> {
        {
            let mut state = write(&self.state);
            match &*state {
                SessionState::Unloaded => *state = SessionState::Loading,
                SessionState::Closed => return Err(CoreError::SessionClosed),
                other => {
                    return Err(CoreError::invalid_argument(format!(
                        "load requires an unloaded session; session is {other}"
                    )))
                }
            }
        }

        let span = info_span!("load", session = %self.id);
        let _enter = span.enter();
        let start = Instant::now();
        let result = self.compile(artifact);

        let mut state = write(&self.state);
        if *state == SessionState::Closed {
            drop(state);
            // Providers created during the load were registered after close
            // shut the registry down.
            drop(result);
            if let Err(e) = self.registry.shutdown() {
                warn!(error = %e, "Failed to shut down providers of a closed session");
            }
            return Err(CoreError::SessionClosed);
        }
        match result {
            Ok(model) => {
                *write(&self.model) = Some(Arc::new(model));
                *state = SessionState::Ready;
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "Session ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session load failed");
                *state = SessionState::Failed(e.clone());
                Err(e)
            }
        }
    }

    fn compile(&self, artifact: Artifact) -> Result<CompiledModel> {
        artifact.graph().validate()?;
        self.options.validate()?;

        for spec in &self.options.providers {
            let provider = self.factories.create(&spec.options)?;
            self.registry.register_provider(provider, spec.priority)?;
        }
        if self.registry.is_empty() {
            return Err(CoreError::invalid_argument("no execution providers registered"));
        }
        self.registry.freeze();

        CompiledModel::compile(artifact, &self.registry, &self.options)
    }

    fn ready_model(&self) -> Result<Arc<CompiledModel>> {
        match &*read(&self.state) {
            SessionState::Ready => read(&self.model)
                .clone()
                .ok_or_else(|| CoreError::internal("ready session without a compiled model")),
            SessionState::Failed(e) => Err(e.clone()),
            SessionState::Closed => Err(CoreError::SessionClosed),
            other => Err(CoreError::invalid_argument(format!(
                "session is {other}; call load first"
            ))),
        }
    }

    /// Execute the graph once.
    ///
    /// Safe to call from many threads at once; each call gets its own
    /// execution frame.
    pub fn run(&self, inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let model = self.ready_model()?;
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);

        let span = info_span!("run", session = %self.id, run = run_id);
        let _enter = span.enter();
        let start = Instant::now();

        let result = validate_inputs(model.graph(), &inputs)
            .and_then(|()| ExecutionFrame::execute(&model, run_id, &inputs));

        let elapsed = start.elapsed();
        self.statistics.record(elapsed, result.is_ok());
        match &result {
            Ok(_) => debug!(elapsed_us = elapsed.as_micros() as u64, "Run complete"),
            Err(e) => {
                warn!(error = %e, "Run failed");
                if e.is_fatal() {
                    self.fail(e.clone());
                }
            }
        }
        result
    }

    fn fail(&self, err: CoreError) {
        let mut state = write(&self.state);
        if *state == SessionState::Ready {
            *state = SessionState::Failed(err);
        }
    }

    /// Release pooled arenas and shut the providers down.
    ///
    /// Runs already in flight finish on their own reference to the compiled
    /// model; providers are shut down once the last of them completes.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = write(&self.state);
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }

        let model = write(&self.model).take();
        let result = match model {
            Some(model) => {
                let freed = model.pool().drain();
                debug!(session = %self.id, freed, "Released pooled arenas");
                match Arc::try_unwrap(model) {
                    Ok(model) => model.shutdown_providers(),
                    Err(shared) => {
                        shared.shutdown_when_dropped();
                        Ok(())
                    }
                }
            }
            None => self.registry.shutdown(),
        };
        info!(session = %self.id, "Session closed");
        result
    }

    /// Snapshot of the run statistics.
    pub fn statistics(&self) -> SessionStatistics {
        let pool = read(&self.model)
            .as_ref()
            .map(|m| m.pool().stats())
            .unwrap_or_default();
        self.statistics.snapshot(pool)
    }

    /// Graph input names, once loaded.
    pub fn input_names(&self) -> Vec<String> {
        self.value_names(Graph::inputs)
    }

    /// Graph output names, once loaded.
    pub fn output_names(&self) -> Vec<String> {
        self.value_names(Graph::outputs)
    }

    fn value_names(&self, ids: fn(&Graph) -> &[usize]) -> Vec<String> {
        read(&self.model)
            .as_ref()
            .map(|m| {
                let graph = m.graph();
                ids(graph)
                    .iter()
                    .filter_map(|&v| graph.value(v).map(|info| info.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The memory plan, once loaded.
    pub fn plan(&self) -> Option<MemoryPlan> {
        read(&self.model).as_ref().map(|m| m.plan().clone())
    }

    /// Kernel chosen for each node, once loaded.
    pub fn kernel_assignments(&self) -> Vec<KernelAssignment> {
        read(&self.model)
            .as_ref()
            .map(|m| m.assignments())
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.id, error = %e, "Error while closing session");
        }
    }
}

/// Check run inputs against the graph's declared inputs.
fn validate_inputs(graph: &Graph, inputs: &HashMap<String, Tensor>) -> Result<()> {
    for name in inputs.keys() {
        let known = graph
            .value_by_name(name)
            .is_some_and(|info| graph.is_input(info.id));
        if !known {
            return Err(CoreError::invalid_argument(format!("unknown input '{name}'")));
        }
    }

    let mut symbols: HashMap<&str, usize> = HashMap::new();
    for &value in graph.inputs() {
        let info = graph
            .value(value)
            .ok_or_else(|| CoreError::internal(format!("graph input {value} has no value info")))?;
        let tensor = inputs
            .get(&info.name)
            .ok_or_else(|| CoreError::invalid_argument(format!("missing input '{}'", info.name)))?;

        if tensor.dtype() != info.dtype {
            return Err(CoreError::invalid_argument(format!(
                "input '{}' has type {}, expected {}",
                info.name,
                tensor.dtype(),
                info.dtype
            )));
        }
        if tensor.shape().len() != info.shape.rank() {
            return Err(CoreError::invalid_argument(format!(
                "input '{}' has rank {}, expected {}",
                info.name,
                tensor.shape().len(),
                info.shape.rank()
            )));
        }
        for (axis, (dim, &n)) in info.shape.0.iter().zip(tensor.shape()).enumerate() {
            match dim {
                Dim::Fixed(expected) if *expected != n => {
                    return Err(CoreError::invalid_argument(format!(
                        "input '{}' has extent {n} on axis {axis}, expected {expected}",
                        info.name
                    )));
                }
                Dim::Fixed(_) => {}
                Dim::Symbolic(symbol) => match symbols.entry(symbol.as_str()) {
                    Entry::Occupied(bound) if *bound.get() != n => {
                        return Err(CoreError::invalid_argument(format!(
                            "input '{}' binds '{symbol}' to {n}, already bound to {}",
                            info.name,
                            bound.get()
                        )));
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(n);
                    }
                },
            }
        }
    }
    Ok(())
}

/// Construct a CPU provider through the session's factories and attach it.
pub fn register_cpu_provider(
    session: &Session,
    options: CpuProviderOptions,
    priority: i32,
) -> Result<()> {
    let provider = session.factories().create(&ProviderOptions::Cpu(options))?;
    session.register_provider(provider, priority)
}

/// Construct a stream provider through the session's factories and attach it.
pub fn register_stream_provider(
    session: &Session,
    options: StreamProviderOptions,
    priority: i32,
) -> Result<()> {
    let provider = session.factories().create(&ProviderOptions::Stream(options))?;
    session.register_provider(provider, priority)
}
