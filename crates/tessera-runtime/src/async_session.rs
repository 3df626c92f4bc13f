//! Async wrapper for sessions.
//!
//! Loading and running block the calling thread, so the async API moves them
//! onto tokio's blocking pool. The wrapped [`Session`] is shared, so one
//! `AsyncSession` can serve many concurrent requests.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::{Artifact, CoreError, Result, Tensor};

use crate::session::{Session, SessionState};
use crate::statistics::SessionStatistics;
use crate::SessionOptions;

/// Async wrapper for sessions.
///
/// # Example
///
/// ```no_run
/// # use std::collections::HashMap;
/// # use tessera_core::{Artifact, Tensor};
/// # use tessera_runtime::{AsyncSession, SessionOptions};
/// # async fn example(artifact: Artifact) -> tessera_core::Result<()> {
/// let session = AsyncSession::load(SessionOptions::default(), artifact).await?;
/// let inputs = HashMap::from([("x".to_string(), Tensor::from_f32(vec![1.0], vec![1])?)]);
/// let outputs = session.run(inputs).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncSession {
    inner: Arc<Session>,
}

fn join_error(e: tokio::task::JoinError) -> CoreError {
    CoreError::internal(format!("blocking task failed: {e}"))
}

impl AsyncSession {
    /// Wrap an existing session.
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(session),
        }
    }

    /// Create a session with `options` and load `artifact` into it.
    pub async fn load(options: SessionOptions, artifact: Artifact) -> Result<Self> {
        let session = tokio::task::spawn_blocking(move || {
            let session = Session::new(options);
            session.load(artifact).map(|()| session)
        })
        .await
        .map_err(join_error)??;
        Ok(Self::new(session))
    }

    /// Run the graph without blocking the async executor.
    pub async fn run(&self, inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let session = self.inner.clone();
        tokio::task::spawn_blocking(move || session.run(inputs))
            .await
            .map_err(join_error)?
    }

    /// Run several input sets concurrently; results come back in input order.
    pub async fn run_batch(
        &self,
        batch: Vec<HashMap<String, Tensor>>,
    ) -> Vec<Result<HashMap<String, Tensor>>> {
        let handles: Vec<_> = batch
            .into_iter()
            .map(|inputs| {
                let session = self.inner.clone();
                tokio::task::spawn_blocking(move || session.run(inputs))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(join_error).and_then(|r| r));
        }
        results
    }

    /// Close the session.
    pub async fn close(&self) -> Result<()> {
        let session = self.inner.clone();
        tokio::task::spawn_blocking(move || session.close())
            .await
            .map_err(join_error)?
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Snapshot of the run statistics.
    pub fn statistics(&self) -> SessionStatistics {
        self.inner.statistics()
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.inner
    }
}
