//! Device streams: FIFO command queues drained by one worker thread each.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use tessera_core::{CoreError, KernelLaunch, LaunchTracker, Result};
use tracing::{debug, trace, warn};

use crate::allocator::lock;

enum Command {
    Launch {
        launch: KernelLaunch,
        tracker: Arc<LaunchTracker>,
    },
    /// Signals once every command queued before it has completed.
    Fence(mpsc::Sender<()>),
}

/// Per-stream counters.
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Launches executed.
    pub executed: AtomicU64,
    /// Launches skipped because their run had already failed.
    pub skipped: AtomicU64,
    /// Launches that failed.
    pub failed: AtomicU64,
}

/// One FIFO device stream.
#[derive(Debug)]
pub struct DeviceStream {
    index: usize,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<StreamCounters>,
}

impl DeviceStream {
    /// Start the worker thread of stream `index`.
    pub fn spawn(name: &str, index: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let counters = Arc::new(StreamCounters::default());
        let worker_counters = counters.clone();
        let worker = thread::Builder::new()
            .name(format!("{name}-stream-{index}"))
            .spawn(move || worker_loop(index, rx, &worker_counters))
            .map_err(|e| CoreError::invalid_option(format!("failed to start stream {index}: {e}")))?;

        Ok(Self {
            index,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    /// Stream index within its provider.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Counters of this stream.
    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = lock(&self.sender);
        let tx = sender
            .as_ref()
            .ok_or_else(|| CoreError::internal(format!("stream {} is shut down", self.index)))?;
        tx.send(command)
            .map_err(|_| CoreError::internal(format!("stream {} worker exited", self.index)))
    }

    /// Queue a launch behind all earlier work.
    pub fn enqueue(&self, launch: KernelLaunch, tracker: Arc<LaunchTracker>) -> Result<()> {
        self.send(Command::Launch { launch, tracker })
    }

    /// Block until everything queued so far has completed.
    pub fn fence(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Fence(tx))?;
        rx.recv()
            .map_err(|_| CoreError::internal(format!("stream {} worker exited", self.index)))
    }

    /// Drain the queue and join the worker.
    pub fn shutdown(&self) {
        // Dropping the sender ends the worker loop after queued work.
        drop(lock(&self.sender).take());
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                warn!(stream = self.index, "Stream worker panicked");
            }
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: mpsc::Receiver<Command>, counters: &StreamCounters) {
    debug!(stream = index, "Stream worker started");
    while let Ok(command) = rx.recv() {
        match command {
            Command::Launch { launch, tracker } => {
                if tracker.has_failed() {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    trace!(stream = index, node = launch.node(), "Skipping launch of failed run");
                    continue;
                }
                trace!(stream = index, node = launch.node(), run = tracker.run_id(), "Executing launch");
                match launch.execute() {
                    Ok(()) => {
                        counters.executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        debug!(stream = index, error = %e, "Launch failed");
                        tracker.record_failure(e);
                    }
                }
            }
            Command::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(stream = index, "Stream worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_on_idle_stream() -> Result<()> {
        let stream = DeviceStream::spawn("test", 0)?;
        stream.fence()?;
        stream.shutdown();
        assert!(stream.fence().is_err());
        Ok(())
    }
}
