//! Arena reuse across runs.
//!
//! Every run needs one arena per provider slot with a planned arena. Finished
//! runs hand their arenas back here keyed by the frame's shape signature, the
//! byte size of each slot's arena, and the next run needing the same layout
//! skips the allocator entirely. Arena sizes come from the static plan, so
//! runs with different symbolic input extents share pooled sets. The number of
//! pooled sets is capped across all signatures.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use tessera_core::{ArenaPlan, TensorAllocator, TensorBuffer};
use tracing::{debug, warn};

/// Per-slot arena byte sizes of an execution frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature(Vec<usize>);

impl ShapeSignature {
    /// Signature of the arenas a plan needs.
    pub fn of(arenas: &[ArenaPlan]) -> Self {
        Self(arenas.iter().map(|a| a.size).collect())
    }

    /// Arena sizes by provider slot.
    pub fn sizes(&self) -> &[usize] {
        &self.0
    }
}

/// One run's arenas, indexed by provider slot.
#[derive(Debug)]
pub struct ArenaSet {
    buffers: Vec<Option<TensorBuffer>>,
}

impl ArenaSet {
    /// Base address of a slot's arena, if the slot has one.
    pub fn base(&self, slot: usize) -> Option<NonNull<u8>> {
        self.buffers.get(slot).and_then(Option::as_ref).map(|b| b.ptr)
    }

    /// Size of a slot's arena.
    pub fn size(&self, slot: usize) -> usize {
        self.buffers
            .get(slot)
            .and_then(Option::as_ref)
            .map_or(0, |b| b.size)
    }
}

/// An arena the allocator of a provider slot could not supply.
#[derive(Debug)]
pub struct ArenaAllocFailure {
    /// Provider slot whose arena failed.
    pub slot: usize,
    /// Allocator error.
    pub error: anyhow::Error,
}

/// Counters of an [`ArenaPool`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaPoolStats {
    /// Distinct signatures with pooled arenas.
    pub signatures: usize,
    /// Arena sets currently pooled.
    pub pooled_sets: usize,
    /// Acquisitions served from the pool.
    pub hits: u64,
    /// Acquisitions that went to the allocators.
    pub misses: u64,
}

/// Shared pool of run arenas.
#[derive(Debug)]
pub struct ArenaPool {
    pooled: DashMap<ShapeSignature, Vec<ArenaSet>>,
    allocators: Vec<Arc<dyn TensorAllocator>>,
    alignments: Vec<usize>,
    max_pooled: usize,
    pooled_sets: AtomicUsize,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ArenaPool {
    /// Create a pool backed by the slot allocators, aligning each slot's
    /// arena as planned.
    ///
    /// At most `max_pooled` sets are kept in total; with `0` nothing is kept.
    pub fn new(
        arenas: &[ArenaPlan],
        allocators: Vec<Arc<dyn TensorAllocator>>,
        max_pooled: usize,
    ) -> Self {
        Self {
            pooled: DashMap::new(),
            allocators,
            alignments: arenas.iter().map(|a| a.alignment).collect(),
            max_pooled,
            pooled_sets: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Take a pooled arena set for `signature` or allocate a fresh one.
    pub fn acquire(&self, signature: &ShapeSignature) -> Result<ArenaSet, ArenaAllocFailure> {
        if let Some(set) = self
            .pooled
            .get_mut(signature)
            .and_then(|mut sets| sets.pop())
        {
            self.pooled_sets.fetch_sub(1, Ordering::AcqRel);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(set);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.allocate_set(signature)
    }

    fn allocate_set(&self, signature: &ShapeSignature) -> Result<ArenaSet, ArenaAllocFailure> {
        let mut set = ArenaSet {
            buffers: Vec::with_capacity(signature.sizes().len()),
        };
        for (slot, &size) in signature.sizes().iter().enumerate() {
            if size == 0 {
                set.buffers.push(None);
                continue;
            }
            let alignment = self.alignments.get(slot).copied().unwrap_or(1);
            let allocated = match self.allocators.get(slot) {
                Some(allocator) => allocator
                    .allocate(size, alignment)
                    .with_context(|| format!("failed to allocate {size}-byte run arena")),
                None => Err(anyhow!("no allocator for provider slot {slot}")),
            };
            match allocated {
                Ok(buffer) => set.buffers.push(Some(buffer)),
                Err(error) => {
                    self.free(set);
                    return Err(ArenaAllocFailure { slot, error });
                }
            }
        }
        Ok(set)
    }

    /// Hand an arena set back after a run.
    pub fn release(&self, signature: ShapeSignature, set: ArenaSet) {
        if self.closed.load(Ordering::Acquire) || !self.reserve_pool_slot() {
            self.free(set);
            return;
        }
        self.pooled.entry(signature).or_default().push(set);
    }

    fn reserve_pool_slot(&self) -> bool {
        self.pooled_sets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_pooled).then_some(n + 1)
            })
            .is_ok()
    }

    /// Free every pooled arena and stop pooling. Returns the sets freed.
    pub fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<ShapeSignature> = self.pooled.iter().map(|e| e.key().clone()).collect();
        let mut freed = 0;
        for key in keys {
            if let Some((_, sets)) = self.pooled.remove(&key) {
                freed += sets.len();
                self.pooled_sets.fetch_sub(sets.len(), Ordering::AcqRel);
                for set in sets {
                    self.free(set);
                }
            }
        }
        debug!(freed, "Drained arena pool");
        freed
    }

    fn free(&self, set: ArenaSet) {
        for (slot, buffer) in set.buffers.into_iter().enumerate() {
            let Some(buffer) = buffer else { continue };
            match self.allocators.get(slot) {
                Some(allocator) => {
                    if let Err(e) = allocator.deallocate(buffer) {
                        warn!(slot, error = %e, "Failed to free arena");
                    }
                }
                None => warn!(slot, "Dropping arena without an allocator"),
            }
        }
    }

    /// Pool counters.
    pub fn stats(&self) -> ArenaPoolStats {
        ArenaPoolStats {
            signatures: self.pooled.iter().filter(|e| !e.value().is_empty()).count(),
            pooled_sets: self.pooled_sets.load(Ordering::Acquire),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ArenaPool {
    fn drop(&mut self) {
        self.drain();
    }
}
