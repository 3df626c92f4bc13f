//! Memory allocator implementations for execution providers.
//!
//! Three strategies are provided: a plain SIMD-aligned heap allocator, a
//! pooled allocator that recycles buffers by size bucket (used by the CPU
//! provider, since arenas and standalone buffers are requested with the same
//! sizes run after run), and a capacity-limited allocator standing in for
//! accelerator memory.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use tessera_core::{
    AllocatorConstraints, MemoryInfo, MemoryType, TensorAllocator, TensorBuffer,
};
use tracing::{debug, trace};

/// Default alignment for host buffers: one cache line, enough for AVX-512.
pub const SIMD_ALIGNMENT: usize = 64;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn checked_layout(size: usize, alignment: usize) -> Result<Layout> {
    Layout::from_size_align(size, alignment)
        .map_err(|e| anyhow!("invalid layout ({size} bytes, align {alignment}): {e}"))
}

fn raw_alloc(size: usize, alignment: usize) -> Result<NonNull<u8>> {
    let layout = checked_layout(size, alignment)?;
    // SAFETY: callers never request zero-sized layouts.
    let ptr = unsafe { alloc(layout) };
    NonNull::new(ptr).ok_or_else(|| anyhow!("allocation of {size} bytes failed"))
}

/// # Safety
///
/// `ptr` must come from `raw_alloc(size, alignment)` and not be freed twice.
unsafe fn raw_dealloc(ptr: NonNull<u8>, size: usize, alignment: usize) -> Result<()> {
    let layout = checked_layout(size, alignment)?;
    dealloc(ptr.as_ptr(), layout);
    Ok(())
}

/// Allocator usage counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes allocated over the allocator's lifetime.
    pub total_allocated: usize,
    /// Bytes currently handed out.
    pub current_allocated: usize,
    /// High-water mark of `current_allocated`.
    pub peak_allocated: usize,
    /// Number of allocations.
    pub allocation_count: usize,
    /// Number of deallocations.
    pub deallocation_count: usize,
}

impl AllocatorStats {
    fn record_alloc(&mut self, size: usize) {
        self.total_allocated += size;
        self.current_allocated += size;
        self.peak_allocated = self.peak_allocated.max(self.current_allocated);
        self.allocation_count += 1;
    }

    fn record_dealloc(&mut self, size: usize) {
        self.current_allocated = self.current_allocated.saturating_sub(size);
        self.deallocation_count += 1;
    }
}

/// SIMD-aligned heap allocator.
#[derive(Debug)]
pub struct AlignedMemoryAllocator {
    alignment: usize,
    stats: Mutex<AllocatorStats>,
}

impl Default for AlignedMemoryAllocator {
    fn default() -> Self {
        Self {
            alignment: SIMD_ALIGNMENT,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }
}

impl AlignedMemoryAllocator {
    /// Create an allocator with the default SIMD alignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator with a minimum alignment.
    pub fn with_alignment(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            bail!("alignment {alignment} is not a power of two");
        }
        Ok(Self {
            alignment,
            stats: Mutex::new(AllocatorStats::default()),
        })
    }

    /// Usage counters.
    pub fn get_stats(&self) -> AllocatorStats {
        lock(&self.stats).clone()
    }
}

impl TensorAllocator for AlignedMemoryAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<TensorBuffer> {
        let alignment = alignment.max(self.alignment);
        if size == 0 {
            return Ok(TensorBuffer::empty(alignment, MemoryType::SystemRAM));
        }
        let ptr = raw_alloc(size, alignment)?;
        lock(&self.stats).record_alloc(size);
        trace!(size, alignment, "Allocated aligned buffer");
        Ok(TensorBuffer {
            ptr,
            size,
            alignment,
            memory_type: MemoryType::SystemRAM,
        })
    }

    fn deallocate(&self, buffer: TensorBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        // SAFETY: non-empty buffers are only produced by `allocate` above.
        unsafe { raw_dealloc(buffer.ptr, buffer.size, buffer.alignment)? };
        lock(&self.stats).record_dealloc(buffer.size);
        Ok(())
    }

    fn get_memory_info(&self) -> MemoryInfo {
        let stats = lock(&self.stats);
        MemoryInfo {
            total_bytes: usize::MAX,
            allocated_bytes: stats.current_allocated,
            peak_bytes: stats.peak_allocated,
        }
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SystemRAM
    }

    fn constraints(&self) -> AllocatorConstraints {
        AllocatorConstraints {
            alignment: self.alignment,
            max_arena_bytes: None,
        }
    }
}

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Buffers kept per `(bucket, alignment)` key.
    pub max_buffers_per_bucket: usize,
    /// Bytes kept across all buckets.
    pub max_pool_size: usize,
    /// Bucket rounding granularity in bytes.
    pub bucket_granularity: usize,
    /// Largest arena handed to the memory planner, if bounded.
    pub max_arena_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_bucket: 64,
            max_pool_size: 256 * 1024 * 1024,
            bucket_granularity: SIMD_ALIGNMENT,
            max_arena_bytes: None,
        }
    }
}

/// Pooled allocator counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Underlying allocation counters.
    pub allocator_stats: AllocatorStats,
    /// Requests served from the pool.
    pub pool_hits: usize,
    /// Requests that needed a fresh allocation.
    pub pool_misses: usize,
    /// Bytes currently parked in the pool.
    pub pool_size: usize,
}

/// Allocator that recycles buffers by `(bucket size, alignment)`.
///
/// Returned buffers always report their full bucket size.
#[derive(Debug)]
pub struct PooledMemoryAllocator {
    pools: RwLock<HashMap<(usize, usize), Vec<TensorBuffer>>>,
    config: PoolConfig,
    alignment: usize,
    stats: Mutex<PoolStats>,
}

impl PooledMemoryAllocator {
    /// Create a pooled allocator.
    pub fn new(config: PoolConfig, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            bail!("alignment {alignment} is not a power of two");
        }
        if config.bucket_granularity == 0 {
            bail!("bucket granularity must be positive");
        }
        Ok(Self {
            pools: RwLock::new(HashMap::new()),
            config,
            alignment,
            stats: Mutex::new(PoolStats::default()),
        })
    }

    fn round_to_bucket(&self, size: usize) -> usize {
        size.div_ceil(self.config.bucket_granularity) * self.config.bucket_granularity
    }

    fn try_get_from_pool(&self, bucket: usize, alignment: usize) -> Option<TensorBuffer> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let buffer = pools.get_mut(&(bucket, alignment)).and_then(Vec::pop);
        let mut stats = lock(&self.stats);
        match &buffer {
            Some(b) => {
                stats.pool_hits += 1;
                stats.pool_size -= b.size;
                trace!(bucket, "Pool hit");
            }
            None => stats.pool_misses += 1,
        }
        buffer
    }

    fn return_to_pool(&self, buffer: TensorBuffer) -> Option<TensorBuffer> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let mut stats = lock(&self.stats);
        let slot = pools.entry((buffer.size, buffer.alignment)).or_default();
        if slot.len() >= self.config.max_buffers_per_bucket
            || stats.pool_size + buffer.size > self.config.max_pool_size
        {
            return Some(buffer);
        }
        stats.pool_size += buffer.size;
        slot.push(buffer);
        None
    }

    /// Pool counters.
    pub fn get_pool_stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }

    /// Fraction of requests served from the pool.
    pub fn get_hit_rate(&self) -> f64 {
        let stats = lock(&self.stats);
        let total = stats.pool_hits + stats.pool_misses;
        if total == 0 {
            0.0
        } else {
            stats.pool_hits as f64 / total as f64
        }
    }

    /// Free every parked buffer.
    pub fn clear_pools(&self) {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let mut freed = 0usize;
        for (_, buffers) in pools.drain() {
            for buffer in buffers {
                freed += buffer.size;
                // SAFETY: pooled buffers were allocated by this allocator.
                if let Err(e) = unsafe { raw_dealloc(buffer.ptr, buffer.size, buffer.alignment) } {
                    debug!(error = %e, "Failed to free pooled buffer");
                }
            }
        }
        let mut stats = lock(&self.stats);
        stats.pool_size = 0;
        stats.allocator_stats.record_dealloc(freed);
        debug!(freed, "Cleared allocator pools");
    }
}

impl TensorAllocator for PooledMemoryAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<TensorBuffer> {
        let alignment = alignment.max(self.alignment);
        if size == 0 {
            return Ok(TensorBuffer::empty(alignment, MemoryType::SystemRAM));
        }
        let bucket = self.round_to_bucket(size);
        if let Some(buffer) = self.try_get_from_pool(bucket, alignment) {
            return Ok(buffer);
        }

        let ptr = raw_alloc(bucket, alignment)?;
        lock(&self.stats).allocator_stats.record_alloc(bucket);
        trace!(bucket, alignment, "Allocated pooled buffer");
        Ok(TensorBuffer {
            ptr,
            size: bucket,
            alignment,
            memory_type: MemoryType::SystemRAM,
        })
    }

    fn deallocate(&self, buffer: TensorBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if buffer.size != self.round_to_bucket(buffer.size) {
            bail!(
                "buffer of {} bytes was not allocated by this pool",
                buffer.size
            );
        }
        let parked = match self.return_to_pool(buffer) {
            None => return Ok(()),
            Some(rejected) => rejected,
        };
        // SAFETY: the buffer came from `allocate` with this size and alignment.
        unsafe { raw_dealloc(parked.ptr, parked.size, parked.alignment)? };
        lock(&self.stats)
            .allocator_stats
            .record_dealloc(parked.size);
        Ok(())
    }

    fn get_memory_info(&self) -> MemoryInfo {
        let stats = lock(&self.stats);
        MemoryInfo {
            total_bytes: usize::MAX,
            allocated_bytes: stats.allocator_stats.current_allocated,
            peak_bytes: stats.allocator_stats.peak_allocated,
        }
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SystemRAM
    }

    fn constraints(&self) -> AllocatorConstraints {
        AllocatorConstraints {
            alignment: self.alignment,
            max_arena_bytes: self.config.max_arena_bytes,
        }
    }
}

impl Drop for PooledMemoryAllocator {
    fn drop(&mut self) {
        self.clear_pools();
    }
}

/// Capacity-limited allocator backing a device's memory.
///
/// Device memory of the stream provider is emulated in host RAM; the capacity
/// limit is what makes planning and allocation behave like a real device.
#[derive(Debug)]
pub struct DeviceMemoryAllocator {
    capacity: usize,
    alignment: usize,
    stats: Mutex<AllocatorStats>,
}

impl DeviceMemoryAllocator {
    /// Create a device allocator with `capacity` bytes.
    pub fn new(capacity: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            bail!("alignment {alignment} is not a power of two");
        }
        Ok(Self {
            capacity,
            alignment,
            stats: Mutex::new(AllocatorStats::default()),
        })
    }

    /// Usage counters.
    pub fn get_stats(&self) -> AllocatorStats {
        lock(&self.stats).clone()
    }
}

impl TensorAllocator for DeviceMemoryAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<TensorBuffer> {
        let alignment = alignment.max(self.alignment);
        if size == 0 {
            return Ok(TensorBuffer::empty(alignment, MemoryType::Device));
        }
        let mut stats = lock(&self.stats);
        if stats.current_allocated + size > self.capacity {
            bail!(
                "device memory exhausted: {} bytes requested, {} of {} in use",
                size,
                stats.current_allocated,
                self.capacity
            );
        }
        let ptr = raw_alloc(size, alignment)?;
        stats.record_alloc(size);
        Ok(TensorBuffer {
            ptr,
            size,
            alignment,
            memory_type: MemoryType::Device,
        })
    }

    fn deallocate(&self, buffer: TensorBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if buffer.memory_type != MemoryType::Device {
            bail!("host buffer returned to device allocator");
        }
        // SAFETY: non-empty device buffers are only produced by `allocate`.
        unsafe { raw_dealloc(buffer.ptr, buffer.size, buffer.alignment)? };
        lock(&self.stats).record_dealloc(buffer.size);
        Ok(())
    }

    fn get_memory_info(&self) -> MemoryInfo {
        let stats = lock(&self.stats);
        MemoryInfo {
            total_bytes: self.capacity,
            allocated_bytes: stats.current_allocated,
            peak_bytes: stats.peak_allocated,
        }
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Device
    }

    fn constraints(&self) -> AllocatorConstraints {
        AllocatorConstraints {
            alignment: self.alignment,
            max_arena_bytes: Some(self.capacity),
        }
    }
}
