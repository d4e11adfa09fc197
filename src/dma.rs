//! DMA-capable linear buffer allocation.
//!
//! The session never talks to a memory driver directly; it goes through a
//! [`DmaAllocator`]. [`HeapAllocator`] backs buffers with host memory and hands
//! out synthetic bus addresses, which is what the software decoder cores and
//! the test-suite run against.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::error::{Result, VpuError};

const BUS_ADDRESS_BASE: u64 = 0x1000_0000;
const BUS_PAGE: u64 = 4096;

/// A physically contiguous buffer visible to the accelerator.
#[derive(Debug)]
pub struct LinearBuffer {
    bus_address: u64,
    data: Vec<u8>,
}

impl LinearBuffer {
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Descriptor handed to the accelerator; the buffer itself stays here.
    pub fn descriptor(&self) -> DmaBufferRef {
        DmaBufferRef {
            bus_address: self.bus_address,
            size: self.data.len(),
        }
    }
}

/// Borrowed view of a [`LinearBuffer`] as seen by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DmaBufferRef {
    pub bus_address: u64,
    pub size: usize,
}

/// Allocator for accelerator-visible memory.
pub trait DmaAllocator: Send + Sync {
    fn alloc_linear(&self, size: usize) -> Result<LinearBuffer>;
    fn free_linear(&self, buffer: LinearBuffer);
}

/// Live allocation counters of a [`HeapAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub live_buffers: usize,
    pub live_bytes: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
}

/// Host-memory allocator with an optional byte budget.
#[derive(Debug)]
pub struct HeapAllocator {
    limit: Option<usize>,
    next_bus: AtomicU64,
    stats: Mutex<AllocatorStats>,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            limit: None,
            next_bus: AtomicU64::new(BUS_ADDRESS_BASE),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    /// Allocator that fails once `limit` bytes are live.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        *self.stats.lock()
    }
}

impl DmaAllocator for HeapAllocator {
    fn alloc_linear(&self, size: usize) -> Result<LinearBuffer> {
        if size == 0 {
            return Err(VpuError::OutOfMemory { requested: 0 });
        }
        let mut stats = self.stats.lock();
        if let Some(limit) = self.limit
            && stats.live_bytes + size > limit
        {
            stats.failed_allocations += 1;
            return Err(VpuError::OutOfMemory { requested: size });
        }
        stats.live_buffers += 1;
        stats.live_bytes += size;
        stats.total_allocations += 1;
        drop(stats);

        let span = (size as u64).div_ceil(BUS_PAGE) * BUS_PAGE;
        let bus_address = self.next_bus.fetch_add(span, Ordering::Relaxed);
        trace!(bus_address, size, "linear buffer allocated");
        Ok(LinearBuffer {
            bus_address,
            data: vec![0u8; size],
        })
    }

    fn free_linear(&self, buffer: LinearBuffer) {
        let mut stats = self.stats.lock();
        stats.live_buffers = stats.live_buffers.saturating_sub(1);
        stats.live_bytes = stats.live_bytes.saturating_sub(buffer.size());
        stats.total_frees += 1;
        trace!(bus_address = buffer.bus_address, "linear buffer freed");
    }
}
