//! Input bitstream ring.
//!
//! A fixed number of DMA buffers is claimed round robin by `put_packet` and
//! handed back by the drive loop once the core has consumed the data. A slot
//! is never claimable while it holds a packet, so the drive loop only ever
//! reads buffers the producer has finished filling.

use tracing::debug;

use crate::dma::{DmaAllocator, LinearBuffer};
use crate::error::{Result, VpuError};

/// Grown slots are sized in multiples of this.
pub const SLOT_ALIGNMENT: usize = 64 * 1024;

#[derive(Debug)]
pub struct StreamBufferSlot {
    buffer: Option<LinearBuffer>,
    capacity: usize,
    occupied_size: usize,
    tag: Option<u64>,
    in_use: bool,
}

impl StreamBufferSlot {
    pub fn bus_address(&self) -> Option<u64> {
        self.buffer.as_ref().map(LinearBuffer::bus_address)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied_size(&self) -> usize {
        self.occupied_size
    }

    pub fn tag(&self) -> Option<u64> {
        self.tag
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

#[derive(Debug)]
pub struct BufferSlotRing {
    slots: Vec<StreamBufferSlot>,
    next: usize,
}

impl BufferSlotRing {
    pub fn new(depth: usize, capacity: usize, allocator: &dyn DmaAllocator) -> Result<Self> {
        if depth == 0 {
            return Err(VpuError::Config("stream ring needs at least one slot".into()));
        }
        let mut slots: Vec<StreamBufferSlot> = Vec::with_capacity(depth);
        for _ in 0..depth {
            match allocator.alloc_linear(capacity) {
                Ok(buffer) => slots.push(StreamBufferSlot {
                    buffer: Some(buffer),
                    capacity,
                    occupied_size: 0,
                    tag: None,
                    in_use: false,
                }),
                Err(err) => {
                    for slot in slots {
                        if let Some(buffer) = slot.buffer {
                            allocator.free_linear(buffer);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { slots, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &StreamBufferSlot {
        &self.slots[index]
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    /// Index the next packet goes to, or `WouldBlock` while it is still queued.
    pub fn claim_slot(&self) -> Result<usize> {
        if self.slots[self.next].in_use {
            return Err(VpuError::WouldBlock { slot: self.next });
        }
        Ok(self.next)
    }

    /// Grows slot `index` when `size` does not fit. Returns whether the slot
    /// was reallocated.
    pub fn ensure_capacity(
        &mut self,
        index: usize,
        size: usize,
        allocator: &dyn DmaAllocator,
    ) -> Result<bool> {
        let slot = &mut self.slots[index];
        if size <= slot.capacity && slot.buffer.is_some() {
            return Ok(false);
        }
        let capacity = size.next_multiple_of(SLOT_ALIGNMENT);
        if let Some(old) = slot.buffer.take() {
            allocator.free_linear(old);
        }
        slot.capacity = 0;
        let buffer = allocator.alloc_linear(capacity)?;
        debug!(slot = index, size, capacity, "stream slot reallocated");
        slot.buffer = Some(buffer);
        slot.capacity = capacity;
        Ok(true)
    }

    /// Copies a packet into a claimed slot and advances the claim cursor.
    pub fn mark_occupied(&mut self, index: usize, data: &[u8], tag: Option<u64>) -> Result<()> {
        let slot = &mut self.slots[index];
        let buffer = slot
            .buffer
            .as_mut()
            .filter(|buffer| buffer.size() >= data.len())
            .ok_or_else(|| {
                VpuError::InvalidState(format!("slot {index} cannot hold {} bytes", data.len()))
            })?;
        buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
        slot.occupied_size = data.len();
        slot.tag = tag;
        slot.in_use = true;
        self.next = (index + 1) % self.slots.len();
        Ok(())
    }

    /// Lends the slot's buffer out while the core reads it.
    pub fn take_buffer(&mut self, index: usize) -> Option<LinearBuffer> {
        self.slots[index].buffer.take()
    }

    pub fn restore_buffer(&mut self, index: usize, buffer: LinearBuffer) {
        self.slots[index].buffer = Some(buffer);
    }

    /// Frees the slot for reuse, returning the caller's tag.
    pub fn release_slot(&mut self, index: usize) -> Option<u64> {
        let slot = &mut self.slots[index];
        slot.in_use = false;
        slot.occupied_size = 0;
        slot.tag.take()
    }

    pub fn free_all(&mut self, allocator: &dyn DmaAllocator) {
        for slot in &mut self.slots {
            if let Some(buffer) = slot.buffer.take() {
                allocator.free_linear(buffer);
            }
            slot.capacity = 0;
            slot.in_use = false;
            slot.occupied_size = 0;
            slot.tag = None;
        }
    }
}
