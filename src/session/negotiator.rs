//! External picture buffer negotiation.
//!
//! The core asks for picture buffers through `get_buffer_info` and hands back
//! the ones it no longer needs the same way. This side owns every buffer it
//! lends out and frees it only once the core has let go of it, or at close.

use tracing::{debug, trace};

use crate::accel::Accelerator;
use crate::dma::{DmaAllocator, LinearBuffer};
use crate::error::{Result, VpuError};

/// Upper bound on live external buffers per session.
pub const MAX_BUFFERS: usize = 64;

/// What one negotiation round did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub allocated: usize,
    pub freed: usize,
}

#[derive(Debug)]
pub struct ExternalBufferNegotiator {
    slots: Vec<Option<LinearBuffer>>,
    /// One past the highest occupied slot.
    active: usize,
    margin: usize,
    /// Request size the margin was last granted for.
    margin_granted_for: Option<usize>,
}

impl ExternalBufferNegotiator {
    pub fn new(margin: usize) -> Self {
        Self {
            slots: (0..MAX_BUFFERS).map(|_| None).collect(),
            active: 0,
            margin,
            margin_granted_for: None,
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots[..self.active].iter().flatten().count()
    }

    pub fn active_len(&self) -> usize {
        self.active
    }

    /// Reclaims everything the core released and, when `supply` is set,
    /// covers the core's outstanding request plus the margin.
    pub fn negotiate(
        &mut self,
        accel: &mut dyn Accelerator,
        supply: bool,
        allocator: &dyn DmaAllocator,
    ) -> Result<Negotiation> {
        let mut round = Negotiation::default();
        loop {
            let info = accel.get_buffer_info();
            if let Some(released) = info.buffer_to_free {
                self.reclaim(released.bus_address, allocator)?;
                round.freed += 1;
                continue;
            }
            if !supply || info.buffer_count == 0 {
                return Ok(round);
            }

            let margin = if self.margin_granted_for == Some(info.requested_size) {
                0
            } else {
                self.margin
            };
            let count = info.buffer_count + margin;
            let live = self.live_count();
            if live + count > MAX_BUFFERS {
                return Err(VpuError::BufferLimit {
                    requested: live + count,
                    limit: MAX_BUFFERS,
                });
            }
            self.margin_granted_for = Some(info.requested_size);
            debug!(
                count,
                size = info.requested_size,
                live,
                "supplying external picture buffers"
            );
            for _ in 0..count {
                self.supply_one(accel, info.requested_size, allocator)?;
                round.allocated += 1;
            }
        }
    }

    fn supply_one(
        &mut self,
        accel: &mut dyn Accelerator,
        size: usize,
        allocator: &dyn DmaAllocator,
    ) -> Result<()> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(VpuError::BufferLimit {
                requested: MAX_BUFFERS + 1,
                limit: MAX_BUFFERS,
            })?;
        let buffer = allocator.alloc_linear(size)?;
        let descriptor = buffer.descriptor();
        self.slots[index] = Some(buffer);
        self.active = self.active.max(index + 1);
        trace!(index, bus_address = descriptor.bus_address, "external buffer lent");
        accel.add_buffer(descriptor)?;
        Ok(())
    }

    fn reclaim(&mut self, bus_address: u64, allocator: &dyn DmaAllocator) -> Result<()> {
        let index = self.slots[..self.active]
            .iter()
            .position(|slot| {
                slot.as_ref()
                    .is_some_and(|buffer| buffer.bus_address() == bus_address)
            })
            .ok_or_else(|| {
                VpuError::BufferInconsistency(format!(
                    "core released untracked buffer {bus_address:#x}"
                ))
            })?;
        if let Some(buffer) = self.slots[index].take() {
            allocator.free_linear(buffer);
        }
        while self.active > 0 && self.slots[self.active - 1].is_none() {
            self.active -= 1;
        }
        trace!(index, bus_address, "external buffer reclaimed");
        Ok(())
    }

    pub fn free_all(&mut self, allocator: &dyn DmaAllocator) {
        for slot in &mut self.slots[..self.active] {
            if let Some(buffer) = slot.take() {
                allocator.free_linear(buffer);
            }
        }
        self.active = 0;
        self.margin_granted_for = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{
        BufferInfo, CodecFormat, DecodeOutput, DecodeStatus, DecodedPicture, InputBuffer,
        NextPicture, PpConfig, SequenceInfo,
    };
    use crate::dma::{DmaBufferRef, HeapAllocator};
    use crate::error::AccelError;

    /// Core that asks for a scripted number of buffers and frees on demand.
    #[derive(Default)]
    struct ScriptedCore {
        want: usize,
        size: usize,
        added: Vec<DmaBufferRef>,
        to_free: Vec<DmaBufferRef>,
    }

    impl Accelerator for ScriptedCore {
        fn format(&self) -> CodecFormat {
            CodecFormat::H264
        }
        fn get_info(&self) -> std::result::Result<SequenceInfo, AccelError> {
            Err(AccelError::NoSequence)
        }
        fn set_info(
            &mut self,
            _: &PpConfig,
            _: &SequenceInfo,
        ) -> std::result::Result<(), AccelError> {
            Ok(())
        }
        fn decode(&mut self, _: &InputBuffer<'_>) -> std::result::Result<DecodeOutput, AccelError> {
            Ok(DecodeOutput::new(DecodeStatus::Ok, 0))
        }
        fn next_picture(&mut self) -> std::result::Result<NextPicture, AccelError> {
            Ok(NextPicture::NotReady)
        }
        fn picture_consumed(&mut self, _: DecodedPicture) -> std::result::Result<(), AccelError> {
            Ok(())
        }
        fn end_of_stream(&mut self) -> std::result::Result<(), AccelError> {
            Ok(())
        }
        fn get_buffer_info(&mut self) -> BufferInfo {
            BufferInfo {
                buffer_to_free: self.to_free.pop(),
                requested_size: self.size,
                buffer_count: self.want,
            }
        }
        fn add_buffer(
            &mut self,
            buffer: DmaBufferRef,
        ) -> std::result::Result<DecodeStatus, AccelError> {
            self.added.push(buffer);
            self.want = self.want.saturating_sub(1);
            Ok(DecodeStatus::Ok)
        }
        fn release(&mut self) {}
    }

    #[test]
    fn supplies_request_plus_margin_once() {
        let alloc = HeapAllocator::new();
        let mut core = ScriptedCore {
            want: 4,
            size: 4096,
            ..Default::default()
        };
        let mut negotiator = ExternalBufferNegotiator::new(2);
        let round = negotiator.negotiate(&mut core, true, &alloc).unwrap();
        assert_eq!(round.allocated, 6);
        assert_eq!(negotiator.live_count(), 6);

        core.want = 1;
        let round = negotiator.negotiate(&mut core, true, &alloc).unwrap();
        assert_eq!(round.allocated, 1, "margin is granted once per size");
        assert_eq!(alloc.stats().live_buffers, 7);
    }

    #[test]
    fn reclaims_and_compacts_tail() {
        let alloc = HeapAllocator::new();
        let mut core = ScriptedCore {
            want: 3,
            size: 1024,
            ..Default::default()
        };
        let mut negotiator = ExternalBufferNegotiator::new(0);
        negotiator.negotiate(&mut core, true, &alloc).unwrap();
        assert_eq!(negotiator.active_len(), 3);

        core.to_free = vec![core.added[1], core.added[2]];
        let round = negotiator.negotiate(&mut core, false, &alloc).unwrap();
        assert_eq!(round.freed, 2);
        assert_eq!(negotiator.active_len(), 1);
        assert_eq!(alloc.stats().live_buffers, 1);

        // Freed indices are reused.
        core.want = 1;
        negotiator.negotiate(&mut core, true, &alloc).unwrap();
        assert_eq!(negotiator.active_len(), 2);
        negotiator.free_all(&alloc);
        assert_eq!(alloc.stats().live_buffers, 0);
    }

    #[test]
    fn unknown_release_is_inconsistency() {
        let alloc = HeapAllocator::new();
        let mut core = ScriptedCore {
            to_free: vec![DmaBufferRef {
                bus_address: 0xdead_0000,
                size: 16,
            }],
            ..Default::default()
        };
        let mut negotiator = ExternalBufferNegotiator::new(0);
        let err = negotiator.negotiate(&mut core, false, &alloc).unwrap_err();
        assert!(matches!(err, VpuError::BufferInconsistency(_)));
    }

    #[test]
    fn over_cap_request_is_rejected_not_truncated() {
        let alloc = HeapAllocator::new();
        let mut core = ScriptedCore {
            want: MAX_BUFFERS,
            size: 64,
            ..Default::default()
        };
        let mut negotiator = ExternalBufferNegotiator::new(1);
        let err = negotiator.negotiate(&mut core, true, &alloc).unwrap_err();
        assert_eq!(
            err,
            VpuError::BufferLimit {
                requested: MAX_BUFFERS + 1,
                limit: MAX_BUFFERS
            }
        );
        assert_eq!(negotiator.live_count(), 0);
        assert_eq!(alloc.stats().live_buffers, 0);
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let alloc = HeapAllocator::with_limit(1000);
        let mut core = ScriptedCore {
            want: 2,
            size: 600,
            ..Default::default()
        };
        let mut negotiator = ExternalBufferNegotiator::new(0);
        let err = negotiator.negotiate(&mut core, true, &alloc).unwrap_err();
        assert_eq!(err, VpuError::OutOfMemory { requested: 600 });
        assert_eq!(negotiator.live_count(), 1);
        negotiator.free_all(&alloc);
    }
}
