//! Background decode thread.
//!
//! The loop pops queued packets, feeds them to the core until every byte is
//! consumed, reacts to the core's status codes and publishes finished
//! pictures. It parks on its event channel when there is no work or when
//! the core has no free picture buffer left.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, info_span, trace, warn};

use super::output::{FrameOutputPool, derive_pp_config};
use super::{CoreState, QueuedPacket, SessionShared};
use crate::accel::{DecodeStatus, InputBuffer, NextPicture};
use crate::dma::LinearBuffer;
use crate::error::{Result, VpuError};
use crate::observability::Counter;

/// Consecutive decode calls without consumed bytes before the core is
/// considered stuck.
const MAX_IDLE_CALLS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveEvent {
    PacketQueued,
    PictureReleased,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct DriveLoop {
    shared: Arc<SessionShared>,
    events: Receiver<DriveEvent>,
    output: FrameOutputPool,
    pictures: u64,
    limit_reached: bool,
}

impl DriveLoop {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        events: Receiver<DriveEvent>,
        output: FrameOutputPool,
    ) -> Self {
        Self {
            shared,
            events,
            output,
            pictures: 0,
            limit_reached: false,
        }
    }

    pub(crate) fn spawn(self, session_id: u64) -> std::io::Result<JoinHandle<()>> {
        let format = self.shared.config.format;
        thread::Builder::new()
            .name(format!("vpu-drive-{format}"))
            .spawn(move || {
                let span = info_span!("decode_session", format = %format, session = session_id);
                let _entered = span.enter();
                self.run();
            })
    }

    fn run(mut self) {
        debug!("drive loop started");
        match panic::catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(Ok(())) => debug!(pictures = self.pictures, "drive loop finished"),
            Ok(Err(err)) => self.fail(err),
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                self.fail(VpuError::SystemError(format!("decode thread panicked: {reason}")));
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        loop {
            let next = {
                let state = self.shared.state.lock();
                if state.finishing {
                    return Ok(());
                }
                if let Some(err) = &state.failure {
                    return Err(err.clone());
                }
                state.queue.front().copied()
            };

            let Some(packet) = next else {
                if self.wait_for_work() == Flow::Shutdown {
                    return Ok(());
                }
                continue;
            };

            let Some(slot) = packet.slot else {
                let mut state = self.shared.state.lock();
                state.queue.pop_front();
                state.released_tags.extend(packet.tag);
                drop(state);
                debug!(decode_order_id = packet.decode_order_id, "end of stream reached");
                return self.finish_stream();
            };

            if self.decode_packet(slot, packet)? == Flow::Shutdown {
                return Ok(());
            }
            if self.limit_reached {
                self.discard_queue();
                return self.finish_stream();
            }
        }
    }

    fn wait_for_work(&self) -> Flow {
        match self.events.recv() {
            Ok(DriveEvent::Shutdown) | Err(_) => Flow::Shutdown,
            Ok(DriveEvent::PacketQueued | DriveEvent::PictureReleased) => Flow::Continue,
        }
    }

    /// Parks until the consumer returns a picture.
    fn wait_for_release(&self) -> Result<Flow> {
        loop {
            match self.events.recv() {
                Ok(DriveEvent::PictureReleased) => return Ok(Flow::Continue),
                Ok(DriveEvent::Shutdown) | Err(_) => return Ok(Flow::Shutdown),
                Ok(DriveEvent::PacketQueued) => {
                    let state = self.shared.state.lock();
                    if state.finishing {
                        return Ok(Flow::Shutdown);
                    }
                    if let Some(err) = &state.failure {
                        return Err(err.clone());
                    }
                }
            }
        }
    }

    fn decode_packet(&mut self, slot: usize, packet: QueuedPacket) -> Result<Flow> {
        let buffer = self
            .shared
            .state
            .lock()
            .ring
            .take_buffer(slot)
            .ok_or_else(|| VpuError::InvalidState(format!("stream slot {slot} has no buffer")))?;
        let flow = self.decode_buffer(&buffer, packet);
        let mut state = self.shared.state.lock();
        state.ring.restore_buffer(slot, buffer);
        if matches!(flow, Ok(Flow::Continue)) {
            state.queue.pop_front();
            if let Some(tag) = state.ring.release_slot(slot) {
                state.released_tags.push_back(tag);
            }
            trace!(slot, decode_order_id = packet.decode_order_id, "stream slot released");
        }
        flow
    }

    fn decode_buffer(&mut self, buffer: &LinearBuffer, packet: QueuedPacket) -> Result<Flow> {
        let data = &buffer.as_slice()[..packet.size];
        let mut offset = 0;
        let mut idle_calls = 0;
        while offset < data.len() && !self.limit_reached {
            let input = InputBuffer {
                data: &data[offset..],
                bus_address: buffer.bus_address() + offset as u64,
                decode_order_id: packet.decode_order_id,
            };
            let mut core = self.shared.core.lock();
            let output = {
                let _timer = self.shared.metrics.time_call("decode");
                core.accel.decode(&input)?
            };
            trace!(status = ?output.status, consumed = output.consumed, offset, "decode call");
            offset += output.consumed;
            self.negotiate(&mut core, output.status)?;

            match output.status {
                DecodeStatus::StreamNotSupported => {
                    return Err(VpuError::StreamNotSupported {
                        format: self.shared.config.format,
                    });
                }
                DecodeStatus::HwTimeout => return Err(VpuError::HardwareTimeout),
                DecodeStatus::SystemError => {
                    return Err(VpuError::SystemError(
                        "decoder core reported a system error".into(),
                    ));
                }
                DecodeStatus::HeadersReady => self.apply_headers(&mut core)?,
                DecodeStatus::AdvancedToolingDetected => {
                    if self.shared.config.multi_core {
                        return Err(VpuError::AdvancedTooling);
                    }
                    debug!("stream uses advanced tooling, continuing on a single core");
                }
                DecodeStatus::PictureDecoded => {
                    self.pictures += 1;
                    self.shared.metrics.increment(Counter::PicturesDecoded);
                    if let Some(limit) = self.shared.config.picture_limit
                        && self.pictures >= limit
                    {
                        info!(limit, "picture limit reached, ending input");
                        self.limit_reached = true;
                    }
                }
                DecodeStatus::NoDecodingBuffer => {
                    self.shared.dpb.arm();
                    drop(core);
                    self.shared.metrics.increment(Counter::DpbStalls);
                    debug!(
                        outstanding = self.shared.tracker.outstanding(),
                        "no free picture buffer, waiting for a release"
                    );
                    self.publish_ready()?;
                    if self.wait_for_release()? == Flow::Shutdown {
                        return Ok(Flow::Shutdown);
                    }
                    idle_calls = 0;
                    continue;
                }
                DecodeStatus::WaitingForBuffer
                | DecodeStatus::Ok
                | DecodeStatus::BufferEmpty
                | DecodeStatus::StreamProcessed
                | DecodeStatus::NonRefSkipped => {}
            }
            drop(core);

            if output.consumed == 0 {
                idle_calls += 1;
                if idle_calls > MAX_IDLE_CALLS {
                    return Err(VpuError::InvalidState(format!(
                        "decoder core made no progress ({:?})",
                        output.status
                    )));
                }
            } else {
                idle_calls = 0;
            }
        }
        if offset < data.len() {
            debug!(
                discarded = data.len() - offset,
                "dropping bitstream past the picture limit"
            );
        }
        self.publish_ready()?;
        Ok(Flow::Continue)
    }

    fn negotiate(&self, core: &mut CoreState, status: DecodeStatus) -> Result<()> {
        let CoreState {
            accel, negotiator, ..
        } = core;
        let round = negotiator.negotiate(
            accel.as_mut(),
            status == DecodeStatus::WaitingForBuffer,
            self.shared.allocator.as_ref(),
        )?;
        let metrics = &self.shared.metrics;
        metrics.add(Counter::ExternalBuffersAllocated, round.allocated as u64);
        metrics.add(Counter::ExternalBuffersFreed, round.freed as u64);
        Ok(())
    }

    fn apply_headers(&self, core: &mut CoreState) -> Result<()> {
        let info = core.accel.get_info()?;
        let pp = derive_pp_config(&self.shared.config.outputs, &info);
        {
            let _timer = self.shared.metrics.time_call("set_info");
            core.accel.set_info(&pp, &info)?;
        }
        core.pp = pp;
        core.sequence = Some(info);
        self.shared.metrics.increment(Counter::SequenceChanges);
        info!(
            width = info.width,
            height = info.height,
            bit_depth = info.bit_depth,
            profile = info.profile,
            outputs = pp.enabled().count(),
            "sequence headers accepted"
        );
        Ok(())
    }

    /// Publishes every picture the core has ready, in the order it hands
    /// them out.
    fn publish_ready(&mut self) -> Result<()> {
        loop {
            let (next, pp) = {
                let mut core = self.shared.core.lock();
                let _timer = self.shared.metrics.time_call("next_picture");
                (core.accel.next_picture()?, core.pp)
            };
            let NextPicture::Ready(picture) = next else {
                return Ok(());
            };

            let timestamp = self
                .shared
                .state
                .lock()
                .timestamps
                .take(picture.decode_order_id);
            if timestamp.is_unknown() {
                self.shared.metrics.increment(Counter::TimestampMisses);
            }
            let decode_order_id = picture.decode_order_id;
            match self
                .output
                .publish(picture, &pp, timestamp, &self.shared.tracker)
            {
                Ok(id) => {
                    self.shared.metrics.increment(Counter::FramesPublished);
                    debug!(frame = %id, decode_order_id, pts = ?timestamp.pts, "frame published");
                }
                Err(picture) => {
                    let capacity = self.shared.tracker.capacity();
                    let _ = self.shared.core.lock().accel.picture_consumed(picture);
                    return Err(VpuError::ConsumeTableFull { capacity });
                }
            }
        }
    }

    /// Drains the core after the last packet and signals end of stream.
    fn finish_stream(&mut self) -> Result<()> {
        {
            let mut core = self.shared.core.lock();
            let _timer = self.shared.metrics.time_call("end_of_stream");
            core.accel.end_of_stream()?;
        }
        self.publish_ready()?;
        self.output.end_of_stream();
        info!(pictures = self.pictures, "stream drained");
        Ok(())
    }

    /// Drops packets queued after the picture limit.
    fn discard_queue(&self) {
        let mut state = self.shared.state.lock();
        state.eos_queued = true;
        let mut discarded = 0;
        while let Some(packet) = state.queue.pop_front() {
            let tag = match packet.slot {
                Some(slot) => state.ring.release_slot(slot),
                None => packet.tag,
            };
            state.released_tags.extend(tag);
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "queued packets dropped");
        }
    }

    fn fail(&self, err: VpuError) {
        error!(error = %err, "decode session failed");
        self.shared.latch_failure(&err);
        let mut core = self.shared.core.lock();
        if !core.released
            && let Err(eos_err) = core.accel.end_of_stream()
        {
            warn!(error = %eos_err, "end of stream after failure was rejected");
        }
        drop(core);
        self.output.failed(err);
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
