//! Decode sessions.
//!
//! A [`DecodeSession`] owns one decoder core and runs it on a background
//! thread. The caller feeds compressed packets with [`DecodeSession::put_packet`],
//! pulls frames with [`DecodeSession::get_frame`] and hands every frame back
//! through [`ControlCommand::ReturnFrame`] once it is done with the picture
//! memory. All methods take `&self`, so producer and consumer may live on
//! different threads.

pub mod drive;
pub mod negotiator;
pub mod output;
pub mod ring;
pub mod timestamps;
pub mod tracker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::accel::{self, Accelerator, PpConfig, SequenceInfo};
use crate::config::SessionConfig;
use crate::dma::{DmaAllocator, HeapAllocator};
use crate::error::{Result, VpuError};
use crate::observability::{Counter, MetricsCollector, MetricsSnapshot};
use crate::validation::validate_config;

use drive::{DriveEvent, DriveLoop};
use negotiator::ExternalBufferNegotiator;
use output::{FrameEvent, FrameOutputPool};
use ring::BufferSlotRing;
use timestamps::{PacketTimestamp, TimestampTable};
use tracker::{DpbSignal, PictureConsumeTracker};

pub use output::OutputFrame;
pub use tracker::FrameId;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A compressed packet. An empty `data` slice marks end of stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packet<'a> {
    pub data: &'a [u8],
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Opaque caller handle, reported back once the packet's slot is free.
    pub tag: Option<u64>,
}

impl<'a> Packet<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn end_of_stream() -> Self {
        Self::default()
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }
}

/// Result of [`DecodeSession::get_frame`].
#[derive(Debug)]
pub enum FrameStatus {
    Frame(OutputFrame),
    /// Nothing ready yet.
    Pending,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ReturnFrame(FrameId),
    /// Tags of packets whose slots were freed since the last query.
    ReleasedPackets,
    QueryBufferCounts,
    QuerySequence,
    QueryMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Done,
    ReleasedPackets(Vec<u64>),
    BufferCounts(BufferCounts),
    Sequence(Option<SequenceInfo>),
    Metrics(MetricsSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferCounts {
    pub stream_slots: usize,
    pub stream_slots_in_use: usize,
    pub queued_packets: usize,
    pub external_buffers: usize,
    pub outstanding_frames: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedPacket {
    /// `None` for the end of stream marker.
    slot: Option<usize>,
    size: usize,
    decode_order_id: u64,
    tag: Option<u64>,
}

pub(crate) struct StreamState {
    ring: BufferSlotRing,
    queue: VecDeque<QueuedPacket>,
    timestamps: TimestampTable,
    next_decode_order_id: u64,
    eos_queued: bool,
    failure: Option<VpuError>,
    finishing: bool,
    released_tags: VecDeque<u64>,
}

pub(crate) struct CoreState {
    accel: Box<dyn Accelerator>,
    negotiator: ExternalBufferNegotiator,
    pp: PpConfig,
    sequence: Option<SequenceInfo>,
    released: bool,
}

pub(crate) struct SessionShared {
    config: SessionConfig,
    state: Mutex<StreamState>,
    core: Mutex<CoreState>,
    tracker: PictureConsumeTracker,
    dpb: DpbSignal,
    allocator: Arc<dyn DmaAllocator>,
    metrics: MetricsCollector,
}

impl SessionShared {
    /// Records the first fatal error; later ones are dropped.
    fn latch_failure(&self, err: &VpuError) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(err.clone());
            self.metrics.increment(Counter::FatalErrors);
        }
    }
}

pub struct DecodeSession {
    id: u64,
    shared: Arc<SessionShared>,
    events: Sender<DriveEvent>,
    frames: Receiver<FrameEvent>,
    drive: Mutex<Option<JoinHandle<()>>>,
    end_of_stream: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("id", &self.id)
            .field("format", &self.shared.config.format)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl DecodeSession {
    /// Opens a session on the built-in core for `config.format`, backed by
    /// host memory.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let accel = accel::open(config.format, &config.core_config())?;
        Self::open_with(
            config,
            accel,
            Arc::new(HeapAllocator::new()),
            MetricsCollector::new(),
        )
    }

    pub fn open_with(
        config: SessionConfig,
        accel: Box<dyn Accelerator>,
        allocator: Arc<dyn DmaAllocator>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let report = validate_config(&config);
        if !report.is_ok() {
            return Err(VpuError::Config(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            warn!(warning = warning.as_str(), "session config warning");
        }
        if accel.format() != config.format {
            return Err(VpuError::Config(format!(
                "decoder core handles {}, session configured for {}",
                accel.format(),
                config.format
            )));
        }

        let ring = BufferSlotRing::new(
            config.stream_buffers,
            config.stream_buffer_size,
            allocator.as_ref(),
        )?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (frames_tx, frames_rx) = crossbeam_channel::bounded(config.max_outstanding_frames + 2);

        let shared = Arc::new(SessionShared {
            state: Mutex::new(StreamState {
                ring,
                queue: VecDeque::with_capacity(config.stream_buffers + 1),
                timestamps: TimestampTable::new(config.timestamp_depth),
                next_decode_order_id: 0,
                eos_queued: false,
                failure: None,
                finishing: false,
                released_tags: VecDeque::new(),
            }),
            core: Mutex::new(CoreState {
                accel,
                negotiator: ExternalBufferNegotiator::new(config.buffer_margin()),
                pp: PpConfig::default(),
                sequence: None,
                released: false,
            }),
            tracker: PictureConsumeTracker::new(config.max_outstanding_frames),
            dpb: DpbSignal::new(events_tx.clone()),
            allocator,
            metrics,
            config,
        });

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let drive = DriveLoop::new(shared.clone(), events_rx, FrameOutputPool::new(frames_tx));
        let handle = match drive.spawn(id) {
            Ok(handle) => handle,
            Err(err) => {
                let mut state = shared.state.lock();
                state.ring.free_all(shared.allocator.as_ref());
                shared.core.lock().accel.release();
                return Err(VpuError::SystemError(format!(
                    "failed to spawn drive thread: {err}"
                )));
            }
        };

        info!(
            session = id,
            format = %shared.config.format,
            stream_buffers = shared.config.stream_buffers,
            outputs = shared.config.outputs.len(),
            "decode session opened"
        );
        Ok(Self {
            id,
            shared,
            events: events_tx,
            frames: frames_rx,
            drive: Mutex::new(Some(handle)),
            end_of_stream: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.shared.metrics.clone()
    }

    /// Queues one packet without blocking. Returns the number of bytes
    /// accepted; an empty packet queues end of stream and returns 0.
    pub fn put_packet(&self, packet: Packet<'_>) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.finishing {
            return Err(VpuError::InvalidState("session is closed".into()));
        }
        if state.eos_queued {
            return Err(VpuError::InvalidState(
                "end of stream already queued".into(),
            ));
        }

        let decode_order_id = state.next_decode_order_id;
        if packet.data.is_empty() {
            state.eos_queued = true;
            state.queue.push_back(QueuedPacket {
                slot: None,
                size: 0,
                decode_order_id,
                tag: packet.tag,
            });
            drop(state);
            debug!(decode_order_id, "end of stream queued");
            let _ = self.events.send(DriveEvent::PacketQueued);
            return Ok(0);
        }

        let slot = match state.ring.claim_slot() {
            Ok(slot) => slot,
            Err(err) => {
                shared.metrics.increment(Counter::WouldBlock);
                return Err(err);
            }
        };
        match state
            .ring
            .ensure_capacity(slot, packet.data.len(), shared.allocator.as_ref())
        {
            Ok(true) => shared.metrics.increment(Counter::SlotReallocations),
            Ok(false) => {}
            Err(err) => {
                drop(state);
                error!(error = %err, size = packet.data.len(), "no memory for stream buffer");
                shared.latch_failure(&err);
                let _ = self.events.send(DriveEvent::PacketQueued);
                return Err(err);
            }
        }
        state.ring.mark_occupied(slot, packet.data, packet.tag)?;

        let timestamp = PacketTimestamp {
            pts: packet.pts,
            dts: packet.dts,
        };
        if let Some(evicted) = state.timestamps.insert(decode_order_id, timestamp) {
            warn!(evicted, "timestamp table full, oldest entry evicted");
            shared.metrics.increment(Counter::TimestampsEvicted);
        }
        state.next_decode_order_id += 1;
        state.queue.push_back(QueuedPacket {
            slot: Some(slot),
            size: packet.data.len(),
            decode_order_id,
            tag: packet.tag,
        });
        drop(state);

        shared.metrics.record_packet(packet.data.len());
        debug!(slot, decode_order_id, size = packet.data.len(), "packet queued");
        let _ = self.events.send(DriveEvent::PacketQueued);
        Ok(packet.data.len())
    }

    /// Takes the next published frame without blocking.
    pub fn get_frame(&self) -> Result<FrameStatus> {
        self.check_readable()?;
        let event = match self.frames.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.drive_thread_lost()),
        };
        self.frame_status(event)
    }

    /// Like [`get_frame`](Self::get_frame) but waits up to `timeout`.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Result<FrameStatus> {
        self.check_readable()?;
        let event = match self.frames.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.drive_thread_lost()),
        };
        self.frame_status(event)
    }

    /// The frame channel closed without an end-of-stream marker.
    fn drive_thread_lost(&self) -> FrameEvent {
        if self.end_of_stream.load(Ordering::SeqCst) {
            return FrameEvent::EndOfStream;
        }
        let err = VpuError::SystemError("decode thread exited without ending the stream".into());
        self.shared.latch_failure(&err);
        let latched = self.shared.state.lock().failure.clone();
        FrameEvent::Failed(latched.unwrap_or(err))
    }

    fn check_readable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VpuError::InvalidState("session is closed".into()));
        }
        if let Some(err) = self.shared.state.lock().failure.clone() {
            return Err(err);
        }
        Ok(())
    }

    fn frame_status(&self, event: Option<FrameEvent>) -> Result<FrameStatus> {
        if self.end_of_stream.load(Ordering::SeqCst) {
            return Ok(FrameStatus::EndOfStream);
        }
        match event {
            Some(FrameEvent::Frame(frame)) => Ok(FrameStatus::Frame(frame)),
            Some(FrameEvent::EndOfStream) => {
                self.end_of_stream.store(true, Ordering::SeqCst);
                Ok(FrameStatus::EndOfStream)
            }
            Some(FrameEvent::Failed(err)) => Err(err),
            None => match self.shared.state.lock().failure.clone() {
                Some(err) => Err(err),
                None => Ok(FrameStatus::Pending),
            },
        }
    }

    pub fn control(&self, command: ControlCommand) -> Result<ControlReply> {
        match command {
            ControlCommand::ReturnFrame(id) => {
                self.return_frame(id)?;
                Ok(ControlReply::Done)
            }
            ControlCommand::ReleasedPackets => {
                let mut state = self.shared.state.lock();
                Ok(ControlReply::ReleasedPackets(
                    state.released_tags.drain(..).collect(),
                ))
            }
            ControlCommand::QueryBufferCounts => {
                Ok(ControlReply::BufferCounts(self.buffer_counts()))
            }
            ControlCommand::QuerySequence => {
                Ok(ControlReply::Sequence(self.shared.core.lock().sequence))
            }
            ControlCommand::QueryMetrics => {
                Ok(ControlReply::Metrics(self.shared.metrics.snapshot()))
            }
        }
    }

    /// Hands a frame's picture back to the core.
    pub fn return_frame(&self, id: FrameId) -> Result<()> {
        let shared = &self.shared;
        let picture = shared.tracker.take(id).ok_or(VpuError::UnknownFrame(id.0))?;
        {
            let mut core = shared.core.lock();
            if core.released {
                return Ok(());
            }
            let _timer = shared.metrics.time_call("picture_consumed");
            core.accel.picture_consumed(picture)?;
        }
        shared.metrics.increment(Counter::FramesReturned);
        if shared.dpb.notify_released() {
            debug!(frame = %id, "drive loop woken after picture release");
        }
        Ok(())
    }

    pub fn buffer_counts(&self) -> BufferCounts {
        let (stream_slots, stream_slots_in_use, queued_packets) = {
            let state = self.shared.state.lock();
            (state.ring.len(), state.ring.occupied_count(), state.queue.len())
        };
        BufferCounts {
            stream_slots,
            stream_slots_in_use,
            queued_packets,
            external_buffers: self.shared.core.lock().negotiator.live_count(),
            outstanding_frames: self.shared.tracker.outstanding(),
        }
    }

    /// Stops the drive thread, releases every outstanding picture and frees
    /// all buffers. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.shared;
        shared.state.lock().finishing = true;
        let _ = self.events.send(DriveEvent::Shutdown);
        if let Some(handle) = self.drive.lock().take()
            && handle.join().is_err()
        {
            error!(session = self.id, "drive thread panicked");
        }

        let mut core = shared.core.lock();
        let mut forced = 0u64;
        for (id, picture) in shared.tracker.drain_all() {
            warn!(
                frame = %id,
                decode_order_id = picture.decode_order_id,
                "picture never consumed, releasing at close"
            );
            if let Err(err) = core.accel.picture_consumed(picture) {
                warn!(frame = %id, error = %err, "forced release rejected by core");
            }
            forced += 1;
        }
        shared.metrics.add(Counter::FramesForceReleased, forced);
        core.accel.release();
        core.released = true;
        core.negotiator.free_all(shared.allocator.as_ref());
        drop(core);

        let mut state = shared.state.lock();
        state.ring.free_all(shared.allocator.as_ref());
        state.queue.clear();
        drop(state);
        while self.frames.try_recv().is_ok() {}
        info!(session = self.id, forced, "decode session closed");
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.close();
    }
}
