use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

/// Counters of one or more decode sessions sharing a collector.
#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub packets_queued: u64,
    pub bytes_queued: u64,
    pub would_block: u64,
    pub slot_reallocations: u64,
    pub pictures_decoded: u64,
    pub frames_published: u64,
    pub frames_returned: u64,
    pub frames_force_released: u64,
    pub dpb_stalls: u64,
    pub external_buffers_allocated: u64,
    pub external_buffers_freed: u64,
    pub timestamp_misses: u64,
    pub timestamps_evicted: u64,
    pub sequence_changes: u64,
    pub fatal_errors: u64,
    /// Accelerator entry points, keyed by call name.
    pub calls: BTreeMap<String, CallMetrics>,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct CallMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Which counter an event bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    PacketsQueued,
    BytesQueued,
    WouldBlock,
    SlotReallocations,
    PicturesDecoded,
    FramesPublished,
    FramesReturned,
    FramesForceReleased,
    DpbStalls,
    ExternalBuffersAllocated,
    ExternalBuffersFreed,
    TimestampMisses,
    TimestampsEvicted,
    SequenceChanges,
    FatalErrors,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        let mut guard = self.inner.lock();
        let slot = match counter {
            Counter::PacketsQueued => &mut guard.packets_queued,
            Counter::BytesQueued => &mut guard.bytes_queued,
            Counter::WouldBlock => &mut guard.would_block,
            Counter::SlotReallocations => &mut guard.slot_reallocations,
            Counter::PicturesDecoded => &mut guard.pictures_decoded,
            Counter::FramesPublished => &mut guard.frames_published,
            Counter::FramesReturned => &mut guard.frames_returned,
            Counter::FramesForceReleased => &mut guard.frames_force_released,
            Counter::DpbStalls => &mut guard.dpb_stalls,
            Counter::ExternalBuffersAllocated => &mut guard.external_buffers_allocated,
            Counter::ExternalBuffersFreed => &mut guard.external_buffers_freed,
            Counter::TimestampMisses => &mut guard.timestamp_misses,
            Counter::TimestampsEvicted => &mut guard.timestamps_evicted,
            Counter::SequenceChanges => &mut guard.sequence_changes,
            Counter::FatalErrors => &mut guard.fatal_errors,
        };
        *slot += value;
    }

    pub fn record_packet(&self, bytes: usize) {
        self.increment(Counter::PacketsQueued);
        self.add(Counter::BytesQueued, bytes as u64);
    }

    /// Times one accelerator call until the returned guard drops.
    pub fn time_call(&self, call: &'static str) -> CallTimer {
        CallTimer {
            call,
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = MetricsSnapshot::default();
    }
}

pub struct CallTimer {
    call: &'static str,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        let mut guard = self.collector.lock();
        let metrics = guard.calls.entry(self.call.to_string()).or_default();
        metrics.calls += 1;
        metrics.total_duration_ms += duration_ms;
        if duration_ms > metrics.max_duration_ms {
            metrics.max_duration_ms = duration_ms;
        }
        drop(guard);
        debug!(call = self.call, duration_ms, "accelerator call recorded");
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        packets = snapshot.packets_queued,
        bytes = snapshot.bytes_queued,
        pictures = snapshot.pictures_decoded,
        published = snapshot.frames_published,
        returned = snapshot.frames_returned,
        force_released = snapshot.frames_force_released,
        dpb_stalls = snapshot.dpb_stalls,
        "Decode metrics summary"
    );
    for (call, metrics) in &snapshot.calls {
        info!(
            call = call.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Accelerator call metrics"
        );
    }
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 15] {
        [
            (
                "packets_queued_total",
                "Packets accepted by put_packet",
                self.packets_queued,
            ),
            (
                "bytes_queued_total",
                "Bitstream bytes accepted",
                self.bytes_queued,
            ),
            (
                "would_block_total",
                "put_packet calls rejected with a full ring",
                self.would_block,
            ),
            (
                "slot_reallocations_total",
                "Stream slots grown for oversize packets",
                self.slot_reallocations,
            ),
            (
                "pictures_decoded_total",
                "Pictures reported by the decoder core",
                self.pictures_decoded,
            ),
            (
                "frames_published_total",
                "Frames handed to the consumer",
                self.frames_published,
            ),
            (
                "frames_returned_total",
                "Frames returned by the consumer",
                self.frames_returned,
            ),
            (
                "frames_force_released_total",
                "Frames released at close without a return",
                self.frames_force_released,
            ),
            (
                "dpb_stalls_total",
                "Times decoding blocked on a full picture pool",
                self.dpb_stalls,
            ),
            (
                "external_buffers_allocated_total",
                "Picture buffers lent to the core",
                self.external_buffers_allocated,
            ),
            (
                "external_buffers_freed_total",
                "Picture buffers reclaimed from the core",
                self.external_buffers_freed,
            ),
            (
                "timestamp_misses_total",
                "Frames published without a matching timestamp",
                self.timestamp_misses,
            ),
            (
                "timestamps_evicted_total",
                "Timestamp entries overwritten before use",
                self.timestamps_evicted,
            ),
            (
                "sequence_changes_total",
                "Sequence headers accepted",
                self.sequence_changes,
            ),
            (
                "fatal_errors_total",
                "Sessions failed with a fatal error",
                self.fatal_errors,
            ),
        ]
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, help, value) in self.counters() {
            output.push_str(&format!("# HELP vpu_{name} {help}\n"));
            output.push_str(&format!("# TYPE vpu_{name} counter\n"));
            output.push_str(&format!("vpu_{name} {value}\n"));
        }
        output.push_str("# HELP vpu_call_total Decoder core call count\n");
        output.push_str("# TYPE vpu_call_total counter\n");
        output.push_str(
            "# HELP vpu_call_duration_seconds_total Accumulated decoder core call duration\n",
        );
        output.push_str("# TYPE vpu_call_duration_seconds_total counter\n");
        output.push_str("# HELP vpu_call_duration_seconds_max Longest decoder core call\n");
        output.push_str("# TYPE vpu_call_duration_seconds_max gauge\n");
        for (call, metrics) in &self.calls {
            output.push_str(&format!(
                "vpu_call_total{{call=\"{}\"}} {}\n",
                call, metrics.calls
            ));
            output.push_str(&format!(
                "vpu_call_duration_seconds_total{{call=\"{}\"}} {:.6}\n",
                call,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "vpu_call_duration_seconds_max{{call=\"{}\"}} {:.6}\n",
                call,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}
