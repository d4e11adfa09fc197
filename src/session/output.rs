//! Frame publication towards the consumer.

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::debug;

use super::timestamps::PacketTimestamp;
use super::tracker::{FrameId, PictureConsumeTracker};
use crate::accel::{
    CropRect, DecodedPicture, MAX_PP_OUTPUTS, PictureOutput, PpConfig, PpUnit, SequenceInfo,
};
use crate::config::OutputSpec;
use crate::error::VpuError;

/// A decoded frame as seen by the consumer. The picture memory it describes
/// stays lent out until the frame id is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFrame {
    pub id: FrameId,
    pub decode_order_id: u64,
    pub picture_id: u32,
    pub keyframe: bool,
    pub timestamp: PacketTimestamp,
    /// Indexed by post-processing unit.
    pub outputs: [Option<PictureOutput>; MAX_PP_OUTPUTS],
}

impl OutputFrame {
    pub fn enabled_outputs(&self) -> impl Iterator<Item = (usize, &PictureOutput)> {
        self.outputs
            .iter()
            .enumerate()
            .filter_map(|(index, output)| output.as_ref().map(|output| (index, output)))
    }
}

#[derive(Debug)]
pub enum FrameEvent {
    Frame(OutputFrame),
    EndOfStream,
    Failed(VpuError),
}

/// Resolves the caller's output requests against the stream geometry.
pub fn derive_pp_config(outputs: &[OutputSpec], info: &SequenceInfo) -> PpConfig {
    let mut pp = PpConfig::default();
    for (index, spec) in outputs.iter().take(MAX_PP_OUTPUTS).enumerate() {
        if !spec.enabled {
            continue;
        }
        let crop = spec.crop.unwrap_or(CropRect {
            x: 0,
            y: 0,
            width: info.width,
            height: info.height,
        });
        pp.units[index] = PpUnit {
            enabled: true,
            crop,
            width: spec.width.unwrap_or(crop.width),
            height: spec.height.unwrap_or(crop.height),
            compressed: spec.compressed,
            bit_depth: spec.bit_depth.unwrap_or(info.bit_depth),
        };
    }
    pp
}

/// Sending half of the frame FIFO.
#[derive(Debug)]
pub struct FrameOutputPool {
    frames: Sender<FrameEvent>,
    next_id: u64,
}

impl FrameOutputPool {
    pub fn new(frames: Sender<FrameEvent>) -> Self {
        Self { frames, next_id: 0 }
    }

    /// Tracks `picture` and queues its descriptor. The picture is handed back
    /// when it cannot be tracked or queued.
    pub fn publish(
        &mut self,
        picture: DecodedPicture,
        pp: &PpConfig,
        timestamp: PacketTimestamp,
        tracker: &PictureConsumeTracker,
    ) -> Result<FrameId, DecodedPicture> {
        let id = FrameId(self.next_id);
        let mut outputs = [None; MAX_PP_OUTPUTS];
        for (index, output) in picture.outputs.iter().enumerate() {
            if pp.units[index].enabled {
                outputs[index] = *output;
            }
        }
        let frame = OutputFrame {
            id,
            decode_order_id: picture.decode_order_id,
            picture_id: picture.pic_id,
            keyframe: picture.keyframe,
            timestamp,
            outputs,
        };

        if self.frames.is_full() {
            return Err(picture);
        }
        tracker.track(id, picture)?;
        if self.frames.try_send(FrameEvent::Frame(frame)).is_err() {
            // Receiver gone; the close sweep releases the tracked picture.
            debug!(frame = %id, "frame queue disconnected");
        }
        self.next_id += 1;
        Ok(id)
    }

    pub fn end_of_stream(&self) {
        let _ = self.frames.try_send(FrameEvent::EndOfStream);
    }

    pub fn failed(&self, err: VpuError) {
        let _ = self.frames.try_send(FrameEvent::Failed(err));
    }
}
