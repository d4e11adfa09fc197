use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::accel::{CodecFormat, CoreConfig, CropRect, ModelParams};

pub const DEFAULT_STREAM_BUFFERS: usize = 8;
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 1 << 20;
pub const DEFAULT_TIMESTAMP_DEPTH: usize = 32;
pub const DEFAULT_MAX_OUTSTANDING_FRAMES: usize = 64;

/// Everything a decode session is opened with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub format: CodecFormat,
    /// Depth of the input bitstream ring.
    #[serde(default = "default_stream_buffers")]
    pub stream_buffers: usize,
    /// Initial capacity of every ring slot, in bytes.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    #[serde(default = "default_timestamp_depth")]
    pub timestamp_depth: usize,
    /// Frames the consumer may hold before the session reports a stall.
    #[serde(default = "default_max_outstanding_frames")]
    pub max_outstanding_frames: usize,
    /// Pictures the consumer pipeline keeps in flight; widens the buffer margin.
    #[serde(default)]
    pub max_frames_delay: usize,
    /// Stop decoding after this many pictures.
    #[serde(default)]
    pub picture_limit: Option<u64>,
    /// Running on a multi-core decoder; advanced tooling streams are fatal there.
    #[serde(default)]
    pub multi_core: bool,
    #[serde(default)]
    pub buffer_margin: BufferMarginPolicy,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub model: ModelParams,
}

fn default_stream_buffers() -> usize {
    DEFAULT_STREAM_BUFFERS
}

fn default_stream_buffer_size() -> usize {
    DEFAULT_STREAM_BUFFER_SIZE
}

fn default_timestamp_depth() -> usize {
    DEFAULT_TIMESTAMP_DEPTH
}

fn default_max_outstanding_frames() -> usize {
    DEFAULT_MAX_OUTSTANDING_FRAMES
}

fn default_outputs() -> Vec<OutputSpec> {
    vec![OutputSpec::default()]
}

impl SessionConfig {
    pub fn new(format: CodecFormat) -> Self {
        Self {
            format,
            stream_buffers: DEFAULT_STREAM_BUFFERS,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            timestamp_depth: DEFAULT_TIMESTAMP_DEPTH,
            max_outstanding_frames: DEFAULT_MAX_OUTSTANDING_FRAMES,
            max_frames_delay: 0,
            picture_limit: None,
            multi_core: false,
            buffer_margin: BufferMarginPolicy::default(),
            outputs: default_outputs(),
            model: ModelParams::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session config: {}", path.display()))?;
        let config: SessionConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse session config YAML: {}", path.display()))?;
        Ok(config)
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            model: self.model.clone(),
        }
    }

    /// External buffers requested on top of what the core asks for.
    pub fn buffer_margin(&self) -> usize {
        self.buffer_margin.margin(self.format, self.max_frames_delay)
    }
}

/// How many spare picture buffers to hand the core beyond its own request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferMarginPolicy {
    /// Replaces the per-format constant when set.
    pub extra: Option<usize>,
    pub include_frames_delay: bool,
}

impl Default for BufferMarginPolicy {
    fn default() -> Self {
        Self {
            extra: None,
            include_frames_delay: true,
        }
    }
}

impl BufferMarginPolicy {
    pub fn margin(&self, format: CodecFormat, max_frames_delay: usize) -> usize {
        let base = self.extra.unwrap_or_else(|| format.default_buffer_margin());
        if self.include_frames_delay {
            base + max_frames_delay
        } else {
            base
        }
    }
}

/// One post-processing output as requested by the caller. Unset geometry
/// falls back to the stream's own picture size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    pub enabled: bool,
    pub crop: Option<CropRect>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub compressed: bool,
    pub bit_depth: Option<u8>,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            crop: None,
            width: None,
            height: None,
            compressed: false,
            bit_depth: None,
        }
    }
}

impl OutputSpec {
    pub fn scaled(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }
}
