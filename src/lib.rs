pub mod accel;
pub mod config;
pub mod dma;
pub mod error;
pub mod observability;
pub mod session;
pub mod stream;
pub mod validation;

pub use accel::CodecFormat;
pub use config::SessionConfig;
pub use error::{Result, VpuError};
pub use session::{
    ControlCommand, ControlReply, DecodeSession, FrameId, FrameStatus, OutputFrame, Packet,
};
