pub mod pump;
pub mod source;

pub use pump::{FramePump, DEFAULT_FRAME_INTERVAL};
pub use source::{encode_jpeg, FrameSource, LatestFrameSlot, StillImageSource};
