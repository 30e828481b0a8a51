pub mod controller;
pub mod convert;
pub mod frame;

pub use controller::{CaptureConfig, CaptureController, CaptureState, CaptureStats};
pub use convert::convert_frame;
pub use frame::{FrameSet, Image, PixelFormat};
