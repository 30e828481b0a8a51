pub mod ancillary;
pub mod frames;
pub mod scheduler;

pub use scheduler::{PlaybackConfig, PlaybackScheduler, PlaybackState};
