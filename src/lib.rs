pub mod capture;
pub mod command;
pub mod control;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod playback;
pub mod utils;

use std::path::Path;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use capture::{CaptureController, FrameSet, Image};
pub use command::CommandBuffer;
pub use device::{DisplayMode, PixelFormat};
pub use error::{Error, Result};
pub use playback::PlaybackScheduler;

/// Environment variables override settings as `SDI_BRIDGE__INPUT__MODE=720p60`.
pub const ENV_PREFIX: &str = "SDI_BRIDGE";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputSettings,
    pub output: OutputSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub mode: DisplayMode,
    /// Follow the card's format detector
    pub auto_detect: bool,
    /// Capture two genlocked inputs as one 3D stream
    pub stereo: bool,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub mode: DisplayMode,
    /// Destination id for camera control packets
    pub camera: u8,
    /// Send the start-up configuration to the camera
    pub configure_camera: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Threads converting right-eye frames
    pub conversion_workers: usize,
    /// Threads assembling frame sets; a hung conversion holds up only one
    pub dispatch_workers: usize,
    /// Frame sets allowed to wait for dispatch before arrivals are dropped
    pub max_pending_sets: usize,
    pub pin_workers: bool,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Hd1080p2997,
            auto_detect: true,
            stereo: false,
            pixel_format: PixelFormat::Yuv10,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Hd1080p2997,
            camera: 1,
            configure_camera: true,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            conversion_workers: 1,
            dispatch_workers: 2,
            max_pending_sets: 4,
            pin_workers: false,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `SDI_BRIDGE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.input.mode, DisplayMode::Hd1080p2997);
        assert!(config.input.auto_detect);
        assert!(!config.input.stereo);
        assert_eq!(config.input.pixel_format, PixelFormat::Yuv10);
        assert_eq!(config.output.camera, 1);
        assert_eq!(config.pipeline.conversion_workers, 1);
        assert_eq!(config.pipeline.dispatch_workers, 2);
        assert_eq!(config.pipeline.max_pending_sets, 4);
    }

    #[test]
    fn test_toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            [input]
            mode = "720p60"
            stereo = true

            [pipeline]
            conversion_workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.input.mode, DisplayMode::Hd720p60);
        assert!(config.input.stereo);
        assert!(config.input.auto_detect);
        assert_eq!(config.pipeline.conversion_workers, 2);
        assert_eq!(config.output, OutputSettings::default());
    }

    #[test]
    fn test_bad_mode_is_rejected() {
        let err = Config::from_toml_str("[input]\nmode = \"1080p99\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
