use tracing::info;

use crate::device::DisplayMode;
use crate::error::Result;

/// Mode name that asks the card to find the input format itself.
pub const DETECT: &str = "detect";

/// Mode the input starts in while waiting for format detection.
pub const DETECT_START_MODE: DisplayMode = DisplayMode::Hd1080p30;

/// Turn a mode name from the command line into a start mode.
///
/// Returns the mode and whether format detection must be forced on.
pub fn resolve_startup_mode(name: &str) -> Result<(DisplayMode, bool)> {
    if name.trim().eq_ignore_ascii_case(DETECT) {
        info!(
            "Format detection requested, starting in {}",
            DETECT_START_MODE
        );
        return Ok((DETECT_START_MODE, true));
    }

    Ok((name.parse()?, false))
}

/// Human readable frame rate, e.g. "29.97".
pub fn frame_rate_label(mode: DisplayMode) -> String {
    let (duration, scale) = mode.frame_rate();
    let rate = scale as f64 / duration as f64;
    if mode.is_fractional() {
        format!("{:.2}", rate)
    } else {
        format!("{:.0}", rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_detect_forces_auto() {
        assert_eq!(
            resolve_startup_mode("detect").unwrap(),
            (DisplayMode::Hd1080p30, true)
        );
        assert_eq!(
            resolve_startup_mode("720p50").unwrap(),
            (DisplayMode::Hd720p50, false)
        );
    }

    #[test]
    fn test_unknown_mode() {
        assert!(matches!(
            resolve_startup_mode("1080p99"),
            Err(Error::InvalidMode(_))
        ));
    }

    #[test]
    fn test_frame_rate_label() {
        assert_eq!(frame_rate_label(DisplayMode::Hd1080p2997), "29.97");
        assert_eq!(frame_rate_label(DisplayMode::Hd720p50), "50");
    }
}
