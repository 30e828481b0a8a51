//! Device collaborator contract
//!
//! The card driver owns the hardware handles and the two callback threads. The
//! core only talks to it through the traits in this module:
//!
//! ```text
//! CaptureDevice ──InputCallback──▶ CaptureController ──▶ ConversionBackend
//! PlaybackScheduler ──▶ PlaybackDevice ──CompletionCallback──▶ PlaybackScheduler
//! ```
//!
//! Frames are reference counted by the driver. [`Retained`] is the owned handle
//! the core keeps while it needs a frame; dropping it gives the reference back.

pub mod mode;
pub mod sim;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use thiserror::Error;

pub use crate::capture::frame::PixelFormat;
pub use mode::DisplayMode;

/// Failure status returned by a device call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device returned status {0:#010x}")]
    Status(u32),

    #[error("frame is read-only")]
    ReadOnly,

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Generic failure status, as returned by most driver calls.
pub const E_FAIL: u32 = 0x8000_4005;

macro_rules! device_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            pub const DEFAULT: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn bits(self) -> u32 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

device_flags!(
    /// Per-frame flags reported by the driver.
    FrameFlags {
        FLIP_VERTICAL = 1 << 0,
        /// Captured while no signal was present on the input
        HAS_NO_INPUT_SOURCE = 1 << 31,
    }
);

device_flags!(
    /// Flags passed when enabling video input.
    InputFlags {
        ENABLE_FORMAT_DETECTION = 1 << 0,
        DUAL_STREAM_3D = 1 << 1,
    }
);

device_flags!(
    /// Flags qualifying a mode support query.
    SupportedModeFlags {
        DUAL_STREAM_3D = 1 << 0,
    }
);

device_flags!(
    /// Flags passed when enabling video output.
    OutputFlags {
        /// Output frames carry vertical ancillary data
        VANC = 1 << 0,
    }
);

device_flags!(
    /// What the format detector saw on the input.
    DetectedFormatFlags {
        YCBCR_422 = 1 << 0,
        RGB_444 = 1 << 1,
        DUAL_STREAM_3D = 1 << 2,
    }
);

device_flags!(
    /// Which aspects of the input format changed.
    FormatChangedEvents {
        FIELD_DOMINANCE_CHANGED = 1 << 0,
        DISPLAY_MODE_CHANGED = 1 << 1,
        COLORSPACE_CHANGED = 1 << 2,
    }
);

/// Capabilities of the attached card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAttributes {
    pub format_detection: bool,
    pub dual_stream_3d: bool,
}

/// Answer to a mode support query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSupport {
    pub supported: bool,
    /// Mode the card will actually run when asked for the requested one
    pub actual_mode: DisplayMode,
}

/// Geometry and timing of a display mode as the card reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayModeInfo {
    pub mode: DisplayMode,
    pub width: u32,
    pub height: u32,
    pub frame_duration: i64,
    pub time_scale: i64,
    pub supports_3d: bool,
}

impl DisplayModeInfo {
    /// Nominal info for a mode, as the card reports it for a 2D-only input.
    pub fn for_mode(mode: DisplayMode) -> Self {
        let (frame_duration, time_scale) = mode.frame_rate();
        Self {
            mode,
            width: mode.width(),
            height: mode.height(),
            frame_duration,
            time_scale,
            supports_3d: false,
        }
    }
}

/// Outcome reported with each completed scheduled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

/// Driver-side reference counting.
pub trait RefCounted: Send + Sync {
    /// Add a reference, returning the new count.
    fn add_ref(&self) -> u32;

    /// Drop a reference, returning the remaining count.
    fn release(&self) -> u32;
}

/// Read access to a frame's backing memory.
pub type BytesView<'a> = Box<dyn Deref<Target = [u8]> + 'a>;

/// Write access to a frame's backing memory.
pub type BytesViewMut<'a> = Box<dyn DerefMut<Target = [u8]> + 'a>;

/// A video frame owned by the driver.
pub trait VideoFrame: RefCounted {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn row_bytes(&self) -> u32;
    fn pixel_format(&self) -> PixelFormat;
    fn flags(&self) -> FrameFlags;
    fn bytes(&self) -> Result<BytesView<'_>, DeviceError>;

    fn bytes_mut(&self) -> Result<BytesViewMut<'_>, DeviceError> {
        Err(DeviceError::ReadOnly)
    }

    /// Store raw 10-bit ancillary words on a vertical blanking line.
    fn write_ancillary(&self, _line: u32, _words: &[u16]) -> Result<(), DeviceError> {
        Err(DeviceError::ReadOnly)
    }

    /// The right-eye frame of a dual-stream 3D capture.
    ///
    /// `None` when the frame has no 3D extension. The returned handle already
    /// holds a reference.
    fn right_eye(&self) -> Option<Result<Retained<dyn VideoFrame>, DeviceError>> {
        None
    }
}

/// An audio packet delivered alongside a captured frame.
pub trait AudioPacket: RefCounted {
    fn sample_frame_count(&self) -> u32;
}

/// Whether two handles point at the same driver frame.
pub fn same_frame(a: &Arc<dyn VideoFrame>, b: &Arc<dyn VideoFrame>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// An owned reference to a driver object.
///
/// Exactly one `release` happens per handle: either explicitly through
/// [`Retained::release`] or on drop. [`Retained::leak`] hands the reference over
/// to someone else without releasing it.
pub struct Retained<T: ?Sized + RefCounted> {
    inner: Arc<T>,
    consumed: bool,
}

impl<T: ?Sized + RefCounted> Retained<T> {
    /// Take a new reference on `object`.
    pub fn retain(object: &Arc<T>) -> Self {
        object.add_ref();
        Self {
            inner: Arc::clone(object),
            consumed: false,
        }
    }

    /// Take ownership of a reference the caller already holds.
    pub fn adopt(object: Arc<T>) -> Self {
        Self {
            inner: object,
            consumed: false,
        }
    }

    /// Release the reference now, returning the driver's remaining count.
    pub fn release(mut self) -> u32 {
        self.consumed = true;
        self.inner.release()
    }

    /// Give the reference away without releasing it.
    ///
    /// Whoever ends up with the pointer must [`Retained::adopt`] it again.
    pub fn leak(mut self) -> Arc<T> {
        self.consumed = true;
        Arc::clone(&self.inner)
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: ?Sized + RefCounted> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized + RefCounted> Drop for Retained<T> {
    fn drop(&mut self) {
        if !self.consumed {
            self.inner.release();
        }
    }
}

impl<T: ?Sized + RefCounted> fmt::Debug for Retained<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retained")
            .field("ptr", &(Arc::as_ptr(&self.inner) as *const ()))
            .finish()
    }
}

/// Narrow interface the capture side of the driver calls into.
///
/// Both methods run on a driver-owned thread and must return promptly.
pub trait InputCallback: Send + Sync {
    /// A frame arrived. `video` is borrowed; keep it with [`Retained::retain`].
    /// `audio` is handed over and released when dropped.
    fn video_input_frame_arrived(
        &self,
        video: Option<&Arc<dyn VideoFrame>>,
        audio: Option<Retained<dyn AudioPacket>>,
    );

    /// Format detection saw a new input format.
    fn video_input_format_changed(
        &self,
        events: FormatChangedEvents,
        mode: &DisplayModeInfo,
        flags: DetectedFormatFlags,
    );
}

/// Interface the playback side of the driver calls after each scheduled frame.
pub trait CompletionCallback: Send + Sync {
    /// `frame` is the pointer that was scheduled; the scheduler decides whether
    /// it owns a reference to give back.
    fn scheduled_frame_completed(&self, frame: Arc<dyn VideoFrame>, result: CompletionResult);

    fn scheduled_playback_has_stopped(&self) {}
}

/// Capture-side capabilities of a card.
pub trait CaptureDevice: Send + Sync {
    fn attributes(&self) -> Result<DeviceAttributes, DeviceError>;

    /// Treat two genlocked SDI inputs with matching modes as one 3D stream.
    fn set_input_3d_payload_override(&self, enabled: bool) -> Result<(), DeviceError>;
    fn input_3d_payload_override(&self) -> Result<bool, DeviceError>;

    fn query_input_mode(
        &self,
        mode: DisplayMode,
        pixel_format: PixelFormat,
        flags: SupportedModeFlags,
    ) -> Result<ModeSupport, DeviceError>;

    fn display_mode(&self, mode: DisplayMode) -> Result<DisplayModeInfo, DeviceError>;

    fn set_input_callback(
        &self,
        callback: Option<Arc<dyn InputCallback>>,
    ) -> Result<(), DeviceError>;

    fn disable_audio_input(&self) -> Result<(), DeviceError>;

    fn enable_video_input(
        &self,
        mode: DisplayMode,
        pixel_format: PixelFormat,
        flags: InputFlags,
    ) -> Result<(), DeviceError>;

    fn disable_video_input(&self) -> Result<(), DeviceError>;

    fn available_video_frame_count(&self) -> Result<u32, DeviceError>;

    fn start_streams(&self) -> Result<(), DeviceError>;
    fn stop_streams(&self) -> Result<(), DeviceError>;
    fn pause_streams(&self) -> Result<(), DeviceError>;
    fn flush_streams(&self) -> Result<(), DeviceError>;
}

/// Allocates frames in card memory.
pub trait FrameFactory: Send + Sync {
    /// The new frame comes back holding one reference.
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: u32,
        pixel_format: PixelFormat,
        flags: FrameFlags,
    ) -> Result<Retained<dyn VideoFrame>, DeviceError>;
}

/// Hardware colour conversion plus the allocator for its destination frames.
pub trait ConversionBackend: FrameFactory {
    fn convert_frame(&self, src: &dyn VideoFrame, dst: &dyn VideoFrame) -> Result<(), DeviceError>;
}

/// Playback-side capabilities of a card.
pub trait PlaybackDevice: FrameFactory {
    /// `Ok(None)` when the mode is not supported for output.
    fn query_output_mode(
        &self,
        mode: DisplayMode,
        flags: OutputFlags,
    ) -> Result<Option<DisplayModeInfo>, DeviceError>;

    fn enable_video_output(&self, mode: DisplayMode, flags: OutputFlags) -> Result<(), DeviceError>;
    fn disable_video_output(&self) -> Result<(), DeviceError>;

    fn set_completion_callback(
        &self,
        callback: Option<Arc<dyn CompletionCallback>>,
    ) -> Result<(), DeviceError>;

    /// Queue `frame` for display. The card keeps its own reference until the
    /// frame has been played out.
    fn schedule_video_frame(
        &self,
        frame: &Arc<dyn VideoFrame>,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> Result<(), DeviceError>;

    fn frame_completion_reference_timestamp(
        &self,
        frame: &dyn VideoFrame,
        time_scale: i64,
    ) -> Result<i64, DeviceError>;

    /// Current stream time and playback speed.
    fn scheduled_stream_time(&self, time_scale: i64) -> Result<(i64, f64), DeviceError>;

    fn start_scheduled_playback(
        &self,
        start_time: i64,
        time_scale: i64,
        speed: f64,
    ) -> Result<(), DeviceError>;

    /// Returns the actual stop time.
    fn stop_scheduled_playback(&self, stop_time: i64, time_scale: i64) -> Result<i64, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counted(AtomicU32);

    impl RefCounted for Counted {
        fn add_ref(&self) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn release(&self) -> u32 {
            self.0.fetch_sub(1, Ordering::SeqCst) - 1
        }
    }

    #[test]
    fn test_retain_and_drop_balance() {
        let object = Arc::new(Counted(AtomicU32::new(1)));
        {
            let handle = Retained::retain(&object);
            assert_eq!(handle.0.load(Ordering::SeqCst), 2);
        }
        assert_eq!(object.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_release_happens_once() {
        let object = Arc::new(Counted(AtomicU32::new(1)));
        let handle = Retained::retain(&object);
        assert_eq!(handle.release(), 1);
        assert_eq!(object.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_leak_then_adopt() {
        let object = Arc::new(Counted(AtomicU32::new(1)));
        let leaked = Retained::retain(&object).leak();
        assert_eq!(object.0.load(Ordering::SeqCst), 2);
        drop(Retained::adopt(leaked));
        assert_eq!(object.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flags() {
        let flags = InputFlags::DEFAULT | InputFlags::DUAL_STREAM_3D;
        assert!(flags.contains(InputFlags::DUAL_STREAM_3D));
        assert!(!flags.contains(InputFlags::ENABLE_FORMAT_DETECTION));
        assert!(FrameFlags::DEFAULT.contains(FrameFlags::DEFAULT));
    }
}
