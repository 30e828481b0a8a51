//! In-process simulated card
//!
//! Implements every device trait against plain memory so the capture and playback
//! paths can run without hardware. Callers play the driver's role: they emit
//! arrivals, format changes and completions from whatever thread they like.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use super::{
    AudioPacket, BytesView, BytesViewMut, CaptureDevice, CompletionCallback, CompletionResult,
    ConversionBackend, DetectedFormatFlags, DeviceAttributes, DeviceError, DisplayMode,
    DisplayModeInfo, FormatChangedEvents, FrameFactory, FrameFlags, InputCallback, InputFlags,
    ModeSupport, OutputFlags, PixelFormat, PlaybackDevice, RefCounted, Retained,
    SupportedModeFlags, VideoFrame, E_FAIL,
};

/// A frame living in simulated card memory.
pub struct SimFrame {
    width: u32,
    height: u32,
    row_bytes: u32,
    pixel_format: PixelFormat,
    flags: FrameFlags,
    data: RwLock<Vec<u8>>,
    ancillary: Mutex<HashMap<u32, Vec<u16>>>,
    right_eye: Option<RightEye>,
    refs: AtomicU32,
    over_released: AtomicBool,
    live: Option<Arc<AtomicUsize>>,
}

enum RightEye {
    Frame(Arc<SimFrame>),
    Broken,
}

/// Builder for [`SimFrame`].
pub struct SimFrameBuilder {
    width: u32,
    height: u32,
    row_bytes: Option<u32>,
    pixel_format: PixelFormat,
    flags: FrameFlags,
    fill: u8,
    right_eye: Option<RightEye>,
}

impl SimFrameBuilder {
    pub fn row_bytes(mut self, row_bytes: u32) -> Self {
        self.row_bytes = Some(row_bytes);
        self
    }

    pub fn flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn fill(mut self, value: u8) -> Self {
        self.fill = value;
        self
    }

    pub fn right_eye(mut self, frame: Arc<SimFrame>) -> Self {
        self.right_eye = Some(RightEye::Frame(frame));
        self
    }

    /// The 3D extension exists but fetching the right eye fails.
    pub fn broken_right_eye(mut self) -> Self {
        self.right_eye = Some(RightEye::Broken);
        self
    }

    pub fn build(self) -> Arc<SimFrame> {
        Arc::new(self.build_inner(None))
    }

    fn build_inner(self, live: Option<Arc<AtomicUsize>>) -> SimFrame {
        let row_bytes = self
            .row_bytes
            .unwrap_or_else(|| self.pixel_format.row_bytes(self.width));
        let len = row_bytes as usize * self.height as usize;

        SimFrame {
            width: self.width,
            height: self.height,
            row_bytes,
            pixel_format: self.pixel_format,
            flags: self.flags,
            data: RwLock::new(vec![self.fill; len]),
            ancillary: Mutex::new(HashMap::new()),
            right_eye: self.right_eye,
            // The driver's own reference
            refs: AtomicU32::new(1),
            over_released: AtomicBool::new(false),
            live,
        }
    }
}

impl SimFrame {
    pub fn builder(width: u32, height: u32, pixel_format: PixelFormat) -> SimFrameBuilder {
        SimFrameBuilder {
            width,
            height,
            row_bytes: None,
            pixel_format,
            flags: FrameFlags::DEFAULT,
            fill: 0,
            right_eye: None,
        }
    }

    pub fn filled(width: u32, height: u32, pixel_format: PixelFormat, value: u8) -> Arc<Self> {
        Self::builder(width, height, pixel_format).fill(value).build()
    }

    pub fn with_stride(
        width: u32,
        height: u32,
        row_bytes: u32,
        pixel_format: PixelFormat,
        value: u8,
    ) -> Arc<Self> {
        Self::builder(width, height, pixel_format)
            .row_bytes(row_bytes)
            .fill(value)
            .build()
    }

    /// A frame captured while the input had no signal.
    pub fn no_signal(width: u32, height: u32, pixel_format: PixelFormat) -> Arc<Self> {
        Self::builder(width, height, pixel_format)
            .flags(FrameFlags::HAS_NO_INPUT_SOURCE)
            .build()
    }

    /// A left-eye frame carrying `right` as its 3D extension.
    pub fn stereo_pair(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        left_fill: u8,
        right_fill: u8,
    ) -> (Arc<Self>, Arc<Self>) {
        let right = Self::filled(width, height, pixel_format, right_fill);
        let left = Self::builder(width, height, pixel_format)
            .fill(left_fill)
            .right_eye(Arc::clone(&right))
            .build();
        (left, right)
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Whether anyone released more references than they held.
    pub fn over_released(&self) -> bool {
        self.over_released.load(Ordering::SeqCst)
    }

    pub fn ancillary(&self, line: u32) -> Option<Vec<u16>> {
        self.ancillary.lock().get(&line).cloned()
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl RefCounted for SimFrame {
    fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> u32 {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| refs.checked_sub(1));

        match previous {
            Ok(1) => {
                if let Some(live) = &self.live {
                    live.fetch_sub(1, Ordering::SeqCst);
                }
                0
            }
            Ok(refs) => refs - 1,
            Err(_) => {
                error!("Frame released with no references left");
                self.over_released.store(true, Ordering::SeqCst);
                0
            }
        }
    }
}

impl VideoFrame for SimFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_bytes(&self) -> u32 {
        self.row_bytes
    }

    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn flags(&self) -> FrameFlags {
        self.flags
    }

    fn bytes(&self) -> Result<BytesView<'_>, DeviceError> {
        Ok(Box::new(RwLockReadGuard::map(self.data.read(), |data| {
            data.as_slice()
        })))
    }

    fn bytes_mut(&self) -> Result<BytesViewMut<'_>, DeviceError> {
        Ok(Box::new(RwLockWriteGuard::map(self.data.write(), |data| {
            data.as_mut_slice()
        })))
    }

    fn write_ancillary(&self, line: u32, words: &[u16]) -> Result<(), DeviceError> {
        if line == 0 || line > 45 {
            return Err(DeviceError::Status(E_FAIL));
        }
        self.ancillary.lock().insert(line, words.to_vec());
        Ok(())
    }

    fn right_eye(&self) -> Option<Result<Retained<dyn VideoFrame>, DeviceError>> {
        match self.right_eye.as_ref()? {
            RightEye::Frame(frame) => {
                let frame: Arc<dyn VideoFrame> = frame.clone();
                Some(Ok(Retained::retain(&frame)))
            }
            RightEye::Broken => Some(Err(DeviceError::Status(E_FAIL))),
        }
    }
}

/// Audio delivered with a simulated arrival.
pub struct SimAudioPacket {
    samples: u32,
    refs: AtomicU32,
}

impl SimAudioPacket {
    pub fn new(samples: u32) -> Arc<Self> {
        Arc::new(Self {
            samples,
            refs: AtomicU32::new(1),
        })
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl RefCounted for SimAudioPacket {
    fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}

impl AudioPacket for SimAudioPacket {
    fn sample_frame_count(&self) -> u32 {
        self.samples
    }
}

/// One `schedule_video_frame` call as the card saw it.
#[derive(Clone)]
pub struct ScheduledRecord {
    pub frame: Arc<dyn VideoFrame>,
    pub display_time: i64,
    pub duration: i64,
    pub time_scale: i64,
    /// Ancillary words on the camera-control line, if the frame carried any
    pub ancillary: Option<Vec<u16>>,
}

struct Pending {
    frame: Arc<dyn VideoFrame>,
    display_time: i64,
    duration: i64,
}

struct SimState {
    attributes: DeviceAttributes,
    input_modes: Option<Vec<DisplayMode>>,
    output_modes: Option<Vec<DisplayMode>>,
    failing: HashSet<&'static str>,
    fail_conversions: bool,
    payload_override: bool,
    input: Option<(DisplayMode, PixelFormat, InputFlags)>,
    input_streaming: bool,
    output: Option<(DisplayMode, OutputFlags)>,
    playback_running: bool,
    pending: VecDeque<Pending>,
    history: Vec<ScheduledRecord>,
    stream_time: i64,
    calls: Vec<&'static str>,
}

/// Simulated card with one input and one output.
pub struct SimDevice {
    state: Mutex<SimState>,
    input_callback: RwLock<Option<Arc<dyn InputCallback>>>,
    completion_callback: RwLock<Option<Arc<dyn CompletionCallback>>>,
    allocated: Mutex<Vec<Weak<SimFrame>>>,
    conversions: AtomicUsize,
    live: Arc<AtomicUsize>,
}

/// Entries kept in the call log and the schedule history.
const HISTORY_LIMIT: usize = 4096;

fn push_bounded<T>(log: &mut Vec<T>, entry: T) {
    if log.len() >= HISTORY_LIMIT {
        log.drain(..HISTORY_LIMIT / 2);
    }
    log.push(entry);
}

/// Scan line the sim reports ancillary data from.
const RECORDED_ANC_LINE: u32 = crate::playback::ancillary::CAMERA_CONTROL_LINE;

impl SimDevice {
    /// A card that supports every mode, format detection and dual-stream 3D.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                attributes: DeviceAttributes {
                    format_detection: true,
                    dual_stream_3d: true,
                },
                input_modes: None,
                output_modes: None,
                failing: HashSet::new(),
                fail_conversions: false,
                payload_override: false,
                input: None,
                input_streaming: false,
                output: None,
                playback_running: false,
                pending: VecDeque::new(),
                history: Vec::new(),
                stream_time: 0,
                calls: Vec::new(),
            }),
            input_callback: RwLock::new(None),
            completion_callback: RwLock::new(None),
            allocated: Mutex::new(Vec::new()),
            conversions: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_attributes(&self, attributes: DeviceAttributes) {
        self.state.lock().attributes = attributes;
    }

    /// Restrict the modes the input accepts.
    pub fn set_input_modes(&self, modes: &[DisplayMode]) {
        self.state.lock().input_modes = Some(modes.to_vec());
    }

    /// Restrict the modes the output accepts.
    pub fn set_output_modes(&self, modes: &[DisplayMode]) {
        self.state.lock().output_modes = Some(modes.to_vec());
    }

    /// Make the named device call fail until [`SimDevice::clear_failures`].
    pub fn fail_call(&self, call: &'static str) {
        self.state.lock().failing.insert(call);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    pub fn fail_conversions(&self, fail: bool) {
        self.state.lock().fail_conversions = fail;
    }

    /// Recent device calls, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }

    /// Frames allocated by this card that still hold references.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn input_enabled(&self) -> Option<(DisplayMode, PixelFormat, InputFlags)> {
        self.state.lock().input
    }

    pub fn is_input_streaming(&self) -> bool {
        self.state.lock().input_streaming
    }

    pub fn output_enabled(&self) -> Option<(DisplayMode, OutputFlags)> {
        self.state.lock().output
    }

    pub fn is_playback_running(&self) -> bool {
        self.state.lock().playback_running
    }

    pub fn payload_override(&self) -> bool {
        self.state.lock().payload_override
    }

    pub fn has_input_callback(&self) -> bool {
        self.input_callback.read().is_some()
    }

    pub fn has_completion_callback(&self) -> bool {
        self.completion_callback.read().is_some()
    }

    /// Recently scheduled frames, oldest first.
    pub fn scheduled(&self) -> Vec<ScheduledRecord> {
        self.state.lock().history.clone()
    }

    /// Frames scheduled but not yet completed.
    pub fn pending_frames(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Ancillary words stored on `line` of a frame this card allocated.
    pub fn ancillary_of(&self, frame: &Arc<dyn VideoFrame>, line: u32) -> Option<Vec<u16>> {
        self.find_allocated(frame)?.ancillary(line)
    }

    /// Deliver a captured frame to the registered input callback.
    pub fn emit_frame(&self, frame: &Arc<SimFrame>) {
        self.emit(Some(frame), None);
    }

    /// Deliver a captured frame together with an audio packet.
    pub fn emit_frame_with_audio(&self, frame: &Arc<SimFrame>, audio: &Arc<SimAudioPacket>) {
        audio.add_ref();
        let audio: Arc<dyn AudioPacket> = audio.clone();
        self.emit(Some(frame), Some(Retained::adopt(audio)));
    }

    /// An arrival event that carries no video frame.
    pub fn emit_empty_arrival(&self) {
        self.emit(None, None);
    }

    fn emit(&self, frame: Option<&Arc<SimFrame>>, audio: Option<Retained<dyn AudioPacket>>) {
        let callback = self.input_callback.read().clone();
        let Some(callback) = callback else {
            debug!("Arrival dropped, no input callback registered");
            return;
        };

        let video: Option<Arc<dyn VideoFrame>> = frame.map(|f| {
            let f: Arc<dyn VideoFrame> = f.clone();
            f
        });
        callback.video_input_frame_arrived(video.as_ref(), audio);
    }

    /// Report a new input format to the registered input callback.
    pub fn emit_format_change(&self, mode: DisplayMode, flags: DetectedFormatFlags) {
        let callback = self.input_callback.read().clone();
        let Some(callback) = callback else {
            return;
        };

        let mut info = DisplayModeInfo::for_mode(mode);
        info.supports_3d = flags.contains(DetectedFormatFlags::DUAL_STREAM_3D);
        callback.video_input_format_changed(FormatChangedEvents::DISPLAY_MODE_CHANGED, &info, flags);
    }

    /// Play out the oldest scheduled frame and report its completion.
    ///
    /// Returns false when nothing was scheduled.
    pub fn complete_next(&self, result: CompletionResult) -> bool {
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.pop_front() else {
                return false;
            };
            state.stream_time = state.stream_time.max(pending.display_time + pending.duration);
            pending
        };

        let callback = self.completion_callback.read().clone();
        if let Some(callback) = callback {
            callback.scheduled_frame_completed(Arc::clone(&pending.frame), result);
        }

        // The card's own reference goes last
        pending.frame.release();
        true
    }

    fn check(&self, call: &'static str) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        push_bounded(&mut state.calls, call);
        if state.failing.contains(call) {
            Err(DeviceError::Status(E_FAIL))
        } else {
            Ok(())
        }
    }

    fn find_allocated(&self, frame: &Arc<dyn VideoFrame>) -> Option<Arc<SimFrame>> {
        let wanted = Arc::as_ptr(frame) as *const ();
        let mut allocated = self.allocated.lock();
        allocated.retain(|weak| weak.strong_count() > 0);
        allocated
            .iter()
            .filter_map(Weak::upgrade)
            .find(|candidate| Arc::as_ptr(candidate) as *const () == wanted)
    }

    fn mode_supported(modes: &Option<Vec<DisplayMode>>, mode: DisplayMode) -> bool {
        modes.as_ref().map_or(true, |modes| modes.contains(&mode))
    }
}

impl CaptureDevice for SimDevice {
    fn attributes(&self) -> Result<DeviceAttributes, DeviceError> {
        self.check("attributes")?;
        Ok(self.state.lock().attributes)
    }

    fn set_input_3d_payload_override(&self, enabled: bool) -> Result<(), DeviceError> {
        self.check("set_input_3d_payload_override")?;
        self.state.lock().payload_override = enabled;
        Ok(())
    }

    fn input_3d_payload_override(&self) -> Result<bool, DeviceError> {
        self.check("input_3d_payload_override")?;
        Ok(self.state.lock().payload_override)
    }

    fn query_input_mode(
        &self,
        mode: DisplayMode,
        _pixel_format: PixelFormat,
        flags: SupportedModeFlags,
    ) -> Result<ModeSupport, DeviceError> {
        self.check("query_input_mode")?;
        let state = self.state.lock();
        let supported = Self::mode_supported(&state.input_modes, mode)
            && (!flags.contains(SupportedModeFlags::DUAL_STREAM_3D)
                || state.attributes.dual_stream_3d);
        Ok(ModeSupport {
            supported,
            actual_mode: mode,
        })
    }

    fn display_mode(&self, mode: DisplayMode) -> Result<DisplayModeInfo, DeviceError> {
        self.check("display_mode")?;
        let mut info = DisplayModeInfo::for_mode(mode);
        info.supports_3d = self.state.lock().attributes.dual_stream_3d;
        Ok(info)
    }

    fn set_input_callback(
        &self,
        callback: Option<Arc<dyn InputCallback>>,
    ) -> Result<(), DeviceError> {
        self.check("set_input_callback")?;
        *self.input_callback.write() = callback;
        Ok(())
    }

    fn disable_audio_input(&self) -> Result<(), DeviceError> {
        self.check("disable_audio_input")
    }

    fn enable_video_input(
        &self,
        mode: DisplayMode,
        pixel_format: PixelFormat,
        flags: InputFlags,
    ) -> Result<(), DeviceError> {
        self.check("enable_video_input")?;
        self.state.lock().input = Some((mode, pixel_format, flags));
        Ok(())
    }

    fn disable_video_input(&self) -> Result<(), DeviceError> {
        self.check("disable_video_input")?;
        let mut state = self.state.lock();
        state.input = None;
        state.input_streaming = false;
        Ok(())
    }

    fn available_video_frame_count(&self) -> Result<u32, DeviceError> {
        self.check("available_video_frame_count")?;
        Ok(0)
    }

    fn start_streams(&self) -> Result<(), DeviceError> {
        self.check("start_streams")?;
        let mut state = self.state.lock();
        if state.input.is_none() {
            return Err(DeviceError::Status(E_FAIL));
        }
        state.input_streaming = true;
        Ok(())
    }

    fn stop_streams(&self) -> Result<(), DeviceError> {
        self.check("stop_streams")?;
        self.state.lock().input_streaming = false;
        Ok(())
    }

    fn pause_streams(&self) -> Result<(), DeviceError> {
        self.check("pause_streams")?;
        self.state.lock().input_streaming = false;
        Ok(())
    }

    fn flush_streams(&self) -> Result<(), DeviceError> {
        self.check("flush_streams")
    }
}

impl FrameFactory for SimDevice {
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: u32,
        pixel_format: PixelFormat,
        flags: FrameFlags,
    ) -> Result<Retained<dyn VideoFrame>, DeviceError> {
        self.check("create_video_frame")?;
        if row_bytes < pixel_format.row_bytes(width) {
            return Err(DeviceError::Status(E_FAIL));
        }

        let frame = Arc::new(
            SimFrame::builder(width, height, pixel_format)
                .row_bytes(row_bytes)
                .flags(flags)
                .build_inner(Some(Arc::clone(&self.live))),
        );
        self.live.fetch_add(1, Ordering::SeqCst);
        self.allocated.lock().push(Arc::downgrade(&frame));

        let frame: Arc<dyn VideoFrame> = frame;
        Ok(Retained::adopt(frame))
    }
}

impl ConversionBackend for SimDevice {
    fn convert_frame(&self, src: &dyn VideoFrame, dst: &dyn VideoFrame) -> Result<(), DeviceError> {
        self.check("convert_frame")?;
        if self.state.lock().fail_conversions {
            return Err(DeviceError::Status(E_FAIL));
        }
        if src.width() != dst.width() || src.height() != dst.height() {
            return Err(DeviceError::Status(E_FAIL));
        }

        // Stand-in for the real colour maths: opaque mid grey
        let mut bytes = dst.bytes_mut()?;
        for pixel in bytes.chunks_exact_mut(4) {
            pixel.copy_from_slice(&[0x80, 0x80, 0x80, 0xFF]);
        }

        self.conversions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PlaybackDevice for SimDevice {
    fn query_output_mode(
        &self,
        mode: DisplayMode,
        _flags: OutputFlags,
    ) -> Result<Option<DisplayModeInfo>, DeviceError> {
        self.check("query_output_mode")?;
        let state = self.state.lock();
        if Self::mode_supported(&state.output_modes, mode) {
            Ok(Some(DisplayModeInfo::for_mode(mode)))
        } else {
            Ok(None)
        }
    }

    fn enable_video_output(&self, mode: DisplayMode, flags: OutputFlags) -> Result<(), DeviceError> {
        self.check("enable_video_output")?;
        self.state.lock().output = Some((mode, flags));
        Ok(())
    }

    fn disable_video_output(&self) -> Result<(), DeviceError> {
        self.check("disable_video_output")?;
        let pending: Vec<Pending> = {
            let mut state = self.state.lock();
            state.output = None;
            state.playback_running = false;
            state.pending.drain(..).collect()
        };

        // Unplayed frames come back flushed
        let callback = self.completion_callback.read().clone();
        for frame in pending {
            if let Some(callback) = &callback {
                callback.scheduled_frame_completed(Arc::clone(&frame.frame), CompletionResult::Flushed);
            }
            frame.frame.release();
        }
        Ok(())
    }

    fn set_completion_callback(
        &self,
        callback: Option<Arc<dyn CompletionCallback>>,
    ) -> Result<(), DeviceError> {
        self.check("set_completion_callback")?;
        *self.completion_callback.write() = callback;
        Ok(())
    }

    fn schedule_video_frame(
        &self,
        frame: &Arc<dyn VideoFrame>,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> Result<(), DeviceError> {
        self.check("schedule_video_frame")?;
        if self.state.lock().output.is_none() {
            return Err(DeviceError::Status(E_FAIL));
        }

        let ancillary = self.ancillary_of(frame, RECORDED_ANC_LINE);

        frame.add_ref();
        let mut state = self.state.lock();
        state.pending.push_back(Pending {
            frame: Arc::clone(frame),
            display_time,
            duration,
        });
        push_bounded(
            &mut state.history,
            ScheduledRecord {
                frame: Arc::clone(frame),
                display_time,
                duration,
                time_scale,
                ancillary,
            },
        );
        Ok(())
    }

    fn frame_completion_reference_timestamp(
        &self,
        _frame: &dyn VideoFrame,
        _time_scale: i64,
    ) -> Result<i64, DeviceError> {
        self.check("frame_completion_reference_timestamp")?;
        Ok(self.state.lock().stream_time)
    }

    fn scheduled_stream_time(&self, _time_scale: i64) -> Result<(i64, f64), DeviceError> {
        self.check("scheduled_stream_time")?;
        let state = self.state.lock();
        let speed = if state.playback_running { 1.0 } else { 0.0 };
        Ok((state.stream_time, speed))
    }

    fn start_scheduled_playback(
        &self,
        start_time: i64,
        _time_scale: i64,
        _speed: f64,
    ) -> Result<(), DeviceError> {
        self.check("start_scheduled_playback")?;
        let mut state = self.state.lock();
        if state.output.is_none() {
            return Err(DeviceError::Status(E_FAIL));
        }
        state.playback_running = true;
        state.stream_time = start_time;
        Ok(())
    }

    fn stop_scheduled_playback(&self, _stop_time: i64, _time_scale: i64) -> Result<i64, DeviceError> {
        self.check("stop_scheduled_playback")?;
        let mut state = self.state.lock();
        state.playback_running = false;
        Ok(state.stream_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_refcount() {
        let frame = SimFrame::filled(4, 4, PixelFormat::Yuv8, 0);
        assert_eq!(frame.ref_count(), 1);
        assert_eq!(frame.add_ref(), 2);
        assert_eq!(frame.release(), 1);
        assert!(!frame.over_released());
    }

    #[test]
    fn test_over_release_is_flagged() {
        let frame = SimFrame::filled(4, 4, PixelFormat::Yuv8, 0);
        frame.release();
        frame.release();
        assert!(frame.over_released());
    }

    #[test]
    fn test_allocations_are_tracked() {
        let device = SimDevice::new();
        let frame = device
            .create_video_frame(8, 2, 16, PixelFormat::Yuv8, FrameFlags::DEFAULT)
            .unwrap();
        assert_eq!(device.live_allocations(), 1);
        drop(frame);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_failure_injection() {
        let device = SimDevice::new();
        device.fail_call("attributes");
        assert!(device.attributes().is_err());
        device.clear_failures();
        assert!(device.attributes().is_ok());
        assert_eq!(device.calls(), vec!["attributes", "attributes"]);
    }

    #[test]
    fn test_stereo_pair_hands_out_retained_right_eye() {
        let (left, right) = SimFrame::stereo_pair(4, 2, PixelFormat::Yuv8, 1, 2);
        let handle = left.right_eye().unwrap().unwrap();
        assert_eq!(right.ref_count(), 2);
        drop(handle);
        assert_eq!(right.ref_count(), 1);
    }
}
