//! Capture session: input enable, format detection and frame set delivery

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::convert::convert_frame;
use crate::capture::frame::{FrameSet, Image, PixelFormat};
use crate::device::{
    AudioPacket, CaptureDevice, ConversionBackend, DetectedFormatFlags, DisplayMode,
    DisplayModeInfo, FormatChangedEvents, FrameFlags, InputCallback, InputFlags, Retained,
    SupportedModeFlags, VideoFrame,
};
use crate::error::{Error, Result};
use crate::pipeline::pool::WorkerPool;
use crate::{InputSettings, PipelineSettings};

/// Receives every converted frame set.
pub type FrameSetCallback = Arc<dyn Fn(FrameSet) + Send + Sync>;

/// Told about the new mode after a successful reconfiguration.
pub type FormatChangedCallback = Arc<dyn Fn(DisplayMode) + Send + Sync>;

const LEFT: &str = "[LEFT]";
const RIGHT: &str = "[RIGHT]";

/// What the input is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub mode: DisplayMode,
    pub stereo: bool,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Disabled,
    Enabling,
    Enabled,
    Reconfiguring,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Disabled => "disabled",
            CaptureState::Enabling => "enabling",
            CaptureState::Enabled => "enabled",
            CaptureState::Reconfiguring => "reconfiguring",
        };
        f.write_str(name)
    }
}

/// Snapshot of the capture counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub frames_received: u64,
    /// Arrivals flagged as having no input signal
    pub dropped_frames: u64,
    /// Arrivals dropped because the dispatch queue was full
    pub backpressure_drops: u64,
    pub frame_sets_delivered: u64,
    pub conversion_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    no_signal: AtomicU64,
    backpressure: AtomicU64,
    delivered: AtomicU64,
    conversion_failures: AtomicU64,
}

/// Drives an input: negotiates the mode, turns arrivals into frame sets and
/// follows the card through format changes.
///
/// The arrival callback only retains frames and hands them to the dispatch
/// pool, so the driver thread is never held up by conversion. A dispatch
/// thread converts the primary frame itself while the conversion pool handles
/// the right eye, then delivers the set in (left, right) order.
pub struct CaptureController {
    inner: Arc<CaptureInner>,
}

struct CaptureInner {
    device: Arc<dyn CaptureDevice>,
    this: Weak<CaptureInner>,
    settings: InputSettings,
    state: Mutex<CaptureState>,
    streaming: AtomicBool,
    requested_stereo: AtomicBool,
    sequence: AtomicU64,
    stage: Arc<ConversionStage>,
    dispatch: WorkerPool,
    on_format_changed: RwLock<Option<FormatChangedCallback>>,
}

/// Everything a dispatched arrival needs once it leaves the driver thread.
struct ConversionStage {
    backend: Arc<dyn ConversionBackend>,
    workers: WorkerPool,
    config: ArcSwap<CaptureConfig>,
    on_frame_set: RwLock<Option<FrameSetCallback>>,
    counters: CachePadded<Counters>,
}

impl CaptureController {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        backend: Arc<dyn ConversionBackend>,
        settings: &InputSettings,
        pipeline: &PipelineSettings,
    ) -> Result<Self> {
        let workers = WorkerPool::new(
            "convert",
            pipeline.conversion_workers,
            pipeline.max_pending_sets,
            pipeline.pin_workers,
        )?;
        let dispatch = WorkerPool::new(
            "capture-dispatch",
            pipeline.dispatch_workers,
            pipeline.max_pending_sets,
            false,
        )?;

        let stage = Arc::new(ConversionStage {
            backend,
            workers,
            config: ArcSwap::from_pointee(CaptureConfig {
                mode: settings.mode,
                stereo: false,
                pixel_format: settings.pixel_format,
            }),
            on_frame_set: RwLock::new(None),
            counters: CachePadded::new(Counters::default()),
        });

        let inner = Arc::new_cyclic(|this| CaptureInner {
            device,
            this: this.clone(),
            settings: settings.clone(),
            state: Mutex::new(CaptureState::Disabled),
            streaming: AtomicBool::new(false),
            requested_stereo: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            stage,
            dispatch,
            on_format_changed: RwLock::new(None),
        });

        Ok(Self { inner })
    }

    /// Negotiate and enable the input.
    ///
    /// An unsupported request leaves the controller as it was; any other failure
    /// leaves it disabled. The capture configuration only changes on success.
    #[instrument(skip(self))]
    pub fn enable(&self, mode: DisplayMode, auto_detect: bool, stereo: bool) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            match *state {
                CaptureState::Enabling | CaptureState::Reconfiguring => {
                    return Err(Error::InvalidState(format!("input is {}", *state)));
                }
                current => {
                    *state = CaptureState::Enabling;
                    current
                }
            }
        };

        match self.inner.negotiate(mode, auto_detect, stereo) {
            Ok(config) => {
                self.inner.stage.config.store(Arc::new(config));
                self.inner.requested_stereo.store(stereo, Ordering::Release);
                *self.inner.state.lock() = CaptureState::Enabled;
                info!("Video input enabled");
                Ok(())
            }
            Err(Error::Unsupported(reason)) => {
                warn!("Unable to enable video input: {} not supported", reason);
                *self.inner.state.lock() = previous;
                Err(Error::Unsupported(reason))
            }
            Err(err) => {
                warn!("Unable to enable video input: {}", err);
                self.inner.release_card();
                *self.inner.state.lock() = CaptureState::Disabled;
                Err(err)
            }
        }
    }

    /// Start capturing, enabling with the configured defaults first if needed.
    pub fn start_streams(&self) -> Result<()> {
        if self.state() == CaptureState::Disabled {
            let settings = &self.inner.settings;
            self.enable(settings.mode, settings.auto_detect, settings.stereo)?;
        }

        debug!("Starting input streams");
        self.inner.device.start_streams().map_err(|err| {
            warn!("Failed to start input streams: {}", err);
            Error::device("StartStreams", err)
        })?;
        self.inner.streaming.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop_streams(&self) -> Result<()> {
        debug!("Stopping input streams");
        self.inner.streaming.store(false, Ordering::Release);
        self.inner.device.stop_streams().map_err(|err| {
            warn!("Failed to stop input streams: {}", err);
            Error::device("StopStreams", err)
        })
    }

    /// Stop streaming if needed, turn the input off and unregister from the card.
    pub fn disable(&self) -> Result<()> {
        if self.is_streaming() {
            self.stop_streams()?;
        }

        self.inner.device.disable_video_input().map_err(|err| {
            warn!("Failed to disable video input: {}", err);
            Error::device("DisableVideoInput", err)
        })?;
        if let Err(err) = self.inner.device.set_input_callback(None) {
            warn!("Unable to clear input callback: {}", err);
        }

        *self.inner.state.lock() = CaptureState::Disabled;
        info!("Video input disabled");
        Ok(())
    }

    pub fn set_frame_set_callback<F>(&self, callback: F)
    where
        F: Fn(FrameSet) + Send + Sync + 'static,
    {
        *self.inner.stage.on_frame_set.write() = Some(Arc::new(callback));
    }

    pub fn set_format_changed_callback<F>(&self, callback: F)
    where
        F: Fn(DisplayMode) + Send + Sync + 'static,
    {
        *self.inner.on_format_changed.write() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> CaptureState {
        *self.inner.state.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    pub fn config(&self) -> CaptureConfig {
        **self.inner.stage.config.load()
    }

    pub fn stats(&self) -> CaptureStats {
        let counters = &self.inner.stage.counters;
        CaptureStats {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            dropped_frames: counters.no_signal.load(Ordering::Relaxed),
            backpressure_drops: counters.backpressure.load(Ordering::Relaxed),
            frame_sets_delivered: counters.delivered.load(Ordering::Relaxed),
            conversion_failures: counters.conversion_failures.load(Ordering::Relaxed),
        }
    }

    /// The callback target to hand to a card by hand; `enable` registers it itself.
    pub fn input_callback(&self) -> Arc<dyn InputCallback> {
        self.inner.clone()
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        // The card holds the other strong reference to the inner state
        if let Err(err) = self.inner.device.set_input_callback(None) {
            debug!("Unable to clear input callback on drop: {}", err);
        }
    }
}

impl CaptureInner {
    fn negotiate(&self, mode: DisplayMode, auto_detect: bool, stereo: bool) -> Result<CaptureConfig> {
        let attributes = self
            .device
            .attributes()
            .map_err(|err| Error::device("GetAttributes", err))?;

        let mut input_flags = InputFlags::DEFAULT;
        let mut mode_flags = SupportedModeFlags::DEFAULT;

        if auto_detect {
            info!("Automatic mode detection requested");
            if !attributes.format_detection {
                return Err(Error::unsupported("input format detection"));
            }
            input_flags |= InputFlags::ENABLE_FORMAT_DETECTION;
        }

        if stereo {
            info!("Configuring input for 3D");
            if !attributes.dual_stream_3d {
                return Err(Error::unsupported("dual-stream 3D input"));
            }
            mode_flags |= SupportedModeFlags::DUAL_STREAM_3D;
            input_flags |= InputFlags::DUAL_STREAM_3D;

            if let Err(err) = self.device.set_input_3d_payload_override(true) {
                warn!("Unable to set 3D payload override: {}", err);
            }
            match self.device.input_3d_payload_override() {
                Ok(enabled) => debug!("3D payload override is {}", enabled),
                Err(err) => warn!("Unable to query 3D payload override: {}", err),
            }
        }

        let pixel_format = self.settings.pixel_format;
        let support = self
            .device
            .query_input_mode(mode, pixel_format, mode_flags)
            .map_err(|err| Error::device("DoesSupportVideoMode", err))?;
        if !support.supported {
            return Err(Error::unsupported(format!(
                "input mode {} with {}",
                mode, pixel_format
            )));
        }
        if support.actual_mode != mode {
            debug!("Card will run {} as {}", mode, support.actual_mode);
        }

        let info = self
            .device
            .display_mode(mode)
            .map_err(|err| Error::device("GetDisplayMode", err))?;
        info!(
            "Enabling video input with mode {}{} and pixel format {}",
            info.mode,
            if info.supports_3d { " 3D" } else { "" },
            pixel_format
        );

        let this: Arc<dyn InputCallback> = self
            .this
            .upgrade()
            .ok_or_else(|| Error::InvalidState("capture controller is shutting down".into()))?;
        self.device
            .set_input_callback(Some(this))
            .map_err(|err| Error::device("SetCallback", err))?;

        if let Err(err) = self.device.disable_audio_input() {
            warn!("Unable to disable audio input: {}", err);
        }

        self.device
            .enable_video_input(mode, pixel_format, input_flags)
            .map_err(|err| {
                warn!("Failed to enable video input. Is another application using the card?");
                Error::device("EnableVideoInput", err)
            })?;

        Ok(CaptureConfig {
            mode,
            stereo,
            pixel_format,
        })
    }

    fn reconfigure(&self, mode: DisplayMode, detected: DetectedFormatFlags) {
        {
            let mut state = self.state.lock();
            if *state != CaptureState::Enabled {
                warn!("Ignoring format change to {} while {}", mode, *state);
                return;
            }
            *state = CaptureState::Reconfiguring;
        }

        // Stereo is kept only if it was asked for and the new signal carries it
        let stereo = self.requested_stereo.load(Ordering::Acquire)
            && detected.contains(DetectedFormatFlags::DUAL_STREAM_3D);
        info!(
            "Input format changed, reconfiguring for {}{}",
            mode,
            if stereo { " 3D" } else { "" }
        );

        match self.restart(mode, stereo) {
            Ok(config) => {
                self.stage.config.store(Arc::new(config));
                self.streaming.store(true, Ordering::Release);
                *self.state.lock() = CaptureState::Enabled;

                let callback = self.on_format_changed.read().clone();
                if let Some(callback) = callback {
                    callback(config.mode);
                }
            }
            Err(err) => {
                error!("Unable to reconfigure input for {}: {}", mode, err);
                self.release_card();
                *self.state.lock() = CaptureState::Disabled;
            }
        }
    }

    /// Leave the card idle after a failed enable: no streams, no callback.
    fn release_card(&self) {
        if self.streaming.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.device.stop_streams() {
                warn!("Unable to stop input streams: {}", err);
            }
        }
        if let Err(err) = self.device.set_input_callback(None) {
            warn!("Unable to clear input callback: {}", err);
        }
    }

    fn restart(&self, mode: DisplayMode, stereo: bool) -> Result<CaptureConfig> {
        self.device
            .pause_streams()
            .map_err(|err| Error::device("PauseStreams", err))?;
        let config = self.negotiate(mode, true, stereo)?;
        self.device
            .flush_streams()
            .map_err(|err| Error::device("FlushStreams", err))?;
        self.device
            .start_streams()
            .map_err(|err| Error::device("StartStreams", err))?;
        Ok(config)
    }
}

impl InputCallback for CaptureInner {
    fn video_input_frame_arrived(
        &self,
        video: Option<&Arc<dyn VideoFrame>>,
        audio: Option<Retained<dyn AudioPacket>>,
    ) {
        // Audio is not used
        drop(audio);

        let Some(video) = video else {
            warn!("Frame arrival without a video frame");
            return;
        };

        if *self.state.lock() == CaptureState::Disabled {
            debug!("Input disabled, ignoring arrival");
            return;
        }

        let counters = &self.stage.counters;
        counters.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_frames_received").increment(1);

        if video.flags().contains(FrameFlags::HAS_NO_INPUT_SOURCE) {
            let dropped = counters.no_signal.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("capture_frames_no_signal").increment(1);
            warn!("No input signal, {} frames dropped", dropped);
            return;
        }

        let config = self.stage.config.load();
        let mut frames = vec![Retained::retain(video)];
        if config.stereo {
            match video.right_eye() {
                Some(Ok(right)) => frames.push(right),
                Some(Err(err)) => warn!("Unable to get right eye, delivering mono: {}", err),
                None => warn!("Stereo input but frame has no right eye, delivering mono"),
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stage = Arc::clone(&self.stage);
        let count = frames.len();

        // A rejected job drops its frames, which releases them
        if self
            .dispatch
            .try_execute(move || stage.process(sequence, frames))
            .is_err()
        {
            counters.backpressure.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("capture_frames_dropped").increment(1);
            warn!(
                "Dispatch queue full, dropping frame set {} ({} frames)",
                sequence, count
            );
        }
    }

    fn video_input_format_changed(
        &self,
        events: FormatChangedEvents,
        mode: &DisplayModeInfo,
        flags: DetectedFormatFlags,
    ) {
        debug!(
            "Format changed events {:#x}, detected flags {:#x}",
            events.bits(),
            flags.bits()
        );
        self.reconfigure(mode.mode, flags);
    }
}

impl ConversionStage {
    /// Runs on one of the dispatch threads. Sets can be delivered out of
    /// sequence order when more than one dispatch thread is running.
    fn process(&self, sequence: u64, frames: Vec<Retained<dyn VideoFrame>>) {
        let stereo = frames.len() > 1;
        let mut frames = frames.into_iter();
        let Some(primary) = frames.next() else {
            return;
        };

        // Secondary frames go to the pool while this thread does the primary
        let pending: Vec<_> = frames.map(|frame| self.spawn_conversion(frame)).collect();

        let mut images = Vec::with_capacity(1 + pending.len());
        images.push(convert_frame(
            primary,
            &*self.backend,
            if stereo { LEFT } else { "" },
        ));
        for receiver in pending {
            let image = receiver.recv().unwrap_or_else(|_| {
                warn!("{} Conversion worker went away", RIGHT);
                Image::empty()
            });
            images.push(image);
        }

        let failed = images.iter().filter(|image| image.is_empty()).count() as u64;
        if failed > 0 {
            self.counters
                .conversion_failures
                .fetch_add(failed, Ordering::Relaxed);
        }

        let callback = self.on_frame_set.read().clone();
        let Some(callback) = callback else {
            debug!("No frame set consumer, discarding set {}", sequence);
            return;
        };

        debug!("Delivering frame set {} with {} images", sequence, images.len());
        callback(FrameSet { sequence, images });
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_frame_sets_delivered").increment(1);
    }

    fn spawn_conversion(&self, frame: Retained<dyn VideoFrame>) -> flume::Receiver<Image> {
        let (sender, receiver) = flume::bounded(1);
        let backend = Arc::clone(&self.backend);
        let job = move || {
            let image = convert_frame(frame, &*backend, RIGHT);
            let _ = sender.send(image);
        };

        if let Err(job) = self.workers.execute(job) {
            debug!("Conversion pool closed, converting inline");
            job();
        }
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimDevice, SimFrame};
    use crate::device::DeviceAttributes;
    use std::time::Duration;

    fn controller(device: &Arc<SimDevice>) -> CaptureController {
        CaptureController::new(
            device.clone(),
            device.clone(),
            &InputSettings::default(),
            &PipelineSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_enable_sets_config_and_flags() {
        let device = SimDevice::new();
        let capture = controller(&device);

        capture.enable(DisplayMode::Hd1080p25, true, false).unwrap();
        assert_eq!(capture.state(), CaptureState::Enabled);
        assert_eq!(capture.config().mode, DisplayMode::Hd1080p25);
        assert!(!capture.config().stereo);

        let (mode, format, flags) = device.input_enabled().unwrap();
        assert_eq!(mode, DisplayMode::Hd1080p25);
        assert_eq!(format, PixelFormat::Yuv10);
        assert!(flags.contains(InputFlags::ENABLE_FORMAT_DETECTION));
        assert!(!flags.contains(InputFlags::DUAL_STREAM_3D));
        assert!(device.has_input_callback());
    }

    #[test]
    fn test_unsupported_capability_changes_nothing() {
        let device = SimDevice::new();
        device.set_attributes(DeviceAttributes {
            format_detection: false,
            dual_stream_3d: false,
        });
        let capture = controller(&device);

        let err = capture.enable(DisplayMode::Hd720p60, true, false).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(capture.state(), CaptureState::Disabled);
        assert!(device.input_enabled().is_none());

        let err = capture.enable(DisplayMode::Hd720p60, false, true).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(capture.config().mode, InputSettings::default().mode);
    }

    #[test]
    fn test_enable_failure_leaves_disabled() {
        let device = SimDevice::new();
        let capture = controller(&device);
        capture.enable(DisplayMode::Hd1080p30, false, false).unwrap();

        device.fail_call("enable_video_input");
        let err = capture.enable(DisplayMode::Hd720p50, false, false).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
        assert_eq!(capture.state(), CaptureState::Disabled);
        assert_eq!(capture.config().mode, DisplayMode::Hd1080p30);
        assert!(!device.has_input_callback());
    }

    #[test]
    fn test_start_streams_enables_with_defaults() {
        let device = SimDevice::new();
        let capture = controller(&device);

        capture.start_streams().unwrap();
        assert_eq!(capture.state(), CaptureState::Enabled);
        assert!(capture.is_streaming());
        assert!(device.is_input_streaming());
        assert_eq!(capture.config().mode, InputSettings::default().mode);

        capture.stop_streams().unwrap();
        assert!(!capture.is_streaming());
    }

    #[test]
    fn test_arrival_without_video_is_ignored() {
        let device = SimDevice::new();
        let capture = controller(&device);
        capture.enable(DisplayMode::Hd1080p30, false, false).unwrap();

        device.emit_empty_arrival();
        assert_eq!(capture.stats().frames_received, 0);
    }

    #[test]
    fn test_mono_arrival_delivers_one_image() {
        let device = SimDevice::new();
        let capture = controller(&device);
        let (tx, rx) = flume::unbounded();
        capture.set_frame_set_callback(move |set| tx.send(set).unwrap());
        capture.enable(DisplayMode::Hd1080p30, false, false).unwrap();

        let frame = SimFrame::filled(8, 4, PixelFormat::Yuv8, 0x10);
        device.emit_frame(&frame);

        let set = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.sequence, 0);
        assert_eq!(frame.ref_count(), 1);
    }

    #[test]
    fn test_disable_unregisters() {
        let device = SimDevice::new();
        let capture = controller(&device);
        capture.start_streams().unwrap();

        capture.disable().unwrap();
        assert_eq!(capture.state(), CaptureState::Disabled);
        assert!(!device.has_input_callback());
        assert!(device.input_enabled().is_none());
    }

    #[test]
    fn test_drop_breaks_callback_cycle() {
        let device = SimDevice::new();
        let capture = controller(&device);
        capture.enable(DisplayMode::Hd1080p30, false, false).unwrap();
        assert!(device.has_input_callback());

        drop(capture);
        assert!(!device.has_input_callback());
    }
}
