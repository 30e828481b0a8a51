use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdi_bridge::capture::{CaptureController, CaptureState};
use sdi_bridge::device::sim::{SimAudioPacket, SimDevice, SimFrame};
use sdi_bridge::device::{
    ConversionBackend, DetectedFormatFlags, DeviceError, DisplayModeInfo, FormatChangedEvents,
    FrameFactory, FrameFlags, InputCallback, Retained, VideoFrame,
};
use sdi_bridge::{DisplayMode, FrameSet, InputSettings, PipelineSettings, PixelFormat};

const TIMEOUT: Duration = Duration::from_secs(5);

fn setup(pipeline: PipelineSettings) -> (Arc<SimDevice>, CaptureController, flume::Receiver<FrameSet>) {
    let device = SimDevice::new();
    let capture = CaptureController::new(
        device.clone(),
        device.clone(),
        &InputSettings::default(),
        &pipeline,
    )
    .unwrap();

    let (tx, rx) = flume::unbounded();
    capture.set_frame_set_callback(move |set| {
        let _ = tx.send(set);
    });
    (device, capture, rx)
}

#[test]
fn mono_arrival_is_converted_and_released() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    let frame = SimFrame::filled(96, 4, PixelFormat::Yuv10, 0);
    device.emit_frame(&frame);

    let set = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(set.len(), 1);
    assert!(!set.is_stereo());
    assert_eq!(set.images[0].format, PixelFormat::Bgra8);
    assert_eq!(set.images[0].data.len(), 96 * 4 * 4);

    assert_eq!(frame.ref_count(), 1);
    assert!(!frame.over_released());
    assert_eq!(device.conversions(), 1);
    assert_eq!(device.live_allocations(), 0);

    let stats = capture.stats();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frame_sets_delivered, 1);
}

#[test]
fn stereo_arrival_keeps_left_right_order() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, true).unwrap();
    assert!(capture.config().stereo);
    assert!(device.payload_override());

    for round in 0..5u8 {
        let (left, right) = SimFrame::stereo_pair(8, 4, PixelFormat::Yuv8, 0x10 + round, 0xA0 + round);
        device.emit_frame(&left);

        let set = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.primary().unwrap().data.iter().all(|b| *b == 0x10 + round));
        assert!(set.secondary().unwrap().data.iter().all(|b| *b == 0xA0 + round));

        assert_eq!(left.ref_count(), 1);
        assert_eq!(right.ref_count(), 1);
    }
}

#[test]
fn broken_right_eye_delivers_mono() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, true).unwrap();

    let frame = SimFrame::builder(8, 4, PixelFormat::Yuv8)
        .broken_right_eye()
        .build();
    device.emit_frame(&frame);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().len(), 1);

    let plain = SimFrame::filled(8, 4, PixelFormat::Yuv8, 1);
    device.emit_frame(&plain);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().len(), 1);
    assert_eq!(frame.ref_count(), 1);
}

#[test]
fn right_eye_ignored_when_not_stereo() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    let (left, right) = SimFrame::stereo_pair(8, 4, PixelFormat::Yuv8, 1, 2);
    device.emit_frame(&left);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().len(), 1);
    assert_eq!(right.ref_count(), 1);
}

#[test]
fn no_signal_frames_are_counted_not_delivered() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    let frame = SimFrame::no_signal(96, 4, PixelFormat::Yuv10);
    device.emit_frame(&frame);

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(capture.stats().dropped_frames, 1);
    assert_eq!(capture.stats().frame_sets_delivered, 0);
    assert_eq!(device.conversions(), 0);
    assert_eq!(frame.ref_count(), 1);

    // The sequence only advances for frames that were dispatched
    let good = SimFrame::filled(8, 4, PixelFormat::Yuv8, 0);
    device.emit_frame(&good);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().sequence, 0);
}

#[test]
fn conversion_failure_yields_empty_slot() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();
    device.fail_conversions(true);

    let frame = SimFrame::filled(96, 4, PixelFormat::Rgb10, 0);
    device.emit_frame(&frame);

    let set = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(set.len(), 1);
    assert!(set.images[0].is_empty());
    assert_eq!(capture.stats().conversion_failures, 1);
    assert_eq!(frame.ref_count(), 1);
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn audio_is_released_immediately() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    let frame = SimFrame::filled(8, 4, PixelFormat::Yuv8, 0);
    let audio = SimAudioPacket::new(1600);
    device.emit_frame_with_audio(&frame, &audio);

    assert_eq!(audio.ref_count(), 1);
    rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn full_dispatch_queue_drops_and_releases() {
    let device = SimDevice::new();
    let capture = CaptureController::new(
        device.clone(),
        device.clone(),
        &InputSettings::default(),
        &PipelineSettings {
            dispatch_workers: 1,
            max_pending_sets: 1,
            ..PipelineSettings::default()
        },
    )
    .unwrap();

    let (entered_tx, entered_rx) = flume::unbounded();
    let (release_tx, release_rx) = flume::unbounded::<()>();
    capture.set_frame_set_callback(move |set| {
        let _ = entered_tx.send(set.sequence);
        let _ = release_rx.recv();
    });
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    let frames: Vec<_> = (0..3)
        .map(|i| SimFrame::filled(8, 4, PixelFormat::Yuv8, i))
        .collect();

    // First set blocks the dispatch thread inside the consumer
    device.emit_frame(&frames[0]);
    assert_eq!(entered_rx.recv_timeout(TIMEOUT).unwrap(), 0);

    // Second waits in the queue, third has nowhere to go
    device.emit_frame(&frames[1]);
    device.emit_frame(&frames[2]);

    assert_eq!(capture.stats().backpressure_drops, 1);
    assert_eq!(frames[2].ref_count(), 1);
    assert_eq!(frames[1].ref_count(), 2);

    release_tx.send(()).unwrap();
    assert_eq!(entered_rx.recv_timeout(TIMEOUT).unwrap(), 1);
    release_tx.send(()).unwrap();

    drop(capture);
    for frame in &frames {
        assert_eq!(frame.ref_count(), 1);
    }
}

#[test]
fn format_change_reconfigures_and_notifies() {
    let (device, capture, _rx) = setup(PipelineSettings::default());
    let (mode_tx, mode_rx) = flume::unbounded();
    capture.set_format_changed_callback(move |mode| {
        let _ = mode_tx.send(mode);
    });

    capture.enable(DisplayMode::Hd1080p30, true, false).unwrap();
    capture.start_streams().unwrap();

    device.emit_format_change(DisplayMode::Hd720p50, DetectedFormatFlags::YCBCR_422);

    assert_eq!(mode_rx.try_recv().unwrap(), DisplayMode::Hd720p50);
    assert_eq!(capture.state(), CaptureState::Enabled);
    assert!(capture.is_streaming());
    assert_eq!(capture.config().mode, DisplayMode::Hd720p50);
    assert_eq!(device.input_enabled().unwrap().0, DisplayMode::Hd720p50);

    let calls = device.calls();
    let pause = calls.iter().rposition(|c| *c == "pause_streams").unwrap();
    let enable = calls.iter().rposition(|c| *c == "enable_video_input").unwrap();
    let flush = calls.iter().rposition(|c| *c == "flush_streams").unwrap();
    let start = calls.iter().rposition(|c| *c == "start_streams").unwrap();
    assert!(pause < enable && enable < flush && flush < start);
}

#[test]
fn format_change_follows_detected_stereo() {
    let (device, capture, _rx) = setup(PipelineSettings::default());
    capture.enable(DisplayMode::Hd1080p30, true, true).unwrap();
    capture.start_streams().unwrap();

    device.emit_format_change(DisplayMode::Hd1080p25, DetectedFormatFlags::YCBCR_422);
    assert!(!capture.config().stereo);

    device.emit_format_change(
        DisplayMode::Hd1080p25,
        DetectedFormatFlags::YCBCR_422 | DetectedFormatFlags::DUAL_STREAM_3D,
    );
    assert!(capture.config().stereo);
}

#[test]
fn failed_reconfigure_stops_without_retry() {
    let (device, capture, _rx) = setup(PipelineSettings::default());
    let (mode_tx, mode_rx) = flume::unbounded();
    capture.set_format_changed_callback(move |mode| {
        let _ = mode_tx.send(mode);
    });
    capture.enable(DisplayMode::Hd1080p30, true, false).unwrap();
    capture.start_streams().unwrap();

    device.fail_call("enable_video_input");
    device.emit_format_change(DisplayMode::Hd720p60, DetectedFormatFlags::YCBCR_422);

    assert_eq!(capture.state(), CaptureState::Disabled);
    assert!(!capture.is_streaming());
    assert!(mode_rx.try_recv().is_err());
    assert_eq!(capture.config().mode, DisplayMode::Hd1080p30);

    let attempts = device
        .calls()
        .iter()
        .filter(|c| **c == "enable_video_input")
        .count();
    assert_eq!(attempts, 2);
}

#[test]
fn format_change_ignored_unless_enabled() {
    let (device, capture, _rx) = setup(PipelineSettings::default());

    let info = DisplayModeInfo::for_mode(DisplayMode::Hd720p60);
    capture.input_callback().video_input_format_changed(
        FormatChangedEvents::DISPLAY_MODE_CHANGED,
        &info,
        DetectedFormatFlags::YCBCR_422,
    );

    assert_eq!(capture.state(), CaptureState::Disabled);
    assert!(!device.calls().contains(&"pause_streams"));
}

/// Holds the first conversion until the gate opens.
struct StallFirst {
    device: Arc<SimDevice>,
    stalled: AtomicBool,
    gate: flume::Receiver<()>,
}

impl FrameFactory for StallFirst {
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: u32,
        pixel_format: PixelFormat,
        flags: FrameFlags,
    ) -> Result<Retained<dyn VideoFrame>, DeviceError> {
        self.device
            .create_video_frame(width, height, row_bytes, pixel_format, flags)
    }
}

impl ConversionBackend for StallFirst {
    fn convert_frame(&self, src: &dyn VideoFrame, dst: &dyn VideoFrame) -> Result<(), DeviceError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            let _ = self.gate.recv_timeout(TIMEOUT);
        }
        self.device.convert_frame(src, dst)
    }
}

#[test]
fn hung_conversion_holds_up_only_its_own_set() {
    let device = SimDevice::new();
    let (open_tx, open_rx) = flume::unbounded();
    let backend = Arc::new(StallFirst {
        device: device.clone(),
        stalled: AtomicBool::new(false),
        gate: open_rx,
    });
    let capture = CaptureController::new(
        device.clone(),
        backend,
        &InputSettings::default(),
        &PipelineSettings::default(),
    )
    .unwrap();
    let (tx, rx) = flume::unbounded();
    capture.set_frame_set_callback(move |set| {
        let _ = tx.send(set.sequence);
    });
    capture.enable(DisplayMode::Hd1080p2997, false, false).unwrap();

    // Yuv10 goes through the backend, so each frame needs a device conversion
    let first = SimFrame::filled(96, 4, PixelFormat::Yuv10, 1);
    let second = SimFrame::filled(96, 4, PixelFormat::Yuv10, 2);
    device.emit_frame(&first);
    device.emit_frame(&second);

    let delivered = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(rx.try_recv().is_err());

    open_tx.send(()).unwrap();
    let stalled = rx.recv_timeout(TIMEOUT).unwrap();
    let mut sequences = [delivered, stalled];
    sequences.sort_unstable();
    assert_eq!(sequences, [0, 1]);
    assert_eq!(capture.stats().backpressure_drops, 0);
}

#[test]
fn failed_enable_while_streaming_releases_the_card() {
    let (device, capture, rx) = setup(PipelineSettings::default());
    capture.start_streams().unwrap();
    assert!(device.is_input_streaming());

    device.fail_call("enable_video_input");
    assert!(capture.enable(DisplayMode::Hd720p50, false, false).is_err());

    assert_eq!(capture.state(), CaptureState::Disabled);
    assert!(!capture.is_streaming());
    assert!(!device.is_input_streaming());
    assert!(!device.has_input_callback());

    let frame = SimFrame::filled(8, 4, PixelFormat::Yuv8, 0);
    device.emit_frame(&frame);

    // An arrival that still reaches the controller is ignored as well
    let video: Arc<dyn VideoFrame> = frame.clone();
    capture
        .input_callback()
        .video_input_frame_arrived(Some(&video), None);

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(capture.stats().frames_received, 0);
    assert_eq!(frame.ref_count(), 1);
}
