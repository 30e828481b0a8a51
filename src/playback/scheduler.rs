//! Completion-paced playback scheduling

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::command::CommandBuffer;
use crate::device::{
    same_frame, CompletionCallback, CompletionResult, DisplayMode, OutputFlags, PlaybackDevice,
    Retained, VideoFrame,
};
use crate::error::{Error, Result};
use crate::playback::frames;
use crate::OutputSettings;

/// Output timing fixed at enable time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub mode: DisplayMode,
    pub frame_duration: i64,
    pub time_scale: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Disabled,
    /// An enable call is negotiating with the card
    Enabling,
    /// Enabled and seeded, playback not started
    Enabled,
    Streaming,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Disabled => "disabled",
            PlaybackState::Enabling => "enabling",
            PlaybackState::Enabled => "enabled",
            PlaybackState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Keeps the output fed, one frame per completion.
///
/// Each completed frame triggers exactly one new schedule: a frame carrying the
/// pending camera commands if there are any, otherwise the reusable blank frame.
pub struct PlaybackScheduler {
    inner: Arc<PlaybackInner>,
}

struct PlaybackInner {
    device: Arc<dyn PlaybackDevice>,
    this: Weak<PlaybackInner>,
    mode: DisplayMode,
    state: Mutex<PlaybackState>,
    config: ArcSwapOption<PlaybackConfig>,
    /// Time units scheduled so far, in frames
    scheduled: AtomicU64,
    blank: ArcSwapOption<Retained<dyn VideoFrame>>,
    commands: Arc<CommandBuffer>,
}

impl PlaybackScheduler {
    pub fn new(device: Arc<dyn PlaybackDevice>, settings: &OutputSettings) -> Self {
        Self::with_command_buffer(device, settings, Arc::new(CommandBuffer::new()))
    }

    pub fn with_command_buffer(
        device: Arc<dyn PlaybackDevice>,
        settings: &OutputSettings,
        commands: Arc<CommandBuffer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| PlaybackInner {
            device,
            this: this.clone(),
            mode: settings.mode,
            state: Mutex::new(PlaybackState::Disabled),
            config: ArcSwapOption::empty(),
            scheduled: AtomicU64::new(0),
            blank: ArcSwapOption::empty(),
            commands,
        });
        Self { inner }
    }

    /// Enable the output and seed it with one blank frame at time zero.
    ///
    /// Nothing in the scheduler changes unless every step succeeds.
    #[instrument(skip(self), fields(mode = %self.inner.mode))]
    pub fn enable(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != PlaybackState::Disabled {
                return Err(Error::InvalidState(format!("output is {}", *state)));
            }
            *state = PlaybackState::Enabling;
        }

        match self.inner.bring_up() {
            Ok((config, blank)) => {
                let inner = &self.inner;
                inner.config.store(Some(Arc::new(config)));
                inner.blank.store(Some(Arc::new(blank)));
                inner.scheduled.store(1, Ordering::Release);
                *inner.state.lock() = PlaybackState::Enabled;

                debug!("Video output initialized");
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock() = PlaybackState::Disabled;
                Err(err)
            }
        }
    }

    /// Put a frame on the output after everything scheduled so far.
    ///
    /// The frame is shown at `scheduled × frame duration` for `repeats` frames.
    /// Only the completion callback and the enable path should call this while
    /// streaming; the counter has a single writer.
    pub fn schedule_frame(&self, frame: &Arc<dyn VideoFrame>, repeats: u32) -> Result<()> {
        self.inner.schedule_frame(frame, repeats)
    }

    /// Start playback, enabling first if needed.
    pub fn start_streams(&self) -> Result<()> {
        if self.state() == PlaybackState::Disabled {
            self.enable()?;
        }

        let config = self.inner.current_config()?;
        debug!("Starting scheduled playback");
        self.inner
            .device
            .start_scheduled_playback(0, config.time_scale, 1.0)
            .map_err(|err| {
                warn!("Could not start video output: {}", err);
                Error::device("StartScheduledPlayback", err)
            })?;

        *self.inner.state.lock() = PlaybackState::Streaming;
        Ok(())
    }

    pub fn stop_streams(&self) -> Result<()> {
        let config = self.inner.current_config()?;
        debug!("Stopping scheduled playback");
        let stopped_at = self
            .inner
            .device
            .stop_scheduled_playback(0, config.time_scale)
            .map_err(|err| {
                warn!("Could not stop video playback: {}", err);
                Error::device("StopScheduledPlayback", err)
            })?;
        debug!("Playback stopped at {}", stopped_at);

        *self.inner.state.lock() = PlaybackState::Enabled;
        Ok(())
    }

    /// Stop if streaming, turn the output off and drop the blank frame.
    pub fn disable(&self) -> Result<()> {
        if self.state() == PlaybackState::Streaming {
            if let Err(err) = self.stop_streams() {
                warn!("Continuing disable after failed stop: {}", err);
            }
        }

        self.inner.device.disable_video_output().map_err(|err| {
            warn!("Could not disable video output: {}", err);
            Error::device("DisableVideoOutput", err)
        })?;
        if let Err(err) = self.inner.device.set_completion_callback(None) {
            warn!("Unable to clear completion callback: {}", err);
        }

        self.inner.blank.store(None);
        self.inner.config.store(None);
        *self.inner.state.lock() = PlaybackState::Disabled;
        info!("Video output disabled");
        Ok(())
    }

    /// Hook for the capture side's format change notification.
    pub fn input_format_changed(&self, mode: DisplayMode) {
        info!("Input mode has changed to {}", mode);
    }

    /// Buffer whose contents ride out on the next completed frame.
    pub fn command_buffer(&self) -> Arc<CommandBuffer> {
        Arc::clone(&self.inner.commands)
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> Option<PlaybackConfig> {
        self.inner.config.load_full().map(|config| *config)
    }

    /// Frames' worth of time scheduled so far.
    pub fn scheduled_count(&self) -> u64 {
        self.inner.scheduled.load(Ordering::Acquire)
    }

    /// The reusable filler frame, while enabled.
    pub fn blank_frame(&self) -> Option<Arc<dyn VideoFrame>> {
        self.inner
            .blank
            .load_full()
            .map(|blank| Arc::clone(blank.as_arc()))
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.inner.device.set_completion_callback(None) {
            debug!("Unable to clear completion callback on drop: {}", err);
        }
    }
}

impl PlaybackInner {
    /// Query, enable and seed the output. Undoes the enable if seeding fails.
    fn bring_up(&self) -> Result<(PlaybackConfig, Retained<dyn VideoFrame>)> {
        let mode = self.mode;
        let info = self
            .device
            .query_output_mode(mode, OutputFlags::VANC)
            .map_err(|err| {
                warn!("Unable to query output modes: {}", err);
                Error::device("DoesSupportVideoMode", err)
            })?
            .ok_or_else(|| {
                warn!("Display mode {} not supported for output", mode);
                Error::unsupported(format!("output mode {}", mode))
            })?;

        info!("Enabling output with mode {} and VANC", mode);
        self.device
            .enable_video_output(mode, OutputFlags::VANC)
            .map_err(|err| {
                warn!("Could not enable video output: {}", err);
                Error::device("EnableVideoOutput", err)
            })?;

        let config = PlaybackConfig {
            mode: info.mode,
            frame_duration: info.frame_duration,
            time_scale: info.time_scale,
        };

        let blank = match self.seed(&config) {
            Ok(blank) => blank,
            Err(err) => {
                warn!("Unable to seed output: {}", err);
                if let Err(err) = self.device.set_completion_callback(None) {
                    debug!("Unable to clear completion callback: {}", err);
                }
                if let Err(err) = self.device.disable_video_output() {
                    warn!("Unable to disable video output after failure: {}", err);
                }
                return Err(err);
            }
        };

        Ok((config, blank))
    }

    fn current_config(&self) -> Result<Arc<PlaybackConfig>> {
        self.config
            .load_full()
            .ok_or_else(|| Error::InvalidState("output is not enabled".into()))
    }

    /// Register for completions and queue the first blank frame at time zero.
    fn seed(&self, config: &PlaybackConfig) -> Result<Retained<dyn VideoFrame>> {
        let this: Arc<dyn CompletionCallback> = self
            .this
            .upgrade()
            .ok_or_else(|| Error::InvalidState("playback scheduler is shutting down".into()))?;
        self.device
            .set_completion_callback(Some(this))
            .map_err(|err| Error::device("SetScheduledFrameCompletionCallback", err))?;

        let blank = frames::blank_frame(&*self.device, config.mode)?;
        self.device
            .schedule_video_frame(blank.as_arc(), 0, config.frame_duration, config.time_scale)
            .map_err(|err| Error::device("ScheduleVideoFrame", err))?;
        metrics::counter!("playback_frames_scheduled").increment(1);

        Ok(blank)
    }

    fn schedule_frame(&self, frame: &Arc<dyn VideoFrame>, repeats: u32) -> Result<()> {
        let config = self.current_config()?;
        let count = self.scheduled.load(Ordering::Acquire);
        debug!("Scheduling frame {}", count);

        self.device
            .schedule_video_frame(
                frame,
                count as i64 * config.frame_duration,
                config.frame_duration * repeats as i64,
                config.time_scale,
            )
            .map_err(|err| Error::device("ScheduleVideoFrame", err))?;

        self.scheduled.store(count + repeats as u64, Ordering::Release);
        metrics::counter!("playback_frames_scheduled").increment(1);
        Ok(())
    }

    /// Build a frame from the pending commands and put it out at the stream clock.
    fn schedule_commands(
        &self,
        commands: &[u8],
        stream_time: Option<i64>,
        config: &PlaybackConfig,
    ) -> Result<()> {
        info!(
            "Scheduling frame with {} bytes of camera commands",
            commands.len()
        );
        let frame =
            frames::with_embedded_commands(&*self.device, config.mode, commands, true)?;

        match stream_time {
            Some(time) => {
                self.device
                    .schedule_video_frame(
                        frame.as_arc(),
                        time,
                        config.frame_duration,
                        config.time_scale,
                    )
                    .map_err(|err| Error::device("ScheduleVideoFrame", err))?;
                metrics::counter!("playback_frames_scheduled").increment(1);
            }
            None => self.schedule_frame(frame.as_arc(), 1)?,
        }
        metrics::counter!("playback_command_frames").increment(1);

        // Our reference comes back through the completion callback
        let _ = frame.leak();
        Ok(())
    }

    fn schedule_blank(&self) -> Result<()> {
        let blank = self
            .blank
            .load_full()
            .ok_or_else(|| Error::InvalidState("no blank frame".into()))?;
        self.schedule_frame(blank.as_arc(), 1)
    }
}

impl CompletionCallback for PlaybackInner {
    fn scheduled_frame_completed(&self, frame: Arc<dyn VideoFrame>, result: CompletionResult) {
        let blank = self.blank.load_full();
        let is_blank = blank
            .as_ref()
            .is_some_and(|blank| same_frame(blank.as_arc(), &frame));

        let config = self.config.load_full();

        if let Some(config) = &config {
            match self
                .device
                .frame_completion_reference_timestamp(&*frame, config.time_scale)
            {
                Ok(at) => debug!("Completed a frame at {} with result {:?}", at, result),
                Err(err) => warn!("Unable to get completion timestamp: {}", err),
            }
        }
        match result {
            CompletionResult::Completed | CompletionResult::Flushed => {}
            CompletionResult::DisplayedLate => warn!("Frame displayed late"),
            CompletionResult::Dropped => warn!("Frame dropped by the output"),
        }

        if !is_blank {
            let refs = Retained::adopt(frame).release();
            debug!("Released completed frame, {} references remain", refs);
        }

        // Flushed frames come back while the output is shutting down
        if result == CompletionResult::Flushed {
            return;
        }
        let Some(config) = config else {
            warn!("Completion while output is disabled");
            return;
        };

        let stream_time = match self.device.scheduled_stream_time(config.time_scale) {
            Ok((time, speed)) => {
                debug!("Stream time {} at speed {}", time, speed);
                Some(time)
            }
            Err(err) => {
                warn!("Unable to get stream time: {}", err);
                None
            }
        };

        let scheduled = self.commands.drain_with(|commands| {
            if commands.is_empty() {
                self.schedule_blank()
            } else {
                self.schedule_commands(commands, stream_time, &config)
            }
        });

        if let Err(err) = scheduled {
            error!("Scheduling after completion failed: {}", err);
        }
    }

    fn scheduled_playback_has_stopped(&self) {
        debug!("Scheduled playback has stopped");
    }
}
