//! SDI bridge demo: capture and camera control against the simulated card

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use sdi_bridge::control::{self, ControlAction, ControlState};
use sdi_bridge::device::sim::{SimDevice, SimFrame};
use sdi_bridge::device::CompletionResult;
use sdi_bridge::{utils, CaptureController, Config, PlaybackScheduler};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdi_bridge=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("sdi-bridge launching...");

    // Usage: sdi-bridge [config.toml] [mode|detect]
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("SDI_BRIDGE_CONFIG").map(PathBuf::from));
    let mut config = Config::load(path.as_deref())?;

    let mut detect = false;
    if let Some(name) = args.next() {
        let (mode, forced) = utils::resolve_startup_mode(&name)?;
        config.input.mode = mode;
        config.input.auto_detect |= forced;
        detect = forced;
    }

    let device = SimDevice::new();
    let capture = CaptureController::new(
        device.clone(),
        device.clone(),
        &config.input,
        &config.pipeline,
    )?;
    let playback = Arc::new(PlaybackScheduler::new(device.clone(), &config.output));

    capture.set_frame_set_callback(|set| {
        let sizes: Vec<String> = set
            .images
            .iter()
            .map(|image| format!("{}x{}x{}", image.width, image.height, image.channels))
            .collect();
        info!("Frame set {}: {}", set.sequence, sizes.join(", "));
    });
    {
        let playback = Arc::clone(&playback);
        capture.set_format_changed_callback(move |mode| playback.input_format_changed(mode));
    }

    let input = &config.input;
    capture.enable(input.mode, input.auto_detect, input.stereo)?;
    playback.enable()?;
    capture.start_streams()?;
    playback.start_streams()?;
    info!("Streams started!");

    let commands = playback.command_buffer();
    if config.output.configure_camera {
        info!("Sending configuration to cameras");
        let startup = control::initial_configuration(
            config.output.camera,
            (!detect).then_some(input.mode),
        );
        control::queue_commands(&commands, &startup)?;
    }

    // The card's side: one arrival and one completion per frame period
    let (duration, scale) = input.mode.frame_rate();
    let period = Duration::from_secs_f64(duration as f64 / scale as f64);
    let width = input.mode.width();
    let height = input.mode.height();
    let frame = if input.stereo {
        SimFrame::stereo_pair(width, height, input.pixel_format, 0x40, 0x80).0
    } else {
        SimFrame::filled(width, height, input.pixel_format, 0x40)
    };
    let no_signal = SimFrame::no_signal(width, height, input.pixel_format);

    let driver = {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            let mut count: u64 = 0;
            loop {
                tick.tick().await;
                count += 1;
                if count % 300 == 0 {
                    device.emit_frame(&no_signal);
                } else {
                    device.emit_frame(&frame);
                }
                device.complete_next(CompletionResult::Completed);
            }
        })
    };

    // Stand-in for the operator: step the gain every few seconds
    let mut controls = ControlState::new(config.output.camera);
    let mut control_tick = tokio::time::interval(Duration::from_secs(5));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = control_tick.tick() => {
                if let Err(err) = controls.apply(ControlAction::GainUp, &commands) {
                    warn!("Unable to queue gain change: {}", err);
                }
                info!("Capture stats: {:?}", capture.stats());
            }
            result = &mut ctrl_c => {
                result?;
                break;
            }
        }
    }

    info!("End of main loop, stopping streams...");
    driver.abort();

    if let Err(err) = capture.stop_streams() {
        warn!("{}", err);
    }
    playback.disable()?;
    capture.disable()?;

    info!("Final capture stats: {:?}", capture.stats());
    info!("sdi-bridge shutting down");
    Ok(())
}
