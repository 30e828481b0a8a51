//! Captured frame to application image

use std::time::Instant;

use tracing::{debug, warn};

use crate::capture::frame::{Image, PixelFormat};
use crate::device::{ConversionBackend, FrameFlags, Retained, VideoFrame};
use crate::error::{Error, Result};

/// Convert one captured frame, then give the frame's reference back.
///
/// Packed 8-bit YUV and 8-bit RGBA layouts are copied out directly. Anything else
/// goes through the card's colour converter into BGRA. A failure yields an empty
/// image; the frame is released exactly once either way.
pub fn convert_frame(
    frame: Retained<dyn VideoFrame>,
    backend: &dyn ConversionBackend,
    label: &str,
) -> Image {
    let start = Instant::now();

    let converted = match frame.pixel_format().packed_channels() {
        Some(channels) => copy_packed(&*frame, channels),
        None => convert_with_device(&*frame, backend, label),
    };

    let image = converted.unwrap_or_else(|err| {
        warn!("{} Frame conversion failed: {}", label, err);
        metrics::counter!("capture_conversion_failures").increment(1);
        Image::empty()
    });

    metrics::histogram!("capture_conversion_time_us").record(start.elapsed().as_micros() as f64);

    let refs = frame.release();
    debug!("{} Released frame; {} references remain", label, refs);

    image
}

/// View the frame memory in place and copy it out once.
fn copy_packed(frame: &dyn VideoFrame, channels: u8) -> Result<Image> {
    let bytes = frame
        .bytes()
        .map_err(|err| Error::device("GetBytes", err))?;

    Image::from_strided(
        frame.width(),
        frame.height(),
        channels,
        frame.pixel_format(),
        &bytes,
        frame.row_bytes() as usize,
    )
    .ok_or_else(|| {
        Error::Conversion(format!(
            "{}x{} frame with {} byte rows does not fit {} bytes",
            frame.width(),
            frame.height(),
            frame.row_bytes(),
            bytes.len()
        ))
    })
}

fn convert_with_device(
    frame: &dyn VideoFrame,
    backend: &dyn ConversionBackend,
    label: &str,
) -> Result<Image> {
    let width = frame.width();
    let height = frame.height();

    let dst = backend
        .create_video_frame(
            width,
            height,
            PixelFormat::Bgra8.row_bytes(width),
            PixelFormat::Bgra8,
            FrameFlags::DEFAULT,
        )
        .map_err(|err| Error::device("CreateVideoFrame", err))?;

    debug!(
        "{} Converting {} to {}",
        label,
        frame.pixel_format(),
        dst.pixel_format()
    );

    backend
        .convert_frame(frame, &*dst)
        .map_err(|err| Error::device("ConvertFrame", err))?;

    let bytes = dst
        .bytes()
        .map_err(|err| Error::device("GetBytes", err))?;

    Image::from_strided(
        dst.width(),
        dst.height(),
        4,
        PixelFormat::Bgra8,
        &bytes,
        dst.row_bytes() as usize,
    )
    .ok_or_else(|| Error::Conversion("converted frame is smaller than its geometry".into()))
}
