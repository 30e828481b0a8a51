//! Frames built for the output

use tracing::debug;

use crate::device::{DisplayMode, FrameFactory, FrameFlags, PixelFormat, Retained, VideoFrame};
use crate::error::{Error, Result};
use crate::playback::ancillary::{self, CAMERA_CONTROL_LINE};

/// Output frames are 8-bit YUV.
pub const OUTPUT_FORMAT: PixelFormat = PixelFormat::Yuv8;

/// One black UYVY pixel pair half: chroma at zero, luma at video black.
const BLACK: [u8; 2] = [0x80, 0x10];

fn allocate<F: FrameFactory + ?Sized>(factory: &F, mode: DisplayMode) -> Result<Retained<dyn VideoFrame>> {
    let width = mode.width();
    factory
        .create_video_frame(
            width,
            mode.height(),
            OUTPUT_FORMAT.row_bytes(width),
            OUTPUT_FORMAT,
            FrameFlags::DEFAULT,
        )
        .map_err(|err| Error::device("CreateVideoFrame", err))
}

fn fill_black(frame: &dyn VideoFrame) -> Result<()> {
    let mut bytes = frame
        .bytes_mut()
        .map_err(|err| Error::device("GetBytes", err))?;
    for pair in bytes.chunks_exact_mut(2) {
        pair.copy_from_slice(&BLACK);
    }
    Ok(())
}

/// A black frame matching the output mode.
pub fn blank_frame<F: FrameFactory + ?Sized>(
    factory: &F,
    mode: DisplayMode,
) -> Result<Retained<dyn VideoFrame>> {
    let frame = allocate(factory, mode)?;
    fill_black(&*frame)?;
    Ok(frame)
}

/// A frame carrying `commands` as a camera control packet in its VANC.
///
/// A key frame also has its picture cleared to black.
pub fn with_embedded_commands<F: FrameFactory + ?Sized>(
    factory: &F,
    mode: DisplayMode,
    commands: &[u8],
    key_frame: bool,
) -> Result<Retained<dyn VideoFrame>> {
    let words = ancillary::encode_packet(commands).ok_or(Error::CommandOverflow {
        requested: commands.len(),
        available: ancillary::MAX_PAYLOAD,
    })?;

    let frame = allocate(factory, mode)?;
    if key_frame {
        fill_black(&*frame)?;
    }

    frame
        .write_ancillary(CAMERA_CONTROL_LINE, &words)
        .map_err(|err| Error::device("SetBufferForVerticalBlankingLine", err))?;
    debug!(
        "Embedded {} command bytes on line {}",
        commands.len(),
        CAMERA_CONTROL_LINE
    );

    Ok(frame)
}
