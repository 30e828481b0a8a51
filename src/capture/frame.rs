//! Captured images and the frame sets they are delivered in

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire pixel formats a card can capture or play out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 YUV, `UYVY` ordering ("2vuy")
    Yuv8,
    /// 10-bit 4:2:2 YUV packed in 128-byte blocks of 48 pixels ("v210")
    #[default]
    Yuv10,
    /// 8-bit ARGB
    Argb8,
    /// 8-bit BGRA
    Bgra8,
    /// 10-bit RGB ("r210")
    Rgb10,
    /// 12-bit RGB ("R12B")
    Rgb12,
}

impl PixelFormat {
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Yuv8 => u32::from_be_bytes(*b"2vuy"),
            PixelFormat::Yuv10 => u32::from_be_bytes(*b"v210"),
            PixelFormat::Argb8 => 32,
            PixelFormat::Bgra8 => u32::from_be_bytes(*b"BGRA"),
            PixelFormat::Rgb10 => u32::from_be_bytes(*b"r210"),
            PixelFormat::Rgb12 => u32::from_be_bytes(*b"R12B"),
        }
    }

    /// Minimum row stride for a frame `width` pixels wide.
    pub fn row_bytes(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuv8 => width * 2,
            PixelFormat::Yuv10 => width.div_ceil(48) * 128,
            PixelFormat::Argb8 | PixelFormat::Bgra8 => width * 4,
            PixelFormat::Rgb10 => width.div_ceil(64) * 256,
            PixelFormat::Rgb12 => width.div_ceil(8) * 36,
        }
    }

    /// Channel count when the wire layout can be copied out as-is.
    ///
    /// `None` means the frame has to go through the card's colour converter.
    pub fn packed_channels(&self) -> Option<u8> {
        match self {
            PixelFormat::Yuv8 => Some(2),
            PixelFormat::Argb8 | PixelFormat::Bgra8 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Yuv8 => write!(f, "8-bit YUV 4:2:2"),
            PixelFormat::Yuv10 => write!(f, "10-bit YUV 4:2:2"),
            PixelFormat::Argb8 => write!(f, "8-bit ARGB"),
            PixelFormat::Bgra8 => write!(f, "8-bit BGRA"),
            PixelFormat::Rgb10 => write!(f, "10-bit RGB"),
            PixelFormat::Rgb12 => write!(f, "12-bit RGB"),
        }
    }
}

/// An application-facing image with tightly packed rows.
///
/// The pixel data is immutable and cheap to clone, so a frame set can be fanned
/// out to several consumers without copying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Layout of `data`: the wire format for copied frames, BGRA for converted ones
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Image {
    /// Placeholder for a slot whose conversion failed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Copy `height` rows of `width * channels` bytes out of a strided source.
    pub fn from_strided(
        width: u32,
        height: u32,
        channels: u8,
        format: PixelFormat,
        src: &[u8],
        stride: usize,
    ) -> Option<Self> {
        let row = width as usize * channels as usize;
        if stride < row || height == 0 {
            return None;
        }
        let needed = stride * (height as usize - 1) + row;
        if src.len() < needed {
            return None;
        }

        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            data.extend_from_slice(&src[start..start + row]);
        }

        Some(Self {
            width,
            height,
            channels,
            format,
            data: Bytes::from(data),
        })
    }
}

/// The images produced from one capture event: one for mono, left/right for stereo.
#[derive(Debug, Clone, Default)]
pub struct FrameSet {
    /// Arrival sequence number of the event this set came from
    pub sequence: u64,
    pub images: Vec<Image>,
}

impl FrameSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn is_stereo(&self) -> bool {
        self.images.len() == 2
    }

    pub fn primary(&self) -> Option<&Image> {
        self.images.first()
    }

    /// Right-eye image of a stereo set.
    pub fn secondary(&self) -> Option<&Image> {
        self.images.get(1)
    }
}

impl IntoIterator for FrameSet {
    type Item = Image;
    type IntoIter = std::vec::IntoIter<Image>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_bytes() {
        assert_eq!(PixelFormat::Yuv8.row_bytes(1920), 3840);
        assert_eq!(PixelFormat::Yuv10.row_bytes(1920), 5120);
        assert_eq!(PixelFormat::Bgra8.row_bytes(1280), 5120);
        assert_eq!(PixelFormat::Rgb10.row_bytes(1920), 7680);
    }

    #[test]
    fn test_packed_channels() {
        assert_eq!(PixelFormat::Yuv8.packed_channels(), Some(2));
        assert_eq!(PixelFormat::Argb8.packed_channels(), Some(4));
        assert_eq!(PixelFormat::Bgra8.packed_channels(), Some(4));
        assert_eq!(PixelFormat::Yuv10.packed_channels(), None);
        assert_eq!(PixelFormat::Rgb12.packed_channels(), None);
    }

    #[test]
    fn test_from_strided_drops_padding() {
        // 2x2 image, 2 channels, stride padded to 6 bytes
        let src = [1, 2, 3, 4, 0xAA, 0xAA, 5, 6, 7, 8];
        let image = Image::from_strided(2, 2, 2, PixelFormat::Yuv8, &src, 6).unwrap();
        assert_eq!(&image.data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.row_bytes(), 4);
    }

    #[test]
    fn test_from_strided_rejects_short_source() {
        let src = [0u8; 7];
        assert!(Image::from_strided(2, 2, 2, PixelFormat::Yuv8, &src, 4).is_none());
        assert!(Image::from_strided(4, 1, 2, PixelFormat::Yuv8, &src, 4).is_none());
    }

    #[test]
    fn test_frame_set_order() {
        let left = Image {
            width: 1,
            ..Image::default()
        };
        let right = Image {
            width: 2,
            ..Image::default()
        };
        let set = FrameSet {
            sequence: 3,
            images: vec![left, right],
        };
        assert!(set.is_stereo());
        assert_eq!(set.primary().map(|i| i.width), Some(1));
        assert_eq!(set.secondary().map(|i| i.width), Some(2));
    }
}
