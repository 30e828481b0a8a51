//! Display modes understood by the card and by the camera-control protocol.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DisplayMode {
    Ntsc,
    Pal,
    Hd720p50,
    Hd720p5994,
    Hd720p60,
    Hd1080p2398,
    Hd1080p24,
    Hd1080p25,
    Hd1080p2997,
    Hd1080p30,
    Hd1080p50,
    Hd1080p5994,
    Hd1080p60,
    Hd1080i50,
    Hd1080i5994,
    Hd1080i60,
    Uhd2160p2398,
    Uhd2160p24,
    Uhd2160p25,
    Uhd2160p2997,
    Uhd2160p30,
    Uhd2160p50,
    Uhd2160p5994,
    Uhd2160p60,
}

struct ModeEntry {
    mode: DisplayMode,
    name: &'static str,
    fourcc: [u8; 4],
    width: u32,
    height: u32,
    frame_duration: i64,
    time_scale: i64,
    interlaced: bool,
}

macro_rules! mode {
    ($mode:ident, $name:literal, $cc:literal, $w:literal x $h:literal, $dur:literal / $scale:literal, $il:literal) => {
        ModeEntry {
            mode: DisplayMode::$mode,
            name: $name,
            fourcc: *$cc,
            width: $w,
            height: $h,
            frame_duration: $dur,
            time_scale: $scale,
            interlaced: $il,
        }
    };
}

const MODES: &[ModeEntry] = &[
    mode!(Ntsc, "ntsc", b"ntsc", 720 x 486, 1001 / 30000, true),
    mode!(Pal, "pal", b"pal ", 720 x 576, 1000 / 25000, true),
    mode!(Hd720p50, "720p50", b"hp50", 1280 x 720, 1000 / 50000, false),
    mode!(Hd720p5994, "720p5994", b"hp59", 1280 x 720, 1001 / 60000, false),
    mode!(Hd720p60, "720p60", b"hp60", 1280 x 720, 1000 / 60000, false),
    mode!(Hd1080p2398, "1080p2398", b"23ps", 1920 x 1080, 1001 / 24000, false),
    mode!(Hd1080p24, "1080p24", b"24ps", 1920 x 1080, 1000 / 24000, false),
    mode!(Hd1080p25, "1080p25", b"Hp25", 1920 x 1080, 1000 / 25000, false),
    mode!(Hd1080p2997, "1080p2997", b"Hp29", 1920 x 1080, 1001 / 30000, false),
    mode!(Hd1080p30, "1080p30", b"Hp30", 1920 x 1080, 1000 / 30000, false),
    mode!(Hd1080p50, "1080p50", b"Hp50", 1920 x 1080, 1000 / 50000, false),
    mode!(Hd1080p5994, "1080p5994", b"Hp59", 1920 x 1080, 1001 / 60000, false),
    mode!(Hd1080p60, "1080p60", b"Hp60", 1920 x 1080, 1000 / 60000, false),
    mode!(Hd1080i50, "1080i50", b"Hi50", 1920 x 1080, 1000 / 25000, true),
    mode!(Hd1080i5994, "1080i5994", b"Hi59", 1920 x 1080, 1001 / 30000, true),
    mode!(Hd1080i60, "1080i60", b"Hi60", 1920 x 1080, 1000 / 30000, true),
    mode!(Uhd2160p2398, "2160p2398", b"4k23", 3840 x 2160, 1001 / 24000, false),
    mode!(Uhd2160p24, "2160p24", b"4k24", 3840 x 2160, 1000 / 24000, false),
    mode!(Uhd2160p25, "2160p25", b"4k25", 3840 x 2160, 1000 / 25000, false),
    mode!(Uhd2160p2997, "2160p2997", b"4k29", 3840 x 2160, 1001 / 30000, false),
    mode!(Uhd2160p30, "2160p30", b"4k30", 3840 x 2160, 1000 / 30000, false),
    mode!(Uhd2160p50, "2160p50", b"4k50", 3840 x 2160, 1000 / 50000, false),
    mode!(Uhd2160p5994, "2160p5994", b"4k59", 3840 x 2160, 1001 / 60000, false),
    mode!(Uhd2160p60, "2160p60", b"4k60", 3840 x 2160, 1000 / 60000, false),
];

impl DisplayMode {
    fn entry(self) -> &'static ModeEntry {
        // Every variant has exactly one table row
        MODES
            .iter()
            .find(|entry| entry.mode == self)
            .unwrap_or(&MODES[0])
    }

    pub fn all() -> impl Iterator<Item = DisplayMode> {
        MODES.iter().map(|entry| entry.mode)
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn fourcc(self) -> u32 {
        u32::from_be_bytes(self.entry().fourcc)
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        MODES
            .iter()
            .find(|entry| u32::from_be_bytes(entry.fourcc) == code)
            .map(|entry| entry.mode)
    }

    pub fn width(self) -> u32 {
        self.entry().width
    }

    pub fn height(self) -> u32 {
        self.entry().height
    }

    /// Frame rate as (frame duration, time scale), e.g. 1001/30000 for 29.97.
    pub fn frame_rate(self) -> (i64, i64) {
        let entry = self.entry();
        (entry.frame_duration, entry.time_scale)
    }

    pub fn is_interlaced(self) -> bool {
        self.entry().interlaced
    }

    /// Whether the rate is an NTSC-style 1000/1001 rate.
    pub fn is_fractional(self) -> bool {
        self.entry().frame_duration == 1001
    }

    /// Integer frame rate the camera protocol uses (24 for 23.98, 30 for 29.97, ...).
    pub fn nominal_rate(self) -> u8 {
        let (duration, scale) = self.frame_rate();
        ((scale + duration - 1) / duration) as u8
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DisplayMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        MODES
            .iter()
            .find(|entry| entry.name == wanted)
            .map(|entry| entry.mode)
            .ok_or_else(|| Error::InvalidMode(s.to_string()))
    }
}

impl TryFrom<String> for DisplayMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DisplayMode> for String {
    fn from(mode: DisplayMode) -> Self {
        mode.name().to_string()
    }
}
