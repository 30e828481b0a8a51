//! Camera control packets carried to the camera over the SDI return feed
//!
//! Each packet is a 4-byte header (destination, length, command id, reserved)
//! followed by category, parameter, data type and operation, then the payload in
//! little-endian order, padded out to a 32-bit boundary.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{info, warn};

use crate::command::CommandBuffer;
use crate::device::DisplayMode;
use crate::error::{Error, Result};

/// Command id for "change configuration".
const CHANGE_CONFIGURATION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Void = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Utf8 = 5,
    /// Signed 5.11 fixed point
    Fixed16 = 128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Assign = 0,
    Offset = 1,
}

/// Which automatic exposure the camera runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AutoExposureMode {
    Manual = 0,
    Iris = 1,
    Shutter = 2,
    IrisShutter = 3,
    ShutterIris = 4,
}

/// Where the camera takes its genlock reference from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReferenceSource {
    Internal = 0,
    Program = 1,
    External = 2,
}

/// One encoded camera control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(Bytes);

impl Command {
    fn encode(
        camera: u8,
        category: u8,
        parameter: u8,
        data_type: DataType,
        operation: Operation,
        payload: &[u8],
    ) -> Self {
        let len = 4 + payload.len();
        let padded = (len + 3) & !3;

        let mut buf = BytesMut::with_capacity(4 + padded);
        buf.put_u8(camera);
        buf.put_u8(len as u8);
        buf.put_u8(CHANGE_CONFIGURATION);
        buf.put_u8(0);

        buf.put_u8(category);
        buf.put_u8(parameter);
        buf.put_u8(data_type as u8);
        buf.put_u8(operation as u8);
        buf.put_slice(payload);
        buf.put_bytes(0, padded - len);

        Self(buf.freeze())
    }

    fn fixed16(value: f32) -> [u8; 2] {
        let fixed = (value * 2048.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        fixed.to_le_bytes()
    }

    /// Absolute focus, 0.0 is near and 1.0 is far.
    pub fn focus(camera: u8, value: f32) -> Self {
        Self::encode(camera, 0, 0, DataType::Fixed16, Operation::Assign, &Self::fixed16(value))
    }

    pub fn focus_offset(camera: u8, delta: f32) -> Self {
        Self::encode(camera, 0, 0, DataType::Fixed16, Operation::Offset, &Self::fixed16(delta))
    }

    pub fn instantaneous_autofocus(camera: u8) -> Self {
        Self::encode(camera, 0, 1, DataType::Void, Operation::Assign, &[])
    }

    pub fn aperture_ordinal_offset(camera: u8, delta: i16) -> Self {
        Self::encode(camera, 0, 4, DataType::Int16, Operation::Offset, &delta.to_le_bytes())
    }

    /// Video mode as the camera protocol spells it.
    pub fn video_mode(camera: u8, mode: DisplayMode) -> Self {
        let dimensions = match mode.height() {
            486 => 0,
            576 => 1,
            720 => 2,
            1080 => 3,
            _ => 6,
        };
        let payload = [
            mode.nominal_rate(),
            u8::from(mode.is_fractional()),
            dimensions,
            u8::from(mode.is_interlaced()),
            0, // YUV
        ];
        Self::encode(camera, 1, 0, DataType::Int8, Operation::Assign, &payload)
    }

    /// Sensor gain as a multiple of ISO 100.
    pub fn sensor_gain(camera: u8, gain: u8) -> Self {
        Self::encode(camera, 1, 1, DataType::Int8, Operation::Assign, &[gain])
    }

    /// Nudge colour temperature (kelvin) and tint.
    pub fn white_balance_offset(camera: u8, temperature: i16, tint: i16) -> Self {
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&temperature.to_le_bytes());
        payload[2..].copy_from_slice(&tint.to_le_bytes());
        Self::encode(camera, 1, 2, DataType::Int16, Operation::Offset, &payload)
    }

    pub fn auto_white_balance(camera: u8) -> Self {
        Self::encode(camera, 1, 3, DataType::Void, Operation::Assign, &[])
    }

    pub fn restore_white_balance(camera: u8) -> Self {
        Self::encode(camera, 1, 4, DataType::Void, Operation::Assign, &[])
    }

    pub fn exposure_ordinal(camera: u8, ordinal: u16) -> Self {
        let ordinal = ordinal.min(i16::MAX as u16) as i16;
        Self::encode(camera, 1, 6, DataType::Int16, Operation::Assign, &ordinal.to_le_bytes())
    }

    pub fn auto_exposure_mode(camera: u8, mode: AutoExposureMode) -> Self {
        Self::encode(camera, 1, 10, DataType::Int8, Operation::Assign, &[mode as u8])
    }

    pub fn reference_source(camera: u8, source: ReferenceSource) -> Self {
        Self::encode(camera, 6, 0, DataType::Int8, Operation::Assign, &[source as u8])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Operator actions the control loop maps keys onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    InstantAutofocus,
    FocusNear,
    FocusFar,
    ApertureUp,
    ApertureDown,
    ExposureDown,
    ExposureUp,
    GainUp,
    GainDown,
    AutoWhiteBalance,
    RestoreWhiteBalance,
    WhiteBalanceDown,
    WhiteBalanceUp,
}

impl ControlAction {
    /// Keyboard layout of the viewer tool.
    pub fn from_key(key: char) -> Option<Self> {
        let action = match key {
            'f' => Self::InstantAutofocus,
            '[' => Self::FocusFar,
            ']' => Self::FocusNear,
            ';' => Self::ApertureUp,
            '\'' => Self::ApertureDown,
            '.' => Self::ExposureDown,
            '/' => Self::ExposureUp,
            'z' => Self::GainUp,
            'x' => Self::GainDown,
            'w' => Self::AutoWhiteBalance,
            'e' => Self::RestoreWhiteBalance,
            'r' => Self::WhiteBalanceDown,
            't' => Self::WhiteBalanceUp,
            _ => return None,
        };
        Some(action)
    }
}

/// Gain and exposure the operator has dialled in for one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    camera: u8,
    gain: u8,
    exposure: u16,
}

impl ControlState {
    pub fn new(camera: u8) -> Self {
        Self {
            camera,
            gain: 1,
            exposure: 0,
        }
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }

    pub fn exposure(&self) -> u16 {
        self.exposure
    }

    /// Update the trackers for `action` and build the command to send.
    pub fn command(&mut self, action: ControlAction) -> Command {
        let camera = self.camera;
        match action {
            ControlAction::InstantAutofocus => {
                info!("Sending instantaneous autofocus to camera");
                Command::instantaneous_autofocus(camera)
            }
            ControlAction::FocusFar => {
                info!("Sending focus increment to camera");
                Command::focus_offset(camera, 0.05)
            }
            ControlAction::FocusNear => {
                info!("Sending focus decrement to camera");
                Command::focus_offset(camera, -0.05)
            }
            ControlAction::ApertureUp => {
                info!("Sending aperture increment to camera");
                Command::aperture_ordinal_offset(camera, 1)
            }
            ControlAction::ApertureDown => {
                info!("Sending aperture decrement to camera");
                Command::aperture_ordinal_offset(camera, -1)
            }
            ControlAction::ExposureDown => {
                self.exposure = self.exposure.saturating_sub(1);
                info!("Setting exposure to {}", self.exposure);
                Command::exposure_ordinal(camera, self.exposure)
            }
            ControlAction::ExposureUp => {
                self.exposure = self.exposure.saturating_add(1);
                info!("Setting exposure to {}", self.exposure);
                Command::exposure_ordinal(camera, self.exposure)
            }
            ControlAction::GainUp => {
                self.gain = if self.gain >= 16 { 1 } else { self.gain << 1 };
                info!("Sending gain ISO {} to camera", 100 * self.gain as u32);
                Command::sensor_gain(camera, self.gain)
            }
            ControlAction::GainDown => {
                self.gain = if self.gain > 1 { self.gain >> 1 } else { 16 };
                info!("Sending gain ISO {} to camera", 100 * self.gain as u32);
                Command::sensor_gain(camera, self.gain)
            }
            ControlAction::AutoWhiteBalance => {
                info!("Auto white balance");
                Command::auto_white_balance(camera)
            }
            ControlAction::RestoreWhiteBalance => {
                info!("Restore white balance");
                Command::restore_white_balance(camera)
            }
            ControlAction::WhiteBalanceDown => {
                info!("Sending decrement to white balance");
                Command::white_balance_offset(camera, -500, 0)
            }
            ControlAction::WhiteBalanceUp => {
                info!("Sending increment to white balance");
                Command::white_balance_offset(camera, 500, 0)
            }
        }
    }

    /// Build the command for `action` and queue it for the next output frame.
    pub fn apply(&mut self, action: ControlAction, buffer: &CommandBuffer) -> Result<()> {
        let command = self.command(action);
        buffer.acquire_write().append(command.as_bytes())
    }
}

/// Commands sent once at start-up to put the camera in a known state.
pub fn initial_configuration(camera: u8, mode: Option<DisplayMode>) -> Vec<Command> {
    let mut commands = vec![
        Command::auto_exposure_mode(camera, AutoExposureMode::Shutter),
        Command::reference_source(camera, ReferenceSource::Program),
    ];
    if let Some(mode) = mode {
        info!("Sending video mode {} to camera", mode);
        commands.push(Command::video_mode(camera, mode));
    }
    commands
}

/// Queue several commands under one write lock, all or nothing.
pub fn queue_commands(buffer: &CommandBuffer, commands: &[Command]) -> Result<()> {
    let mut guard = buffer.acquire_write();
    let total: usize = commands.iter().map(Command::len).sum();
    let available = guard.remaining();
    if total > available {
        warn!(
            "{} commands ({} bytes) do not fit, {} bytes free",
            commands.len(),
            total,
            available
        );
        return Err(Error::CommandOverflow {
            requested: total,
            available,
        });
    }
    for command in commands {
        guard.append(command.as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autofocus_packet() {
        let command = Command::instantaneous_autofocus(1);
        assert_eq!(command.as_bytes(), &[1, 4, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_focus_offset_is_fixed_point() {
        let command = Command::focus_offset(1, -0.05);
        // -0.05 * 2048 = -102.4 -> -102
        let value = (-102i16).to_le_bytes();
        assert_eq!(
            command.as_bytes(),
            &[1, 6, 0, 0, 0, 0, 128, 1, value[0], value[1], 0, 0]
        );
    }

    #[test]
    fn test_video_mode_packet() {
        let command = Command::video_mode(2, DisplayMode::Hd1080p2997);
        assert_eq!(
            command.as_bytes(),
            &[2, 9, 0, 0, 1, 0, 1, 0, 30, 1, 3, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_packets_are_word_aligned() {
        let commands = [
            Command::sensor_gain(1, 4),
            Command::white_balance_offset(1, 500, 0),
            Command::exposure_ordinal(1, 3),
            Command::reference_source(1, ReferenceSource::External),
        ];
        for command in commands {
            let declared = command.as_bytes()[1] as usize;
            assert_eq!(command.len() % 4, 0);
            assert!(command.len() >= 4 + declared);
            assert!(command.len() < 4 + declared + 4);
        }
    }

    #[test]
    fn test_gain_cycles() {
        let mut state = ControlState::new(1);
        let gains: Vec<u8> = (0..6)
            .map(|_| {
                state.command(ControlAction::GainUp);
                state.gain()
            })
            .collect();
        assert_eq!(gains, vec![2, 4, 8, 16, 1, 2]);

        let mut state = ControlState::new(1);
        state.command(ControlAction::GainDown);
        assert_eq!(state.gain(), 16);
    }

    #[test]
    fn test_exposure_saturates_at_zero() {
        let mut state = ControlState::new(1);
        state.command(ControlAction::ExposureDown);
        assert_eq!(state.exposure(), 0);
        state.command(ControlAction::ExposureUp);
        state.command(ControlAction::ExposureUp);
        assert_eq!(state.exposure(), 2);
    }

    #[test]
    fn test_apply_writes_to_buffer() {
        let buffer = CommandBuffer::new();
        let mut state = ControlState::new(1);
        state.apply(ControlAction::AutoWhiteBalance, &buffer).unwrap();
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_queue_commands_is_all_or_nothing() {
        let buffer = CommandBuffer::new();
        let too_many: Vec<Command> = (0..40).map(|_| Command::sensor_gain(1, 2)).collect();
        let requested = 40 * too_many[0].len();
        match queue_commands(&buffer, &too_many) {
            Err(Error::CommandOverflow {
                requested: r,
                available,
            }) => {
                assert_eq!(r, requested);
                assert_eq!(available, crate::command::COMMAND_CAPACITY);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
        assert!(buffer.is_empty());

        let startup = initial_configuration(1, Some(DisplayMode::Hd1080p2997));
        queue_commands(&buffer, &startup).unwrap();
        assert_eq!(buffer.len(), 12 + 12 + 16);
    }

    #[test]
    fn test_keys() {
        assert_eq!(ControlAction::from_key('z'), Some(ControlAction::GainUp));
        assert_eq!(ControlAction::from_key('q'), None);
    }
}
