//! Host commands and device telemetry that are not raw samples.
//!
//! The board parses host commands with the same framing it uses for
//! telemetry, so every command here is a [`Frame`] on the wire.

use crate::protocol::{unpack_f32s, unpack_sample, DecodeError, Frame, FrameError};
use crate::types::ImuSample;
use glam::Quat;
use std::io::Write;

/// Command ids understood by the board.
pub mod command {
    pub const RESET: u8 = 0x00;
    pub const ECHO: u8 = 0x01;
    pub const BEGIN_OWN_ATTITUDE: u8 = 0x10;
    pub const END_OWN_ATTITUDE: u8 = 0x11;
    pub const BEGIN_TEST_ATTITUDE: u8 = 0x20;
    pub const END_TEST_ATTITUDE: u8 = 0x21;
}

/// Telemetry ids sent by the board.
pub mod telemetry {
    pub const STATUS: u8 = 0x00;
    pub const MESSAGE: u8 = 0x01;
}

/// Sensor selected by the high nibble of an attitude telemetry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Own,
    Test,
}

/// A device-originated frame, interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Status(Vec<u8>),
    Message(String),
    Raw { sensor: Sensor, sample: ImuSample },
    /// Device-side Euler angles in radians.
    Euler {
        sensor: Sensor,
        pitch: f32,
        roll: f32,
        heading: f32,
    },
    /// Device-side quaternion.
    Quaternion { sensor: Sensor, quaternion: Quat },
    Unknown(Frame),
}

/// Send the reset command. Wire: `<marker> 01 00 <arg>`.
///
/// `arg` is the byte after the length field; the board resets on
/// [`command::RESET`]. No response is awaited.
pub fn reset<W: Write>(writer: &mut W, arg: u8) -> Result<(), FrameError> {
    send(writer, &Frame::new(arg, Vec::new()))
}

/// Start streaming. Wire: `<marker> 03 00 <mode> <period lo> <period hi>`.
///
/// `mode` selects the stream ([`command::BEGIN_OWN_ATTITUDE`] for the raw
/// samples the fusion consumes). The period must match the fusion interval.
pub fn begin<W: Write>(writer: &mut W, mode: u8, period_ms: u16) -> Result<(), FrameError> {
    send(writer, &Frame::new(mode, period_ms.to_le_bytes().to_vec()))
}

/// Stop the stream started with `begin(mode, ..)`.
pub fn end<W: Write>(writer: &mut W, mode: u8) -> Result<(), FrameError> {
    send(writer, &Frame::new(mode.wrapping_add(1), Vec::new()))
}

fn send<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    writer.write_all(&frame.to_bytes()?)?;
    writer.flush()?;
    Ok(())
}

/// Interpret a device-originated frame.
///
/// Attitude ids carry the sensor in the high nibble and the encoding in the
/// low nibble (0 raw, 1 Euler, 2 quaternion).
pub fn interpret(frame: &Frame) -> Result<Telemetry, DecodeError> {
    match frame.command {
        telemetry::STATUS => Ok(Telemetry::Status(frame.payload.clone())),
        telemetry::MESSAGE => Ok(Telemetry::Message(decode_message(&frame.payload))),
        id => {
            let sensor = match id >> 4 {
                0x1 => Sensor::Own,
                0x2 => Sensor::Test,
                _ => return Ok(Telemetry::Unknown(frame.clone())),
            };
            match id & 0x0F {
                0x0 => Ok(Telemetry::Raw {
                    sensor,
                    sample: unpack_sample(&frame.payload)?,
                }),
                0x1 => {
                    let [pitch, roll, heading] = unpack_f32s::<3>(&frame.payload)?;
                    Ok(Telemetry::Euler {
                        sensor,
                        pitch,
                        roll,
                        heading,
                    })
                }
                0x2 => {
                    let [x, y, z, w] = unpack_f32s::<4>(&frame.payload)?;
                    Ok(Telemetry::Quaternion {
                        sensor,
                        quaternion: Quat::from_xyzw(x, y, z, w),
                    })
                }
                _ => Ok(Telemetry::Unknown(frame.clone())),
            }
        }
    }
}

/// Text up to the first NUL, lossily decoded.
fn decode_message(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
