use crate::types::ImuSample;
use glam::Vec3;
use std::io::Read;
use thiserror::Error;

/// Sync marker preceding every frame (`0xDEADBEEF` in device byte order).
pub const SYNC_MARKER: [u8; 4] = [0xEF, 0xBE, 0xAD, 0xDE];

/// Command byte of a raw attitude sample from the on-board sensor.
pub const SAMPLE_COMMAND: u8 = 0x10;

/// Payload size of a raw attitude sample: 9 x f32 = 36 bytes.
pub const SAMPLE_PAYLOAD_LEN: usize = 36;

/// Size of the length field that follows the sync marker.
const LENGTH_FIELD_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Transport read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Declared frame length {declared} exceeds limit {max}")]
    LengthExceedsLimit { declared: u16, max: u16 },
    #[error("Payload of {len} bytes does not fit a frame")]
    PayloadTooLarge { len: usize },
}

impl FrameError {
    /// Whether the synchronizer can keep scanning after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::LengthExceedsLimit { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: expected {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },
    #[error("Command 0x{0:02x} does not carry an IMU sample")]
    UnexpectedCommand(u8),
}

/// One delimited unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Value of the length field: the command byte plus the payload.
    pub fn declared_len(&self) -> usize {
        self.payload.len() + 1
    }

    /// Serialize as `<marker> <length:u16 LE> <command> <payload>`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let length = u16::try_from(self.declared_len()).map_err(|_| FrameError::PayloadTooLarge {
            len: self.payload.len(),
        })?;

        let mut bytes =
            Vec::with_capacity(SYNC_MARKER.len() + LENGTH_FIELD_LEN + self.declared_len());
        bytes.extend_from_slice(&SYNC_MARKER);
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.push(self.command);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

/// How much the synchronizer trusts the declared length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Accept any declared length and block until that many bytes arrive.
    #[default]
    Permissive,
    /// Reject declared lengths above `max_length` before reading the body.
    Strict { max_length: u16 },
}

/// Counters kept while scanning the byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Frames emitted.
    pub frames: u64,
    /// Bytes thrown away while hunting for a sync marker.
    pub discarded_bytes: u64,
    /// Markers followed by a zero length field.
    pub empty_frames: u64,
    /// Frames dropped in strict mode for an oversized length.
    pub rejected_lengths: u64,
}

/// Blocking frame reader for the Blueboy serial protocol.
///
/// Pulls bytes from `reader` one at a time until the last four equal
/// [`SYNC_MARKER`], then reads the length, command and payload in full.
/// Every frame needs its own marker; bytes between frames are discarded.
pub struct FrameSynchronizer<R> {
    reader: R,
    window: [u8; 4],
    mode: FramingMode,
    stats: SyncStats,
}

impl<R: Read> FrameSynchronizer<R> {
    pub fn new(reader: R) -> Self {
        Self::with_mode(reader, FramingMode::Permissive)
    }

    pub fn with_mode(reader: R, mode: FramingMode) -> Self {
        Self {
            reader,
            window: [0; 4],
            mode,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Block until the next complete frame has been read.
    ///
    /// A [`FrameError::LengthExceedsLimit`] leaves the synchronizer ready to
    /// scan again; an I/O error means the transport is gone.
    pub fn next_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            self.lock()?;

            let mut length = [0u8; LENGTH_FIELD_LEN];
            self.reader.read_exact(&mut length)?;
            let length = u16::from_le_bytes(length);

            if length == 0 {
                // No room for a command byte: treat like noise and rescan.
                self.stats.empty_frames += 1;
                tracing::warn!("Zero-length frame after sync marker, resynchronizing");
                continue;
            }

            if let FramingMode::Strict { max_length } = self.mode {
                if length > max_length {
                    self.stats.rejected_lengths += 1;
                    return Err(FrameError::LengthExceedsLimit {
                        declared: length,
                        max: max_length,
                    });
                }
            }

            let mut command = [0u8; 1];
            self.reader.read_exact(&mut command)?;

            let mut payload = vec![0u8; usize::from(length) - 1];
            self.reader.read_exact(&mut payload)?;

            self.stats.frames += 1;
            return Ok(Frame {
                command: command[0],
                payload,
            });
        }
    }

    /// Shift bytes through the window until it holds the sync marker.
    fn lock(&mut self) -> Result<(), FrameError> {
        self.window = [0; 4];
        let mut scanned: u64 = 0;
        let mut byte = [0u8; 1];

        loop {
            self.reader.read_exact(&mut byte)?;
            self.window.rotate_left(1);
            self.window[3] = byte[0];
            scanned += 1;

            if self.window == SYNC_MARKER {
                let discarded = scanned - SYNC_MARKER.len() as u64;
                if discarded > 0 {
                    self.stats.discarded_bytes += discarded;
                    tracing::debug!(
                        discarded,
                        total_discarded = self.stats.discarded_bytes,
                        "Resynchronized on sync marker"
                    );
                }
                return Ok(());
            }
        }
    }
}

/// Decode a raw attitude frame into an IMU sample.
///
/// Layout: `[mx, my, mz, ax, ay, az, gx, gy, gz]`, all f32 LE.
pub fn decode_sample(frame: &Frame) -> Result<ImuSample, DecodeError> {
    if frame.command != SAMPLE_COMMAND {
        return Err(DecodeError::UnexpectedCommand(frame.command));
    }
    unpack_sample(&frame.payload)
}

pub(crate) fn unpack_sample(payload: &[u8]) -> Result<ImuSample, DecodeError> {
    let [mx, my, mz, ax, ay, az, gx, gy, gz] = unpack_f32s::<9>(payload)?;
    Ok(ImuSample {
        mag: Vec3::new(mx, my, mz),
        accel: Vec3::new(ax, ay, az),
        gyro: Vec3::new(gx, gy, gz),
    })
}

/// Unpack exactly `N` little-endian f32 values.
pub(crate) fn unpack_f32s<const N: usize>(payload: &[u8]) -> Result<[f32; N], DecodeError> {
    if payload.len() != N * 4 {
        return Err(DecodeError::MalformedPayload {
            expected: N * 4,
            actual: payload.len(),
        });
    }

    let mut values = [0f32; N];
    for (value, chunk) in values.iter_mut().zip(payload.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(values)
}

/// Encode a sample the way the device does.
pub fn encode_sample(sample: &ImuSample) -> Vec<u8> {
    [sample.mag, sample.accel, sample.gyro]
        .iter()
        .flat_map(|v| v.to_array())
        .flat_map(f32::to_le_bytes)
        .collect()
}
