use anyhow::{bail, Result};
use blueboy_imu::connection::RetryPolicy;
use blueboy_imu::control::command;
use blueboy_imu::fusion::{FilterParams, FusionMode, OrientationState, DEFAULT_BETA};
use blueboy_imu::protocol::FramingMode;
use blueboy_imu::serial::{default_port, SerialSettings};
use blueboy_imu::session::{SessionOptions, Timing};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub stream: StreamConfig,
    pub filter: FilterConfig,
    pub framing: FramingConfig,
    pub connection: ConnectionConfig,
}

impl AppConfig {
    /// Serial settings, with `port_override` (usually from the command line)
    /// taking precedence over the configured port.
    pub fn serial_settings(&self, port_override: Option<String>) -> SerialSettings {
        SerialSettings {
            port: port_override.unwrap_or_else(|| self.serial.port.clone()),
            baud_rate: self.serial.baud_rate,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
        }
    }

    /// Session options for the IMU client. The fusion interval is always the
    /// streaming period.
    pub fn session_options(&self) -> Result<SessionOptions> {
        if !(self.filter.beta.is_finite() && self.filter.beta >= 0.0) {
            bail!("filter.beta must be a non-negative number, got {}", self.filter.beta);
        }

        let initial = match self.filter.initial_quaternion {
            Some([w, x, y, z]) => OrientationState::from_wxyz(w, x, y, z).ok_or_else(|| {
                anyhow::anyhow!("filter.initial_quaternion must be finite and non-zero")
            })?,
            None => OrientationState::identity(),
        };

        let framing = if self.framing.strict {
            FramingMode::Strict {
                max_length: self.framing.max_frame_length,
            }
        } else {
            FramingMode::Permissive
        };

        let options = SessionOptions {
            stream_mode: self.stream.mode,
            period_ms: self.stream.period_ms,
            reset_settle: Duration::from_millis(self.stream.reset_settle_ms),
            filter: FilterParams {
                beta: self.filter.beta,
                mode: match self.filter.fusion {
                    FusionConfig::Imu => FusionMode::Imu,
                    FusionConfig::Marg => FusionMode::Marg,
                },
            },
            timing: match self.filter.timing {
                TimingConfig::Fixed => Timing::Fixed,
                TimingConfig::Measured => Timing::Measured,
            },
            calibration_samples: self.filter.calibration_samples,
            initial,
            framing,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(self.connection.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.connection.max_backoff_ms),
                max_attempts: self.connection.max_attempts,
            },
            reconnect: self.connection.reconnect,
        };
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name, e.g. `COM4` or `/dev/ttyACM0`.
    pub port: String,
    pub baud_rate: u32,
    /// How often an idle read wakes up to check for shutdown.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_owned(),
            baud_rate: 9600,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream selector sent with `begin`: 0x10 for the on-board sensor, 0x20 for the test sensor.
    pub mode: u8,
    /// Sample period requested from the board, in milliseconds. Also the fusion interval.
    pub period_ms: u16,
    /// Time the board needs after a reset before it accepts `begin`.
    pub reset_settle_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: command::BEGIN_OWN_ATTITUDE,
            period_ms: 50,
            reset_settle_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Madgwick filter gain. Higher = faster convergence, more accelerometer noise.
    pub beta: f64,
    pub fusion: FusionConfig,
    pub timing: TimingConfig,
    /// Stationary samples averaged into a gyro bias at startup. 0 disables calibration.
    pub calibration_samples: u32,
    /// Starting orientation as `[w, x, y, z]`; identity when absent.
    pub initial_quaternion: Option<[f64; 4]>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            beta: DEFAULT_BETA,
            fusion: FusionConfig::Imu,
            timing: TimingConfig::Fixed,
            calibration_samples: 0,
            initial_quaternion: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionConfig {
    /// Gyroscope and accelerometer only.
    Imu,
    /// Gyroscope, accelerometer and magnetometer.
    Marg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingConfig {
    Fixed,
    Measured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Reject frames whose declared length exceeds `max_frame_length`.
    pub strict: bool,
    pub max_frame_length: u16,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_frame_length: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Give up after this many failed opens. Unlimited when absent.
    pub max_attempts: Option<u32>,
    /// Reopen the port after the link drops mid-stream.
    pub reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            max_attempts: None,
            reconnect: true,
        }
    }
}
