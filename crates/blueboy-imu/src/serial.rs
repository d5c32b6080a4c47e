//! Serial transport for the Blueboy board.
//!
//! Reads block until the requested bytes arrive. The port is opened with a
//! short timeout only so a blocked read can notice a stop request; timeouts
//! never surface to the frame synchronizer.

use crate::connection::StopSignal;
use serialport::SerialPort;
use std::io::{self, Read};
use std::time::Duration;

/// Where and how to open the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Poll interval for stop checks while a read is idle.
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port().to_owned(),
            baud_rate: 9600,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Conventional name of the board's port on this platform.
pub fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM4"
    } else {
        "/dev/ttyACM0"
    }
}

/// Read half of an open serial link.
pub struct SerialReader {
    port: Box<dyn SerialPort>,
    stop: StopSignal,
}

impl Read for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.port.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.stop.is_requested() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "stop requested",
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

/// Open the port and split it into a stop-aware reader and a writer.
pub fn open(
    settings: &SerialSettings,
    stop: StopSignal,
) -> io::Result<(SerialReader, Box<dyn SerialPort>)> {
    let port = serialport::new(&settings.port, settings.baud_rate)
        .timeout(settings.read_timeout)
        .open()
        .inspect_err(|e| {
            tracing::debug!(port = %settings.port, error = %e, "Failed to open serial port");
            log_available_ports();
        })?;
    let writer = port.try_clone()?;

    tracing::info!(
        port = %settings.port,
        baud_rate = settings.baud_rate,
        "Opened serial port"
    );

    Ok((SerialReader { port, stop }, writer))
}

/// Log the serial ports the OS reports, for diagnosing a wrong port name.
fn log_available_ports() {
    match serialport::available_ports() {
        Ok(ports) => {
            let names: Vec<_> = ports.iter().map(|p| p.port_name.as_str()).collect();
            tracing::debug!(ports = ?names, "Available serial ports");
        }
        Err(e) => tracing::debug!(error = %e, "Could not enumerate serial ports"),
    }
}
