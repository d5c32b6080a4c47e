pub mod connection;
pub mod control;
pub mod fusion;
pub mod protocol;
pub mod serial;
pub mod session;
pub mod types;

use connection::{connect_with_retry, ConnectionError, ConnectionState, StopSignal};
use serial::SerialSettings;
use session::{ImuCommand, Pipeline, SessionCounters, SessionError, SessionOptions, SessionStats};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use types::Orientation;

/// Client for the Blueboy attitude board.
///
/// Opens the serial link, resynchronizes the frame stream, runs Madgwick
/// sensor fusion on a dedicated thread, and publishes the latest orientation.
pub struct ImuClient {
    orientation_rx: watch::Receiver<Orientation>,
    state_rx: watch::Receiver<ConnectionState>,
    command_tx: mpsc::UnboundedSender<ImuCommand>,
    counters: Arc<SessionCounters>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl ImuClient {
    /// Connect to the board on a serial port and start processing.
    ///
    /// Returns immediately; connection progress is visible through
    /// [`ImuClient::connection_state`].
    pub fn connect(
        settings: SerialSettings,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let target = settings.port.clone();
        Self::connect_with(target, options, move |stop| serial::open(&settings, stop.clone()))
    }

    /// Start processing over a caller-provided transport.
    ///
    /// `open` is called on the acquisition thread for every (re)connection
    /// attempt and returns the read and write halves of a fresh link.
    pub fn connect_with<R, W, F>(
        target: impl Into<String>,
        options: SessionOptions,
        open: F,
    ) -> Result<Self, SessionError>
    where
        R: Read,
        W: Write,
        F: FnMut(&StopSignal) -> io::Result<(R, W)> + Send + 'static,
    {
        options.validate()?;
        let target = target.into();
        tracing::info!(%target, period_ms = options.period_ms, "Starting Blueboy IMU client");

        let (orientation_tx, orientation_rx) = watch::channel(Orientation::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(SessionCounters::default());
        let stop = StopSignal::new();

        let pipeline = Pipeline::with_counters(&options, orientation_tx, counters.clone());
        let loop_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("blueboy-imu-reader".into())
            .spawn(move || {
                acquisition_loop(target, options, open, pipeline, state_tx, command_rx, loop_stop)
            })
            .map_err(SessionError::Spawn)?;

        Ok(Self {
            orientation_rx,
            state_rx,
            command_tx,
            counters,
            stop,
            thread: Some(thread),
        })
    }

    /// Get the latest fused orientation (non-blocking).
    pub fn orientation(&self) -> Orientation {
        *self.orientation_rx.borrow()
    }

    /// A receiver for sinks that live elsewhere.
    pub fn subscribe(&self) -> watch::Receiver<Orientation> {
        self.orientation_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Set current orientation as the zero reference.
    pub fn set_zero(&self) {
        let _ = self.command_tx.send(ImuCommand::SetZero);
    }

    /// Restart gyro bias calibration.
    pub fn recalibrate(&self, samples: u32) {
        let _ = self.command_tx.send(ImuCommand::Recalibrate(samples));
    }

    /// Stop the acquisition loop and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop.request();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("IMU acquisition thread panicked");
            }
        }
    }
}

impl Drop for ImuClient {
    fn drop(&mut self) {
        self.stop.request();
    }
}

/// Background thread: connect, stream, fuse, publish; reconnect on failure.
fn acquisition_loop<R, W, F>(
    target: String,
    options: SessionOptions,
    mut open: F,
    mut pipeline: Pipeline,
    state_tx: watch::Sender<ConnectionState>,
    mut command_rx: mpsc::UnboundedReceiver<ImuCommand>,
    stop: StopSignal,
) where
    R: Read,
    W: Write,
    F: FnMut(&StopSignal) -> io::Result<(R, W)>,
{
    loop {
        let link = connect_with_retry(
            &target,
            &options.retry,
            &stop,
            |state| {
                state_tx.send_replace(state);
            },
            || open(&stop),
        );

        let (reader, writer) = match link {
            Ok(link) => link,
            Err(ConnectionError::Stopped { .. }) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
            Err(e) => {
                tracing::error!(%e, "Giving up on IMU connection");
                state_tx.send_replace(ConnectionState::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        pipeline.counters().connected();
        tracing::info!(%target, "Connected to Blueboy IMU");

        match session::run_link(reader, writer, &mut pipeline, &options, &stop, &mut command_rx) {
            Ok(()) => {
                tracing::info!(stats = ?pipeline.stats(), "IMU session stopped");
                state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
            Err(e) if options.reconnect && !stop.is_requested() => {
                tracing::warn!(%e, "IMU link lost, reconnecting");
                state_tx.send_replace(ConnectionState::Disconnected);
            }
            Err(e) => {
                tracing::error!(%e, "IMU link lost");
                state_tx.send_replace(ConnectionState::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}
