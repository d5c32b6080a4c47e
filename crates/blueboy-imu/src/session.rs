use crate::connection::{ConnectionError, RetryPolicy, StopSignal};
use crate::control::{self, command, Telemetry};
use crate::fusion::{FilterParams, OrientationState, SensorFusion};
use crate::protocol::{unpack_sample, Frame, FrameError, FrameSynchronizer, FramingMode, SyncStats};
use crate::types::Orientation;
use std::io::{self, BufReader, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("IMU link failed: {0}")]
    Frame(#[from] FrameError),
    #[error("Sample period must be at least 1 ms")]
    InvalidPeriod,
    #[error("Stream mode 0x{0:02x} does not select a raw attitude stream")]
    UnsupportedStreamMode(u8),
    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Where the fusion interval comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timing {
    /// Integrate every sample over the configured streaming period.
    #[default]
    Fixed,
    /// Integrate over the measured time since the previous sample, clamped
    /// to half and twice the configured period.
    Measured,
}

/// Everything a session needs besides the transport itself.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Stream selector sent with `begin`. Raw samples of that stream arrive
    /// with the same id.
    pub stream_mode: u8,
    /// Streaming period requested from the board. Also the fusion interval.
    pub period_ms: u16,
    /// Wait between reset and begin.
    pub reset_settle: Duration,
    pub filter: FilterParams,
    pub timing: Timing,
    /// Gyro bias calibration samples; 0 disables calibration.
    pub calibration_samples: u32,
    pub initial: OrientationState,
    pub framing: FramingMode,
    pub retry: RetryPolicy,
    /// Reopen the transport after a mid-stream failure.
    pub reconnect: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stream_mode: command::BEGIN_OWN_ATTITUDE,
            period_ms: 50,
            reset_settle: Duration::from_secs(3),
            filter: FilterParams::default(),
            timing: Timing::Fixed,
            calibration_samples: 0,
            initial: OrientationState::identity(),
            framing: FramingMode::Permissive,
            retry: RetryPolicy::default(),
            reconnect: true,
        }
    }
}

impl SessionOptions {
    /// The fusion interval. Always equal to the period sent with `begin`.
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_ms))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.period_ms == 0 {
            return Err(SessionError::InvalidPeriod);
        }
        if !matches!(self.stream_mode, command::BEGIN_OWN_ATTITUDE | command::BEGIN_TEST_ATTITUDE) {
            return Err(SessionError::UnsupportedStreamMode(self.stream_mode));
        }
        Ok(())
    }
}

/// Commands sent to the acquisition loop.
#[derive(Debug)]
pub(crate) enum ImuCommand {
    SetZero,
    Recalibrate(u32),
}

/// Snapshot of the acquisition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub samples: u64,
    pub discarded_bytes: u64,
    /// Sync markers followed by a zero length field.
    pub empty_frames: u64,
    pub malformed_payloads: u64,
    pub rejected_lengths: u64,
    pub connections: u64,
}

/// Shared counters for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    frames: AtomicU64,
    samples: AtomicU64,
    discarded_bytes: AtomicU64,
    empty_frames: AtomicU64,
    malformed_payloads: AtomicU64,
    rejected_lengths: AtomicU64,
    connections: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames: self.frames.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            empty_frames: self.empty_frames.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            rejected_lengths: self.rejected_lengths.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decode, fuse and publish: everything downstream of the synchronizer.
pub struct Pipeline {
    fusion: SensorFusion,
    /// Frame id of the raw samples to fuse.
    sample_command: u8,
    timing: Timing,
    period: Duration,
    last_sample_at: Option<Instant>,
    orientation_tx: watch::Sender<Orientation>,
    counters: Arc<SessionCounters>,
    /// Synchronizer totals from links that have already closed.
    carried: SyncStats,
}

impl Pipeline {
    pub fn new(options: &SessionOptions, orientation_tx: watch::Sender<Orientation>) -> Self {
        Self::with_counters(options, orientation_tx, Arc::default())
    }

    pub(crate) fn with_counters(
        options: &SessionOptions,
        orientation_tx: watch::Sender<Orientation>,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            fusion: SensorFusion::new(options.filter, options.initial, options.calibration_samples),
            sample_command: options.stream_mode,
            timing: options.timing,
            period: options.sample_period(),
            last_sample_at: None,
            orientation_tx,
            counters,
            carried: SyncStats::default(),
        }
    }

    /// Route one frame. Returns the orientation published for it, if any.
    pub fn handle_frame(&mut self, frame: &Frame) -> Option<Orientation> {
        if frame.command != self.sample_command {
            self.handle_control(frame);
            return None;
        }

        let sample = match unpack_sample(&frame.payload) {
            Ok(sample) => sample,
            Err(e) => {
                self.counters.malformed_payloads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%e, "Dropping malformed sample frame");
                return None;
            }
        };

        let samples = self.counters.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if samples % 1000 == 0 {
            tracing::debug!(samples, "IMU samples processed");
        }

        let dt = self.next_dt();
        let orientation = self.fusion.update(&sample, dt)?;
        self.orientation_tx.send_replace(orientation);
        Some(orientation)
    }

    fn handle_control(&self, frame: &Frame) {
        match control::interpret(frame) {
            Ok(Telemetry::Message(text)) => tracing::info!(%text, "Device message"),
            Ok(telemetry) => tracing::trace!(?telemetry, "Skipping non-sample frame"),
            Err(e) => tracing::debug!(command = frame.command, %e, "Undecodable control frame"),
        }
    }

    fn next_dt(&mut self) -> f64 {
        let nominal = self.period.as_secs_f64();
        match self.timing {
            Timing::Fixed => nominal,
            Timing::Measured => {
                let now = Instant::now();
                match self.last_sample_at.replace(now) {
                    Some(prev) => now
                        .duration_since(prev)
                        .as_secs_f64()
                        .clamp(0.5 * nominal, 2.0 * nominal),
                    None => nominal,
                }
            }
        }
    }

    pub(crate) fn apply(&mut self, cmd: ImuCommand) {
        match cmd {
            ImuCommand::SetZero => self.fusion.set_zero(),
            ImuCommand::Recalibrate(n) => self.fusion.recalibrate(n),
        }
    }

    /// Mirror the live synchronizer counters into the shared ones.
    fn record_sync(&self, current: &SyncStats) {
        let c = &self.counters;
        c.frames.store(self.carried.frames + current.frames, Ordering::Relaxed);
        c.discarded_bytes.store(
            self.carried.discarded_bytes + current.discarded_bytes,
            Ordering::Relaxed,
        );
        c.empty_frames.store(
            self.carried.empty_frames + current.empty_frames,
            Ordering::Relaxed,
        );
        c.rejected_lengths.store(
            self.carried.rejected_lengths + current.rejected_lengths,
            Ordering::Relaxed,
        );
    }

    /// Fold a closed link's counters into the carried totals.
    fn close_link(&mut self, last: &SyncStats) {
        self.carried.frames += last.frames;
        self.carried.discarded_bytes += last.discarded_bytes;
        self.carried.empty_frames += last.empty_frames;
        self.carried.rejected_lengths += last.rejected_lengths;
        self.last_sample_at = None;
    }

    pub fn fusion(&self) -> &SensorFusion {
        &self.fusion
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &SessionCounters {
        &self.counters
    }
}

/// Drive one open link: reset, begin, then read frames until the transport
/// fails or a stop is requested. Orientation state survives in `pipeline`.
pub(crate) fn run_link<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    pipeline: &mut Pipeline,
    options: &SessionOptions,
    stop: &StopSignal,
    commands: &mut mpsc::UnboundedReceiver<ImuCommand>,
) -> Result<(), SessionError> {
    control::reset(&mut writer, command::RESET)?;
    tracing::info!("Reset sent, waiting for board to settle");
    if !stop.sleep(options.reset_settle) {
        return Ok(());
    }

    control::begin(&mut writer, options.stream_mode, options.period_ms)?;
    tracing::info!(
        mode = options.stream_mode,
        period_ms = options.period_ms,
        "Streaming requested"
    );

    let mut sync = FrameSynchronizer::with_mode(BufReader::new(reader), options.framing);
    let result = read_frames(&mut sync, pipeline, stop, commands);
    pipeline.record_sync(&sync.stats());
    pipeline.close_link(&sync.stats());

    if stop.is_requested() {
        if let Err(e) = control::end(&mut writer, options.stream_mode) {
            tracing::debug!(%e, "Could not send end command");
        }
        return Ok(());
    }
    result
}

fn read_frames<R: Read>(
    sync: &mut FrameSynchronizer<R>,
    pipeline: &mut Pipeline,
    stop: &StopSignal,
    commands: &mut mpsc::UnboundedReceiver<ImuCommand>,
) -> Result<(), SessionError> {
    loop {
        if stop.is_requested() {
            return Ok(());
        }
        while let Ok(cmd) = commands.try_recv() {
            pipeline.apply(cmd);
        }

        let result = sync.next_frame();
        pipeline.record_sync(&sync.stats());
        match result {
            Ok(frame) => {
                pipeline.handle_frame(&frame);
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(%e, "Rejected frame, resynchronizing");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
