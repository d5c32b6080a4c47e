use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Granularity of stop checks while sleeping.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Link state published to observers of the acquisition loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Opening the transport; `attempt` is 1-based.
    Connecting { attempt: u32 },
    Connected,
    /// Gave up. The loop has exited.
    Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Gave up connecting to {target} after {attempts} attempts: {last}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        #[source]
        last: io::Error,
    },
    #[error("Stop requested while connecting to {target}")]
    Stopped { target: String },
}

/// Capped exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Cooperative stop flag shared between the client and its acquisition loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless a stop arrives first.
    /// Returns `false` if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

/// Open a transport, retrying per `policy`.
///
/// `report` sees every state change before the attempt it describes.
pub fn connect_with_retry<T>(
    target: &str,
    policy: &RetryPolicy,
    stop: &StopSignal,
    mut report: impl FnMut(ConnectionState),
    mut open: impl FnMut() -> io::Result<T>,
) -> Result<T, ConnectionError> {
    let mut attempt: u32 = 0;
    loop {
        if stop.is_requested() {
            return Err(ConnectionError::Stopped {
                target: target.to_owned(),
            });
        }

        attempt += 1;
        report(ConnectionState::Connecting { attempt });

        match open() {
            Ok(link) => {
                report(ConnectionState::Connected);
                return Ok(link);
            }
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(ConnectionError::RetriesExhausted {
                        target: target.to_owned(),
                        attempts: attempt,
                        last: e,
                    });
                }

                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(%target, attempt, ?delay, error = %e, "Connection failed, retrying");
                if !stop.sleep(delay) {
                    return Err(ConnectionError::Stopped {
                        target: target.to_owned(),
                    });
                }
            }
        }
    }
}
