//! End-to-end tests: bytes in, orientation out, through the public client.

use approx::assert_abs_diff_eq;
use blueboy_imu::connection::{ConnectionState, RetryPolicy, StopSignal};
use blueboy_imu::fusion::{self, FilterParams, OrientationState};
use blueboy_imu::protocol::{decode_sample, encode_sample, Frame, FrameSynchronizer, SAMPLE_COMMAND};
use blueboy_imu::session::SessionOptions;
use blueboy_imu::types::ImuSample;
use blueboy_imu::ImuClient;
use glam::Vec3;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RESET: [u8; 7] = [0xEF, 0xBE, 0xAD, 0xDE, 0x01, 0x00, 0x00];
const BEGIN: [u8; 9] = [0xEF, 0xBE, 0xAD, 0xDE, 0x03, 0x00, 0x10, 0x32, 0x00];
const END: [u8; 7] = [0xEF, 0xBE, 0xAD, 0xDE, 0x01, 0x00, 0x11];

/// Write half that records everything the client sends.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<u8>>>);

impl Recorder {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for Recorder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half that replays one frame forever until a stop is requested.
struct Replay {
    bytes: Vec<u8>,
    pos: usize,
    stop: StopSignal,
}

impl Read for Replay {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stop.is_requested() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stop requested"));
        }
        if self.pos == self.bytes.len() {
            std::thread::sleep(Duration::from_millis(2));
            self.pos = 0;
        }
        let n = buf.len().min(self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        reset_settle: Duration::ZERO,
        retry: RetryPolicy {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts: Some(1),
        },
        reconnect: false,
        ..SessionOptions::default()
    }
}

fn sample_frame(gyro_z: f32) -> Vec<u8> {
    let sample = ImuSample {
        mag: Vec3::new(0.0, 0.0, 1.0),
        accel: Vec3::new(0.0, 0.0, 1.0),
        gyro: Vec3::new(0.0, 0.0, gyro_z),
    };
    Frame::new(SAMPLE_COMMAND, encode_sample(&sample))
        .to_bytes()
        .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn device_bytes_decode_and_fuse_to_identity() {
    let mut bytes = vec![0xEF, 0xBE, 0xAD, 0xDE, 0x25, 0x00, 0x10];
    for v in [0.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    let mut sync = FrameSynchronizer::new(Cursor::new(bytes));
    let frame = sync.next_frame().unwrap();
    assert_eq!(frame.command, SAMPLE_COMMAND);
    assert_eq!(frame.payload.len(), 36);

    let sample = decode_sample(&frame).unwrap();
    assert_eq!(sample.mag, Vec3::new(0.0, 0.0, 1.0));
    assert_eq!(sample.accel, Vec3::new(0.0, 0.0, 1.0));
    assert_eq!(sample.gyro, Vec3::ZERO);

    let to_f64 = |v: Vec3| nalgebra::Vector3::new(v.x as f64, v.y as f64, v.z as f64);
    let next = fusion::update(
        OrientationState::identity(),
        &to_f64(sample.gyro),
        &to_f64(sample.accel),
        Some(&to_f64(sample.mag)),
        &FilterParams::default(),
        0.05,
    );

    assert_abs_diff_eq!(next.quaternion().norm(), 1.0, epsilon = 1e-12);
    assert_eq!(next.wxyz(), [1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn client_streams_until_transport_ends() {
    let mut stream = vec![0x13, 0x37, 0xDE, 0xAD];
    for _ in 0..3 {
        stream.extend(sample_frame(0.1));
    }

    let recorder = Recorder::default();
    let writer = recorder.clone();
    let client = ImuClient::connect_with("memory", fast_options(), move |_stop| {
        Ok((Cursor::new(stream.clone()), writer.clone()))
    })
    .unwrap();

    assert!(wait_for(|| matches!(
        client.connection_state(),
        ConnectionState::Failed { .. }
    )));

    let stats = client.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.discarded_bytes, 4);
    assert_eq!(stats.malformed_payloads, 0);

    // Three steps of 0.1 rad/s about z at 50 ms each.
    let [w, x, y, z] = client.orientation().components();
    assert!(z > 0.0);
    assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(2.0 * z.atan2(w), 0.015, epsilon = 1e-4);

    let mut expected = RESET.to_vec();
    expected.extend_from_slice(&BEGIN);
    assert_eq!(recorder.bytes(), expected);

    client.shutdown();
}

#[test]
fn client_reconnects_and_keeps_counting() {
    let opens = Arc::new(AtomicU32::new(0));
    let counter = opens.clone();
    let mut options = fast_options();
    options.reconnect = true;

    let client = ImuClient::connect_with("memory", options, move |_stop| {
        if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unplugged"));
        }
        let mut stream = vec![0xAA];
        stream.extend(sample_frame(0.0));
        stream.extend(sample_frame(0.0));
        Ok((Cursor::new(stream), io::sink()))
    })
    .unwrap();

    assert!(wait_for(|| matches!(
        client.connection_state(),
        ConnectionState::Failed { .. }
    )));

    assert_eq!(opens.load(Ordering::SeqCst), 3);
    let stats = client.stats();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.samples, 4);
    assert_eq!(stats.discarded_bytes, 2);

    client.shutdown();
}

#[test]
fn shutdown_ends_the_stream() {
    let recorder = Recorder::default();
    let writer = recorder.clone();
    let client = ImuClient::connect_with("memory", fast_options(), move |stop| {
        let reader = Replay {
            bytes: sample_frame(0.0),
            pos: 0,
            stop: stop.clone(),
        };
        Ok((reader, writer.clone()))
    })
    .unwrap();

    assert!(wait_for(|| client.stats().samples >= 3));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.shutdown();

    let mut expected = RESET.to_vec();
    expected.extend_from_slice(&BEGIN);
    expected.extend_from_slice(&END);
    assert_eq!(recorder.bytes(), expected);
}

#[test]
fn set_zero_reaches_running_session() {
    let half = std::f64::consts::FRAC_PI_4;
    let options = SessionOptions {
        initial: OrientationState::from_wxyz(half.cos(), 0.0, 0.0, half.sin()).unwrap(),
        ..fast_options()
    };

    let client = ImuClient::connect_with("memory", options, |stop| {
        let reader = Replay {
            bytes: sample_frame(0.0),
            pos: 0,
            stop: stop.clone(),
        };
        Ok((reader, io::sink()))
    })
    .unwrap();

    // Level, so the 90 degree heading seed is held exactly.
    assert!(wait_for(|| client.stats().samples >= 1));
    let (_, _, yaw) = client.orientation().euler_angles();
    assert_abs_diff_eq!(yaw, std::f32::consts::FRAC_PI_2, epsilon = 1e-5);

    client.set_zero();
    assert!(wait_for(|| client.orientation().quaternion.w > 0.9999));

    client.shutdown();
}

#[test]
fn zero_period_is_refused_up_front() {
    let options = SessionOptions {
        period_ms: 0,
        ..fast_options()
    };
    let result = ImuClient::connect_with("memory", options, |_stop| {
        Ok((Cursor::new(Vec::<u8>::new()), io::sink()))
    });
    assert!(result.is_err());
}
