use crate::types::{ImuSample, Orientation};
use glam::{Quat, Vec3};
use nalgebra::{Matrix3x4, Matrix6x4, Quaternion, UnitQuaternion, Vector3, Vector4, Vector6};

/// Default filter gain, matching the reference Madgwick implementation.
pub const DEFAULT_BETA: f64 = 0.033;

/// Gradient norms at or below this are treated as zero.
const GRADIENT_EPSILON: f64 = 1e-12;

/// Which reference vectors drive the gradient-descent correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
    /// Gyroscope + accelerometer. The magnetometer is ignored.
    #[default]
    Imu,
    /// Gyroscope + accelerometer + magnetometer.
    Marg,
}

/// Gradient-descent filter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// Gain applied to the normalized gradient step.
    pub beta: f64,
    pub mode: FusionMode,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            beta: DEFAULT_BETA,
            mode: FusionMode::Imu,
        }
    }
}

/// The running attitude estimate. Always a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationState {
    quaternion: UnitQuaternion<f64>,
}

impl OrientationState {
    pub fn identity() -> Self {
        Self {
            quaternion: UnitQuaternion::identity(),
        }
    }

    /// Seed from scalar-first components. Returns `None` for a zero or
    /// non-finite quaternion.
    pub fn from_wxyz(w: f64, x: f64, y: f64, z: f64) -> Option<Self> {
        let q = Quaternion::new(w, x, y, z);
        if !is_finite(&q) {
            return None;
        }
        UnitQuaternion::try_new(q, f64::EPSILON).map(|quaternion| Self { quaternion })
    }

    pub fn from_unit(quaternion: UnitQuaternion<f64>) -> Self {
        Self { quaternion }
    }

    pub fn quaternion(&self) -> &UnitQuaternion<f64> {
        &self.quaternion
    }

    /// Scalar-first components `[w, x, y, z]`.
    pub fn wxyz(&self) -> [f64; 4] {
        let q = self.quaternion.quaternion();
        [q.w, q.i, q.j, q.k]
    }

    /// Gravity direction predicted in the sensor frame.
    pub fn predicted_gravity(&self) -> Vector3<f64> {
        self.quaternion.inverse_transform_vector(&Vector3::z())
    }
}

impl Default for OrientationState {
    fn default() -> Self {
        Self::identity()
    }
}

/// One fusion step: `update(state, gyro, acc[, mag]) -> new state`.
///
/// The magnetometer is used only in [`FusionMode::Marg`] and only when it is
/// non-zero. If the step produces a non-finite quaternion (NaN input) the
/// previous state is returned unchanged.
pub fn update(
    state: OrientationState,
    gyro: &Vector3<f64>,
    accel: &Vector3<f64>,
    mag: Option<&Vector3<f64>>,
    params: &FilterParams,
    dt: f64,
) -> OrientationState {
    step(state, gyro, accel, mag, params, dt).unwrap_or(state)
}

/// Like [`update`] but reports a rejected step as `None`.
pub fn step(
    state: OrientationState,
    gyro: &Vector3<f64>,
    accel: &Vector3<f64>,
    mag: Option<&Vector3<f64>>,
    params: &FilterParams,
    dt: f64,
) -> Option<OrientationState> {
    let q = *state.quaternion.quaternion();

    // Rate of change from the gyroscope alone.
    let mut q_dot = q * Quaternion::from_imag(*gyro) * 0.5;

    // Fall back to the accelerometer alone only when the field reading is unusable.
    let gradient = match (params.mode, mag) {
        (FusionMode::Marg, Some(m)) => {
            marg_gradient(&q, accel, m).or_else(|| imu_gradient(&q, accel))
        }
        _ => imu_gradient(&q, accel),
    };
    // A vanishing gradient means the estimate already matches the references.
    if let Some(g) = gradient.and_then(|g| g.try_normalize(GRADIENT_EPSILON)) {
        q_dot -= Quaternion::new(g[0], g[1], g[2], g[3]) * params.beta;
    }

    let next = q + q_dot * dt;
    if !is_finite(&next) {
        return None;
    }
    UnitQuaternion::try_new(next, f64::EPSILON).map(OrientationState::from_unit)
}

/// Gradient of the accelerometer objective function, `None` when the
/// accelerometer reads all zero.
fn imu_gradient(q: &Quaternion<f64>, accel: &Vector3<f64>) -> Option<Vector4<f64>> {
    let a = accel.try_normalize(0.0)?;
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let f = Vector3::new(
        2.0 * (x * z - w * y) - a.x,
        2.0 * (w * x + y * z) - a.y,
        2.0 * (0.5 - x * x - y * y) - a.z,
    );
    #[rustfmt::skip]
    let j = Matrix3x4::new(
        -2.0 * y, 2.0 * z,  -2.0 * w, 2.0 * x,
        2.0 * x,  2.0 * w,  2.0 * z,  2.0 * y,
        0.0,      -4.0 * x, -4.0 * y, 0.0,
    );

    Some(j.transpose() * f)
}

/// Gradient of the combined accelerometer and magnetometer objective
/// function, `None` when either reference vector is zero.
fn marg_gradient(
    q: &Quaternion<f64>,
    accel: &Vector3<f64>,
    mag: &Vector3<f64>,
) -> Option<Vector4<f64>> {
    let a = accel.try_normalize(0.0)?;
    let m = mag.try_normalize(0.0)?;

    // Earth-frame magnetic field, folded onto the x-z plane.
    let h = q * Quaternion::from_imag(m) * q.conjugate();
    let bx = (h.i * h.i + h.j * h.j).sqrt();
    let bz = h.k;

    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let f = Vector6::new(
        2.0 * (x * z - w * y) - a.x,
        2.0 * (w * x + y * z) - a.y,
        2.0 * (0.5 - x * x - y * y) - a.z,
        2.0 * bx * (0.5 - y * y - z * z) + 2.0 * bz * (x * z - w * y) - m.x,
        2.0 * bx * (x * y - w * z) + 2.0 * bz * (w * x + y * z) - m.y,
        2.0 * bx * (w * y + x * z) + 2.0 * bz * (0.5 - x * x - y * y) - m.z,
    );
    #[rustfmt::skip]
    let j = Matrix6x4::new(
        -2.0 * y,                  2.0 * z,                   -2.0 * w,                  2.0 * x,
        2.0 * x,                   2.0 * w,                   2.0 * z,                   2.0 * y,
        0.0,                       -4.0 * x,                  -4.0 * y,                  0.0,
        -2.0 * bz * y,             2.0 * bz * z,              -4.0 * bx * y - 2.0 * bz * w, -4.0 * bx * z + 2.0 * bz * x,
        -2.0 * bx * z + 2.0 * bz * x, 2.0 * bx * y + 2.0 * bz * w, 2.0 * bx * x + 2.0 * bz * z, -2.0 * bx * w + 2.0 * bz * y,
        2.0 * bx * y,              2.0 * bx * z - 4.0 * bz * x, 2.0 * bx * w - 4.0 * bz * y, 2.0 * bx * x,
    );

    Some(j.transpose() * f)
}

fn is_finite(q: &Quaternion<f64>) -> bool {
    q.coords.iter().all(|c| c.is_finite())
}

fn to_vector(v: Vec3) -> Vector3<f64> {
    Vector3::new(v.x as f64, v.y as f64, v.z as f64)
}

fn to_quat(q: &UnitQuaternion<f64>) -> Quat {
    Quat::from_xyzw(q.i as f32, q.j as f32, q.k as f32, q.w as f32)
}

/// Sensor fusion using the Madgwick gradient-descent filter.
///
/// Owns the orientation state and converts raw Blueboy samples into a
/// stable orientation quaternion at a fixed sample period.
pub struct SensorFusion {
    state: OrientationState,
    params: FilterParams,
    /// Gyroscope bias (average of calibration samples).
    gyro_bias: Vector3<f64>,
    calibration: CalibrationState,
    /// Reference orientation for "set zero".
    zero_ref: UnitQuaternion<f64>,
}

enum CalibrationState {
    Collecting {
        samples: Vec<Vector3<f64>>,
        target: usize,
    },
    Calibrated,
}

impl CalibrationState {
    fn collecting(target: u32) -> Self {
        if target == 0 {
            CalibrationState::Calibrated
        } else {
            CalibrationState::Collecting {
                samples: Vec::with_capacity(target as usize),
                target: target as usize,
            }
        }
    }
}

impl SensorFusion {
    pub fn new(params: FilterParams, initial: OrientationState, calibration_samples: u32) -> Self {
        Self {
            state: initial,
            params,
            gyro_bias: Vector3::zeros(),
            calibration: CalibrationState::collecting(calibration_samples),
            zero_ref: UnitQuaternion::identity(),
        }
    }

    /// Process a sample integrated over `dt` seconds and return the current
    /// orientation, or `None` while calibrating or when the step was rejected.
    pub fn update(&mut self, sample: &ImuSample, dt: f64) -> Option<Orientation> {
        match &mut self.calibration {
            CalibrationState::Collecting { samples, target } => {
                samples.push(to_vector(sample.gyro));
                if samples.len() >= *target {
                    let sum: Vector3<f64> = samples.iter().sum();
                    self.gyro_bias = sum / samples.len() as f64;
                    self.calibration = CalibrationState::Calibrated;
                    tracing::info!(
                        bias_x = self.gyro_bias.x,
                        bias_y = self.gyro_bias.y,
                        bias_z = self.gyro_bias.z,
                        "Gyro calibration complete"
                    );
                }
                None
            }
            CalibrationState::Calibrated => {
                let gyro = to_vector(sample.gyro) - self.gyro_bias;
                let accel = to_vector(sample.accel);
                let mag = to_vector(sample.mag);

                match step(self.state, &gyro, &accel, Some(&mag), &self.params, dt) {
                    Some(next) => {
                        self.state = next;
                        Some(self.orientation())
                    }
                    None => {
                        tracing::warn!(
                            ?sample,
                            "Fusion step produced a non-finite quaternion, keeping previous state"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Current orientation relative to the zero reference.
    pub fn orientation(&self) -> Orientation {
        let relative = self.zero_ref.inverse() * self.state.quaternion;
        Orientation {
            quaternion: to_quat(&relative),
        }
    }

    /// Absolute filter state, ignoring the zero reference.
    pub fn state(&self) -> OrientationState {
        self.state
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    /// Set current orientation as the zero reference.
    pub fn set_zero(&mut self) {
        self.zero_ref = self.state.quaternion;
        tracing::info!("Zero reference set");
    }

    /// Restart gyroscope bias calibration.
    pub fn recalibrate(&mut self, samples: u32) {
        self.calibration = CalibrationState::collecting(samples);
        self.gyro_bias = Vector3::zeros();
        tracing::info!(samples, "Recalibration started");
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.calibration, CalibrationState::Calibrated)
    }

    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.gyro_bias
    }
}
