use glam::{EulerRot, Quat, Vec3};

/// Raw sensor reading streamed by the Blueboy board.
///
/// Values are passed through exactly as the device sent them: no unit
/// conversion, no range checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Magnetic field (uT).
    pub mag: Vec3,
    /// Linear acceleration (m/s^2).
    pub accel: Vec3,
    /// Angular velocity (rad/s).
    pub gyro: Vec3,
}

/// Fused orientation output from the sensor fusion filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    /// Orientation as a unit quaternion.
    pub quaternion: Quat,
}

impl Orientation {
    /// Quaternion components in scalar-first order: `[w, x, y, z]`.
    pub fn components(&self) -> [f32; 4] {
        let q = self.quaternion;
        [q.w, q.x, q.y, q.z]
    }

    /// Roll, pitch and yaw in radians (ZYX sequence).
    pub fn euler_angles(&self) -> (f32, f32, f32) {
        let (yaw, pitch, roll) = self.quaternion.to_euler(EulerRot::ZYX);
        (roll, pitch, yaw)
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            quaternion: Quat::IDENTITY,
        }
    }
}
