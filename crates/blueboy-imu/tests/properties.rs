use blueboy_imu::fusion::{self, FilterParams, FusionMode, OrientationState};
use blueboy_imu::protocol::{
    decode_sample, encode_sample, Frame, FrameSynchronizer, SAMPLE_COMMAND, SYNC_MARKER,
};
use blueboy_imu::types::ImuSample;
use glam::Vec3;
use nalgebra::Vector3;
use proptest::prelude::*;
use std::io::Cursor;

fn contains_marker(bytes: &[u8]) -> bool {
    bytes.windows(SYNC_MARKER.len()).any(|w| w == SYNC_MARKER)
}

fn vec3_bits() -> impl Strategy<Value = Vec3> {
    prop::array::uniform3(any::<u32>()).prop_map(|[x, y, z]| {
        Vec3::new(f32::from_bits(x), f32::from_bits(y), f32::from_bits(z))
    })
}

/// Finite readings, with whole vectors sometimes forced to zero.
fn reading(scale: f64) -> impl Strategy<Value = Vector3<f64>> {
    prop_oneof![
        1 => Just(Vector3::zeros()),
        6 => prop::array::uniform3(-scale..scale).prop_map(Vector3::from),
    ]
}

proptest! {
    #[test]
    fn resyncs_after_any_garbage(
        garbage in prop::collection::vec(any::<u8>(), 0..256),
        payload in prop::collection::vec(any::<u8>(), 0..64),
        command in any::<u8>(),
    ) {
        // The suffix of the garbage plus the start of the marker must not
        // form a marker earlier than the real one.
        let mut head = garbage.clone();
        head.extend_from_slice(&SYNC_MARKER[..3]);
        prop_assume!(!contains_marker(&head));

        let frame = Frame::new(command, payload);
        let mut stream = garbage.clone();
        stream.extend(frame.to_bytes().unwrap());

        let mut sync = FrameSynchronizer::new(Cursor::new(stream));
        prop_assert_eq!(sync.next_frame().unwrap(), frame);
        prop_assert_eq!(sync.stats().discarded_bytes, garbage.len() as u64);
    }

    #[test]
    fn sample_bits_survive_decoding(mag in vec3_bits(), accel in vec3_bits(), gyro in vec3_bits()) {
        let sample = ImuSample { mag, accel, gyro };
        let decoded = decode_sample(&Frame::new(SAMPLE_COMMAND, encode_sample(&sample))).unwrap();

        let bits = |s: &ImuSample| -> Vec<u32> {
            [s.mag, s.accel, s.gyro]
                .iter()
                .flat_map(|v| v.to_array())
                .map(f32::to_bits)
                .collect()
        };
        prop_assert_eq!(bits(&decoded), bits(&sample));
    }

    #[test]
    fn estimate_stays_unit_norm(
        steps in prop::collection::vec((reading(10.0), reading(20.0), reading(100.0)), 1..50),
        marg in any::<bool>(),
        beta in 0.0f64..1.0,
    ) {
        let params = FilterParams {
            beta,
            mode: if marg { FusionMode::Marg } else { FusionMode::Imu },
        };
        let mut state = OrientationState::identity();
        for (gyro, accel, mag) in &steps {
            state = fusion::update(state, gyro, accel, Some(mag), &params, 0.05);
            prop_assert!((state.quaternion().norm() - 1.0).abs() < 1e-9);
        }
    }
}
