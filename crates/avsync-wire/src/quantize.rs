//! Lossy fixed-size encodings for orientations, vectors, ratios and gains
//!
//! Every packer writes exactly the number of bytes it documents and every
//! unpacker reads exactly that many. Callers check space beforehand.

use bytes::{Buf, BufMut};
use glam::{Quat, Vec3};

/// Compressed quaternion size
pub const SIX_BYTE_QUAT_SIZE: usize = 6;

/// Fixed-point vec3 size
pub const SIX_BYTE_VEC3_SIZE: usize = 6;

/// Ratio size
pub const TWO_BYTE_RATIO_SIZE: usize = 2;

/// Fractional bits for normalized joint translations
pub const TRANSLATION_COMPRESSION_RADIX: u32 = 14;

/// Fractional bits for hand controller translations (range +-8m)
pub const HAND_CONTROLLER_COMPRESSION_RADIX: u32 = 12;

/// Fractional bits for the sensor-to-world scale
pub const SENSOR_TO_WORLD_SCALE_RADIX: u32 = 10;

const QUAT_COMPONENT_BITS: u32 = 15;
const QUAT_COMPONENT_RANGE: f32 = ((1u32 << QUAT_COMPONENT_BITS) - 1) as f32;
const QUAT_COMPONENT_MAGNITUDE: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Pack a rotation into six bytes.
///
/// The largest component is dropped (its sign is forced negative so the
/// decoder can rebuild it). The three remaining components are each
/// quantized to 15 bits over `[-1/sqrt(2), 1/sqrt(2)]`; the index of the
/// dropped component rides in the top bits of the first two words.
/// Words are big-endian.
pub fn pack_orientation_quat<B: BufMut>(buf: &mut B, rotation: Quat) -> usize {
    let rotation = if rotation.length_squared() > 0.0 {
        rotation.normalize()
    } else {
        Quat::IDENTITY
    };
    let mut q = rotation.to_array();

    let mut largest = 0;
    for i in 1..4 {
        if q[i].abs() > q[largest].abs() {
            largest = i;
        }
    }
    if q[largest] > 0.0 {
        for c in q.iter_mut() {
            *c = -*c;
        }
    }

    let mut components = [0u16; 3];
    let mut j = 0;
    for (i, c) in q.iter().enumerate() {
        if i != largest {
            let value = (c + QUAT_COMPONENT_MAGNITUDE) / (2.0 * QUAT_COMPONENT_MAGNITUDE);
            components[j] = (value.clamp(0.0, 1.0) * QUAT_COMPONENT_RANGE).round() as u16;
            j += 1;
        }
    }

    let largest = largest as u16;
    components[0] = (components[0] & 0x7fff) | ((largest & 0x01) << 15);
    components[1] = (components[1] & 0x7fff) | ((largest & 0x02) << 14);

    for component in components {
        buf.put_u16(component);
    }
    SIX_BYTE_QUAT_SIZE
}

/// Inverse of [`pack_orientation_quat`]; always yields a unit quaternion
pub fn unpack_orientation_quat<B: Buf>(buf: &mut B) -> Quat {
    let raw = [buf.get_u16(), buf.get_u16(), buf.get_u16()];
    let largest = (((raw[1] & 0x8000) >> 14) | ((raw[0] & 0x8000) >> 15)) as usize;

    let mut parts = [0f32; 3];
    for (part, word) in parts.iter_mut().zip(raw) {
        let quantized = (word & 0x7fff) as f32;
        *part = (quantized / QUAT_COMPONENT_RANGE) * (2.0 * QUAT_COMPONENT_MAGNITUDE)
            - QUAT_COMPONENT_MAGNITUDE;
    }

    let sum: f32 = parts.iter().map(|p| p * p).sum();
    let missing = -(1.0 - sum).max(0.0).sqrt();

    let mut q = [0f32; 4];
    let mut j = 0;
    for (i, c) in q.iter_mut().enumerate() {
        if i == largest {
            *c = missing;
        } else {
            *c = parts[j];
            j += 1;
        }
    }
    Quat::from_array(q).normalize()
}

/// Pack a scalar as signed fixed point with `radix` fractional bits (i16 LE)
#[inline]
pub fn pack_fixed_scalar<B: BufMut>(buf: &mut B, scalar: f32, radix: u32) -> usize {
    let scaled = (scalar * (1u32 << radix) as f32).round();
    buf.put_i16_le(scaled as i16);
    2
}

#[inline]
pub fn unpack_fixed_scalar<B: Buf>(buf: &mut B, radix: u32) -> f32 {
    buf.get_i16_le() as f32 / (1u32 << radix) as f32
}

/// Pack a vector as three signed fixed point components
pub fn pack_fixed_vec3<B: BufMut>(buf: &mut B, v: Vec3, radix: u32) -> usize {
    pack_fixed_scalar(buf, v.x, radix);
    pack_fixed_scalar(buf, v.y, radix);
    pack_fixed_scalar(buf, v.z, radix);
    SIX_BYTE_VEC3_SIZE
}

pub fn unpack_fixed_vec3<B: Buf>(buf: &mut B, radix: u32) -> Vec3 {
    let x = unpack_fixed_scalar(buf, radix);
    let y = unpack_fixed_scalar(buf, radix);
    let z = unpack_fixed_scalar(buf, radix);
    Vec3::new(x, y, z)
}

const SMALL_RATIO_LIMIT: f32 = 10.0;
const LARGE_RATIO_LIMIT: f32 = 1000.0;

/// Pack a positive ratio into two bytes (i16 LE).
///
/// Ratios below 10 map linearly onto `1..=i16::MAX`; ratios in
/// `[10, 1000]` map linearly onto `i16::MIN..=0`. A zero ratio is not
/// representable and reads back as 10.
pub fn pack_ratio_two_byte<B: BufMut>(buf: &mut B, ratio: f32) -> usize {
    let holder = if ratio < SMALL_RATIO_LIMIT {
        (ratio.max(0.0) * (i16::MAX as f32 / SMALL_RATIO_LIMIT)).floor()
    } else {
        ((ratio.min(LARGE_RATIO_LIMIT) - SMALL_RATIO_LIMIT) * (i16::MIN as f32 / LARGE_RATIO_LIMIT)).floor()
    };
    buf.put_i16_le(holder as i16);
    TWO_BYTE_RATIO_SIZE
}

pub fn unpack_ratio_two_byte<B: Buf>(buf: &mut B) -> f32 {
    let holder = buf.get_i16_le();
    if holder > 0 {
        (holder as f32 / i16::MAX as f32) * SMALL_RATIO_LIMIT
    } else {
        (holder as f32 / i16::MIN as f32) * LARGE_RATIO_LIMIT + SMALL_RATIO_LIMIT
    }
}

const GAIN_STEPS_PER_OCTAVE: f32 = 32.0;
const GAIN_SILENCE: u8 = 0xff;

/// Pack a gain in `[0, 1]` into one byte on a log2 scale.
///
/// Byte `n` means `2^(-n/32)` (about 0.19 dB per step); `0xff` is silence.
/// Gains of 1 or more saturate at `0`.
pub fn pack_gain_byte(gain: f32) -> u8 {
    if gain >= 1.0 {
        return 0;
    }
    if gain.is_nan() || gain <= 0.0 {
        return GAIN_SILENCE;
    }
    let steps = (-gain.log2() * GAIN_STEPS_PER_OCTAVE).round();
    if steps >= GAIN_SILENCE as f32 {
        GAIN_SILENCE
    } else {
        steps as u8
    }
}

pub fn unpack_gain_byte(byte: u8) -> f32 {
    if byte == GAIN_SILENCE {
        0.0
    } else {
        (-(byte as f32) / GAIN_STEPS_PER_OCTAVE).exp2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn same_rotation(a: Quat, b: Quat, tolerance: f32) -> bool {
        a.dot(b).abs() >= 1.0 - tolerance
    }

    #[test]
    fn test_identity_quat() {
        let mut buf = Vec::new();
        assert_eq!(pack_orientation_quat(&mut buf, Quat::IDENTITY), 6);
        assert_eq!(buf.len(), 6);
        let q = unpack_orientation_quat(&mut buf.as_slice());
        assert!(same_rotation(q, Quat::IDENTITY, 1e-6));
    }

    #[test]
    fn test_degenerate_quat_packs_identity() {
        let mut buf = Vec::new();
        pack_orientation_quat(&mut buf, Quat::from_xyzw(0.0, 0.0, 0.0, 0.0));
        let q = unpack_orientation_quat(&mut buf.as_slice());
        assert!(same_rotation(q, Quat::IDENTITY, 1e-6));
    }

    #[test]
    fn test_fixed_scalar_layout() {
        let mut buf = Vec::new();
        pack_fixed_scalar(&mut buf, 1.5, SENSOR_TO_WORLD_SCALE_RADIX);
        assert_eq!(buf, 1536i16.to_le_bytes());
        assert_eq!(unpack_fixed_scalar(&mut buf.as_slice(), SENSOR_TO_WORLD_SCALE_RADIX), 1.5);
    }

    #[test]
    fn test_fixed_scalar_saturates() {
        let mut buf = Vec::new();
        pack_fixed_scalar(&mut buf, 100.0, HAND_CONTROLLER_COMPRESSION_RADIX);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), i16::MAX);
    }

    #[test]
    fn test_ratio_ranges() {
        for ratio in [0.005f32, 0.5, 1.0, 9.99, 10.5, 250.0, 1000.0] {
            let mut buf = Vec::new();
            pack_ratio_two_byte(&mut buf, ratio);
            let back = unpack_ratio_two_byte(&mut buf.as_slice());
            let tolerance = if ratio < 10.0 { 10.0 / 32767.0 } else { 1000.0 / 32768.0 };
            assert!((back - ratio).abs() <= tolerance, "{ratio} -> {back}");
        }
    }

    #[test]
    fn test_gain_extremes() {
        assert_eq!(pack_gain_byte(1.0), 0);
        assert_eq!(pack_gain_byte(2.0), 0);
        assert_eq!(pack_gain_byte(0.0), 0xff);
        assert_eq!(pack_gain_byte(f32::NAN), 0xff);
        assert_eq!(unpack_gain_byte(0xff), 0.0);
        assert_eq!(unpack_gain_byte(0), 1.0);
        assert_eq!(pack_gain_byte(0.5), 32);
    }

    proptest! {
        #[test]
        fn prop_quat_round_trip(x in -1.0f32..1.0, y in -1.0f32..1.0, z in -1.0f32..1.0, w in -1.0f32..1.0) {
            let q = Quat::from_xyzw(x, y, z, w);
            prop_assume!(q.length() > 0.1);
            let q = q.normalize();

            let mut buf = Vec::new();
            pack_orientation_quat(&mut buf, q);
            prop_assert_eq!(buf.len(), SIX_BYTE_QUAT_SIZE);
            let back = unpack_orientation_quat(&mut buf.as_slice());
            prop_assert!((back.length() - 1.0).abs() < 1e-4);
            prop_assert!(same_rotation(back, q, 1e-4), "{:?} vs {:?}", q, back);
        }

        #[test]
        fn prop_fixed_vec3_error_bound(x in -1.0f32..1.0, y in -1.0f32..1.0, z in -1.0f32..1.0) {
            let v = Vec3::new(x, y, z);
            let mut buf = Vec::new();
            pack_fixed_vec3(&mut buf, v, TRANSLATION_COMPRESSION_RADIX);
            prop_assert_eq!(buf.len(), SIX_BYTE_VEC3_SIZE);
            let back = unpack_fixed_vec3(&mut buf.as_slice(), TRANSLATION_COMPRESSION_RADIX);
            let epsilon = 1.0 / (1u32 << TRANSLATION_COMPRESSION_RADIX) as f32;
            prop_assert!((back - v).abs().max_element() <= epsilon);
        }

        #[test]
        fn prop_gain_relative_error(gain in 0.01f32..1.0) {
            let back = unpack_gain_byte(pack_gain_byte(gain));
            prop_assert!((back - gain).abs() / gain < 0.012);
        }
    }
}
