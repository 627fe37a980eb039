//! 16-bit fixed-point quantization used by the terse update layout.

use bytes::{Buf, BufMut};
use glam::{Quat, Vec3};

pub const VELOCITY_RANGE: f32 = 128.0;
pub const ACCELERATION_RANGE: f32 = 64.0;
pub const ROTATION_RANGE: f32 = 1.0;
pub const ANGULAR_VELOCITY_RANGE: f32 = 64.0;

const U16_MAX: f32 = u16::MAX as f32;

/// Maps `value` clamped to `[lower, upper]` onto `0..=65535`.
pub fn float_to_u16(value: f32, lower: f32, upper: f32) -> u16 {
    let value = if value.is_nan() { 0.0 } else { value.clamp(lower, upper) };
    ((value - lower) / (upper - lower) * U16_MAX).round() as u16
}

/// Inverse of [`float_to_u16`]. Results within one step of zero snap to zero
/// so a resting entity decodes as exactly still.
pub fn u16_to_float(value: u16, lower: f32, upper: f32) -> f32 {
    let delta = upper - lower;
    let decoded = value as f32 / U16_MAX * delta + lower;
    let step = delta / U16_MAX;

    if decoded.abs() < step {
        0.0
    } else {
        decoded
    }
}

/// Largest absolute error a round trip through 16 bits may introduce over
/// a symmetric range of `±range`.
pub fn quantization_step(range: f32) -> f32 {
    2.0 * range / U16_MAX
}

pub fn put_vec3_u16<B: BufMut>(buf: &mut B, v: Vec3, range: f32) {
    buf.put_u16_le(float_to_u16(v.x, -range, range));
    buf.put_u16_le(float_to_u16(v.y, -range, range));
    buf.put_u16_le(float_to_u16(v.z, -range, range));
}

pub fn put_quat_u16<B: BufMut>(buf: &mut B, q: Quat) {
    buf.put_u16_le(float_to_u16(q.x, -ROTATION_RANGE, ROTATION_RANGE));
    buf.put_u16_le(float_to_u16(q.y, -ROTATION_RANGE, ROTATION_RANGE));
    buf.put_u16_le(float_to_u16(q.z, -ROTATION_RANGE, ROTATION_RANGE));
    buf.put_u16_le(float_to_u16(q.w, -ROTATION_RANGE, ROTATION_RANGE));
}

pub fn get_vec3_u16<B: Buf>(buf: &mut B, range: f32) -> Vec3 {
    let x = u16_to_float(buf.get_u16_le(), -range, range);
    let y = u16_to_float(buf.get_u16_le(), -range, range);
    let z = u16_to_float(buf.get_u16_le(), -range, range);
    Vec3::new(x, y, z)
}

pub fn get_quat_u16<B: Buf>(buf: &mut B) -> Quat {
    let x = u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE);
    let y = u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE);
    let z = u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE);
    let w = u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE);
    Quat::from_xyzw(x, y, z, w)
}

pub fn put_vec3_f32<B: BufMut>(buf: &mut B, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

pub fn get_vec3_f32<B: Buf>(buf: &mut B) -> Vec3 {
    let x = buf.get_f32_le();
    let y = buf.get_f32_le();
    let z = buf.get_f32_le();
    Vec3::new(x, y, z)
}

/// Writes the 12-byte packed rotation: normalized x, y, z with the sign
/// chosen so the implied w is non-negative.
pub fn put_quat_packed<B: BufMut>(buf: &mut B, q: Quat) {
    let q = if q.length_squared() > f32::EPSILON { q.normalize() } else { Quat::IDENTITY };
    let q = if q.w < 0.0 { -q } else { q };
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
}

pub fn get_quat_packed<B: Buf>(buf: &mut B) -> Quat {
    let x = buf.get_f32_le();
    let y = buf.get_f32_le();
    let z = buf.get_f32_le();
    let w = (1.0 - (x * x + y * y + z * z)).max(0.0).sqrt();
    Quat::from_xyzw(x, y, z, w)
}
