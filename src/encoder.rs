//! Wire encoding of entity updates in the four representation classes.
//!
//! Every function here writes one self-contained block; framing blocks into
//! packets is the job of [`crate::protocol::UpdatePacketWriter`].

use crate::classify::RepresentationClass;
use crate::entity::{EntityKind, EntitySnapshot, PrimShape, UpdateFlags};
use crate::error::{LinkError, Result};
use crate::protocol::{need, LocalId};
use crate::quantize::{
    get_quat_u16, get_vec3_f32, get_vec3_u16, put_quat_packed, put_quat_u16, put_vec3_f32, put_vec3_u16,
    ACCELERATION_RANGE, ANGULAR_VELOCITY_RANGE, VELOCITY_RANGE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3, Vec4};

pub const TERSE_PRIM_SIZE: usize = 44;
pub const TERSE_AVATAR_SIZE: usize = 60;
pub const OBJECT_DATA_PRIM_SIZE: usize = 60;
pub const OBJECT_DATA_AVATAR_SIZE: usize = 76;
pub const CACHED_BLOCK_SIZE: usize = 12;
pub const SHAPE_SIZE: usize = 23;

/// Longest hover text kept, excluding the terminator.
pub const MAX_TEXT_LEN: usize = 254;

/// Section bits of the compressed layout.
pub mod compressed_flags {
    pub const SCRATCH_PAD: u32 = 0x01;
    pub const TREE: u32 = 0x02;
    pub const HAS_TEXT: u32 = 0x04;
    pub const HAS_PARTICLES: u32 = 0x08;
    pub const HAS_SOUND: u32 = 0x10;
    pub const HAS_PARENT: u32 = 0x20;
    pub const TEXTURE_ANIM: u32 = 0x40;
    pub const HAS_ANGULAR_VELOCITY: u32 = 0x80;
    pub const HAS_NAME_VALUES: u32 = 0x100;
    pub const MEDIA_URL: u32 = 0x200;
}

/// Byte offset of the compressed-flags word inside the compressed data section.
pub const COMPRESSED_FLAGS_OFFSET: usize = 16 + 4 + 1 + 1 + 4 + 1 + 1 + 12 + 12 + 12;

/// Per-recipient inputs to encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeContext {
    /// Fields changed since the recipient last saw the entity.
    pub mask: UpdateFlags,
    /// Permission-derived object flags for this recipient.
    pub flags: u32,
}

impl EncodeContext {
    pub fn new(mask: UpdateFlags, flags: u32) -> Self {
        Self { mask, flags }
    }
}

pub fn encode(entity: &EntitySnapshot, class: RepresentationClass, ctx: &EncodeContext) -> Result<Bytes> {
    match class {
        RepresentationClass::Full => encode_full(entity, ctx),
        RepresentationClass::Compressed => encode_compressed(entity, ctx),
        RepresentationClass::Cached => Ok(encode_cached(entity, ctx)),
        RepresentationClass::Terse => encode_terse(entity, ctx),
    }
}

/// Collision plane as sent for avatars; an unset plane becomes straight up.
fn collision_plane(entity: &EntitySnapshot) -> Vec4 {
    if entity.collision_plane == Vec4::ZERO {
        Vec4::W
    } else {
        entity.collision_plane
    }
}

fn put_vec4_f32<B: BufMut>(buf: &mut B, v: Vec4) {
    for component in v.to_array() {
        buf.put_f32_le(component);
    }
}

pub fn encode_terse(entity: &EntitySnapshot, ctx: &EncodeContext) -> Result<Bytes> {
    let avatar = entity.is_avatar();
    let data_len = if avatar { TERSE_AVATAR_SIZE } else { TERSE_PRIM_SIZE };
    let textures: &[u8] = if ctx.mask.contains(UpdateFlags::TEXTURES) && !avatar {
        &entity.textures
    } else {
        &[]
    };

    let mut buf = BytesMut::with_capacity(1 + data_len + 2 + textures.len());
    buf.put_u8(data_len as u8);
    buf.put_u32_le(entity.local_id);
    buf.put_u8(entity.attachment_state());
    buf.put_u8(avatar as u8);
    if avatar {
        put_vec4_f32(&mut buf, collision_plane(entity));
    }
    put_vec3_f32(&mut buf, entity.position);
    put_vec3_u16(&mut buf, entity.velocity, VELOCITY_RANGE);
    put_vec3_u16(&mut buf, entity.acceleration, ACCELERATION_RANGE);
    put_quat_u16(&mut buf, entity.rotation);
    put_vec3_u16(&mut buf, entity.angular_velocity, ANGULAR_VELOCITY_RANGE);

    put_var2(&mut buf, "texture_entry", textures)?;
    Ok(buf.freeze())
}

/// A terse block read back from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TerseUpdate {
    pub local_id: LocalId,
    pub attachment_state: u8,
    pub collision_plane: Option<Vec4>,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub rotation: Quat,
    pub angular_velocity: Vec3,
    pub textures: Bytes,
}

impl TerseUpdate {
    pub fn is_avatar(&self) -> bool {
        self.collision_plane.is_some()
    }

    /// Reads one block and advances `data` past it.
    pub fn decode(data: &mut &[u8]) -> Result<Self> {
        need(data, 1)?;
        let len = data.get_u8() as usize;
        if len != TERSE_PRIM_SIZE && len != TERSE_AVATAR_SIZE {
            return Err(LinkError::InvalidMessage(format!("Bad terse block length {}", len)));
        }
        need(data, len)?;

        let local_id = data.get_u32_le();
        let attachment_state = data.get_u8();
        let avatar = data.get_u8() != 0;
        if avatar != (len == TERSE_AVATAR_SIZE) {
            return Err(LinkError::InvalidMessage(format!(
                "Terse avatar flag does not match block length {}",
                len
            )));
        }
        let collision_plane = if avatar {
            Some(Vec4::new(data.get_f32_le(), data.get_f32_le(), data.get_f32_le(), data.get_f32_le()))
        } else {
            None
        };
        let position = get_vec3_f32(data);
        let velocity = get_vec3_u16(data, VELOCITY_RANGE);
        let acceleration = get_vec3_u16(data, ACCELERATION_RANGE);
        let rotation = get_quat_u16(data);
        let angular_velocity = get_vec3_u16(data, ANGULAR_VELOCITY_RANGE);

        need(data, 2)?;
        let texture_len = data.get_u16_le() as usize;
        need(data, texture_len)?;
        let textures = Bytes::copy_from_slice(&data[..texture_len]);
        data.advance(texture_len);

        Ok(Self {
            local_id,
            attachment_state,
            collision_plane,
            position,
            velocity,
            acceleration,
            rotation,
            angular_velocity,
            textures,
        })
    }
}

fn put_var1(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<()> {
    if data.len() > u8::MAX as usize {
        return Err(LinkError::FieldTooLong { field, len: data.len(), max: u8::MAX as usize });
    }
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
    Ok(())
}

fn put_var2(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(LinkError::FieldTooLong { field, len: data.len(), max: u16::MAX as usize });
    }
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Strings travel NUL-terminated; an empty string is sent as zero bytes.
fn terminated(value: &str) -> Vec<u8> {
    if value.is_empty() {
        return Vec::new();
    }
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    bytes
}

/// Hover text cut to fit a one-byte length, on a character boundary.
fn truncated_text(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LEN {
        return text;
    }
    let mut end = MAX_TEXT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn put_shape(buf: &mut BytesMut, shape: &PrimShape) {
    buf.put_u8(shape.path_curve);
    buf.put_u8(shape.profile_curve);
    buf.put_u16_le(shape.path_begin);
    buf.put_u16_le(shape.path_end);
    buf.put_u8(shape.path_scale_x);
    buf.put_u8(shape.path_scale_y);
    buf.put_u8(shape.path_shear_x);
    buf.put_u8(shape.path_shear_y);
    buf.put_i8(shape.path_twist);
    buf.put_i8(shape.path_twist_begin);
    buf.put_i8(shape.path_radius_offset);
    buf.put_i8(shape.path_taper_x);
    buf.put_i8(shape.path_taper_y);
    buf.put_u8(shape.path_revolutions);
    buf.put_i8(shape.path_skew);
    buf.put_u16_le(shape.profile_begin);
    buf.put_u16_le(shape.profile_end);
    buf.put_u16_le(shape.profile_hollow);
}

/// Name-value block the viewer uses to label an avatar.
pub fn avatar_name_values(first_name: &str, last_name: &str, title: &str) -> String {
    format!(
        "FirstName STRING RW SV {}\nLastName STRING RW SV {}\nTitle STRING RW SV {}",
        first_name, last_name, title
    )
}

fn object_data(entity: &EntitySnapshot) -> BytesMut {
    let avatar = entity.is_avatar();
    let mut data = BytesMut::with_capacity(OBJECT_DATA_AVATAR_SIZE);
    if avatar {
        put_vec4_f32(&mut data, collision_plane(entity));
    }
    put_vec3_f32(&mut data, entity.position);
    put_vec3_f32(&mut data, entity.velocity);
    put_vec3_f32(&mut data, entity.acceleration);
    put_quat_packed(&mut data, entity.rotation);
    put_vec3_f32(&mut data, entity.angular_velocity);
    data
}

pub fn encode_full(entity: &EntitySnapshot, ctx: &EncodeContext) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(256 + entity.textures.len() + entity.name_values.len());

    buf.put_u32_le(entity.local_id);
    buf.put_u8(entity.attachment_state());
    buf.put_slice(entity.full_id.as_bytes());
    buf.put_u32_le(entity.structural_crc());
    buf.put_u8(entity.kind.pcode());
    buf.put_u8(entity.material);
    buf.put_u8(entity.click_action);
    put_vec3_f32(&mut buf, entity.scale);
    put_var1(&mut buf, "object_data", &object_data(entity))?;
    buf.put_u32_le(entity.parent_id);
    buf.put_u32_le(ctx.flags);
    put_shape(&mut buf, &entity.shape);

    let (textures, name_values) = match &entity.kind {
        EntityKind::Avatar { first_name, last_name, title } => {
            (Bytes::new(), avatar_name_values(first_name, last_name, title))
        }
        _ => (entity.textures.clone(), entity.name_values.clone()),
    };
    put_var2(&mut buf, "texture_entry", &textures)?;
    put_var1(&mut buf, "texture_anim", &entity.texture_anim)?;
    put_var2(&mut buf, "name_value", &terminated(&name_values))?;
    put_var2(&mut buf, "scratch_pad", &entity.scratch_pad)?;
    put_var1(&mut buf, "text", &terminated(truncated_text(&entity.text)))?;
    buf.put_slice(&entity.text_color);
    put_var1(&mut buf, "media_url", &terminated(&entity.media_url))?;
    put_var1(&mut buf, "particles", &entity.particles)?;
    put_var1(&mut buf, "extra_params", &entity.extra_params)?;

    match &entity.sound {
        Some(sound) => {
            buf.put_slice(sound.sound_id.as_bytes());
            buf.put_slice(entity.owner_id.as_bytes());
            buf.put_f32_le(sound.gain);
            buf.put_u8(sound.flags);
            buf.put_f32_le(sound.radius);
        }
        None => {
            buf.put_bytes(0, 16);
            buf.put_slice(entity.owner_id.as_bytes());
            buf.put_f32_le(0.0);
            buf.put_u8(0);
            buf.put_f32_le(0.0);
        }
    }

    buf.put_u8(entity.joint.joint_type);
    put_vec3_f32(&mut buf, entity.joint.pivot);
    put_vec3_f32(&mut buf, entity.joint.axis_or_anchor);

    Ok(buf.freeze())
}

/// Sections the compressed block will carry for this entity and mask.
pub fn compressed_sections(entity: &EntitySnapshot, mask: UpdateFlags) -> u32 {
    use compressed_flags::*;

    let mask = mask | UpdateFlags::COMPRESSED_FORCED;
    let mut flags = 0;

    if mask.contains(UpdateFlags::ANGULAR_VELOCITY) && entity.angular_velocity != Vec3::ZERO {
        flags |= HAS_ANGULAR_VELOCITY;
    }
    if mask.contains(UpdateFlags::PARENT_ID) && entity.parent_id != 0 {
        flags |= HAS_PARENT;
    }
    if entity.kind.tree_species().is_some() {
        flags |= TREE;
    }
    if mask.contains(UpdateFlags::TEXT) && !entity.text.is_empty() {
        flags |= HAS_TEXT;
    }
    if mask.contains(UpdateFlags::MEDIA_URL) && !entity.media_url.is_empty() {
        flags |= MEDIA_URL;
    }
    if mask.contains(UpdateFlags::PARTICLES) && !entity.particles.is_empty() {
        flags |= HAS_PARTICLES;
    }
    if mask.contains(UpdateFlags::SOUND) && entity.sound.is_some() {
        flags |= HAS_SOUND;
    }
    if mask.contains(UpdateFlags::NAME_VALUE) && !entity.name_values.is_empty() {
        flags |= HAS_NAME_VALUES;
    }
    if mask.contains(UpdateFlags::TEXTURE_ANIM) && !entity.texture_anim.is_empty() {
        flags |= TEXTURE_ANIM;
    }
    flags
}

pub fn encode_compressed(entity: &EntitySnapshot, ctx: &EncodeContext) -> Result<Bytes> {
    use compressed_flags::*;

    let sections = compressed_sections(entity, ctx.mask);
    let mut data = BytesMut::with_capacity(128 + entity.textures.len());

    data.put_slice(entity.full_id.as_bytes());
    data.put_u32_le(entity.local_id);
    data.put_u8(entity.kind.pcode());
    data.put_u8(entity.attachment_state());
    data.put_u32_le(entity.structural_crc());
    data.put_u8(entity.material);
    data.put_u8(entity.click_action);
    put_vec3_f32(&mut data, entity.scale);
    put_vec3_f32(&mut data, entity.position);
    put_quat_packed(&mut data, entity.rotation);
    data.put_u32_le(sections);

    if sections & HAS_ANGULAR_VELOCITY != 0 {
        put_vec3_f32(&mut data, entity.angular_velocity);
    }
    if sections & HAS_PARENT != 0 {
        data.put_u32_le(entity.parent_id);
    }
    if let (true, Some(species)) = (sections & TREE != 0, entity.kind.tree_species()) {
        data.put_u8(species);
    }
    if sections & HAS_TEXT != 0 {
        data.put_slice(&terminated(truncated_text(&entity.text)));
        data.put_slice(&entity.text_color);
    }
    if sections & MEDIA_URL != 0 {
        data.put_slice(&terminated(&entity.media_url));
    }
    if sections & HAS_PARTICLES != 0 {
        data.put_slice(&entity.particles);
    }
    if let (true, Some(sound)) = (sections & HAS_SOUND != 0, &entity.sound) {
        data.put_slice(sound.sound_id.as_bytes());
        data.put_f32_le(sound.gain);
        data.put_u8(sound.flags);
        data.put_f32_le(sound.radius);
    }
    if sections & HAS_NAME_VALUES != 0 {
        data.put_slice(&terminated(&entity.name_values));
    }

    put_shape(&mut data, &entity.shape);
    data.put_u32_le(entity.textures.len() as u32);
    data.put_slice(&entity.textures);
    if sections & TEXTURE_ANIM != 0 {
        data.put_u32_le(entity.texture_anim.len() as u32);
        data.put_slice(&entity.texture_anim);
    }

    let mut buf = BytesMut::with_capacity(6 + data.len());
    buf.put_u32_le(ctx.flags);
    put_var2(&mut buf, "compressed_data", &data)?;
    Ok(buf.freeze())
}

pub fn encode_cached(entity: &EntitySnapshot, ctx: &EncodeContext) -> Bytes {
    let mut buf = BytesMut::with_capacity(CACHED_BLOCK_SIZE);
    buf.put_u32_le(entity.local_id);
    buf.put_u32_le(entity.structural_crc());
    buf.put_u32_le(ctx.flags);
    buf.freeze()
}
