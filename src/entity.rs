//! Entity snapshots and the update-flag masks that describe what changed.

use crate::protocol::{AgentId, LocalId, ObjectId};
use bytes::Bytes;
use glam::{Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Mask of entity fields changed since the recipient last saw the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UpdateFlags(pub u32);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);
    pub const ATTACHMENT_POINT: UpdateFlags = UpdateFlags(1 << 0);
    pub const MATERIAL: UpdateFlags = UpdateFlags(1 << 1);
    pub const CLICK_ACTION: UpdateFlags = UpdateFlags(1 << 2);
    pub const SCALE: UpdateFlags = UpdateFlags(1 << 3);
    pub const PARENT_ID: UpdateFlags = UpdateFlags(1 << 4);
    pub const PRIM_FLAGS: UpdateFlags = UpdateFlags(1 << 5);
    pub const SHAPE: UpdateFlags = UpdateFlags(1 << 6);
    pub const MEDIA_URL: UpdateFlags = UpdateFlags(1 << 7);
    pub const SCRATCH_PAD: UpdateFlags = UpdateFlags(1 << 8);
    pub const TEXTURES: UpdateFlags = UpdateFlags(1 << 9);
    pub const TEXTURE_ANIM: UpdateFlags = UpdateFlags(1 << 10);
    pub const NAME_VALUE: UpdateFlags = UpdateFlags(1 << 11);
    pub const POSITION: UpdateFlags = UpdateFlags(1 << 12);
    pub const ROTATION: UpdateFlags = UpdateFlags(1 << 13);
    pub const VELOCITY: UpdateFlags = UpdateFlags(1 << 14);
    pub const ACCELERATION: UpdateFlags = UpdateFlags(1 << 15);
    pub const ANGULAR_VELOCITY: UpdateFlags = UpdateFlags(1 << 16);
    pub const COLLISION_PLANE: UpdateFlags = UpdateFlags(1 << 17);
    pub const TEXT: UpdateFlags = UpdateFlags(1 << 18);
    pub const PARTICLES: UpdateFlags = UpdateFlags(1 << 19);
    pub const EXTRA_PARAMS: UpdateFlags = UpdateFlags(1 << 20);
    pub const SOUND: UpdateFlags = UpdateFlags(1 << 21);
    pub const JOINT: UpdateFlags = UpdateFlags(1 << 22);
    pub const FIND_BEST: UpdateFlags = UpdateFlags(1 << 23);
    /// The entity is new to the recipient.
    pub const CREATE: UpdateFlags = UpdateFlags(1 << 30);
    /// Every field; forces a full refresh.
    pub const FULL_UPDATE: UpdateFlags = UpdateFlags(0x00ff_ffff);

    /// Fields the terse layout carries.
    pub const TERSE: UpdateFlags = UpdateFlags(
        Self::POSITION.0
            | Self::ROTATION.0
            | Self::VELOCITY.0
            | Self::ACCELERATION.0
            | Self::ANGULAR_VELOCITY.0
            | Self::COLLISION_PLANE.0,
    );

    /// Fields only the full layout carries.
    pub const NO_COMPRESSED: UpdateFlags = UpdateFlags(
        Self::VELOCITY.0
            | Self::ACCELERATION.0
            | Self::COLLISION_PLANE.0
            | Self::JOINT.0
            | Self::ANGULAR_VELOCITY.0,
    );

    /// Structural fields the terse layout cannot carry.
    pub const NO_TERSE: UpdateFlags = UpdateFlags(
        Self::SHAPE.0
            | Self::SCALE.0
            | Self::PRIM_FLAGS.0
            | Self::PARENT_ID.0
            | Self::ATTACHMENT_POINT.0
            | Self::TEXT.0
            | Self::NAME_VALUE.0
            | Self::EXTRA_PARAMS.0
            | Self::TEXTURE_ANIM.0
            | Self::SOUND.0
            | Self::PARTICLES.0
            | Self::MATERIAL.0
            | Self::CLICK_ACTION.0
            | Self::MEDIA_URL.0
            | Self::SCRATCH_PAD.0
            | Self::FIND_BEST.0,
    );

    /// Always reported by a compressed block so it describes the whole entity.
    pub const COMPRESSED_FORCED: UpdateFlags = UpdateFlags(
        Self::SHAPE.0
            | Self::MATERIAL.0
            | Self::TEXTURES.0
            | Self::ROTATION.0
            | Self::POSITION.0
            | Self::PRIM_FLAGS.0
            | Self::ANGULAR_VELOCITY.0
            | Self::CLICK_ACTION.0
            | Self::EXTRA_PARAMS.0
            | Self::SCALE.0,
    );

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: UpdateFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True for forced refreshes and creation updates.
    pub fn is_full_refresh(&self) -> bool {
        self.contains(Self::FULL_UPDATE) || self.intersects(Self::CREATE)
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: UpdateFlags) -> UpdateFlags {
        UpdateFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: UpdateFlags) {
        self.0 |= rhs.0;
    }
}

/// Object flag bits sent in the permission-derived flag word.
pub mod prim_flags {
    pub const CREATE_SELECTED: u32 = 0x0000_0002;
    pub const OBJECT_MODIFY: u32 = 0x0000_0004;
    pub const OBJECT_COPY: u32 = 0x0000_0008;
    pub const OBJECT_YOU_OWNER: u32 = 0x0000_0080;
    pub const PHANTOM: u32 = 0x0000_0400;
    pub const TEMPORARY_ON_REZ: u32 = 0x2000_0000;
}

pub const PCODE_PRIM: u8 = 9;
pub const PCODE_AVATAR: u8 = 47;
pub const PCODE_GRASS: u8 = 95;
pub const PCODE_NEW_TREE: u8 = 111;
pub const PCODE_TREE: u8 = 255;

/// Attachment points 31..=38 sit on the wearer's screen.
pub const HUD_ATTACHMENT_POINTS: std::ops::RangeInclusive<u8> = 31..=38;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    Prim,
    Tree { species: u8 },
    Grass { species: u8 },
    Avatar { first_name: String, last_name: String, title: String },
}

impl EntityKind {
    pub fn pcode(&self) -> u8 {
        match self {
            EntityKind::Prim => PCODE_PRIM,
            EntityKind::Tree { .. } => PCODE_NEW_TREE,
            EntityKind::Grass { .. } => PCODE_GRASS,
            EntityKind::Avatar { .. } => PCODE_AVATAR,
        }
    }

    pub fn tree_species(&self) -> Option<u8> {
        match self {
            EntityKind::Tree { species } | EntityKind::Grass { species } => Some(*species),
            _ => None,
        }
    }
}

/// Path and profile parameters of a primitive shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrimShape {
    pub path_curve: u8,
    pub profile_curve: u8,
    pub path_begin: u16,
    pub path_end: u16,
    pub path_scale_x: u8,
    pub path_scale_y: u8,
    pub path_shear_x: u8,
    pub path_shear_y: u8,
    pub path_twist: i8,
    pub path_twist_begin: i8,
    pub path_radius_offset: i8,
    pub path_taper_x: i8,
    pub path_taper_y: i8,
    pub path_revolutions: u8,
    pub path_skew: i8,
    pub profile_begin: u16,
    pub profile_end: u16,
    pub profile_hollow: u16,
}

impl PrimShape {
    /// A plain box.
    pub fn cube() -> Self {
        Self {
            path_curve: 16,
            profile_curve: 1,
            path_scale_x: 100,
            path_scale_y: 100,
            path_revolutions: 0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoundEmitter {
    pub sound_id: ObjectId,
    pub gain: f32,
    pub flags: u8,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Joint {
    pub joint_type: u8,
    pub pivot: Vec3,
    pub axis_or_anchor: Vec3,
}

/// Immutable view of one entity for a single classify + encode call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub local_id: LocalId,
    pub full_id: ObjectId,
    pub owner_id: AgentId,
    pub kind: EntityKind,
    pub parent_id: LocalId,
    pub attachment_point: u8,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub angular_velocity: Vec3,
    pub collision_plane: Vec4,
    pub scale: Vec3,
    pub shape: PrimShape,
    pub material: u8,
    pub click_action: u8,
    pub textures: Bytes,
    pub texture_anim: Bytes,
    pub name_values: String,
    pub scratch_pad: Bytes,
    pub text: String,
    pub text_color: [u8; 4],
    pub media_url: String,
    pub particles: Bytes,
    pub extra_params: Bytes,
    pub sound: Option<SoundEmitter>,
    pub joint: Joint,
    /// Set when the object was just rezzed and should show as selected to its owner.
    pub create_selected: bool,
}

impl EntitySnapshot {
    pub fn new(local_id: LocalId, full_id: ObjectId, owner_id: AgentId, kind: EntityKind) -> Self {
        Self {
            local_id,
            full_id,
            owner_id,
            kind,
            parent_id: 0,
            attachment_point: 0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            collision_plane: Vec4::ZERO,
            scale: Vec3::ONE,
            shape: PrimShape::cube(),
            material: 3,
            click_action: 0,
            textures: Bytes::new(),
            texture_anim: Bytes::new(),
            name_values: String::new(),
            scratch_pad: Bytes::new(),
            text: String::new(),
            text_color: [0; 4],
            media_url: String::new(),
            particles: Bytes::new(),
            extra_params: Bytes::new(),
            sound: None,
            joint: Joint::default(),
            create_selected: false,
        }
    }

    pub fn is_avatar(&self) -> bool {
        matches!(self.kind, EntityKind::Avatar { .. })
    }

    /// Attachments are prims linked to an avatar at a non-zero attachment point.
    pub fn is_attachment(&self) -> bool {
        !self.is_avatar() && self.attachment_point != 0 && self.parent_id != 0
    }

    pub fn is_hud(&self) -> bool {
        self.is_attachment() && HUD_ATTACHMENT_POINTS.contains(&self.attachment_point)
    }

    /// Attachment point packed as two swapped nibbles.
    pub fn attachment_state(&self) -> u8 {
        let ap = self.attachment_point;
        (ap % 16) * 16 + ap / 16
    }

    /// Checksum over the non-transient fields; motion is excluded.
    pub fn structural_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.full_id.as_bytes());
        hasher.update(self.owner_id.as_bytes());
        hasher.update(&[self.kind.pcode(), self.attachment_point, self.material, self.click_action]);
        hasher.update(&self.parent_id.to_le_bytes());
        for component in self.scale.to_array() {
            hasher.update(&component.to_le_bytes());
        }

        let shape = &self.shape;
        hasher.update(&[
            shape.path_curve,
            shape.profile_curve,
            shape.path_scale_x,
            shape.path_scale_y,
            shape.path_shear_x,
            shape.path_shear_y,
            shape.path_twist as u8,
            shape.path_twist_begin as u8,
            shape.path_radius_offset as u8,
            shape.path_taper_x as u8,
            shape.path_taper_y as u8,
            shape.path_revolutions,
            shape.path_skew as u8,
        ]);
        for value in [shape.path_begin, shape.path_end, shape.profile_begin, shape.profile_end, shape.profile_hollow] {
            hasher.update(&value.to_le_bytes());
        }

        hasher.update(&self.textures);
        hasher.update(&self.texture_anim);
        hasher.update(self.name_values.as_bytes());
        hasher.update(self.text.as_bytes());
        hasher.update(&self.text_color);
        hasher.update(self.media_url.as_bytes());
        hasher.update(&self.particles);
        hasher.update(&self.extra_params);
        if let Some(sound) = &self.sound {
            hasher.update(sound.sound_id.as_bytes());
            hasher.update(&sound.gain.to_le_bytes());
            hasher.update(&[sound.flags]);
            hasher.update(&sound.radius.to_le_bytes());
        }
        if let EntityKind::Avatar { first_name, last_name, title } = &self.kind {
            hasher.update(first_name.as_bytes());
            hasher.update(last_name.as_bytes());
            hasher.update(title.as_bytes());
        }
        hasher.finalize()
    }
}
