//! Choice of wire representation for one entity update.

use crate::entity::{EntitySnapshot, UpdateFlags};
use crate::protocol::{AgentId, PacketKind};
use crate::services::SceneCache;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RepresentationClass {
    Full,
    Compressed,
    Cached,
    Terse,
}

impl RepresentationClass {
    pub const ALL: [RepresentationClass; 4] = [
        RepresentationClass::Full,
        RepresentationClass::Compressed,
        RepresentationClass::Cached,
        RepresentationClass::Terse,
    ];

    pub fn packet_kind(&self) -> PacketKind {
        match self {
            RepresentationClass::Full => PacketKind::ObjectUpdate,
            RepresentationClass::Compressed => PacketKind::ObjectUpdateCompressed,
            RepresentationClass::Cached => PacketKind::ObjectUpdateCached,
            RepresentationClass::Terse => PacketKind::ImprovedTerseObjectUpdate,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            RepresentationClass::Full => 0,
            RepresentationClass::Compressed => 1,
            RepresentationClass::Cached => 2,
            RepresentationClass::Terse => 3,
        }
    }
}

/// Facts the decision table looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassTraits {
    pub attachment: bool,
    pub full_refresh: bool,
    pub no_compressed: bool,
    pub no_terse: bool,
    pub cache_hit: bool,
}

impl ClassTraits {
    pub fn new(entity: &EntitySnapshot, mask: UpdateFlags) -> Self {
        Self {
            attachment: entity.is_attachment(),
            full_refresh: mask.is_full_refresh(),
            no_compressed: mask.intersects(UpdateFlags::NO_COMPRESSED),
            no_terse: mask.intersects(UpdateFlags::NO_TERSE),
            cache_hit: false,
        }
    }
}

/// The decision table, in priority order.
pub fn decide(traits: ClassTraits) -> RepresentationClass {
    match traits {
        ClassTraits { attachment: true, .. } => RepresentationClass::Full,
        ClassTraits { full_refresh: true, .. } => RepresentationClass::Full,
        ClassTraits { cache_hit: true, no_compressed: false, .. } => RepresentationClass::Cached,
        ClassTraits { no_terse: false, no_compressed: false, .. } => RepresentationClass::Terse,
        ClassTraits { no_compressed: false, .. } => RepresentationClass::Compressed,
        _ => RepresentationClass::Full,
    }
}

/// Who an update is for.
#[derive(Clone, Copy)]
pub struct Recipient<'a> {
    pub agent_id: AgentId,
    pub scene_cache: Option<&'a dyn SceneCache>,
}

impl<'a> Recipient<'a> {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            scene_cache: None,
        }
    }

    pub fn with_scene_cache(mut self, cache: &'a dyn SceneCache) -> Self {
        self.scene_cache = Some(cache);
        self
    }
}

/// HUD attachments are only visible to the avatar wearing them.
pub fn is_suppressed(entity: &EntitySnapshot, recipient: &Recipient) -> bool {
    entity.is_hud() && entity.owner_id != recipient.agent_id
}

pub fn classify(entity: &EntitySnapshot, mask: UpdateFlags, recipient: &Recipient) -> RepresentationClass {
    let mut traits = ClassTraits::new(entity, mask);

    // The cache lookup costs a CRC; skip it when the table cannot pick Cached.
    if !traits.attachment && !traits.full_refresh && !traits.no_compressed {
        if let Some(cache) = recipient.scene_cache {
            traits.cache_hit = cache.has_cached(recipient.agent_id, entity.local_id, entity.structural_crc());
        }
    }

    decide(traits)
}
