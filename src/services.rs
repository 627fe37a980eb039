//! Interfaces of the collaborators this crate consumes, plus in-memory
//! implementations used by tests and simple embeddings.
//!
//! Asynchronous completions (asset fetch, layer decode) are delivered by
//! consuming a reply handle, which posts a [`TransferEvent`] into the
//! owning connection's queue. Completions never touch transfer state
//! directly.

use crate::entity::{prim_flags, EntitySnapshot};
use crate::protocol::{AgentId, LocalId, TextureId};
use crate::texture::{LayerBoundary, TransferEvent};
use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Single-shot completion handle for an asset fetch.
#[derive(Debug)]
pub struct AssetReply {
    texture_id: TextureId,
    events: Sender<TransferEvent>,
}

impl AssetReply {
    pub fn new(texture_id: TextureId, events: Sender<TransferEvent>) -> Self {
        Self { texture_id, events }
    }

    pub fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    /// `None` reports the asset as not found. A closed connection drops the event.
    pub fn complete(self, data: Option<Bytes>) {
        let _ = self.events.send(TransferEvent::AssetLoaded {
            texture_id: self.texture_id,
            data,
        });
    }
}

/// Single-shot completion handle for a layer decode.
#[derive(Debug)]
pub struct DecodeReply {
    texture_id: TextureId,
    events: Sender<TransferEvent>,
}

impl DecodeReply {
    pub fn new(texture_id: TextureId, events: Sender<TransferEvent>) -> Self {
        Self { texture_id, events }
    }

    pub fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    /// An empty table means the codestream could not be split into layers.
    pub fn complete(self, layers: Vec<LayerBoundary>) {
        let _ = self.events.send(TransferEvent::LayersDecoded {
            texture_id: self.texture_id,
            layers,
        });
    }
}

pub trait AssetStore: Send + Sync {
    fn request(&self, texture_id: TextureId, reply: AssetReply);
}

pub trait LayerDecoder: Send + Sync {
    fn begin_decode(&self, texture_id: TextureId, data: Bytes, reply: DecodeReply);
}

pub trait PermissionEngine: Send + Sync {
    fn generate_flags(&self, recipient: AgentId, entity: &EntitySnapshot) -> u32;
}

pub trait SceneCache: Send + Sync {
    fn has_cached(&self, recipient: AgentId, local_id: LocalId, crc: u32) -> bool;
    fn record_cached(&self, recipient: AgentId, local_id: LocalId, crc: u32);
}

pub trait SceneSource: Send + Sync {
    fn snapshot(&self, local_id: LocalId) -> Option<Arc<EntitySnapshot>>;
}

/// Grants owners modify/copy rights and everyone else nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerPermissions;

impl PermissionEngine for OwnerPermissions {
    fn generate_flags(&self, recipient: AgentId, entity: &EntitySnapshot) -> u32 {
        if recipient == entity.owner_id {
            prim_flags::OBJECT_MODIFY | prim_flags::OBJECT_COPY | prim_flags::OBJECT_YOU_OWNER
        } else {
            0
        }
    }
}

/// Replies on the caller's thread; the completion is still observed on the
/// next event drain, like a real asynchronous store.
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: RwLock<AHashMap<TextureId, Bytes>>,
    requests: AtomicUsize,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, texture_id: TextureId, data: Bytes) {
        if let Ok(mut assets) = self.assets.write() {
            assets.insert(texture_id, data);
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl AssetStore for MemoryAssetStore {
    fn request(&self, texture_id: TextureId, reply: AssetReply) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let data = self.assets.read().ok().and_then(|assets| assets.get(&texture_id).cloned());
        reply.complete(data);
    }
}

/// Scene cache shared across connections.
#[derive(Clone, Default)]
pub struct MemorySceneCache {
    entries: Arc<RwLock<AHashMap<(AgentId, LocalId), u32>>>,
}

impl MemorySceneCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forget_agent(&self, agent: AgentId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(recipient, _), _| *recipient != agent);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SceneCache for MemorySceneCache {
    fn has_cached(&self, recipient: AgentId, local_id: LocalId, crc: u32) -> bool {
        self.entries
            .read()
            .map(|entries| entries.get(&(recipient, local_id)) == Some(&crc))
            .unwrap_or(false)
    }

    fn record_cached(&self, recipient: AgentId, local_id: LocalId, crc: u32) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((recipient, local_id), crc);
        }
    }
}

#[derive(Default)]
pub struct MemoryScene {
    entities: RwLock<AHashMap<LocalId, Arc<EntitySnapshot>>>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, entity: EntitySnapshot) {
        if let Ok(mut entities) = self.entities.write() {
            entities.insert(entity.local_id, Arc::new(entity));
        }
    }

    pub fn remove(&self, local_id: LocalId) {
        if let Ok(mut entities) = self.entities.write() {
            entities.remove(&local_id);
        }
    }
}

impl SceneSource for MemoryScene {
    fn snapshot(&self, local_id: LocalId) -> Option<Arc<EntitySnapshot>> {
        self.entities.read().ok().and_then(|entities| entities.get(&local_id).cloned())
    }
}
