//! Per-recipient batching of entity updates and loss recovery.
//!
//! Each tick drains the pending queue, classifies and encodes every update,
//! and packs the blocks into at most one packet per representation class.
//! A lost packet is never retransmitted: the entity references it carried
//! go back on the queue and are classified again against current state.

use crate::classify::{classify, is_suppressed, Recipient, RepresentationClass};
use crate::debug;
use crate::encoder::{encode, EncodeContext};
use crate::entity::{prim_flags, EntitySnapshot, UpdateFlags};
use crate::error::{LinkError, Result};
use crate::protocol::{AgentId, LocalId, OutgoingPacket, PacketCategory, RegionHeader, UpdatePacketWriter};
use crate::services::{PermissionEngine, SceneCache, SceneSource};
use crate::transport::{DeliveryEvent, DeliveryReceipt, PacketScheduler, Ticket};
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::Sender;
use log::warn;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_blocks_per_packet: u8,
    pub max_packet_bytes: usize,
    pub max_updates_per_tick: usize,
    pub region_handle: u64,
    pub time_dilation: u16,
    /// Ask the scheduler for reliable delivery of update packets.
    pub reliable: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_packet: 64,
            max_packet_bytes: 1200,
            max_updates_per_tick: 500,
            region_handle: 0,
            time_dilation: u16::MAX,
            reliable: false,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_blocks_per_packet(mut self, max: u8) -> Self {
        self.max_blocks_per_packet = max.max(1);
        self
    }

    pub fn with_max_packet_bytes(mut self, max: usize) -> Self {
        self.max_packet_bytes = max;
        self
    }

    pub fn with_max_updates_per_tick(mut self, max: usize) -> Self {
        self.max_updates_per_tick = max;
        self
    }

    pub fn with_region(mut self, region_handle: u64, time_dilation: u16) -> Self {
        self.region_handle = region_handle;
        self.time_dilation = time_dilation;
        self
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    fn header(&self) -> RegionHeader {
        RegionHeader {
            region_handle: self.region_handle,
            time_dilation: self.time_dilation,
        }
    }
}

/// A logical update waiting to be classified and encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedUpdate {
    pub local_id: LocalId,
    pub mask: UpdateFlags,
    pub priority: f32,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    mask: UpdateFlags,
    priority: f32,
    order: u64,
}

/// Pending updates keyed by entity; repeated updates coalesce.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    entries: AHashMap<LocalId, PendingEntry>,
    next_order: u64,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an update, OR-ing its mask into any update already pending for
    /// the entity and keeping the higher priority.
    pub fn push(&mut self, local_id: LocalId, mask: UpdateFlags, priority: f32) {
        let order = self.next_order;
        let entry = self.entries.entry(local_id).or_insert_with(|| PendingEntry {
            mask: UpdateFlags::NONE,
            priority,
            order,
        });
        entry.mask |= mask;
        entry.priority = entry.priority.max(priority);
        self.next_order += 1;
    }

    /// Removes up to `limit` updates, highest priority first, oldest first
    /// among equals.
    pub fn drain(&mut self, limit: usize) -> Vec<QueuedUpdate> {
        let mut pending: Vec<(LocalId, PendingEntry)> = self.entries.iter().map(|(id, e)| (*id, *e)).collect();
        pending.sort_by(|a, b| {
            b.1.priority
                .partial_cmp(&a.1.priority)
                .unwrap_or(Ordering::Equal)
                .then(a.1.order.cmp(&b.1.order))
        });
        pending.truncate(limit);

        pending
            .into_iter()
            .map(|(local_id, entry)| {
                self.entries.remove(&local_id);
                QueuedUpdate {
                    local_id,
                    mask: entry.mask,
                    priority: entry.priority,
                }
            })
            .collect()
    }

    pub fn mask_of(&self, local_id: LocalId) -> Option<UpdateFlags> {
        self.entries.get(&local_id).map(|e| e.mask)
    }

    pub fn contains(&self, local_id: LocalId) -> bool {
        self.entries.contains_key(&local_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchStats {
    pub packets_sent: u64,
    /// Indexed by [`RepresentationClass::index`].
    pub blocks_by_class: [u64; 4],
    pub packets_acked: u64,
    pub packets_lost: u64,
    /// Entity updates re-queued after a lost packet.
    pub resends: u64,
    pub suppressed: u64,
    pub vanished: u64,
    pub encode_failures: u64,
}

impl DispatchStats {
    pub fn blocks(&self, class: RepresentationClass) -> u64 {
        self.blocks_by_class[class.index()]
    }
}

/// Shared collaborators used while dispatching.
#[derive(Clone, Copy)]
pub struct DispatchServices<'a> {
    pub scene: &'a dyn SceneSource,
    pub permissions: &'a dyn PermissionEngine,
    pub scene_cache: Option<&'a dyn SceneCache>,
}

#[derive(Debug, Clone, Copy)]
struct BatchEntry {
    update: QueuedUpdate,
    crc: u32,
    /// This block carried the create-selected bit.
    selected: bool,
}

/// Blocks sent in one packet, kept until the scheduler reports its fate.
#[derive(Debug)]
struct InFlightBatch {
    class: RepresentationClass,
    entries: Vec<BatchEntry>,
}

struct OpenBatch {
    writer: UpdatePacketWriter,
    entries: Vec<BatchEntry>,
    full: bool,
}

pub struct UpdateCoordinator {
    agent_id: AgentId,
    config: DispatchConfig,
    queue: UpdateQueue,
    in_flight: AHashMap<Ticket, InFlightBatch>,
    next_ticket: Ticket,
    delivery: Sender<DeliveryEvent>,
    /// Entities whose create-selected flag has gone out to their owner.
    selected_sent: AHashSet<LocalId>,
    stats: DispatchStats,
}

impl UpdateCoordinator {
    pub fn new(agent_id: AgentId, config: DispatchConfig, delivery: Sender<DeliveryEvent>) -> Self {
        Self {
            agent_id,
            config,
            queue: UpdateQueue::new(),
            in_flight: AHashMap::new(),
            next_ticket: 1,
            delivery,
            selected_sent: AHashSet::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue_update(&mut self, local_id: LocalId, mask: UpdateFlags, priority: f32) {
        self.queue.push(local_id, mask, priority);
    }

    pub fn pending(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Drops everything pending and in flight.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight.clear();
        self.selected_sent.clear();
    }

    /// Permission flags for this recipient, plus the create-selected bit when
    /// the owner has not been sent it yet.
    fn object_flags(&self, entity: &EntitySnapshot, permissions: &dyn PermissionEngine) -> (u32, bool) {
        let flags = permissions.generate_flags(self.agent_id, entity) & !prim_flags::CREATE_SELECTED;
        let select = entity.create_selected
            && entity.owner_id == self.agent_id
            && !self.selected_sent.contains(&entity.local_id);

        if select {
            (flags | prim_flags::CREATE_SELECTED, true)
        } else {
            (flags, false)
        }
    }

    /// Classifies, encodes and sends pending updates. Returns the number of
    /// packets handed to the scheduler.
    pub fn tick(&mut self, services: &DispatchServices, scheduler: &mut dyn PacketScheduler) -> Result<usize> {
        if self.queue.is_empty() {
            return Ok(0);
        }

        let updates = self.queue.drain(self.config.max_updates_per_tick);
        let mut batches: [Option<OpenBatch>; 4] = [None, None, None, None];
        let mut recipient = Recipient::new(self.agent_id);
        if let Some(cache) = services.scene_cache {
            recipient = recipient.with_scene_cache(cache);
        }

        for update in updates {
            let Some(entity) = services.scene.snapshot(update.local_id) else {
                self.stats.vanished += 1;
                self.selected_sent.remove(&update.local_id);
                continue;
            };
            if is_suppressed(&entity, &recipient) {
                self.stats.suppressed += 1;
                continue;
            }

            let class = classify(&entity, update.mask, &recipient);
            let batch = &mut batches[class.index()];
            if batch.as_ref().is_some_and(|b| b.full) {
                self.queue.push(update.local_id, update.mask, update.priority);
                continue;
            }

            let (flags, select) = if class == RepresentationClass::Terse {
                (0, false)
            } else {
                self.object_flags(&entity, services.permissions)
            };
            let block = match encode(&entity, class, &EncodeContext::new(update.mask, flags)) {
                Ok(block) => block,
                Err(e) => {
                    warn!("Skipping update for entity {}: {}", entity.local_id, e);
                    self.stats.encode_failures += 1;
                    continue;
                }
            };
            debug::trace_classification(entity.local_id, update.mask, class, block.len());

            let open = batch.get_or_insert_with(|| OpenBatch {
                writer: UpdatePacketWriter::new(
                    class.packet_kind(),
                    self.config.header(),
                    self.config.max_blocks_per_packet,
                    self.config.max_packet_bytes,
                ),
                entries: Vec::new(),
                full: false,
            });

            if !open.writer.try_push(&block) {
                open.full = true;
                self.queue.push(update.local_id, update.mask, update.priority);
                continue;
            }
            if select {
                self.selected_sent.insert(entity.local_id);
            }
            open.entries.push(BatchEntry {
                update,
                crc: entity.structural_crc(),
                selected: select,
            });
        }

        let mut sent = 0;
        let mut refused = None;
        for class in RepresentationClass::ALL {
            let Some(open) = batches[class.index()].take() else {
                continue;
            };
            if open.writer.is_empty() {
                continue;
            }
            if refused.is_some() {
                self.requeue_unsent(&open.entries);
                continue;
            }
            match self.send_batch(class, open, scheduler) {
                Ok(()) => sent += 1,
                Err(e) => refused = Some(e),
            }
        }

        match refused {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Puts back updates the scheduler never accepted, undoing the
    /// create-selected latch they set.
    fn requeue_unsent(&mut self, entries: &[BatchEntry]) {
        for entry in entries {
            if entry.selected {
                self.selected_sent.remove(&entry.update.local_id);
            }
            self.queue.push(entry.update.local_id, entry.update.mask, entry.update.priority);
        }
    }

    fn send_batch(&mut self, class: RepresentationClass, open: OpenBatch, scheduler: &mut dyn PacketScheduler) -> Result<()> {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let block_count = open.writer.block_count() as u64;
        let packet = OutgoingPacket {
            recipient: self.agent_id,
            category: PacketCategory::Task,
            kind: class.packet_kind(),
            payload: open.writer.finish(),
        };
        let receipt = DeliveryReceipt::new(ticket, self.delivery.clone());

        if let Err(e) = scheduler.send(packet, self.config.reliable, Some(receipt)) {
            self.requeue_unsent(&open.entries);
            return Err(e);
        }

        self.stats.packets_sent += 1;
        self.stats.blocks_by_class[class.index()] += block_count;
        self.in_flight.insert(ticket, InFlightBatch { class, entries: open.entries });
        Ok(())
    }

    /// Applies a delivery report for a packet sent by [`tick`](Self::tick).
    pub fn handle_delivery(&mut self, event: DeliveryEvent, scene_cache: Option<&dyn SceneCache>) {
        let Some(batch) = self.in_flight.remove(&event.ticket()) else {
            log::debug!("Delivery report for unknown ticket {}", event.ticket());
            return;
        };

        match event {
            DeliveryEvent::Acked(_) => {
                self.stats.packets_acked += 1;
                if batch.class == RepresentationClass::Terse {
                    return;
                }
                if let Some(cache) = scene_cache {
                    for entry in &batch.entries {
                        cache.record_cached(self.agent_id, entry.update.local_id, entry.crc);
                    }
                }
            }
            DeliveryEvent::Failed(_) => {
                self.stats.packets_lost += 1;
                self.stats.resends += batch.entries.len() as u64;
                debug::trace_resend(batch.class, batch.entries.len());
                for entry in batch.entries {
                    self.queue.push(entry.update.local_id, entry.update.mask, entry.update.priority);
                }
            }
        }
    }
}

impl From<&UpdateCoordinator> for debug::BatchSummary {
    fn from(coordinator: &UpdateCoordinator) -> Self {
        debug::BatchSummary {
            agent_id: coordinator.agent_id.to_string(),
            pending: coordinator.queue.len(),
            in_flight: coordinator.in_flight.len(),
            stats: coordinator.stats,
        }
    }
}

/// Rejects configurations that can never produce a packet.
pub fn validate_config(config: &DispatchConfig) -> Result<()> {
    if config.max_blocks_per_packet == 0 {
        return Err(LinkError::InvalidConfig("max_blocks_per_packet must be at least 1".to_string()));
    }
    if config.max_updates_per_tick == 0 {
        return Err(LinkError::InvalidConfig("max_updates_per_tick must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::TerseUpdate;
    use crate::entity::EntityKind;
    use crate::protocol::{parse_update_header, ObjectId, PacketKind};
    use crate::services::{MemoryScene, MemorySceneCache, OwnerPermissions};
    use crate::transport::MemoryScheduler;
    use crossbeam_channel::{unbounded, Receiver};
    use glam::Vec3;

    const VIEWER: u128 = 100;

    fn prim(local_id: LocalId) -> EntitySnapshot {
        EntitySnapshot::new(
            local_id,
            ObjectId::from_u128(local_id as u128),
            ObjectId::from_u128(1),
            EntityKind::Prim,
        )
    }

    fn coordinator(config: DispatchConfig) -> (UpdateCoordinator, Receiver<DeliveryEvent>) {
        let (tx, rx) = unbounded();
        (UpdateCoordinator::new(ObjectId::from_u128(VIEWER), config, tx), rx)
    }

    fn deliver(coordinator: &mut UpdateCoordinator, rx: &Receiver<DeliveryEvent>, cache: Option<&dyn SceneCache>) {
        while let Ok(event) = rx.try_recv() {
            coordinator.handle_delivery(event, cache);
        }
    }

    #[test]
    fn test_queue_coalesces() {
        let mut queue = UpdateQueue::new();
        queue.push(1, UpdateFlags::POSITION, 1.0);
        queue.push(2, UpdateFlags::ROTATION, 2.0);
        queue.push(1, UpdateFlags::TEXT, 5.0);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.mask_of(1), Some(UpdateFlags::POSITION | UpdateFlags::TEXT));

        let drained = queue.drain(10);
        assert_eq!(drained[0].local_id, 1);
        assert_eq!(drained[0].priority, 5.0);
        assert_eq!(drained[1].local_id, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_one_packet_per_class() {
        let scene = MemoryScene::new();
        for id in 1..=4 {
            scene.upsert(prim(id));
        }
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(1, UpdateFlags::POSITION, 1.0);
        coordinator.queue_update(2, UpdateFlags::POSITION, 1.0);
        coordinator.queue_update(3, UpdateFlags::CREATE, 1.0);
        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);

        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 3);

        let kinds: Vec<PacketKind> = scheduler.packets().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![PacketKind::ObjectUpdate, PacketKind::ObjectUpdateCompressed, PacketKind::ImprovedTerseObjectUpdate]
        );
        let terse = scheduler.packets().last().unwrap();
        let (_, _, count, _) = parse_update_header(&terse.payload).unwrap();
        assert_eq!(count, 2);
        assert_eq!(coordinator.stats().blocks(RepresentationClass::Terse), 2);
        assert_eq!(coordinator.in_flight_count(), 3);
    }

    #[test]
    fn test_overflow_stays_queued() {
        let scene = MemoryScene::new();
        for id in 1..=5 {
            scene.upsert(prim(id));
        }
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default().with_max_blocks_per_packet(2));
        let mut scheduler = MemoryScheduler::new();

        for id in 1..=5 {
            coordinator.queue_update(id, UpdateFlags::POSITION, 1.0);
        }

        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 1);
        assert_eq!(coordinator.pending().len(), 3);
        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 1);
        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 1);
        assert!(coordinator.pending().is_empty());
    }

    #[test]
    fn test_lost_terse_is_reclassified_against_current_state() {
        let scene = MemoryScene::new();
        let mut entity = prim(7);
        entity.position = Vec3::new(10.0, 10.0, 10.0);
        scene.upsert(entity.clone());

        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(7, UpdateFlags::POSITION, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        let stale = scheduler.fail_next().unwrap();
        deliver(&mut coordinator, &rx, None);
        assert_eq!(coordinator.stats().resends, 1);
        assert_eq!(coordinator.pending().mask_of(7), Some(UpdateFlags::POSITION));

        entity.position = Vec3::new(20.0, 10.0, 10.0);
        scene.upsert(entity);
        coordinator.tick(&services, &mut scheduler).unwrap();

        let fresh = scheduler.take_packets().pop().unwrap();
        assert_ne!(fresh.payload, stale.payload);
        let (_, _, _, mut blocks) = parse_update_header(&fresh.payload).unwrap();
        let decoded = TerseUpdate::decode(&mut blocks).unwrap();
        assert_eq!(decoded.position, Vec3::new(20.0, 10.0, 10.0));
    }

    #[test]
    fn test_lost_update_merges_with_newer_mask() {
        let scene = MemoryScene::new();
        scene.upsert(prim(3));
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(3, UpdateFlags::POSITION, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        coordinator.queue_update(3, UpdateFlags::SHAPE, 1.0);
        scheduler.fail_next();
        deliver(&mut coordinator, &rx, None);

        assert_eq!(coordinator.pending().mask_of(3), Some(UpdateFlags::POSITION | UpdateFlags::SHAPE));
    }

    #[test]
    fn test_ack_records_scene_cache() {
        let scene = MemoryScene::new();
        let entity = prim(9);
        scene.upsert(entity.clone());
        let cache = MemorySceneCache::new();
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: Some(&cache) };
        let (mut coordinator, rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(9, UpdateFlags::CREATE, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        scheduler.ack_all();
        deliver(&mut coordinator, &rx, Some(&cache));
        assert!(cache.has_cached(ObjectId::from_u128(VIEWER), 9, entity.structural_crc()));

        coordinator.queue_update(9, UpdateFlags::POSITION, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        assert_eq!(scheduler.packets().next().unwrap().kind, PacketKind::ObjectUpdateCached);
    }

    #[test]
    fn test_vanished_and_suppressed_dropped() {
        let scene = MemoryScene::new();
        let mut hud = prim(5);
        hud.parent_id = 1;
        hud.attachment_point = 35;
        scene.upsert(hud);
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(5, UpdateFlags::POSITION, 1.0);
        coordinator.queue_update(6, UpdateFlags::POSITION, 1.0);

        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 0);
        assert_eq!(coordinator.stats().suppressed, 1);
        assert_eq!(coordinator.stats().vanished, 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_create_selected_sent_once() {
        let scene = MemoryScene::new();
        let mut entity = prim(4);
        entity.owner_id = ObjectId::from_u128(VIEWER);
        entity.create_selected = true;
        scene.upsert(entity);
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        let flags_of = |payload: &[u8]| {
            let (_, _, _, block) = parse_update_header(payload).unwrap();
            u32::from_le_bytes(block[0..4].try_into().unwrap())
        };

        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();

        let packets = scheduler.take_packets();
        assert_eq!(flags_of(&packets[0].payload) & prim_flags::CREATE_SELECTED, prim_flags::CREATE_SELECTED);
        assert_eq!(flags_of(&packets[1].payload) & prim_flags::CREATE_SELECTED, 0);
        assert_ne!(flags_of(&packets[1].payload) & prim_flags::OBJECT_YOU_OWNER, 0);
    }

    #[test]
    fn test_unresolved_receipts_do_not_accumulate() {
        let scene = MemoryScene::new();
        scene.upsert(prim(2));
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        for _ in 0..1000 {
            coordinator.queue_update(2, UpdateFlags::POSITION, 1.0);
            coordinator.tick(&services, &mut scheduler).unwrap();
            scheduler.take_packets();
            deliver(&mut coordinator, &rx, None);
        }

        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(coordinator.stats().packets_lost, 1000);
        assert_eq!(coordinator.pending().len(), 1);
    }

    #[test]
    fn test_create_selected_forgotten_when_entity_vanishes() {
        let scene = MemoryScene::new();
        let mut entity = prim(4);
        entity.owner_id = ObjectId::from_u128(VIEWER);
        entity.create_selected = true;
        scene.upsert(entity.clone());
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        assert!(coordinator.selected_sent.contains(&4));

        scene.remove(4);
        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        assert!(coordinator.selected_sent.is_empty());

        scene.upsert(entity);
        coordinator.queue_update(4, UpdateFlags::TEXT, 1.0);
        coordinator.tick(&services, &mut scheduler).unwrap();
        let (_, _, _, block) = parse_update_header(&scheduler.packets().last().unwrap().payload).unwrap();
        let flags = u32::from_le_bytes(block[0..4].try_into().unwrap());
        assert_eq!(flags & prim_flags::CREATE_SELECTED, prim_flags::CREATE_SELECTED);
    }

    #[test]
    fn test_unencodable_update_skipped() {
        let scene = MemoryScene::new();
        let mut oversized = prim(1);
        oversized.textures = bytes::Bytes::from(vec![0u8; 70_000]);
        scene.upsert(oversized);
        scene.upsert(prim(2));
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();

        coordinator.queue_update(1, UpdateFlags::POSITION | UpdateFlags::TEXTURES, 1.0);
        coordinator.queue_update(2, UpdateFlags::POSITION, 1.0);

        assert_eq!(coordinator.tick(&services, &mut scheduler).unwrap(), 1);
        assert_eq!(coordinator.stats().encode_failures, 1);
        let (_, _, count, mut blocks) = parse_update_header(&scheduler.packets().next().unwrap().payload).unwrap();
        assert_eq!(count, 1);
        assert_eq!(TerseUpdate::decode(&mut blocks).unwrap().local_id, 2);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_scheduler_refusal_requeues() {
        let scene = MemoryScene::new();
        scene.upsert(prim(1));
        let services = DispatchServices { scene: &scene, permissions: &OwnerPermissions, scene_cache: None };
        let (mut coordinator, _rx) = coordinator(DispatchConfig::default());
        let mut scheduler = MemoryScheduler::new();
        scheduler.close().unwrap();

        coordinator.queue_update(1, UpdateFlags::POSITION, 1.0);
        assert!(matches!(coordinator.tick(&services, &mut scheduler), Err(LinkError::ConnectionClosed)));
        assert!(coordinator.pending().contains(1));
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&DispatchConfig::default()).is_ok());
        let mut config = DispatchConfig::default();
        config.max_blocks_per_packet = 0;
        assert!(validate_config(&config).is_err());
    }
}
