//! Per-connection driver tying texture streaming and entity updates to one
//! packet scheduler.
//!
//! A session is owned by one serialized context. Completions from the asset
//! store, the decoder and the scheduler arrive through channels and are
//! applied at the start of [`ClientSession::tick`].

use crate::debug::{self, BatchSummary, SessionSummary};
use crate::dispatch::{validate_config, DispatchConfig, DispatchServices, UpdateCoordinator};
use crate::entity::UpdateFlags;
use crate::error::Result;
use crate::image_manager::{ImageManager, TextureRequest};
use crate::protocol::{AgentId, ImageMessage, LocalId, OutgoingPacket, PacketCategory, PacketKind};
use crate::services::{AssetStore, LayerDecoder, PermissionEngine, SceneCache, SceneSource};
use crate::texture::{ImageSink, TextureServices, TransferEvent};
use crate::throttle::{ThrottleConfig, TokenBucket};
use crate::transport::{DeliveryEvent, DeliveryReceipt, PacketScheduler, Ticket};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;
use serde::{Deserialize, Serialize};

/// Ticket reserved for the simulator statistics packet; update batches
/// never use it.
const SIM_STATS_TICKET: Ticket = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Upper bound on texture packets sent per tick.
    pub packets_per_tick: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { packets_per_tick: 20 }
    }
}

impl ImageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packets_per_tick(mut self, packets: usize) -> Self {
        self.packets_per_tick = packets;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub image: ImageConfig,
    pub dispatch: DispatchConfig,
    pub throttle: ThrottleConfig,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        validate_config(&config.dispatch)?;
        Ok(config)
    }

    pub fn with_image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }
}

/// Shared collaborators a session reaches through during a tick.
#[derive(Clone, Copy)]
pub struct SessionServices<'a> {
    pub assets: &'a dyn AssetStore,
    pub decoder: Option<&'a dyn LayerDecoder>,
    pub scene: &'a dyn SceneSource,
    pub permissions: &'a dyn PermissionEngine,
    pub scene_cache: Option<&'a dyn SceneCache>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TickReport {
    pub texture_packets: usize,
    pub update_packets: usize,
    pub events_applied: usize,
}

/// Forwards image packets to the scheduler, counting the ones it accepts.
struct SchedulerSink<'a> {
    recipient: AgentId,
    scheduler: &'a mut dyn PacketScheduler,
    accepted: usize,
}

impl ImageSink for SchedulerSink<'_> {
    fn send_image(&mut self, message: ImageMessage) -> Result<()> {
        let packet = OutgoingPacket {
            recipient: self.recipient,
            category: PacketCategory::Texture,
            kind: message.kind(),
            payload: message.encode(),
        };
        self.scheduler.send(packet, false, None)?;
        self.accepted += 1;
        Ok(())
    }
}

pub struct ClientSession {
    agent_id: AgentId,
    config: SessionConfig,
    images: ImageManager,
    updates: UpdateCoordinator,
    transfer_tx: Sender<TransferEvent>,
    transfer_rx: Receiver<TransferEvent>,
    delivery_tx: Sender<DeliveryEvent>,
    delivery_rx: Receiver<DeliveryEvent>,
    throttle: Option<TokenBucket>,
    stats_in_flight: bool,
    closed: bool,
}

impl ClientSession {
    pub fn new(agent_id: AgentId, config: SessionConfig) -> Self {
        let (transfer_tx, transfer_rx) = unbounded();
        let (delivery_tx, delivery_rx) = unbounded();
        let updates = UpdateCoordinator::new(agent_id, config.dispatch.clone(), delivery_tx.clone());
        let throttle = if config.throttle.enabled {
            Some(TokenBucket::from_config(&config.throttle))
        } else {
            None
        };

        Self {
            agent_id,
            config,
            images: ImageManager::new(),
            updates,
            transfer_tx,
            transfer_rx,
            delivery_tx,
            delivery_rx,
            throttle,
            stats_in_flight: false,
            closed: false,
        }
    }

    /// Serves `data` in place of textures the asset store cannot find.
    pub fn with_missing_image(mut self, data: Bytes) -> Self {
        self.images = std::mem::take(&mut self.images).with_missing_image(data);
        self
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn images(&self) -> &ImageManager {
        &self.images
    }

    pub fn updates(&self) -> &UpdateCoordinator {
        &self.updates
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn request_image(&mut self, request: TextureRequest, services: &SessionServices) {
        if self.closed {
            return;
        }
        let texture = TextureServices {
            assets: services.assets,
            decoder: services.decoder,
            events: &self.transfer_tx,
        };
        self.images.enqueue(request, &texture);
    }

    pub fn queue_update(&mut self, local_id: LocalId, mask: UpdateFlags, priority: f32) {
        if self.closed {
            return;
        }
        self.updates.queue_update(local_id, mask, priority);
    }

    /// Applies queued completions, streams textures within budget, then
    /// dispatches entity updates.
    pub fn tick(&mut self, services: &SessionServices, scheduler: &mut dyn PacketScheduler) -> Result<TickReport> {
        if self.closed {
            return Ok(TickReport::default());
        }

        let texture = TextureServices {
            assets: services.assets,
            decoder: services.decoder,
            events: &self.transfer_tx,
        };
        let mut report = TickReport::default();

        while let Ok(event) = self.transfer_rx.try_recv() {
            self.images.handle_event(event, &texture);
            report.events_applied += 1;
        }
        while let Ok(event) = self.delivery_rx.try_recv() {
            if event.ticket() == SIM_STATS_TICKET {
                self.stats_in_flight = false;
            } else {
                self.updates.handle_delivery(event, services.scene_cache);
            }
            report.events_applied += 1;
        }

        if self.images.has_pending() {
            let wanted = self.config.image.packets_per_tick;
            let budget = match self.throttle.as_mut() {
                Some(bucket) => bucket.take(wanted),
                None => wanted,
            };

            let mut sink = SchedulerSink {
                recipient: self.agent_id,
                scheduler: &mut *scheduler,
                accepted: 0,
            };
            let processed = self.images.process(&texture, Some(&mut sink), budget);
            let accepted = sink.accepted;
            if let Some(bucket) = self.throttle.as_mut() {
                bucket.give_back(budget - accepted.min(budget));
            }
            report.texture_packets = processed?;
        }

        let dispatch = DispatchServices {
            scene: services.scene,
            permissions: services.permissions,
            scene_cache: services.scene_cache,
        };
        report.update_packets = self.updates.tick(&dispatch, scheduler)?;

        debug::log_session_summary("Tick", &self.summary());
        Ok(report)
    }

    /// Sends a simulator statistics packet unless the previous one is still
    /// unacknowledged. Returns whether a packet was sent.
    pub fn send_sim_stats(&mut self, payload: Bytes, scheduler: &mut dyn PacketScheduler) -> Result<bool> {
        if self.closed || self.stats_in_flight {
            return Ok(false);
        }

        let packet = OutgoingPacket {
            recipient: self.agent_id,
            category: PacketCategory::Task,
            kind: PacketKind::SimStats,
            payload,
        };
        let receipt = DeliveryReceipt::new(SIM_STATS_TICKET, self.delivery_tx.clone());
        scheduler.send(packet, false, Some(receipt))?;
        self.stats_in_flight = true;
        Ok(true)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            updates: BatchSummary::from(&self.updates),
            images: self.images.stats(),
            active_transfers: self.images.len(),
        }
    }

    /// Cancels every transfer and drops pending updates. Late completions
    /// are discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.images.has_pending() {
            warn!("Closing session {} with texture transfers in progress", self.agent_id);
        }
        self.images.cancel_all();
        self.updates.clear();
        self.closed = true;
        while self.transfer_rx.try_recv().is_ok() {}
        while self.delivery_rx.try_recv().is_ok() {}
    }
}
