//! Per-connection table of texture transfers.

use crate::debug;
use crate::error::Result;
use crate::protocol::TextureId;
use crate::texture::{ImageSink, TextureServices, TextureTransfer, TransferEvent, TransferState};
use ahash::AHashMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One client image request as received from the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextureRequest {
    pub texture_id: TextureId,
    pub discard_level: i8,
    pub priority: f32,
    pub start_packet: u32,
}

impl TextureRequest {
    pub fn new(texture_id: TextureId, discard_level: i8, priority: f32) -> Self {
        Self {
            texture_id,
            discard_level,
            priority,
            start_packet: 0,
        }
    }

    pub fn with_start_packet(mut self, start_packet: u32) -> Self {
        self.start_packet = start_packet;
        self
    }

    /// Viewers cancel a download with discard -1 at priority 0.
    pub fn is_cancel(&self) -> bool {
        self.discard_level == -1 && self.priority == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ImageStats {
    pub requests: u64,
    pub cancels: u64,
    pub packets_sent: u64,
    pub completed: u64,
}

/// Per-connection queue of texture transfers, served by priority.
///
/// Completed transfers stay parked so a later request for a different
/// discard level resumes without fetching the asset again.
#[derive(Default)]
pub struct ImageManager {
    transfers: AHashMap<TextureId, TextureTransfer>,
    missing_image: Option<Bytes>,
    stats: ImageStats,
}

impl ImageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder served in place of assets the store cannot find.
    pub fn with_missing_image(mut self, data: Bytes) -> Self {
        self.missing_image = Some(data);
        self
    }

    pub fn enqueue(&mut self, request: TextureRequest, services: &TextureServices) {
        self.stats.requests += 1;

        if let Some(transfer) = self.transfers.get_mut(&request.texture_id) {
            if request.is_cancel() {
                log::debug!("Client cancelled texture {}", request.texture_id);
                self.transfers.remove(&request.texture_id);
                self.stats.cancels += 1;
                return;
            }

            transfer.update_request(
                request.discard_level,
                request.priority,
                request.start_packet.max(1),
                services,
            );
            return;
        }

        if request.is_cancel() {
            return;
        }

        let mut transfer = TextureTransfer::new(
            request.texture_id,
            request.discard_level,
            request.priority,
            request.start_packet,
        );
        transfer.run_update(services);
        self.transfers.insert(request.texture_id, transfer);
    }

    pub fn handle_event(&mut self, event: TransferEvent, services: &TextureServices) {
        let Some(transfer) = self.transfers.get_mut(&event.texture_id()) else {
            log::debug!("Dropping completion for texture {} no longer requested", event.texture_id());
            return;
        };

        match event {
            TransferEvent::AssetLoaded { data, .. } => {
                transfer.on_asset_loaded(data, self.missing_image.as_ref(), services)
            }
            TransferEvent::LayersDecoded { layers, .. } => transfer.on_layers_decoded(layers, services),
        }
    }

    /// Streams up to `budget` packets across transfers in descending
    /// priority; returns the number sent.
    ///
    /// Stops at the first packet the client refuses and returns its error;
    /// that transfer resumes from the refused packet on the next call.
    pub fn process(
        &mut self,
        services: &TextureServices,
        client: Option<&mut dyn ImageSink>,
        budget: usize,
    ) -> Result<usize> {
        let Some(client) = client else {
            return Ok(0);
        };

        let mut order: Vec<(TextureId, f32)> = self
            .transfers
            .values()
            .filter(|t| !t.is_complete())
            .map(|t| (t.texture_id(), t.priority()))
            .collect();
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

        let mut sent = 0;
        for (texture_id, _) in order {
            if sent >= budget {
                break;
            }
            let Some(transfer) = self.transfers.get_mut(&texture_id) else {
                continue;
            };
            if !transfer.is_ready() {
                transfer.run_update(services);
                continue;
            }

            let outcome = transfer.advance(services, Some(&mut *client), budget - sent)?;
            debug::trace_texture_progress(texture_id, transfer.current_packet(), transfer.stop_packet(), outcome.packets_sent);
            sent += outcome.packets_sent;
            if outcome.complete {
                self.stats.completed += 1;
            }
        }

        self.stats.packets_sent += sent as u64;
        Ok(sent)
    }

    pub fn cancel(&mut self, texture_id: &TextureId) -> bool {
        self.transfers.remove(texture_id).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.transfers.clear();
    }

    pub fn get(&self, texture_id: &TextureId) -> Option<&TextureTransfer> {
        self.transfers.get(texture_id)
    }

    pub fn state(&self, texture_id: &TextureId) -> Option<TransferState> {
        self.transfers.get(texture_id).map(|t| t.state())
    }

    pub fn has_pending(&self) -> bool {
        self.transfers.values().any(|t| !t.is_complete())
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn stats(&self) -> ImageStats {
        self.stats
    }
}
