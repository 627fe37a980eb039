//! Progressive, resumable transfer of one layered texture to one client.
//!
//! The header packet carries the first 600 bytes together with the total
//! size and packet count; every later packet carries up to 1000 bytes.
//! Packets `2..=packet_count` are data packets, the header is sent while
//! the cursor is at 0 or 1.

use crate::error::{LinkError, Result};
use crate::protocol::{ImageMessage, TextureId, IMAGE_CODEC_J2C};
use crate::services::{AssetReply, AssetStore, DecodeReply, LayerDecoder};
use bytes::Bytes;
use crossbeam_channel::Sender;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const FIRST_PACKET_SIZE: usize = 600;
pub const IMAGE_PACKET_SIZE: usize = 1000;

/// Byte range of one resolution layer; `end` is the offset of its last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerBoundary {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    AssetLoaded {
        texture_id: TextureId,
        data: Option<Bytes>,
    },
    LayersDecoded {
        texture_id: TextureId,
        layers: Vec<LayerBoundary>,
    },
}

impl TransferEvent {
    pub fn texture_id(&self) -> TextureId {
        match self {
            TransferEvent::AssetLoaded { texture_id, .. }
            | TransferEvent::LayersDecoded { texture_id, .. } => *texture_id,
        }
    }
}

/// Receives image packets on behalf of one client.
pub trait ImageSink {
    /// An error means the packet was not taken; the transfer retries it.
    fn send_image(&mut self, message: ImageMessage) -> Result<()>;
}

impl ImageSink for Vec<ImageMessage> {
    fn send_image(&mut self, message: ImageMessage) -> Result<()> {
        self.push(message);
        Ok(())
    }
}

/// Collaborators a transfer needs to make progress.
pub struct TextureServices<'a> {
    pub assets: &'a dyn AssetStore,
    pub decoder: Option<&'a dyn LayerDecoder>,
    pub events: &'a Sender<TransferEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AssetLoading,
    Decoding,
    Streaming,
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvanceOutcome {
    pub packets_sent: usize,
    pub complete: bool,
}

pub fn packet_count(asset_len: usize) -> u32 {
    if asset_len <= FIRST_PACKET_SIZE {
        1
    } else {
        ((asset_len - FIRST_PACKET_SIZE + IMAGE_PACKET_SIZE - 1) / IMAGE_PACKET_SIZE) as u32 + 1
    }
}

/// Byte offset of data packet `packet` (`packet >= 2`).
pub fn packet_offset(packet: u32) -> usize {
    if packet < 2 {
        return if packet == 0 { 0 } else { FIRST_PACKET_SIZE };
    }
    FIRST_PACKET_SIZE + (packet as usize - 2) * IMAGE_PACKET_SIZE
}

pub fn last_packet_size(asset_len: usize) -> usize {
    if asset_len <= FIRST_PACKET_SIZE {
        return asset_len;
    }
    match (asset_len - FIRST_PACKET_SIZE) % IMAGE_PACKET_SIZE {
        0 => IMAGE_PACKET_SIZE,
        size => size,
    }
}

/// Packet that carries `byte`; anything inside the header maps to 1.
pub fn packet_for_byte(byte: usize) -> u32 {
    if byte < FIRST_PACKET_SIZE {
        return 1;
    }
    ((byte - FIRST_PACKET_SIZE) / IMAGE_PACKET_SIZE) as u32 + 2
}

/// Last packet to send for `discard_level` (already clamped to the layer table).
pub fn stop_packet_for(asset_len: usize, layers: &[LayerBoundary], discard_level: usize) -> u32 {
    let total = packet_count(asset_len);
    if total <= 1 {
        return 0;
    }
    if layers.is_empty() {
        return total;
    }

    let layer = &layers[layers.len() - 1 - discard_level.min(layers.len() - 1)];
    let mut stop = packet_for_byte(layer.end);

    // The client expects the final packet when only one would remain.
    if stop + 1 == total {
        stop = total;
    }

    stop.min(total)
}

fn slice_asset(asset: &Bytes, offset: usize, len: usize) -> Result<Bytes> {
    let end = offset.checked_add(len).unwrap_or(usize::MAX);
    if end > asset.len() {
        return Err(LinkError::ByteRange {
            offset,
            end,
            asset_len: asset.len(),
        });
    }
    Ok(asset.slice(offset..end))
}

#[derive(Debug, Clone)]
pub struct TextureTransfer {
    texture_id: TextureId,
    priority: f32,
    discard_level: i8,
    start_packet: u32,
    current_packet: u32,
    stop_packet: u32,
    asset: Option<Bytes>,
    layers: Option<Vec<LayerBoundary>>,
    has_asset: bool,
    asset_requested: bool,
    decode_requested: bool,
    decoded: bool,
    header_sent: bool,
}

impl TextureTransfer {
    pub fn new(texture_id: TextureId, discard_level: i8, priority: f32, start_packet: u32) -> Self {
        Self {
            texture_id,
            priority,
            discard_level,
            start_packet,
            current_packet: 0,
            stop_packet: 0,
            asset: None,
            layers: None,
            has_asset: false,
            asset_requested: false,
            decode_requested: false,
            decoded: false,
            header_sent: false,
        }
    }

    pub fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn discard_level(&self) -> i8 {
        self.discard_level
    }

    pub fn current_packet(&self) -> u32 {
        self.current_packet
    }

    pub fn stop_packet(&self) -> u32 {
        self.stop_packet
    }

    pub fn asset_len(&self) -> Option<usize> {
        self.asset.as_ref().map(|a| a.len())
    }

    pub fn is_ready(&self) -> bool {
        self.has_asset && self.decoded
    }

    pub fn is_complete(&self) -> bool {
        self.is_ready() && self.header_sent && self.current_packet > self.stop_packet
    }

    pub fn state(&self) -> TransferState {
        if !self.has_asset {
            TransferState::AssetLoading
        } else if !self.decoded {
            TransferState::Decoding
        } else if self.asset.is_none() {
            TransferState::Cancelled
        } else if self.is_complete() {
            TransferState::Complete
        } else {
            TransferState::Streaming
        }
    }

    /// Applies a newer request for the same texture. The asset is never re-fetched.
    /// Discard -1 on a resumed request keeps the current discard level and
    /// stop packet.
    pub fn update_request(&mut self, discard_level: i8, priority: f32, start_packet: u32, services: &TextureServices) {
        let keep_level = discard_level < 0 && start_packet != 0 && self.stop_packet != 0;
        if !keep_level {
            self.discard_level = discard_level;
        }
        self.priority = priority;
        self.start_packet = start_packet;
        self.run_update(services);
    }

    /// Issues the outstanding fetch or decode, or recomputes the stop packet
    /// once both are done. Safe to call any number of times.
    pub fn run_update(&mut self, services: &TextureServices) {
        if !self.has_asset {
            if !self.asset_requested {
                self.asset_requested = true;
                debug!("Requesting texture asset {}", self.texture_id);
                services
                    .assets
                    .request(self.texture_id, AssetReply::new(self.texture_id, services.events.clone()));
            }
            return;
        }

        if !self.decoded {
            if !self.decode_requested {
                self.decode_requested = true;
                match (services.decoder, &self.asset) {
                    (Some(decoder), Some(asset)) => {
                        decoder.begin_decode(
                            self.texture_id,
                            asset.clone(),
                            DecodeReply::new(self.texture_id, services.events.clone()),
                        );
                    }
                    _ => {
                        self.decoded = true;
                        self.layers = None;
                    }
                }
            }
            if !self.decoded {
                return;
            }
        }

        self.resolve_stop_packet();
    }

    /// `None` marks the asset as unavailable; `fallback` substitutes a placeholder.
    pub fn on_asset_loaded(&mut self, data: Option<Bytes>, fallback: Option<&Bytes>, services: &TextureServices) {
        if self.has_asset {
            return;
        }
        self.has_asset = true;

        match data.or_else(|| fallback.cloned()) {
            Some(data) => self.asset = Some(data),
            None => {
                warn!("Texture {} not found, ending transfer", self.texture_id);
                self.asset = None;
                self.decoded = true;
            }
        }

        self.run_update(services);
    }

    pub fn on_layers_decoded(&mut self, layers: Vec<LayerBoundary>, services: &TextureServices) {
        if self.decoded {
            return;
        }
        self.decoded = true;
        self.layers = if layers.is_empty() { None } else { Some(layers) };
        self.run_update(services);
    }

    fn resolve_stop_packet(&mut self) {
        let Some(asset) = &self.asset else {
            self.current_packet = self.stop_packet;
            return;
        };

        if self.discard_level < 0 {
            self.discard_level = 0;
        }

        let layers = self.layers.as_deref().unwrap_or(&[]);
        let max_discard = layers.len().saturating_sub(1).min(i8::MAX as usize) as i8;
        self.discard_level = self.discard_level.min(max_discard);

        self.stop_packet = stop_packet_for(asset.len(), layers, self.discard_level as usize);
        self.current_packet = self.current_packet.max(self.start_packet);
    }

    /// Sends up to `max_packets` packets. Without a client this is a no-op.
    ///
    /// A packet the client refuses leaves the cursor on it and ends the call
    /// with the client's error.
    pub fn advance(
        &mut self,
        services: &TextureServices,
        client: Option<&mut dyn ImageSink>,
        max_packets: usize,
    ) -> Result<AdvanceOutcome> {
        let Some(client) = client else {
            return Ok(AdvanceOutcome::default());
        };

        if max_packets == 0 {
            return Ok(AdvanceOutcome {
                packets_sent: 0,
                complete: self.is_complete(),
            });
        }

        if !self.is_ready() {
            self.run_update(services);
            if !self.is_ready() {
                return Ok(AdvanceOutcome::default());
            }
        }

        if self.header_sent && self.current_packet > self.stop_packet {
            return Ok(AdvanceOutcome {
                packets_sent: 0,
                complete: true,
            });
        }

        let mut packets_sent = 0;
        let mut send_more = true;

        if !self.header_sent || self.current_packet == 0 {
            match self.header_message() {
                Ok((message, more)) => {
                    client.send_image(message)?;
                    send_more = more;
                    self.header_sent = true;
                    self.current_packet = self.current_packet.max(1);
                    packets_sent += 1;
                }
                Err(e) => {
                    warn!("Skipping header of texture {}: {}", self.texture_id, e);
                    return Ok(AdvanceOutcome::default());
                }
            }
        }

        if self.current_packet < 2 {
            self.current_packet = 2;
        }

        while send_more && packets_sent < max_packets && self.current_packet <= self.stop_packet {
            match self.packet_message() {
                Ok((message, more)) => {
                    if let Some(message) = message {
                        if let Err(e) = client.send_image(message) {
                            debug!(
                                "Client refused packet {} of texture {}: {}",
                                self.current_packet, self.texture_id, e
                            );
                            return Err(e);
                        }
                    }
                    send_more = more;
                    self.current_packet += 1;
                    packets_sent += 1;
                }
                Err(e) => {
                    warn!(
                        "Skipping packet {} of texture {}: {}",
                        self.current_packet, self.texture_id, e
                    );
                    break;
                }
            }
        }

        Ok(AdvanceOutcome {
            packets_sent,
            complete: self.current_packet > self.stop_packet,
        })
    }

    /// Header message and whether data packets follow it.
    fn header_message(&self) -> Result<(ImageMessage, bool)> {
        let Some(asset) = &self.asset else {
            return Ok((ImageMessage::NotInDatabase { texture_id: self.texture_id }, false));
        };

        if asset.len() <= FIRST_PACKET_SIZE {
            let message = ImageMessage::Data {
                texture_id: self.texture_id,
                codec: IMAGE_CODEC_J2C,
                size: asset.len() as u32,
                packets: 1,
                data: asset.clone(),
            };
            return Ok((message, false));
        }

        let data = slice_asset(asset, 0, FIRST_PACKET_SIZE)?;
        let message = ImageMessage::Data {
            texture_id: self.texture_id,
            codec: IMAGE_CODEC_J2C,
            size: asset.len() as u32,
            packets: packet_count(asset.len()).min(u16::MAX as u32) as u16,
            data,
        };
        Ok((message, true))
    }

    /// Message for the packet under the cursor, `None` when it would be
    /// empty, and whether more packets follow.
    fn packet_message(&self) -> Result<(Option<ImageMessage>, bool)> {
        let asset = self
            .asset
            .as_ref()
            .ok_or(LinkError::AssetUnavailable(self.texture_id))?;
        let len = asset.len();
        let position = packet_offset(self.current_packet);

        let mut size = if self.current_packet == packet_count(len) {
            last_packet_size(len)
        } else {
            IMAGE_PACKET_SIZE
        };
        let mut complete = false;

        if position + IMAGE_PACKET_SIZE > len {
            size = last_packet_size(len);
            complete = true;
            if position + size > len {
                size = len.saturating_sub(position);
            }
        }

        if size == 0 {
            return Ok((None, !complete));
        }

        let data = slice_asset(asset, position, size)?;
        let message = ImageMessage::Packet {
            texture_id: self.texture_id,
            packet: (self.current_packet - 1).min(u16::MAX as u32) as u16,
            data,
        };
        Ok((Some(message), !complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObjectId;
    use crate::services::MemoryAssetStore;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDecoder {
        layers: Vec<LayerBoundary>,
        calls: AtomicUsize,
    }

    impl LayerDecoder for FixedDecoder {
        fn begin_decode(&self, _texture_id: TextureId, _data: Bytes, reply: DecodeReply) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            reply.complete(self.layers.clone());
        }
    }

    fn asset(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn drain(transfer: &mut TextureTransfer, rx: &Receiver<TransferEvent>, services: &TextureServices) {
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::AssetLoaded { data, .. } => transfer.on_asset_loaded(data, None, services),
                TransferEvent::LayersDecoded { layers, .. } => transfer.on_layers_decoded(layers, services),
            }
        }
    }

    fn simulate_packets(len: usize) -> u32 {
        let mut count = 1;
        let mut remaining = len.saturating_sub(FIRST_PACKET_SIZE);
        while remaining > 0 {
            remaining = remaining.saturating_sub(IMAGE_PACKET_SIZE);
            count += 1;
        }
        count
    }

    #[test]
    fn test_packet_count_matches_slicing() {
        for len in 0..5000 {
            assert_eq!(packet_count(len), simulate_packets(len), "len {}", len);
        }
        assert_eq!(packet_count(1_000_000), simulate_packets(1_000_000));
    }

    #[test]
    fn test_last_packet_size() {
        assert_eq!(last_packet_size(600), 600);
        assert_eq!(last_packet_size(2600), 1000);
        assert_eq!(last_packet_size(2601), 1);
        assert_eq!(last_packet_size(1200), 600);
    }

    #[test]
    fn test_stop_packet_non_increasing_with_discard() {
        let len = 25_000;
        let layers: Vec<LayerBoundary> = [1_800, 4_700, 9_999, 16_000, 24_999]
            .iter()
            .scan(0, |start, &end| {
                let layer = LayerBoundary { start: *start, end };
                *start = end + 1;
                Some(layer)
            })
            .collect();

        let mut previous = u32::MAX;
        for discard in 0..layers.len() {
            let stop = stop_packet_for(len, &layers, discard);
            assert!(stop <= previous, "discard {} stop {} previous {}", discard, stop, previous);
            assert!(stop <= packet_count(len));
            previous = stop;
        }
    }

    #[test]
    fn test_stop_packet_extends_dangling_remainder() {
        // 3 packets; the layer ends inside packet 2, leaving one packet.
        let len = 2_600;
        let layers = [LayerBoundary { start: 0, end: 1_200 }, LayerBoundary { start: 1_201, end: 2_599 }];
        assert_eq!(packet_for_byte(1_200), 2);
        assert_eq!(stop_packet_for(len, &layers, 1), 3);
    }

    #[test]
    fn test_scenario_single_packet_asset() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(1);
        store.insert(id, asset(600));
        let decoder = FixedDecoder {
            layers: vec![LayerBoundary { start: 0, end: 599 }],
            calls: AtomicUsize::new(0),
        };
        let services = TextureServices { assets: &store, decoder: Some(&decoder), events: &tx };

        let mut transfer = TextureTransfer::new(id, -1, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        drain(&mut transfer, &rx, &services);
        assert_eq!(transfer.state(), TransferState::Streaming);
        assert_eq!(transfer.stop_packet(), 0);

        let mut sink: Vec<ImageMessage> = Vec::new();
        let outcome = transfer.advance(&services, Some(&mut sink), 10).unwrap();

        assert_eq!(outcome, AdvanceOutcome { packets_sent: 1, complete: true });
        assert_eq!(sink.len(), 1);
        match &sink[0] {
            ImageMessage::Data { size, packets, data, .. } => {
                assert_eq!(*size, 600);
                assert_eq!(*packets, 1);
                assert_eq!(data.len(), 600);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transfer.state(), TransferState::Complete);
    }

    #[test]
    fn test_scenario_last_packet_full_size() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(2);
        let data = asset(2600);
        store.insert(id, data.clone());
        let services = TextureServices { assets: &store, decoder: None, events: &tx };

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        assert_eq!(transfer.stop_packet(), 3);

        let mut sink: Vec<ImageMessage> = Vec::new();
        let outcome = transfer.advance(&services, Some(&mut sink), 10).unwrap();
        assert_eq!(outcome, AdvanceOutcome { packets_sent: 3, complete: true });

        let mut reassembled = Vec::new();
        for (i, message) in sink.iter().enumerate() {
            match message {
                ImageMessage::Data { data, packets, .. } => {
                    assert_eq!(i, 0);
                    assert_eq!(*packets, 3);
                    reassembled.extend_from_slice(data);
                }
                ImageMessage::Packet { packet, data, .. } => {
                    assert_eq!(*packet as usize, i);
                    reassembled.extend_from_slice(data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sink[2].payload_len(), 1000);
        assert_eq!(reassembled, data.to_vec());
    }

    #[test]
    fn test_streaming_resumes_across_calls() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(3);
        store.insert(id, asset(10_600));
        let services = TextureServices { assets: &store, decoder: None, events: &tx };

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);

        let mut sink: Vec<ImageMessage> = Vec::new();
        let mut last = transfer.current_packet();
        let mut calls = 0;
        loop {
            let outcome = transfer.advance(&services, Some(&mut sink), 4).unwrap();
            assert!(transfer.current_packet() >= last);
            last = transfer.current_packet();
            calls += 1;
            if outcome.complete {
                break;
            }
        }

        assert_eq!(sink.len(), packet_count(10_600) as usize);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_budget_is_idempotent() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(4);
        store.insert(id, asset(5000));
        let services = TextureServices { assets: &store, decoder: None, events: &tx };
        let mut sink: Vec<ImageMessage> = Vec::new();

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        for _ in 0..3 {
            let outcome = transfer.advance(&services, Some(&mut sink), 0).unwrap();
            assert_eq!(outcome.packets_sent, 0);
        }
        assert_eq!(store.request_count(), 0);

        transfer.advance(&services, Some(&mut sink), 1).unwrap();
        transfer.advance(&services, Some(&mut sink), 1).unwrap();
        assert_eq!(store.request_count(), 1);

        drain(&mut transfer, &rx, &services);
        let (current, stop) = (transfer.current_packet(), transfer.stop_packet());
        for _ in 0..3 {
            transfer.advance(&services, Some(&mut sink), 0).unwrap();
        }
        assert_eq!((transfer.current_packet(), transfer.stop_packet()), (current, stop));
        assert_eq!(store.request_count(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_decode_requested_once() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(5);
        store.insert(id, asset(3000));
        let decoder = FixedDecoder { layers: vec![], calls: AtomicUsize::new(0) };
        let services = TextureServices { assets: &store, decoder: Some(&decoder), events: &tx };
        let mut sink: Vec<ImageMessage> = Vec::new();

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        let event = rx.try_recv().unwrap();
        if let TransferEvent::AssetLoaded { data, .. } = event {
            transfer.on_asset_loaded(data, None, &services);
        }

        // Decode reply is queued but not yet applied.
        for _ in 0..3 {
            assert_eq!(transfer.advance(&services, Some(&mut sink), 5).unwrap().packets_sent, 0);
        }
        assert_eq!(decoder.calls.load(Ordering::Relaxed), 1);

        drain(&mut transfer, &rx, &services);
        // Empty layer table degrades to the whole asset.
        assert_eq!(transfer.stop_packet(), packet_count(3000));
    }

    #[test]
    fn test_missing_asset_sends_not_found() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(6);
        let services = TextureServices { assets: &store, decoder: None, events: &tx };

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        assert_eq!(transfer.state(), TransferState::Cancelled);
        assert_eq!(transfer.current_packet(), transfer.stop_packet());

        let mut sink: Vec<ImageMessage> = Vec::new();
        let outcome = transfer.advance(&services, Some(&mut sink), 10).unwrap();
        assert!(outcome.complete);
        assert_eq!(sink, vec![ImageMessage::NotInDatabase { texture_id: id }]);

        let again = transfer.advance(&services, Some(&mut sink), 10).unwrap();
        assert_eq!(again.packets_sent, 0);
        assert_eq!(store.request_count(), 1);
    }

    #[test]
    fn test_missing_asset_uses_fallback() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(7);
        let services = TextureServices { assets: &store, decoder: None, events: &tx };
        let placeholder = asset(100);

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        if let Ok(TransferEvent::AssetLoaded { data, .. }) = rx.try_recv() {
            transfer.on_asset_loaded(data, Some(&placeholder), &services);
        }
        assert_eq!(transfer.asset_len(), Some(100));
        assert_eq!(transfer.state(), TransferState::Streaming);
    }

    #[test]
    fn test_rerequest_keeps_asset_and_cursor() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(8);
        store.insert(id, asset(25_000));
        let decoder = FixedDecoder {
            layers: vec![
                LayerBoundary { start: 0, end: 2_000 },
                LayerBoundary { start: 2_001, end: 8_000 },
                LayerBoundary { start: 8_001, end: 24_999 },
            ],
            calls: AtomicUsize::new(0),
        };
        let services = TextureServices { assets: &store, decoder: Some(&decoder), events: &tx };
        let mut sink: Vec<ImageMessage> = Vec::new();

        let mut transfer = TextureTransfer::new(id, 2, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        drain(&mut transfer, &rx, &services);
        let low_stop = transfer.stop_packet();
        assert_eq!(low_stop, packet_for_byte(2_000));

        assert!(transfer.advance(&services, Some(&mut sink), 100).unwrap().complete);
        let cursor = transfer.current_packet();

        transfer.update_request(0, 2.0, 1, &services);
        assert_eq!(transfer.stop_packet(), packet_count(25_000));
        assert_eq!(transfer.current_packet(), cursor);
        assert_eq!(transfer.state(), TransferState::Streaming);

        let outcome = transfer.advance(&services, Some(&mut sink), 100).unwrap();
        assert!(outcome.complete);
        assert_eq!(store.request_count(), 1);
        assert_eq!(decoder.calls.load(Ordering::Relaxed), 1);
        assert_eq!(sink.len(), packet_count(25_000) as usize);
    }

    #[test]
    fn test_resumed_request_without_discard_keeps_level() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(11);
        store.insert(id, asset(25_000));
        let decoder = FixedDecoder {
            layers: vec![
                LayerBoundary { start: 0, end: 2_000 },
                LayerBoundary { start: 2_001, end: 8_000 },
                LayerBoundary { start: 8_001, end: 24_999 },
            ],
            calls: AtomicUsize::new(0),
        };
        let services = TextureServices { assets: &store, decoder: Some(&decoder), events: &tx };
        let mut sink: Vec<ImageMessage> = Vec::new();

        let mut transfer = TextureTransfer::new(id, 1, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        drain(&mut transfer, &rx, &services);
        let stop = transfer.stop_packet();
        assert_eq!(stop, packet_for_byte(8_000));
        transfer.advance(&services, Some(&mut sink), 2).unwrap();

        transfer.update_request(-1, 1.0, 3, &services);
        assert_eq!(transfer.discard_level(), 1);
        assert_eq!(transfer.stop_packet(), stop);
        assert_eq!(transfer.current_packet(), 3);
        assert_eq!(transfer.state(), TransferState::Streaming);

        transfer.update_request(-1, 1.0, 6, &services);
        assert_eq!(transfer.discard_level(), 1);
        assert_eq!(transfer.current_packet(), 6);
    }

    #[test]
    fn test_refused_packet_is_retried() {
        struct Refusing {
            accepted: Vec<ImageMessage>,
            capacity: usize,
        }

        impl ImageSink for Refusing {
            fn send_image(&mut self, message: ImageMessage) -> Result<()> {
                if self.accepted.len() >= self.capacity {
                    return Err(LinkError::ConnectionClosed);
                }
                self.accepted.push(message);
                Ok(())
            }
        }

        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(12);
        let data = asset(10_600);
        store.insert(id, data.clone());
        let services = TextureServices { assets: &store, decoder: None, events: &tx };

        let mut transfer = TextureTransfer::new(id, 0, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);

        let mut closed = Refusing { accepted: Vec::new(), capacity: 0 };
        assert!(matches!(
            transfer.advance(&services, Some(&mut closed), 20),
            Err(LinkError::ConnectionClosed)
        ));
        assert_eq!(transfer.current_packet(), 0);
        assert_eq!(transfer.state(), TransferState::Streaming);

        let mut partial = Refusing { accepted: Vec::new(), capacity: 4 };
        assert!(transfer.advance(&services, Some(&mut partial), 20).is_err());
        assert_eq!(transfer.current_packet(), 5);
        assert!(!transfer.is_complete());

        let mut sink: Vec<ImageMessage> = Vec::new();
        let outcome = transfer.advance(&services, Some(&mut sink), 20).unwrap();
        assert_eq!(outcome, AdvanceOutcome { packets_sent: 7, complete: true });
        match &sink[0] {
            ImageMessage::Packet { packet, .. } => assert_eq!(*packet, 4),
            other => panic!("unexpected {:?}", other),
        }

        let mut reassembled = Vec::new();
        for message in partial.accepted.iter().chain(sink.iter()) {
            match message {
                ImageMessage::Data { data, .. } | ImageMessage::Packet { data, .. } => reassembled.extend_from_slice(data),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(reassembled, data.to_vec());
    }

    #[test]
    fn test_discard_clamped_to_layer_table() {
        let (tx, rx) = unbounded();
        let store = MemoryAssetStore::new();
        let id = ObjectId::from_u128(9);
        store.insert(id, asset(8_000));
        let decoder = FixedDecoder {
            layers: vec![LayerBoundary { start: 0, end: 3_000 }, LayerBoundary { start: 3_001, end: 7_999 }],
            calls: AtomicUsize::new(0),
        };
        let services = TextureServices { assets: &store, decoder: Some(&decoder), events: &tx };

        let mut transfer = TextureTransfer::new(id, 5, 1.0, 0);
        transfer.run_update(&services);
        drain(&mut transfer, &rx, &services);
        drain(&mut transfer, &rx, &services);
        assert_eq!(transfer.discard_level(), 1);
    }

    #[test]
    fn test_no_client_is_noop() {
        let (tx, _rx) = unbounded();
        let store = MemoryAssetStore::new();
        let services = TextureServices { assets: &store, decoder: None, events: &tx };

        let mut transfer = TextureTransfer::new(ObjectId::from_u128(10), 0, 1.0, 0);
        assert_eq!(transfer.advance(&services, None, 10).unwrap(), AdvanceOutcome::default());
        assert_eq!(store.request_count(), 0);
    }

    #[test]
    fn test_slice_fault_reported() {
        let data = asset(10);
        assert!(matches!(slice_asset(&data, 5, 10), Err(LinkError::ByteRange { .. })));
        assert_eq!(slice_asset(&data, 5, 5).unwrap().len(), 5);
    }
}
