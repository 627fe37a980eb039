//! Identifiers and the framing shared by image and update packets.

use crate::error::{LinkError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region-local entity id.
pub type LocalId = u32;

/// 128-bit identifier used for agents, objects and texture assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 16]);

pub type AgentId = ObjectId;
pub type TextureId = ObjectId;

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0; 16]);

    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Throttle categories understood by the packet scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketCategory {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    Task = 4,
    Texture = 5,
    Asset = 6,
    State = 7,
    AvatarInfo = 8,
    Transfer = 9,
    OutBand = 10,
}

/// Message numbers for the packets this crate produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    ImageData = 9,
    ImagePacket = 10,
    ObjectUpdate = 12,
    ObjectUpdateCompressed = 13,
    ObjectUpdateCached = 14,
    ImprovedTerseObjectUpdate = 15,
    ImageNotInDatabase = 86,
    SimStats = 140,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            9 => Some(PacketKind::ImageData),
            10 => Some(PacketKind::ImagePacket),
            12 => Some(PacketKind::ObjectUpdate),
            13 => Some(PacketKind::ObjectUpdateCompressed),
            14 => Some(PacketKind::ObjectUpdateCached),
            15 => Some(PacketKind::ImprovedTerseObjectUpdate),
            86 => Some(PacketKind::ImageNotInDatabase),
            140 => Some(PacketKind::SimStats),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub recipient: AgentId,
    pub category: PacketCategory,
    pub kind: PacketKind,
    pub payload: Bytes,
}

/// J2K codestream codec id carried in the image header.
pub const IMAGE_CODEC_J2C: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageMessage {
    /// First packet of a transfer: total size and packet count plus up to 600 bytes.
    Data {
        texture_id: TextureId,
        codec: u8,
        size: u32,
        packets: u16,
        data: Bytes,
    },
    /// A later packet carrying up to 1000 bytes.
    Packet {
        texture_id: TextureId,
        packet: u16,
        data: Bytes,
    },
    NotInDatabase {
        texture_id: TextureId,
    },
}

impl ImageMessage {
    pub fn kind(&self) -> PacketKind {
        match self {
            ImageMessage::Data { .. } => PacketKind::ImageData,
            ImageMessage::Packet { .. } => PacketKind::ImagePacket,
            ImageMessage::NotInDatabase { .. } => PacketKind::ImageNotInDatabase,
        }
    }

    pub fn texture_id(&self) -> TextureId {
        match self {
            ImageMessage::Data { texture_id, .. }
            | ImageMessage::Packet { texture_id, .. }
            | ImageMessage::NotInDatabase { texture_id } => *texture_id,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            ImageMessage::Data { data, .. } | ImageMessage::Packet { data, .. } => data.len(),
            ImageMessage::NotInDatabase { .. } => 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.payload_len());
        buf.put_u8(self.kind() as u8);

        match self {
            ImageMessage::Data { texture_id, codec, size, packets, data } => {
                buf.put_slice(texture_id.as_bytes());
                buf.put_u8(*codec);
                buf.put_u32_le(*size);
                buf.put_u16_le(*packets);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
            ImageMessage::Packet { texture_id, packet, data } => {
                buf.put_slice(texture_id.as_bytes());
                buf.put_u16_le(*packet);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
            ImageMessage::NotInDatabase { texture_id } => {
                buf.put_slice(texture_id.as_bytes());
            }
        }

        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let kind = read_u8(&mut data)?;
        let texture_id = read_id(&mut data)?;

        match PacketKind::from_u8(kind) {
            Some(PacketKind::ImageData) => {
                let codec = read_u8(&mut data)?;
                need(&data, 8)?;
                let size = data.get_u32_le();
                let packets = data.get_u16_le();
                let len = data.get_u16_le() as usize;
                need(&data, len)?;
                Ok(ImageMessage::Data {
                    texture_id,
                    codec,
                    size,
                    packets,
                    data: Bytes::copy_from_slice(&data[..len]),
                })
            }
            Some(PacketKind::ImagePacket) => {
                need(&data, 4)?;
                let packet = data.get_u16_le();
                let len = data.get_u16_le() as usize;
                need(&data, len)?;
                Ok(ImageMessage::Packet {
                    texture_id,
                    packet,
                    data: Bytes::copy_from_slice(&data[..len]),
                })
            }
            Some(PacketKind::ImageNotInDatabase) => Ok(ImageMessage::NotInDatabase { texture_id }),
            _ => Err(LinkError::InvalidMessage(format!("Not an image message: kind {}", kind))),
        }
    }
}

pub(crate) fn need(data: &[u8], len: usize) -> Result<()> {
    if data.len() < len {
        return Err(LinkError::InvalidMessage(format!(
            "Truncated message: need {} bytes, have {}",
            len,
            data.len()
        )));
    }
    Ok(())
}

fn read_u8(data: &mut &[u8]) -> Result<u8> {
    need(data, 1)?;
    Ok(data.get_u8())
}

fn read_id(data: &mut &[u8]) -> Result<ObjectId> {
    need(data, 16)?;
    let mut id = [0u8; 16];
    data.copy_to_slice(&mut id);
    Ok(ObjectId(id))
}

/// Header shared by the four object update packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub region_handle: u64,
    pub time_dilation: u16,
}

/// `kind u8, region_handle u64, time_dilation u16, block_count u8`.
pub const UPDATE_HEADER_SIZE: usize = 12;

/// Builds one object update packet from pre-encoded blocks.
pub struct UpdatePacketWriter {
    buffer: BytesMut,
    kind: PacketKind,
    block_count: u8,
    max_blocks: u8,
    max_bytes: usize,
}

impl UpdatePacketWriter {
    pub fn new(kind: PacketKind, header: RegionHeader, max_blocks: u8, max_bytes: usize) -> Self {
        let mut buffer = BytesMut::with_capacity(max_bytes.min(1500));
        buffer.put_u8(kind as u8);
        buffer.put_u64_le(header.region_handle);
        buffer.put_u16_le(header.time_dilation);
        buffer.put_u8(0);

        Self {
            buffer,
            kind,
            block_count: 0,
            max_blocks,
            max_bytes,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Appends a block if it fits. The first block is always accepted so an
    /// oversized block still gets its own packet.
    pub fn try_push(&mut self, block: &[u8]) -> bool {
        if self.block_count >= self.max_blocks {
            return false;
        }
        if self.block_count > 0 && self.buffer.len() + block.len() > self.max_bytes {
            return false;
        }
        self.buffer.put_slice(block);
        self.block_count += 1;
        true
    }

    pub fn block_count(&self) -> u8 {
        self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    pub fn finish(mut self) -> Bytes {
        self.buffer[UPDATE_HEADER_SIZE - 1] = self.block_count;
        self.buffer.freeze()
    }
}

/// Splits an update packet back into its header and block region.
pub fn parse_update_header(mut data: &[u8]) -> Result<(PacketKind, RegionHeader, u8, &[u8])> {
    need(data, UPDATE_HEADER_SIZE)?;
    let kind_byte = data.get_u8();
    let kind = PacketKind::from_u8(kind_byte)
        .ok_or_else(|| LinkError::InvalidMessage(format!("Unknown packet kind {}", kind_byte)))?;
    let region_handle = data.get_u64_le();
    let time_dilation = data.get_u16_le();
    let count = data.get_u8();
    Ok((kind, RegionHeader { region_handle, time_dilation }, count, data))
}
