pub mod protocol;
pub mod error;
pub mod quantize;
pub mod entity;
pub mod services;
pub mod texture;
pub mod image_manager;
pub mod classify;
pub mod encoder;
pub mod transport;
pub mod throttle;
pub mod dispatch;
pub mod session;
pub mod debug;

pub use protocol::{
    AgentId, LocalId, ObjectId, TextureId,
    ImageMessage, OutgoingPacket, PacketCategory, PacketKind,
    RegionHeader, UpdatePacketWriter,
};

pub use error::{
    LinkError, Result,
};

pub use entity::{
    EntityKind, EntitySnapshot, PrimShape, UpdateFlags,
};

pub use services::{
    AssetReply, AssetStore, DecodeReply, LayerDecoder,
    PermissionEngine, SceneCache, SceneSource,
    MemoryAssetStore, MemoryScene, MemorySceneCache, OwnerPermissions,
};

pub use texture::{
    AdvanceOutcome, ImageSink, LayerBoundary, TextureServices,
    TextureTransfer, TransferEvent, TransferState,
};

pub use image_manager::{
    ImageManager, ImageStats, TextureRequest,
};

pub use classify::{
    classify, is_suppressed, Recipient, RepresentationClass,
};

pub use encoder::{
    encode, EncodeContext, TerseUpdate,
};

pub use transport::{
    DeliveryEvent, DeliveryReceipt, MemoryScheduler, PacketScheduler, Ticket,
};

pub use throttle::{
    ThrottleConfig, TokenBucket,
};

pub use dispatch::{
    DispatchConfig, DispatchServices, DispatchStats, UpdateCoordinator, UpdateQueue,
};

pub use session::{
    ClientSession, ImageConfig, SessionConfig, SessionServices, TickReport,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    format_bytes,
};
