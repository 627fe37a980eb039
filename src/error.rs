use crate::protocol::ObjectId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Asset unavailable: {0}")]
    AssetUnavailable(ObjectId),

    #[error("Byte range {offset}..{end} out of bounds for asset of {asset_len} bytes")]
    ByteRange {
        offset: usize,
        end: usize,
        asset_len: usize,
    },

    #[error("Field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
