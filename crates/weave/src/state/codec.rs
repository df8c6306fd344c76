//! Wire format for state packets
//!
//! MessagePack for normal use, JSON when you want to read the datagrams in
//! a packet capture.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{DomainError, Result};

use super::StatePacket;

/// Serialization used by a state send/receive pair. Both ends must agree.
pub trait StateCodec: Send + 'static {
    const NAME: &'static str;

    fn encode<T: Serialize>(packet: &StatePacket<T>) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<StatePacket<T>>;
}

/// MessagePack format - compact, the default
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl StateCodec for MsgPackCodec {
    const NAME: &'static str = "msgpack";

    fn encode<T: Serialize>(packet: &StatePacket<T>) -> Result<Vec<u8>> {
        rmp_serde::to_vec(packet)
            .map_err(|e| DomainError::Codec(format!("failed to serialize state to MessagePack: {}", e)))
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<StatePacket<T>> {
        rmp_serde::from_slice(data)
            .map_err(|e| DomainError::Codec(format!("failed to deserialize MessagePack state: {}", e)))
    }
}

/// JSON format - readable for debugging
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl StateCodec for JsonCodec {
    const NAME: &'static str = "json";

    fn encode<T: Serialize>(packet: &StatePacket<T>) -> Result<Vec<u8>> {
        serde_json::to_vec(packet)
            .map_err(|e| DomainError::Codec(format!("failed to serialize state to JSON: {}", e)))
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<StatePacket<T>> {
        serde_json::from_slice(data)
            .map_err(|e| DomainError::Codec(format!("failed to deserialize JSON state: {}", e)))
    }
}
