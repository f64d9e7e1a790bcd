//! Error types used within the `mqttd` broker.
//!
//! `ProtocolError` covers anything the peer got wrong on the wire and always
//! ends the connection. `StoreError` comes out of the session store and is
//! logged by the engine rather than surfaced to clients. `Error` wraps both
//! together with transport and configuration failures.

use std::io;

use thiserror::Error;

/// Top-level error for the broker.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Timed out waiting for CONNECT")]
    ConnectTimeout,

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("No packet within keep-alive of {0}s")]
    KeepAliveExpired(u16),

    #[error("Engine is no longer running")]
    EngineClosed,
}

/// MQTT wire protocol violations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid fixed header flags {flags:#06b} for packet type {packet_type}")]
    InvalidHeaderFlags { packet_type: u8, flags: u8 },

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Packet of {size} bytes exceeds the limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),
}

/// Session store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No such user: {0}")]
    NotFound(String),

    #[error("Bad credentials for user {0}")]
    BadCredentials(String),
}

pub type Result<T> = std::result::Result<T, Error>;
