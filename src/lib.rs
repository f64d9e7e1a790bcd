//! # mqttd
//!
//! `mqttd` is an MQTT 3.1.1 broker built on tokio. Clients connect over plain
//! TCP, and messages are routed by topic filter with QoS 0, 1 and 2 delivery,
//! retained messages, last wills and persistent sessions.
//!
//! ## Core Modules
//!
//! - `packet`: The MQTT control packets and their `tokio_util` codec.
//! - `broker`: The engine that owns all session state, plus topic matching.
//! - `client`: The per-connection actor bridging a socket to the engine.
//! - `config`: Loading settings from files and the environment.
//! - `persistence`: The session store for users, subscriptions and retained messages.
//! - `transport`: The TCP listener and CONNECT handshake.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod packet;
pub mod persistence;
pub mod transport;
pub mod utils;
