//! The `client` module holds the actor that serves one connected MQTT client.
//!
//! A [`Connection`] owns both halves of the socket and bridges them to the
//! engine: inbound packets become events, and the engine's outbound queue is
//! written back out.

pub mod connection;

pub use connection::{Connection, ConnectionInfo};

#[cfg(test)]
mod tests;
