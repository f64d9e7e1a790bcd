//! The `transport` module is responsible for network communication with
//! clients over plain TCP.
//!
//! It accepts sockets, runs the CONNECT/CONNACK handshake against the engine
//! and hands accepted connections to the per-connection actor.

pub mod tcp;

pub use tcp::start_tcp_server;

#[cfg(test)]
mod tests;
