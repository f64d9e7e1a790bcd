//! Per-client session state owned by the engine.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::Message;
use crate::broker::topic;
use crate::packet::{LastWill, Packet, Publish, QoS};

/// Monotonic tag for one accepted socket. Events carrying an id that is not
/// the session's current one come from a replaced connection.
pub type ConnectionId = u64;

/// Work item for a connection's write duty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Packet(Packet),
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: UnboundedSender<Outbound>) -> Self {
        Self { id, sender }
    }

    /// Enqueue a packet. Returns false once the write duty has gone away.
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(Outbound::Packet(packet)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

/// A broker to client delivery waiting for its acknowledgement.
///
/// `sent_at` is a UTC timestamp in milliseconds, `retries` counts re-sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub publish: Publish,
    pub sent_at: i64,
    pub retries: u8,
}

impl Pending {
    pub fn new(publish: Publish) -> Self {
        Self {
            publish,
            sent_at: chrono::Utc::now().timestamp_millis(),
            retries: 0,
        }
    }
}

#[derive(Debug)]
pub struct ClientSession {
    pub client_id: String,
    pub persistent: bool,
    pub connection: Option<ConnectionHandle>,
    pub subscriptions: HashMap<String, QoS>,
    pub will: Option<LastWill>,
    /// QoS 1 and 2 publishes sent to the client, awaiting PUBACK or PUBREC.
    pub outstanding_out: HashMap<u16, Pending>,
    /// QoS 2 publishes the client has PUBRECed, awaiting PUBCOMP.
    pub released: HashMap<u16, Pending>,
    /// QoS 2 publishes received from the client, awaiting PUBREL.
    pub outstanding_in: HashMap<u16, Message>,
    next_packet_id: u16,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, persistent: bool) -> Self {
        Self {
            client_id: client_id.into(),
            persistent,
            connection: None,
            subscriptions: HashMap::new(),
            will: None,
            outstanding_out: HashMap::new(),
            released: HashMap::new(),
            outstanding_in: HashMap::new(),
            next_packet_id: 1,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_connection(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    /// Enqueue a packet on the live connection, if any.
    pub fn send(&self, packet: Packet) -> bool {
        match &self.connection {
            Some(connection) => connection.send(packet),
            None => false,
        }
    }

    /// Allocate the next free outbound packet id.
    ///
    /// Ids run 1..=65535 and wrap back to 1. Ids still in `outstanding_out`
    /// or `released` are skipped. Returns `None` if every id is in flight.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.outstanding_out.contains_key(&id) && !self.released.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Highest QoS granted by any subscription matching `topic`.
    pub fn granted_qos(&self, topic_name: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic_name))
            .map(|(_, qos)| *qos)
            .max()
    }
}
