//! Broker engine
//!
//! The engine is the single owner of every client session, the subscription
//! tables, the retained index and all in-flight QoS state. It consumes one
//! stream of [`Event`]s and answers by enqueueing packets on per-connection
//! outbound queues.
//!
//! Concurrency and usage notes:
//! - `Engine::run` is meant to be spawned as one tokio task. Connection
//!   actors only ever talk to it through the event channel, so no locks are
//!   needed around broker state.
//! - `Engine::handle` runs one event synchronously, which is what the unit
//!   tests drive.
//! - Store calls happen inline. A failing store is logged and the in-memory
//!   operation still goes ahead.
//! - `start_retry_loop` feeds `Event::RetryTick` so unacknowledged deliveries
//!   are re-sent with DUP set. Retries are capped to avoid endless resends.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::broker::session::{ClientSession, ConnectionHandle, ConnectionId, Outbound, Pending};
use crate::broker::topic;
use crate::config::BrokerSettings;
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, PROTOCOL_LEVEL_3_1_1, Packet, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Unsubscribe,
};
use crate::persistence::SessionStore;

pub type EventSender = UnboundedSender<Event>;

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum Event {
    /// A CONNECT read by the listener. The outcome goes back on `reply`.
    Connect {
        connect: Connect,
        outbound: UnboundedSender<Outbound>,
        reply: oneshot::Sender<ConnectOutcome>,
    },
    /// A packet read by a connection actor.
    Packet {
        client_id: String,
        connection: ConnectionId,
        packet: Packet,
    },
    /// The socket went away without a DISCONNECT.
    ConnectionLost {
        client_id: String,
        connection: ConnectionId,
    },
    RetryTick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted {
        client_id: String,
        connection: ConnectionId,
        session_present: bool,
    },
    Rejected(ConnectReturnCode),
}

impl ConnectOutcome {
    /// The CONNACK to write back to the client.
    pub fn connack(&self) -> ConnAck {
        match self {
            ConnectOutcome::Accepted {
                session_present, ..
            } => ConnAck {
                session_present: *session_present,
                code: ConnectReturnCode::Accepted,
            },
            ConnectOutcome::Rejected(code) => ConnAck {
                session_present: false,
                code: *code,
            },
        }
    }
}

pub struct Engine {
    store: Box<dyn SessionStore>,
    settings: BrokerSettings,
    sessions: HashMap<String, ClientSession>,
    retained: HashMap<String, Message>,
    next_connection_id: ConnectionId,
}

impl Engine {
    /// Creates an engine and loads the retained index from `store`.
    pub fn new(store: Box<dyn SessionStore>, settings: BrokerSettings) -> Self {
        let retained: HashMap<String, Message> = match store.fetch_all_retained() {
            Ok(messages) => messages.into_iter().map(|m| (m.topic.clone(), m)).collect(),
            Err(e) => {
                error!("Failed to load retained messages: {e}");
                HashMap::new()
            }
        };
        info!("Loaded {} retained messages", retained.len());

        Self {
            store,
            settings,
            sessions: HashMap::new(),
            retained,
            next_connection_id: 1,
        }
    }

    /// Spawns the engine task and its retry timer, returning the event sender.
    pub fn start(self) -> (EventSender, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval = Duration::from_secs(self.settings.retry_interval_secs.max(1));

        tokio::spawn(start_retry_loop(tx.clone(), interval));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Processes events until every sender is gone.
    pub async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        info!("Engine event channel closed");
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Connect {
                connect,
                outbound,
                reply,
            } => {
                let outcome = self.connect(connect, outbound);
                let accepted = match &outcome {
                    ConnectOutcome::Accepted {
                        client_id,
                        connection,
                        ..
                    } => Some((client_id.clone(), *connection)),
                    ConnectOutcome::Rejected(_) => None,
                };
                if reply.send(outcome).is_err() {
                    if let Some((client_id, connection)) = accepted {
                        warn!("Listener for {client_id} went away before CONNACK");
                        self.connection_lost(&client_id, connection);
                    }
                }
            }
            Event::Packet {
                client_id,
                connection,
                packet,
            } => self.on_packet(&client_id, connection, packet),
            Event::ConnectionLost {
                client_id,
                connection,
            } => self.connection_lost(&client_id, connection),
            Event::RetryTick => self.retry_pending(),
        }
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    pub fn retained(&self, topic_name: &str) -> Option<&Message> {
        self.retained.get(topic_name)
    }

    pub fn live_connections(&self) -> usize {
        self.sessions.values().filter(|s| s.is_connected()).count()
    }

    fn connect(&mut self, connect: Connect, outbound: UnboundedSender<Outbound>) -> ConnectOutcome {
        if connect.protocol_level != PROTOCOL_LEVEL_3_1_1 {
            warn!(
                "Rejecting CONNECT with protocol level {}",
                connect.protocol_level
            );
            return ConnectOutcome::Rejected(ConnectReturnCode::UnacceptableProtocolVersion);
        }

        let persistent = !connect.clean_session;
        if connect.client_id.is_empty() && persistent {
            warn!("Rejecting persistent session without client id");
            return ConnectOutcome::Rejected(ConnectReturnCode::IdentifierRejected);
        }

        match &connect.username {
            Some(username) => {
                let password = connect.password.as_deref().unwrap_or_default();
                if let Err(e) = self.store.check_auth(username, password) {
                    warn!("Authentication failed: {e}");
                    return ConnectOutcome::Rejected(ConnectReturnCode::BadUsernameOrPassword);
                }
            }
            None if !self.settings.allow_anonymous => {
                warn!("Rejecting anonymous CONNECT");
                return ConnectOutcome::Rejected(ConnectReturnCode::NotAuthorized);
            }
            None => {}
        }

        let client_id = if !connect.client_id.is_empty() {
            connect.client_id
        } else if let Some(username) = &connect.username {
            username.clone()
        } else {
            format!("auto-{}", Uuid::new_v4())
        };

        let replacing = self
            .sessions
            .get(&client_id)
            .is_some_and(|s| s.is_connected());
        if !replacing && self.live_connections() >= self.settings.max_connections {
            warn!(
                "Rejecting {client_id}: {} connections already open",
                self.settings.max_connections
            );
            return ConnectOutcome::Rejected(ConnectReturnCode::ServerUnavailable);
        }

        if let Some(existing) = self.sessions.get_mut(&client_id) {
            if let Some(previous) = existing.connection.take() {
                info!("Client {client_id} connected again, closing previous connection");
                previous.close();
                existing.will = None;
            }
        }

        let resumed = match self.sessions.remove(&client_id) {
            Some(session) if persistent && session.persistent => Some(session),
            _ => None,
        };

        let restored = if persistent {
            match self.store.fetch_subscriptions(&client_id) {
                Ok(subscriptions) => subscriptions,
                Err(e) => {
                    error!("Failed to fetch subscriptions for {client_id}: {e}");
                    HashMap::new()
                }
            }
        } else {
            if let Err(e) = self.store.delete_subscriptions(&client_id) {
                error!("Failed to delete subscriptions for {client_id}: {e}");
            }
            HashMap::new()
        };

        let session_present = persistent && (resumed.is_some() || !restored.is_empty());
        let mut session = resumed.unwrap_or_else(|| ClientSession::new(&client_id, persistent));

        let connection = self.next_connection_id;
        self.next_connection_id += 1;
        session.connection = Some(ConnectionHandle::new(connection, outbound));
        session.will = connect.will;

        let mut filters: Vec<(String, QoS)> = session
            .subscriptions
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect();
        for (filter, qos) in restored {
            if !session.subscriptions.contains_key(&filter) {
                session.subscriptions.insert(filter.clone(), qos);
                filters.push((filter, qos));
            }
        }

        resend_in_flight(&mut session);
        self.sessions.insert(client_id.clone(), session);

        if !filters.is_empty() {
            debug!("Restoring {} subscriptions for {client_id}", filters.len());
            self.replay_retained(&client_id, &filters);
        }

        info!(
            "Client {client_id} connected (persistent: {persistent}, session present: {session_present})"
        );
        ConnectOutcome::Accepted {
            client_id,
            connection,
            session_present,
        }
    }

    fn on_packet(&mut self, client_id: &str, connection: ConnectionId, packet: Packet) {
        let Some(session) = self.sessions.get(client_id) else {
            warn!("{packet} from unknown client {client_id}");
            return;
        };
        if !session.is_connection(connection) {
            debug!("Ignoring {packet} from replaced connection of {client_id}");
            return;
        }

        match packet {
            Packet::Publish(publish) => self.on_publish(client_id, publish),
            Packet::PubAck(id) => self.on_puback(client_id, id),
            Packet::PubRec(id) => self.on_pubrec(client_id, id),
            Packet::PubRel(id) => self.on_pubrel(client_id, id),
            Packet::PubComp(id) => self.on_pubcomp(client_id, id),
            Packet::Subscribe(subscribe) => self.on_subscribe(client_id, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(client_id, unsubscribe),
            Packet::PingReq => {
                session.send(Packet::PingResp);
            }
            Packet::Disconnect => self.on_disconnect(client_id),
            other => warn!("Unexpected {} from {client_id}", other.packet_type()),
        }
    }

    fn on_publish(&mut self, client_id: &str, publish: Publish) {
        let qos = publish.qos;
        let packet_id = publish.packet_id;
        let message = Message::from(publish);

        self.apply_retain(&message);

        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => self.publish_fanout(&message),
            (QoS::AtLeastOnce, Some(id)) => {
                if let Some(session) = self.sessions.get(client_id) {
                    session.send(Packet::PubAck(id));
                }
                self.publish_fanout(&message);
            }
            (QoS::ExactlyOnce, Some(id)) => {
                let Some(session) = self.sessions.get_mut(client_id) else {
                    return;
                };
                if session.outstanding_in.contains_key(&id) {
                    debug!("Repeated QoS 2 publish {id} from {client_id}");
                } else {
                    session.outstanding_in.insert(id, message);
                }
                session.send(Packet::PubRec(id));
            }
            (_, None) => warn!("QoS {} publish without packet id from {client_id}", qos as u8),
        }
    }

    fn on_puback(&mut self, client_id: &str, id: u16) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if session.outstanding_out.remove(&id).is_none() {
            warn!("PUBACK for unknown packet {id} from {client_id}");
        }
    }

    fn on_pubrec(&mut self, client_id: &str, id: u16) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        match session.outstanding_out.remove(&id) {
            Some(mut pending) => {
                pending.sent_at = chrono::Utc::now().timestamp_millis();
                pending.retries = 0;
                session.released.insert(id, pending);
                session.send(Packet::PubRel(id));
            }
            None => warn!("PUBREC for unknown packet {id} from {client_id}"),
        }
    }

    fn on_pubrel(&mut self, client_id: &str, id: u16) {
        let message = match self.sessions.get_mut(client_id) {
            Some(session) => session.outstanding_in.remove(&id),
            None => return,
        };

        match message {
            Some(message) => self.publish_fanout(&message),
            None => warn!("PUBREL for unknown packet {id} from {client_id}"),
        }

        if let Some(session) = self.sessions.get(client_id) {
            session.send(Packet::PubComp(id));
        }
    }

    fn on_pubcomp(&mut self, client_id: &str, id: u16) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if session.released.remove(&id).is_none() {
            warn!("PUBCOMP for unknown packet {id} from {client_id}");
        }
    }

    fn on_subscribe(&mut self, client_id: &str, subscribe: Subscribe) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for (filter, qos) in subscribe.filters {
            if !topic::valid_filter(&filter) {
                warn!("Invalid topic filter {filter:?} from {client_id}");
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            session.subscriptions.insert(filter.clone(), qos);
            if session.persistent {
                if let Err(e) = self.store.save_subscription(client_id, &filter, qos) {
                    error!("Failed to persist subscription {filter} for {client_id}: {e}");
                }
            }
            debug!("{client_id} subscribed to {filter} (qos {})", qos as u8);
            return_codes.push(SubscribeReturnCode::Success(qos));
            granted.push((filter, qos));
        }

        session.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));

        self.replay_retained(client_id, &granted);
    }

    fn on_unsubscribe(&mut self, client_id: &str, unsubscribe: Unsubscribe) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };

        for filter in &unsubscribe.filters {
            session.subscriptions.remove(filter);
            if session.persistent {
                if let Err(e) = self.store.delete_subscription(client_id, filter) {
                    error!("Failed to delete subscription {filter} for {client_id}: {e}");
                }
            }
        }

        session.send(Packet::UnsubAck(unsubscribe.packet_id));
    }

    fn on_disconnect(&mut self, client_id: &str) {
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.will = None;
        }
        info!("Client {client_id} disconnected");
        self.end_session(client_id);
    }

    fn connection_lost(&mut self, client_id: &str, connection: ConnectionId) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if !session.is_connection(connection) {
            debug!("Ignoring loss of replaced connection for {client_id}");
            return;
        }

        let will = session.will.take();
        info!("Connection to {client_id} lost");
        self.end_session(client_id);

        if let Some(will) = will {
            let message = Message::from(will);
            info!("Publishing will of {client_id} on {}", message.topic);
            self.apply_retain(&message);
            self.publish_fanout(&message);
        }
    }

    /// Closes the live connection and forgets a clean session.
    fn end_session(&mut self, client_id: &str) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if let Some(connection) = session.connection.take() {
            connection.close();
        }
        if !session.persistent {
            self.sessions.remove(client_id);
            if let Err(e) = self.store.delete_subscriptions(client_id) {
                error!("Failed to delete subscriptions for {client_id}: {e}");
            }
        }
    }

    fn apply_retain(&mut self, message: &Message) {
        if !message.retain {
            return;
        }

        if message.payload.is_empty() {
            self.retained.remove(&message.topic);
            if let Err(e) = self.store.delete_retain(&message.topic) {
                error!("Failed to delete retained message on {}: {e}", message.topic);
            }
        } else {
            self.retained.insert(message.topic.clone(), message.clone());
            if let Err(e) = self.store.save_retain(message) {
                error!("Failed to store retained message on {}: {e}", message.topic);
            }
        }
    }

    /// Delivers one copy of `message` to every connected session with a
    /// matching subscription, at the highest QoS any of its filters granted.
    fn publish_fanout(&mut self, message: &Message) {
        for session in self.sessions.values_mut() {
            if !session.is_connected() {
                continue;
            }
            if let Some(qos) = session.granted_qos(&message.topic) {
                deliver(session, message, qos, false);
            }
        }
    }

    fn replay_retained(&mut self, client_id: &str, filters: &[(String, QoS)]) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        for (filter, qos) in filters {
            for message in self.retained.values() {
                if topic::matches(filter, &message.topic) {
                    deliver(session, message, *qos, true);
                }
            }
        }
    }

    fn retry_pending(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let timeout_ms = self.settings.ack_timeout_secs.saturating_mul(1000) as i64;
        let max_retries = self.settings.max_retries;

        for session in self.sessions.values_mut() {
            if !session.is_connected() {
                continue;
            }

            let mut resend = Vec::new();
            let mut dropped = Vec::new();

            for (id, pending) in session.outstanding_out.iter_mut() {
                if now - pending.sent_at < timeout_ms {
                    continue;
                }
                if pending.retries >= max_retries {
                    dropped.push(*id);
                    continue;
                }
                pending.retries += 1;
                pending.sent_at = now;
                let mut publish = pending.publish.clone();
                publish.dup = true;
                resend.push(Packet::Publish(publish));
            }
            for id in dropped.drain(..) {
                session.outstanding_out.remove(&id);
                warn!(
                    "Message {id} to {} dropped after {max_retries} retries",
                    session.client_id
                );
            }

            for (id, pending) in session.released.iter_mut() {
                if now - pending.sent_at < timeout_ms {
                    continue;
                }
                if pending.retries >= max_retries {
                    dropped.push(*id);
                    continue;
                }
                pending.retries += 1;
                pending.sent_at = now;
                resend.push(Packet::PubRel(*id));
            }
            for id in dropped {
                session.released.remove(&id);
                warn!(
                    "Release {id} to {} dropped after {max_retries} retries",
                    session.client_id
                );
            }

            for packet in resend {
                debug!("Re-sending {packet} to {}", session.client_id);
                session.send(packet);
            }
        }
    }
}

/// Sends one copy of `message` to `session`, tracking it when QoS > 0.
fn deliver(session: &mut ClientSession, message: &Message, qos: QoS, retain: bool) {
    let publish = if qos == QoS::AtMostOnce {
        message.to_publish(qos, None, retain, false)
    } else {
        let Some(id) = session.next_packet_id() else {
            warn!(
                "No free packet id for {}, dropping message on {}",
                session.client_id, message.topic
            );
            return;
        };
        let publish = message.to_publish(qos, Some(id), retain, false);
        session.outstanding_out.insert(id, Pending::new(publish.clone()));
        publish
    };
    session.send(Packet::Publish(publish));
}

/// Re-sends unacknowledged deliveries of a resumed session, DUP set.
fn resend_in_flight(session: &mut ClientSession) {
    let now = chrono::Utc::now().timestamp_millis();

    let mut ids: Vec<u16> = session.outstanding_out.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        if let Some(pending) = session.outstanding_out.get_mut(&id) {
            pending.sent_at = now;
            let mut publish = pending.publish.clone();
            publish.dup = true;
            session.send(Packet::Publish(publish));
        }
    }

    let mut ids: Vec<u16> = session.released.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        if let Some(pending) = session.released.get_mut(&id) {
            pending.sent_at = now;
        }
        session.send(Packet::PubRel(id));
    }
}

/// Pushes a `RetryTick` into the engine every `interval` until it goes away.
pub async fn start_retry_loop(events: EventSender, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if events.send(Event::RetryTick).is_err() {
            break;
        }
    }
}
