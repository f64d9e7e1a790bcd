//! Per-connection actor
//!
//! Once the listener has completed the CONNECT/CONNACK handshake it hands the
//! framed socket halves to a [`Connection`]. The actor runs two duties:
//! - the read duty decodes packets and forwards them to the engine as
//!   `Event::Packet`. PINGREQ is answered here without involving the engine.
//! - the write duty drains the outbound queue the engine fills and encodes
//!   each packet onto the socket.
//!
//! The duties share a `CancellationToken`: whichever stops first stops the
//! other. A lost connection is reported to the engine exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{ConnectionId, Event, EventSender, Outbound};
use crate::packet::{MqttCodec, Packet};
use crate::utils::{Error, ProtocolError};

/// Identity of an accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub id: ConnectionId,
    /// Keep-alive from CONNECT, in seconds. Zero disables the check.
    pub keep_alive: u16,
}

pub struct Connection<R, W> {
    reader: FramedRead<R, MqttCodec>,
    writer: FramedWrite<W, MqttCodec>,
    info: ConnectionInfo,
    outbound_tx: UnboundedSender<Outbound>,
    outbound_rx: UnboundedReceiver<Outbound>,
    events: EventSender,
}

/// Reports `ConnectionLost` at most once per connection.
#[derive(Clone)]
struct LossReporter {
    reported: Arc<AtomicBool>,
    events: EventSender,
    client_id: String,
    connection: ConnectionId,
}

impl LossReporter {
    fn report(&self) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(Event::ConnectionLost {
                client_id: self.client_id.clone(),
                connection: self.connection,
            });
        }
    }

    /// Marks the connection as ended on purpose so nothing is reported.
    fn settle(&self) {
        self.reported.store(true, Ordering::SeqCst);
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: FramedRead<R, MqttCodec>,
        writer: FramedWrite<W, MqttCodec>,
        info: ConnectionInfo,
        outbound_tx: UnboundedSender<Outbound>,
        outbound_rx: UnboundedReceiver<Outbound>,
        events: EventSender,
    ) -> Self {
        Self {
            reader,
            writer,
            info,
            outbound_tx,
            outbound_rx,
            events,
        }
    }

    /// Runs both duties until the connection ends.
    pub async fn run(self) {
        let Connection {
            reader,
            writer,
            info,
            outbound_tx,
            outbound_rx,
            events,
        } = self;

        let token = CancellationToken::new();
        let loss = LossReporter {
            reported: Arc::new(AtomicBool::new(false)),
            events: events.clone(),
            client_id: info.client_id.clone(),
            connection: info.id,
        };

        let write_duty = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            token.clone(),
            loss.clone(),
            info.client_id.clone(),
        ));

        read_loop(reader, outbound_tx, events, token.clone(), loss, &info).await;

        if let Err(e) = write_duty.await {
            warn!("Write duty for {} panicked: {e}", info.client_id);
        }
        info!("Connection {} for {} closed", info.id, info.client_id);
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, MqttCodec>,
    outbound: UnboundedSender<Outbound>,
    events: EventSender,
    token: CancellationToken,
    loss: LossReporter,
    info: &ConnectionInfo,
) where
    R: AsyncRead + Unpin,
{
    let keep_alive = (info.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(info.keep_alive) * 1500));
    let client_id = &info.client_id;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = next_packet(&mut reader, keep_alive, info.keep_alive) => next,
        };

        let packet = match next {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!("{client_id} closed the connection");
                loss.report();
                break;
            }
            Err(e) => {
                warn!("Closing connection to {client_id}: {e}");
                loss.report();
                break;
            }
        };

        match packet {
            Packet::PingReq => {
                let _ = outbound.send(Outbound::Packet(Packet::PingResp));
            }
            Packet::Connect(_) => {
                let e = ProtocolError::UnexpectedPacket("second CONNECT".to_string());
                warn!("Closing connection to {client_id}: {e}");
                loss.report();
                break;
            }
            Packet::Disconnect => {
                loss.settle();
                debug!("{client_id} sent DISCONNECT");
                let _ = events.send(Event::Packet {
                    client_id: client_id.clone(),
                    connection: info.id,
                    packet: Packet::Disconnect,
                });
                // The engine answers with Outbound::Close, which ends the write duty.
                return;
            }
            packet => {
                let forwarded = events.send(Event::Packet {
                    client_id: client_id.clone(),
                    connection: info.id,
                    packet,
                });
                if forwarded.is_err() {
                    warn!("{}", Error::EngineClosed);
                    break;
                }
            }
        }
    }

    token.cancel();
}

async fn next_packet<R>(
    reader: &mut FramedRead<R, MqttCodec>,
    keep_alive: Option<Duration>,
    keep_alive_secs: u16,
) -> Result<Option<Packet>, Error>
where
    R: AsyncRead + Unpin,
{
    let next = match keep_alive {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| Error::KeepAliveExpired(keep_alive_secs))?,
        None => reader.next().await,
    };
    next.transpose()
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, MqttCodec>,
    mut outbound: UnboundedReceiver<Outbound>,
    token: CancellationToken,
    loss: LossReporter,
    client_id: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            item = outbound.recv() => match item {
                Some(Outbound::Packet(packet)) => {
                    if let Err(e) = writer.send(packet).await {
                        warn!("Failed to write to {client_id}: {e}");
                        loss.report();
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Engine closed connection to {client_id}");
                    loss.settle();
                    break;
                }
            }
        }
    }

    token.cancel();
    if let Err(e) = writer.close().await {
        debug!("Shutdown of {client_id} socket failed: {e}");
    }
}
