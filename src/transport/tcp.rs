//! TCP transport
//!
//! Accepts plain TCP connections and performs the MQTT handshake:
//! - the first packet must be CONNECT and must arrive within
//!   `server.connect_timeout_secs`
//! - the CONNECT is handed to the engine, which decides the CONNACK
//! - on acceptance the socket halves move into a [`Connection`] actor,
//!   on rejection the CONNACK is written and the socket closed

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::broker::{ConnectOutcome, Event, EventSender};
use crate::client::{Connection, ConnectionInfo};
use crate::config::Settings;
use crate::packet::{MqttCodec, Packet};
use crate::utils::{Error, Result};

/// Accepts connections on `listener` until the task is dropped.
pub async fn start_tcp_server(listener: TcpListener, events: EventSender, settings: Settings) {
    match listener.local_addr() {
        Ok(addr) => info!("MQTT broker listening on tcp://{addr}"),
        Err(e) => warn!("Listening on unknown address: {e}"),
    }

    let connect_timeout = Duration::from_secs(settings.server.connect_timeout_secs);
    let codec = MqttCodec::new(settings.broker.max_packet_size);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {e}");
                continue;
            }
        };

        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, peer, events, codec, connect_timeout).await {
                warn!("Connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    events: EventSender,
    codec: MqttCodec,
    connect_timeout: Duration,
) -> Result<()> {
    debug!("Accepted connection from {peer}");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {peer}: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec);
    let mut writer = FramedWrite::new(write_half, codec);

    let first = tokio::time::timeout(connect_timeout, reader.next())
        .await
        .map_err(|_| Error::ConnectTimeout)?;
    let connect = match first {
        Some(Ok(Packet::Connect(connect))) => connect,
        Some(Ok(_)) => return Err(Error::FirstPacketNotConnect),
        Some(Err(e)) => return Err(e),
        None => {
            debug!("{peer} closed before CONNECT");
            return Ok(());
        }
    };

    let keep_alive = connect.keep_alive;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();

    events
        .send(Event::Connect {
            connect,
            outbound: outbound_tx.clone(),
            reply: reply_tx,
        })
        .map_err(|_| Error::EngineClosed)?;
    let outcome = reply_rx.await.map_err(|_| Error::EngineClosed)?;

    let connack = outcome.connack();
    let written = writer.send(Packet::ConnAck(connack)).await;

    let ConnectOutcome::Accepted {
        client_id,
        connection,
        ..
    } = outcome
    else {
        info!("Refused {peer} with {:?}", connack.code);
        written?;
        let _ = writer.close().await;
        return Ok(());
    };

    if let Err(e) = written {
        let _ = events.send(Event::ConnectionLost {
            client_id,
            connection,
        });
        return Err(e);
    }

    debug!("{peer} is {client_id}");
    let info = ConnectionInfo {
        client_id,
        id: connection,
        keep_alive,
    };
    Connection::new(reader, writer, info, outbound_tx, outbound_rx, events)
        .run()
        .await;
    Ok(())
}
