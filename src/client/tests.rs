use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use super::{Connection, ConnectionInfo};
use crate::broker::{Event, Outbound};
use crate::packet::{Connect, MqttCodec, Packet};

struct Harness {
    peer: Framed<DuplexStream, MqttCodec>,
    outbound: UnboundedSender<Outbound>,
    events: UnboundedReceiver<Event>,
    actor: JoinHandle<()>,
}

fn spawn_connection(keep_alive: u16) -> Harness {
    let (peer_io, server_io) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(server_io);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connection = Connection::new(
        FramedRead::new(read_half, MqttCodec::default()),
        FramedWrite::new(write_half, MqttCodec::default()),
        ConnectionInfo {
            client_id: "c1".to_string(),
            id: 42,
            keep_alive,
        },
        outbound_tx.clone(),
        outbound_rx,
        events_tx,
    );

    Harness {
        peer: Framed::new(peer_io, MqttCodec::default()),
        outbound: outbound_tx,
        events: events_rx,
        actor: tokio::spawn(connection.run()),
    }
}

async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn finish(actor: JoinHandle<()>) {
    timeout(Duration::from_secs(5), actor)
        .await
        .expect("connection did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_pingreq_is_answered_locally() {
    let mut h = spawn_connection(0);

    h.peer.send(Packet::PingReq).await.unwrap();
    let reply = timeout(Duration::from_secs(5), h.peer.next()).await.unwrap();
    assert_eq!(reply.unwrap().unwrap(), Packet::PingResp);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_packets_are_forwarded_with_connection_id() {
    let mut h = spawn_connection(0);

    h.peer.send(Packet::PubAck(5)).await.unwrap();
    match next_event(&mut h.events).await {
        Event::Packet {
            client_id,
            connection,
            packet,
        } => {
            assert_eq!(client_id, "c1");
            assert_eq!(connection, 42);
            assert_eq!(packet, Packet::PubAck(5));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_outbound_queue_is_written_and_close_ends_quietly() {
    let mut h = spawn_connection(0);

    h.outbound.send(Outbound::Packet(Packet::UnsubAck(3))).unwrap();
    let written = timeout(Duration::from_secs(5), h.peer.next()).await.unwrap();
    assert_eq!(written.unwrap().unwrap(), Packet::UnsubAck(3));

    h.outbound.send(Outbound::Close).unwrap();
    finish(h.actor).await;

    assert!(h.events.try_recv().is_err());
    assert!(h.peer.next().await.is_none());
}

#[tokio::test]
async fn test_socket_loss_is_reported_once() {
    let Harness {
        peer,
        mut events,
        actor,
        ..
    } = spawn_connection(0);

    drop(peer);
    finish(actor).await;

    assert!(matches!(
        next_event(&mut events).await,
        Event::ConnectionLost { connection: 42, .. }
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_protocol_error_closes_connection() {
    let mut h = spawn_connection(0);

    // PUBLISH to a wildcard topic is malformed
    let raw = [0x30u8, 0x05, 0x00, 0x03, b'a', b'/', b'#'];
    tokio::io::AsyncWriteExt::write_all(h.peer.get_mut(), &raw)
        .await
        .unwrap();

    finish(h.actor).await;
    assert!(matches!(
        next_event(&mut h.events).await,
        Event::ConnectionLost { .. }
    ));
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let mut h = spawn_connection(0);

    h.peer
        .send(Packet::Connect(Connect {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            client_id: "again".to_string(),
            ..Connect::default()
        }))
        .await
        .unwrap();

    finish(h.actor).await;
    assert!(matches!(
        next_event(&mut h.events).await,
        Event::ConnectionLost { .. }
    ));
}

#[tokio::test]
async fn test_disconnect_is_forwarded_without_loss() {
    let mut h = spawn_connection(0);

    h.peer.send(Packet::Disconnect).await.unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        Event::Packet {
            packet: Packet::Disconnect,
            ..
        }
    ));

    h.outbound.send(Outbound::Close).unwrap();
    finish(h.actor).await;
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_keep_alive_expiry() {
    let mut h = spawn_connection(1);

    // nothing sent for longer than 1.5 x keep-alive
    let event = timeout(Duration::from_secs(4), h.events.recv())
        .await
        .expect("keep-alive did not expire")
        .unwrap();
    assert!(matches!(event, Event::ConnectionLost { .. }));
    finish(h.actor).await;
}

#[tokio::test]
async fn test_traffic_keeps_connection_alive() {
    let mut h = spawn_connection(1);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        h.peer.send(Packet::PingReq).await.unwrap();
        let reply = timeout(Duration::from_secs(5), h.peer.next()).await.unwrap();
        assert_eq!(reply.unwrap().unwrap(), Packet::PingResp);
    }
    assert!(h.events.try_recv().is_err());
}
