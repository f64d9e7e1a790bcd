use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::start_tcp_server;
use crate::broker::Engine;
use crate::config::Settings;
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, MqttCodec, Packet, Publish, QoS,
    Subscribe, SubscribeReturnCode,
};
use crate::persistence::SledStore;

type Client = Framed<TcpStream, MqttCodec>;

async fn start_broker(mut settings: Settings) -> SocketAddr {
    settings.server.connect_timeout_secs = 1;
    let engine = Engine::new(Box::new(SledStore::temporary().unwrap()), settings.broker.clone());
    let (events, _engine_task) = engine.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(start_tcp_server(listener, events, settings));
    addr
}

fn connect_packet(client_id: &str) -> Connect {
    Connect {
        protocol_name: "MQTT".to_string(),
        protocol_level: 4,
        clean_session: true,
        keep_alive: 30,
        client_id: client_id.to_string(),
        ..Connect::default()
    }
}

async fn recv(client: &mut Client) -> Option<Packet> {
    timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for packet")
        .map(|r| r.unwrap())
}

async fn connect(addr: SocketAddr, connect: Connect) -> (Client, ConnAck) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(stream, MqttCodec::default());
    client.send(Packet::Connect(connect)).await.unwrap();
    match recv(&mut client).await {
        Some(Packet::ConnAck(ack)) => (client, ack),
        other => panic!("expected CONNACK, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_and_subscribe_over_tcp() {
    let addr = start_broker(Settings::default()).await;

    let (mut sub, ack) = connect(addr, connect_packet("sub")).await;
    assert_eq!(ack.code, ConnectReturnCode::Accepted);
    assert!(!ack.session_present);

    sub.send(Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![("sensors/+".to_string(), QoS::AtLeastOnce)],
    }))
    .await
    .unwrap();
    match recv(&mut sub).await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.return_codes, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)])
        }
        other => panic!("expected SUBACK, got {other:?}"),
    }

    let (mut publisher, _) = connect(addr, connect_packet("pub")).await;
    publisher
        .send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "sensors/t1".to_string(),
            packet_id: Some(11),
            payload: Bytes::from_static(b"19.0"),
        }))
        .await
        .unwrap();
    assert_eq!(recv(&mut publisher).await, Some(Packet::PubAck(11)));

    let Some(Packet::Publish(delivered)) = recv(&mut sub).await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(delivered.topic, "sensors/t1");
    assert_eq!(delivered.payload, Bytes::from_static(b"19.0"));
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    sub.send(Packet::PubAck(delivered.packet_id.unwrap()))
        .await
        .unwrap();

    sub.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut sub).await, Some(Packet::PingResp));

    sub.send(Packet::Disconnect).await.unwrap();
    assert_eq!(recv(&mut sub).await, None);
}

#[tokio::test]
async fn test_unsupported_protocol_level_gets_connack_and_close() {
    let addr = start_broker(Settings::default()).await;

    let mut v5 = connect_packet("v5");
    v5.protocol_level = 5;
    let (mut client, ack) = connect(addr, v5).await;
    assert_eq!(ack.code, ConnectReturnCode::UnacceptableProtocolVersion);
    assert!(!ack.session_present);
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_mqtt_3_1_client_gets_version_connack_and_close() {
    let addr = start_broker(Settings::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = vec![0x10, 0x10, 0x00, 0x06];
    raw.extend_from_slice(b"MQIsdp");
    raw.extend_from_slice(&[0x03, 0x02, 0x00, 0x1E, 0x00, 0x02, b'c', b'1']);
    stream.write_all(&raw).await.unwrap();

    let mut client = Framed::new(stream, MqttCodec::default());
    match recv(&mut client).await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(ack.code, ConnectReturnCode::UnacceptableProtocolVersion);
            assert!(!ack.session_present);
        }
        other => panic!("expected CONNACK, got {other:?}"),
    }
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_anonymous_rejected_when_disabled() {
    let mut settings = Settings::default();
    settings.broker.allow_anonymous = false;
    let addr = start_broker(settings).await;

    let (mut client, ack) = connect(addr, connect_packet("anon")).await;
    assert_eq!(ack.code, ConnectReturnCode::NotAuthorized);
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let addr = start_broker(Settings::default()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(stream, MqttCodec::default());
    client.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_silent_socket_times_out() {
    let addr = start_broker(Settings::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
    )
    .await
    .expect("connection was not closed");
    assert_eq!(read.unwrap_or(0), 0);
}

#[tokio::test]
async fn test_will_published_when_socket_drops() {
    let addr = start_broker(Settings::default()).await;

    let (mut watcher, _) = connect(addr, connect_packet("watcher")).await;
    watcher
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![("status/#".to_string(), QoS::AtMostOnce)],
        }))
        .await
        .unwrap();
    assert!(matches!(recv(&mut watcher).await, Some(Packet::SubAck(_))));

    let mut with_will = connect_packet("A");
    with_will.will = Some(LastWill {
        topic: "status/A".to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtLeastOnce,
        retain: false,
    });
    let (client, _) = connect(addr, with_will).await;

    let mut stream = client.into_inner();
    stream.shutdown().await.unwrap();
    drop(stream);

    let Some(Packet::Publish(will)) = recv(&mut watcher).await else {
        panic!("expected will PUBLISH");
    };
    assert_eq!(will.topic, "status/A");
    assert_eq!(will.payload, Bytes::from_static(b"offline"));
}
