//! Per-type decoders for the MQTT 3.1.1 variable header and payload.

use bytes::{Buf, Bytes};

use super::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketType, PROTOCOL_LEVEL_3_1_1,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe,
};
use crate::broker::topic::valid_topic_name;
use crate::utils::ProtocolError;

/// Decode the remaining length field that follows the fixed header byte.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded length
/// and the number of bytes the field occupied.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in buf.iter().enumerate() {
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i == 3 {
            return Err(ProtocolError::InvalidRemainingLength);
        }
        multiplier *= 128;
    }

    Ok(None)
}

/// Decode a complete packet body given its fixed header byte.
pub fn decode_packet(header: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    let packet_type = PacketType::try_from(header >> 4)?;
    check_header_flags(packet_type, header & 0x0F)?;

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut body)?),
        PacketType::ConnAck => Packet::ConnAck(decode_connack(&mut body)?),
        PacketType::Publish => Packet::Publish(decode_publish(header, &mut body)?),
        PacketType::PubAck => Packet::PubAck(read_u16(&mut body)?),
        PacketType::PubRec => Packet::PubRec(read_u16(&mut body)?),
        PacketType::PubRel => Packet::PubRel(read_u16(&mut body)?),
        PacketType::PubComp => Packet::PubComp(read_u16(&mut body)?),
        PacketType::Subscribe => Packet::Subscribe(decode_subscribe(&mut body)?),
        PacketType::SubAck => Packet::SubAck(decode_suback(&mut body)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(&mut body)?),
        PacketType::UnsubAck => Packet::UnsubAck(read_u16(&mut body)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    // An unsupported protocol level leaves the rest of CONNECT unparsed on purpose.
    let unparsed_connect = matches!(
        &packet,
        Packet::Connect(c) if c.protocol_level != PROTOCOL_LEVEL_3_1_1
    );
    if body.has_remaining() && !unparsed_connect {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} trailing bytes in {packet_type}",
            body.remaining()
        )));
    }

    Ok(packet)
}

fn check_header_flags(packet_type: PacketType, flags: u8) -> Result<(), ProtocolError> {
    let expected = match packet_type {
        PacketType::Publish => return Ok(()),
        PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
        _ => 0,
    };
    if flags != expected {
        return Err(ProtocolError::InvalidHeaderFlags {
            packet_type: packet_type as u8,
            flags,
        });
    }
    Ok(())
}

fn decode_connect(buf: &mut Bytes) -> Result<Connect, ProtocolError> {
    let protocol_name = read_string(buf)?;
    let protocol_level = read_u8(buf)?;

    // Other levels (e.g. "MQIsdp"/3) go to the engine, which answers CONNACK 1.
    if protocol_level != PROTOCOL_LEVEL_3_1_1 {
        return Ok(Connect {
            protocol_name,
            protocol_level,
            ..Connect::default()
        });
    }
    if protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }

    let flags = read_u8(buf)?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    if password_flag && !username_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    let keep_alive = read_u16(buf)?;
    let client_id = read_string(buf)?;

    let will = if will_flag {
        let topic = read_string(buf)?;
        if !valid_topic_name(&topic) {
            return Err(ProtocolError::InvalidTopic(topic));
        }
        let payload = read_binary(buf)?;
        Some(LastWill {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag { Some(read_string(buf)?) } else { None };
    let password = if password_flag { Some(read_binary(buf)?) } else { None };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connack(buf: &mut Bytes) -> Result<ConnAck, ProtocolError> {
    let flags = read_u8(buf)?;
    if flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid CONNACK flags: {flags:#04x}"
        )));
    }
    let code = ConnectReturnCode::try_from(read_u8(buf)?)?;
    Ok(ConnAck {
        session_present: flags & 0x01 != 0,
        code,
    })
}

fn decode_publish(header: u8, buf: &mut Bytes) -> Result<Publish, ProtocolError> {
    let dup = header & 0x08 != 0;
    let qos = QoS::try_from((header >> 1) & 0x03)?;
    let retain = header & 0x01 != 0;

    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::InvalidHeaderFlags {
            packet_type: PacketType::Publish as u8,
            flags: header & 0x0F,
        });
    }

    let topic = read_string(buf)?;
    if !valid_topic_name(&topic) {
        return Err(ProtocolError::InvalidTopic(topic));
    }

    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_packet_id(buf)?)
    };

    let payload = buf.split_to(buf.remaining());

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    })
}

fn decode_subscribe(buf: &mut Bytes) -> Result<Subscribe, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let mut filters = Vec::new();

    while buf.has_remaining() {
        let filter = read_string(buf)?;
        let requested = read_u8(buf)?;
        if requested & 0xFC != 0 {
            return Err(ProtocolError::InvalidQoS(requested));
        }
        filters.push((filter, QoS::try_from(requested)?));
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE without topic filters".to_string(),
        ));
    }

    Ok(Subscribe { packet_id, filters })
}

fn decode_suback(buf: &mut Bytes) -> Result<SubAck, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let mut return_codes = Vec::with_capacity(buf.remaining());

    while buf.has_remaining() {
        let code = match buf.get_u8() {
            SubscribeReturnCode::FAILURE => SubscribeReturnCode::Failure,
            other => SubscribeReturnCode::Success(QoS::try_from(other)?),
        };
        return_codes.push(code);
    }

    Ok(SubAck {
        packet_id,
        return_codes,
    })
}

fn decode_unsubscribe(buf: &mut Bytes) -> Result<Unsubscribe, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let mut filters = Vec::new();

    while buf.has_remaining() {
        filters.push(read_string(buf)?);
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE without topic filters".to_string(),
        ));
    }

    Ok(Unsubscribe { packet_id, filters })
}

fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn read_packet_id(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    match read_u16(buf)? {
        0 => Err(ProtocolError::MalformedPacket(
            "Packet identifier must be non-zero".to_string(),
        )),
        id => Ok(id),
    }
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = read_binary(buf)?;
    let s = String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(ProtocolError::InvalidUtf8);
    }
    Ok(s)
}

fn truncated() -> ProtocolError {
    ProtocolError::MalformedPacket("Packet truncated".to_string())
}
