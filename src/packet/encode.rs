//! Packet encoders. Each packet writes its body into a scratch buffer first so
//! the remaining length is known before the fixed header goes out.

use bytes::{BufMut, Bytes, BytesMut};

use super::{MAX_REMAINING_LENGTH, Packet, PacketType, QoS};
use crate::utils::ProtocolError;

impl Packet {
    /// Append the wire form of this packet to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let mut flags = 0u8;

        match self {
            Packet::Connect(c) => {
                write_string(&mut body, &c.protocol_name)?;
                body.put_u8(c.protocol_level);

                let mut connect_flags = 0u8;
                if c.clean_session {
                    connect_flags |= 0x02;
                }
                if let Some(will) = &c.will {
                    connect_flags |= 0x04 | ((will.qos as u8) << 3);
                    if will.retain {
                        connect_flags |= 0x20;
                    }
                }
                if c.password.is_some() {
                    connect_flags |= 0x40;
                }
                if c.username.is_some() {
                    connect_flags |= 0x80;
                }
                body.put_u8(connect_flags);
                body.put_u16(c.keep_alive);
                write_string(&mut body, &c.client_id)?;

                if let Some(will) = &c.will {
                    write_string(&mut body, &will.topic)?;
                    write_binary(&mut body, &will.payload)?;
                }
                if let Some(username) = &c.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    write_binary(&mut body, password)?;
                }
            }
            Packet::ConnAck(a) => {
                body.put_u8(a.session_present as u8);
                body.put_u8(a.code as u8);
            }
            Packet::Publish(p) => {
                flags = ((p.dup as u8) << 3) | ((p.qos as u8) << 1) | p.retain as u8;
                write_string(&mut body, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (_, Some(id)) => body.put_u16(id),
                    (_, None) => {
                        return Err(ProtocolError::MalformedPacket(
                            "PUBLISH above QoS 0 needs a packet identifier".to_string(),
                        ));
                    }
                }
                body.put_slice(&p.payload);
            }
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => body.put_u16(*id),
            Packet::PubRel(id) => {
                flags = 0b0010;
                body.put_u16(*id);
            }
            Packet::Subscribe(s) => {
                flags = 0b0010;
                body.put_u16(s.packet_id);
                for (filter, qos) in &s.filters {
                    write_string(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
            }
            Packet::SubAck(s) => {
                body.put_u16(s.packet_id);
                for code in &s.return_codes {
                    body.put_u8(code.as_byte());
                }
            }
            Packet::Unsubscribe(u) => {
                flags = 0b0010;
                body.put_u16(u.packet_id);
                for filter in &u.filters {
                    write_string(&mut body, filter)?;
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }

        write_fixed_header(dst, self.packet_type(), flags, body.len())?;
        dst.put_slice(&body);
        Ok(())
    }
}

fn write_fixed_header(
    dst: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining: usize,
) -> Result<(), ProtocolError> {
    if remaining > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: remaining,
            limit: MAX_REMAINING_LENGTH,
        });
    }
    dst.reserve(5 + remaining);
    dst.put_u8(((packet_type as u8) << 4) | flags);
    write_remaining_length(dst, remaining);
    Ok(())
}

fn write_remaining_length(dst: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn write_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    write_binary(dst, &Bytes::copy_from_slice(s.as_bytes()))
}

fn write_binary(dst: &mut BytesMut, data: &Bytes) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| {
        ProtocolError::MalformedPacket(format!("Field of {} bytes exceeds 65535", data.len()))
    })?;
    dst.put_u16(len);
    dst.put_slice(data);
    Ok(())
}
