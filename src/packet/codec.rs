//! `tokio_util` framing for MQTT packets.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::{MAX_REMAINING_LENGTH, Packet, decode_packet, decode_remaining_length};
use crate::utils::{Error, ProtocolError};

/// Codec for use with `FramedRead`/`FramedWrite` over a TCP stream.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let Some((remaining, length_bytes)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if remaining > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: remaining,
                limit: self.max_packet_size,
            }
            .into());
        }

        let frame_len = 1 + length_bytes + remaining;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len).freeze();
        let header = frame[0];
        frame.advance(1 + length_bytes);

        let packet = decode_packet(header, frame)?;
        debug!("read {packet}");
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug!("write {item}");
        item.encode(dst)?;
        Ok(())
    }
}
