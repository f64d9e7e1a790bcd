use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::packet::{LastWill, Publish, QoS};

/// An application message as the broker routes it.
///
/// This is the payload of a PUBLISH stripped of its per-hop fields (packet
/// id and DUP), so it can be fanned out, parked in `outstanding_in` while a
/// QoS 2 handshake completes, or kept in the retained index.
///
/// Retained messages are persisted as JSON through the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Builds the PUBLISH for one delivery of this message.
    pub fn to_publish(&self, qos: QoS, packet_id: Option<u16>, retain: bool, dup: bool) -> Publish {
        Publish {
            dup,
            qos,
            retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl From<LastWill> for Message {
    fn from(will: LastWill) -> Self {
        Self {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
        }
    }
}

mod qos_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use crate::packet::QoS;

    pub fn serialize<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QoS, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        QoS::try_from(raw).map_err(D::Error::custom)
    }
}
