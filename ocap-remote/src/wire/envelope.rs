//! Envelope and typed message bodies.

use ocap_core::{IncarnationId, PeerId};
use serde::{Deserialize, Serialize};

use super::WireError;

const METHOD_HELLO: &str = "hello";
const METHOD_DELIVER: &str = "deliver";
const METHOD_REPLY: &str = "reply";
const METHOD_ACK: &str = "ack";

/// Envelope carried in every frame.
///
/// `seq` is non-zero only for messages that travel through the outbound queue
/// (`deliver`, `reply`). `ack` is the highest sequence number the sender has
/// received from the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sequence number, 0 for unsequenced frames.
    pub seq: u64,
    /// Cumulative acknowledgement.
    pub ack: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Handshake sent by both sides when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's peer id.
    pub peer_id: PeerId,
    /// Sender's incarnation.
    pub incarnation: IncarnationId,
    /// Highest sequence the sender received from the recipient.
    pub ack: u64,
    /// Recipient incarnation `ack` refers to. The recipient ignores the ack
    /// unless this matches its own incarnation.
    pub acked_incarnation: Option<IncarnationId>,
}

/// An application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliver {
    /// Opaque payload.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Sender-local binding id when a reply is expected.
    #[serde(default)]
    pub reply_to: Option<u64>,
}

/// A reply to a [`Deliver`] that carried `reply_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Binding id copied from the original message.
    pub reply_to: u64,
    /// Opaque reply payload.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// Typed view of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Connection handshake.
    Hello(Hello),
    /// Application message.
    Deliver(Deliver),
    /// Reply to an application message.
    Reply(Reply),
    /// Ack-only frame.
    Ack,
}

impl MessageBody {
    /// Method name used on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Hello(_) => METHOD_HELLO,
            Self::Deliver(_) => METHOD_DELIVER,
            Self::Reply(_) => METHOD_REPLY,
            Self::Ack => METHOD_ACK,
        }
    }

    /// Whether this body is sequenced and retransmitted until acked.
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Self::Deliver(_) | Self::Reply(_))
    }

    /// Wrap the body in an envelope.
    pub fn to_envelope(&self, seq: u64, ack: u64) -> Result<Envelope, WireError> {
        let params = match self {
            Self::Hello(hello) => serde_json::to_value(hello)?,
            Self::Deliver(deliver) => serde_json::to_value(deliver)?,
            Self::Reply(reply) => serde_json::to_value(reply)?,
            Self::Ack => serde_json::Value::Null,
        };
        Ok(Envelope {
            seq,
            ack,
            method: self.method().to_string(),
            params,
        })
    }
}

impl Envelope {
    /// Decode the typed body.
    ///
    /// Returns `Ok(None)` for methods this layer does not handle.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if params do not match a known method.
    pub fn body(&self) -> Result<Option<MessageBody>, WireError> {
        let params = self.params.clone();
        let body = match self.method.as_str() {
            METHOD_HELLO => MessageBody::Hello(serde_json::from_value(params)?),
            METHOD_DELIVER => MessageBody::Deliver(serde_json::from_value(params)?),
            METHOD_REPLY => MessageBody::Reply(serde_json::from_value(params)?),
            METHOD_ACK => MessageBody::Ack,
            _ => return Ok(None),
        };
        Ok(Some(body))
    }
}

/// Byte buffers as hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_through_envelope() {
        let hello = Hello {
            peer_id: PeerId::from_seed(b"alice").expect("seed"),
            incarnation: IncarnationId::new(1, 2),
            ack: 4,
            acked_incarnation: Some(IncarnationId::new(3, 4)),
        };
        let envelope = MessageBody::Hello(hello.clone())
            .to_envelope(0, 0)
            .expect("envelope");
        assert_eq!(envelope.method, "hello");
        assert_eq!(
            envelope.body().expect("decode"),
            Some(MessageBody::Hello(hello))
        );
    }

    #[test]
    fn test_deliver_payload_is_hex() {
        let envelope = MessageBody::Deliver(Deliver {
            payload: vec![0xde, 0xad],
            reply_to: Some(9),
        })
        .to_envelope(3, 1)
        .expect("envelope");
        assert_eq!(envelope.params["payload"], "dead");
        assert_eq!(envelope.params["reply_to"], 9);
    }

    #[test]
    fn test_unknown_method_is_ignored() {
        let envelope = Envelope {
            seq: 5,
            ack: 0,
            method: "redeemURL".to_string(),
            params: serde_json::json!({ "url": "ocap:abc" }),
        };
        assert_eq!(envelope.body().expect("decode"), None);
    }

    #[test]
    fn test_mismatched_params_are_malformed() {
        let envelope = Envelope {
            seq: 1,
            ack: 0,
            method: "deliver".to_string(),
            params: serde_json::json!({ "payload": "zz" }),
        };
        assert!(matches!(envelope.body(), Err(WireError::Malformed { .. })));
    }

    #[test]
    fn test_only_deliver_and_reply_are_sequenced() {
        assert!(
            MessageBody::Reply(Reply {
                reply_to: 1,
                payload: vec![]
            })
            .is_sequenced()
        );
        assert!(!MessageBody::Ack.is_sequenced());
    }
}
