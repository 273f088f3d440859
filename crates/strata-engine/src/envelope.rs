//! The invalidation broadcast wire format.
//!
//! One channel carries everything: heartbeats, membership, eviction and
//! entity-change fan-out. Every payload is a JSON [`Envelope`] naming its
//! sender; the action strings are part of the wire contract and must not
//! change between versions.

use serde::{Deserialize, Serialize};
use serde_json::Error;
use uuid::Uuid;

use strata_core::EntityRef;

/// Broadcast message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Message {
    /// Periodic membership heartbeat.
    #[serde(rename = "keep-alive")]
    KeepAlive { started_at_ms: i64 },

    /// Explicit instance shutdown.
    #[serde(rename = "shutdown")]
    Shutdown,

    /// A peer started tracking an entity kind; everyone should.
    #[serde(rename = "subscribe-db-event")]
    SubscribeEvent { kind: String },

    /// Drop these keys from local caches.
    #[serde(rename = "evict-local-cache")]
    Evict { keys: Vec<String> },

    /// A tracked entity was created or updated.
    #[serde(rename = "upsert")]
    Upsert { entity: EntityRef },

    /// A tracked entity was deleted.
    #[serde(rename = "delete")]
    Delete { entity: EntityRef },
}

/// A broadcast payload: the message plus its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Uuid,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: Uuid, message: Message) -> Self {
        Self { from, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_are_wire_stable() {
        let from = Uuid::new_v4();
        let cases = [
            (Message::KeepAlive { started_at_ms: 5 }, "keep-alive"),
            (Message::Shutdown, "shutdown"),
            (Message::SubscribeEvent { kind: "product".into() }, "subscribe-db-event"),
            (Message::Evict { keys: vec!["k".into()] }, "evict-local-cache"),
            (Message::Upsert { entity: EntityRef::new("product", "1") }, "upsert"),
            (Message::Delete { entity: EntityRef::kind_only("product") }, "delete"),
        ];
        for (message, action) in cases {
            let envelope = Envelope::new(from, message);
            let json: serde_json::Value =
                serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
            assert_eq!(json["from"], serde_json::json!(from.to_string()));
            assert_eq!(json["message"]["action"], serde_json::json!(action));
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(
            Uuid::new_v4(),
            Message::Evict { keys: vec!["a".into(), "b".into()] },
        );
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_payloads_fail_to_decode() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"from":"x","message":{"action":"??"}}"#).is_err());
    }
}
