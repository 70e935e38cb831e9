//! The Envelope: the unit exchanged on every tunnel queue (§3, §6).
//!
//! Wire shape is fixed by the external interface:
//! `{ "type": "<kind>", "identifier": "<id>", "payload": { ... } }`.
//! `payload` is an untyped JSON value here — its shape is determined by
//! `kind` and decoded into one of the typed payload structs below by
//! whichever side (ingress or control session) understands that kind.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Envelope kind. Serializes to the exact wire tokens from §6, which take
/// precedence over the `ws-*` prose names used elsewhere in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Connect,
    Disconnect,
    Message,
    Ack,
}

/// The tagged record exchanged on every queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "identifier")]
    pub id: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: Kind, id: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::ProtocolViolation(format!("encoding payload: {e}")))?;
        Ok(Self {
            kind,
            id: id.into(),
            payload,
        })
    }

    /// Decode `self.payload` into a typed payload. Returns `ProtocolViolation`
    /// on shape mismatch rather than panicking — malformed envelopes are
    /// logged and dropped by callers (§7), never a crash.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::ProtocolViolation(format!("decoding payload: {e}")))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::ProtocolViolation(format!("invalid envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::ProtocolViolation(format!("encoding envelope: {e}")))
    }
}

/// Ordered header pairs. Duplicates and ordering survive the round-trip
/// (invariant 4) because this is a plain `Vec`, never a map.
pub type HeaderPairs = Vec<(String, String)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub method: String,
    pub path: String,
    pub headers: HeaderPairs,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub status: u16,
    pub headers: HeaderPairs,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConnectPayload {
    pub path: String,
    pub headers: HeaderPairs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessagePayload {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsDisconnectPayload {
    pub close_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WsAckPayload {}

/// Base64-encode raw bytes for a binary-safe envelope field (invariant 5).
pub fn encode_body(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 envelope field back to raw bytes.
pub fn decode_body(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| Error::ProtocolViolation(format!("invalid base64 body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip_empty_and_arbitrary() {
        for len in [0usize, 1, 17, 255, 4096] {
            let bytes: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let encoded = encode_body(&bytes);
            let decoded = decode_body(&encoded).unwrap();
            assert_eq!(bytes, decoded);
        }
    }

    #[test]
    fn envelope_wire_shape_matches_schema() {
        let payload = HttpRequestPayload {
            method: "GET".into(),
            path: "/hello?q=1".into(),
            headers: vec![("host".into(), "abc.example.test".into())],
            body: String::new(),
        };
        let env = Envelope::new(Kind::Request, "req-1", payload).unwrap();
        let json = env.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["identifier"], "req-1");
        assert_eq!(value["payload"]["method"], "GET");
    }

    #[test]
    fn duplicate_headers_survive_round_trip() {
        let payload = HttpRequestPayload {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![
                ("x-foo".into(), "1".into()),
                ("x-foo".into(), "2".into()),
            ],
            body: String::new(),
        };
        let env = Envelope::new(Kind::Request, "id", payload).unwrap();
        let decoded: HttpRequestPayload = env.decode().unwrap();
        assert_eq!(
            decoded.headers,
            vec![
                ("x-foo".to_string(), "1".to_string()),
                ("x-foo".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_payload_is_protocol_violation_not_panic() {
        let env = Envelope {
            kind: Kind::Request,
            id: "id".into(),
            payload: Value::String("not an object".into()),
        };
        let err = env.decode::<HttpRequestPayload>().unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
