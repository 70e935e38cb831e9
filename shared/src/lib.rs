//! Shared envelope, payload and error types for the tunnel gateway.

pub mod envelope;
pub mod error;

pub use envelope::{
    decode_body, encode_body, Envelope, HeaderPairs, HttpRequestPayload, HttpResponsePayload,
    Kind, WsAckPayload, WsConnectPayload, WsDisconnectPayload, WsMessagePayload,
};
pub use error::{Error, Result};
