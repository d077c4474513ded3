//! Browser WebSocket protocol.
//!
//! Every frame in both directions is a JSON envelope:
//! `{"type": <string>, "payload": <any>, "timestamp": <int64 ms>}`.

use crate::error::{ProxyError, ProxyResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Subscription filter as sent by clients. Absent fields are wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, rename = "dataTypes", skip_serializing_if = "Option::is_none")]
    pub data_types: Option<Vec<String>>,
}

/// Parsed client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping,
    Subscribe(FilterRequest),
    Unsubscribe { filter_id: Option<String> },
    GetStats,
}

impl ClientMessage {
    /// Parse a raw text frame into a client message.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| ProxyError::Protocol(format!("invalid envelope: {e}")))?;
        match envelope.msg_type.as_str() {
            "ping" => Ok(Self::Ping),
            "subscribe" => {
                let filter: FilterRequest = serde_json::from_value(envelope.payload)
                    .map_err(|e| ProxyError::Protocol(format!("invalid filter: {e}")))?;
                Ok(Self::Subscribe(filter))
            }
            "unsubscribe" => {
                let filter_id = envelope
                    .payload
                    .get("filterId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                Ok(Self::Unsubscribe { filter_id })
            }
            "getStats" => Ok(Self::GetStats),
            other => Err(ProxyError::Protocol(format!("unknown message type: {other}"))),
        }
    }
}

/// `welcome` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "serverTime")]
    pub server_time: i64,
    pub version: String,
}

/// `subscribed` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribedPayload {
    #[serde(rename = "filterId")]
    pub filter_id: String,
    pub filter: FilterRequest,
}

/// `error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let msg = ClientMessage::parse(r#"{"type":"ping","payload":null,"timestamp":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_parse_subscribe() {
        let raw = r#"{"type":"subscribe","payload":{"symbols":["BTC/USDT"],"dataTypes":["trade"]},"timestamp":1}"#;
        let ClientMessage::Subscribe(filter) = ClientMessage::parse(raw).unwrap() else {
            panic!("expected subscribe");
        };
        assert_eq!(filter.symbols, Some(vec!["BTC/USDT".to_string()]));
        assert_eq!(filter.data_types, Some(vec!["trade".to_string()]));
        assert_eq!(filter.exchange, None);
    }

    #[test]
    fn test_parse_unsubscribe_all() {
        let msg =
            ClientMessage::parse(r#"{"type":"unsubscribe","payload":{},"timestamp":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe { filter_id: None });
    }

    #[test]
    fn test_parse_unsubscribe_specific() {
        let raw = r#"{"type":"unsubscribe","payload":{"filterId":"abc"},"timestamp":1}"#;
        assert_eq!(
            ClientMessage::parse(raw).unwrap(),
            ClientMessage::Unsubscribe {
                filter_id: Some("abc".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"order","payload":{},"timestamp":1}"#).is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::new("pong", Value::Null);
        let parsed: Envelope = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(parsed.msg_type, "pong");
    }
}
