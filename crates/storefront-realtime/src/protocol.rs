//! Frame formats of the two push channels.
//!
//! Broadcast: Pusher-style topic frames. Subscriptions are
//! `{"event":"pusher:subscribe","data":{"channel":..}}` and inbound events
//! arrive as `{event, channel, data}` where `data` is often a JSON string.
//!
//! Authenticated: `{event, data}` frames over a connection that carried the
//! bearer token in its upgrade request.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    error::RealtimeError,
    push::{ChannelKind, PushFrame},
};

/// Result of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(PushFrame),
    /// Protocol-level frame to send straight back, such as a pong.
    Reply(String),
    Ignore,
}

pub trait WireProtocol: Send + Sync + 'static {
    fn kind(&self) -> ChannelKind;

    fn subscribe_frame(&self, channel: &str) -> String;

    fn unsubscribe_frame(&self, channel: &str) -> String;

    fn emit_frame(&self, event: &str, data: &Value) -> Result<String, RealtimeError>;

    fn decode(&self, text: &str) -> Inbound;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastProtocol;

impl WireProtocol for BroadcastProtocol {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Broadcast
    }

    fn subscribe_frame(&self, channel: &str) -> String {
        json!({"event": "pusher:subscribe", "data": {"channel": channel}}).to_string()
    }

    fn unsubscribe_frame(&self, channel: &str) -> String {
        json!({"event": "pusher:unsubscribe", "data": {"channel": channel}}).to_string()
    }

    fn emit_frame(&self, event: &str, _data: &Value) -> Result<String, RealtimeError> {
        Err(RealtimeError::Protocol(format!(
            "broadcast channel does not accept client event '{event}'"
        )))
    }

    fn decode(&self, text: &str) -> Inbound {
        let Some((event, channel, data)) = split_frame(text) else {
            return Inbound::Ignore;
        };
        match event.as_str() {
            "pusher:ping" => Inbound::Reply(json!({"event": "pusher:pong", "data": {}}).to_string()),
            "pusher:error" => {
                warn!(data = %data, "broadcast channel reported an error");
                Inbound::Ignore
            }
            other if other.starts_with("pusher:") || other.starts_with("pusher_internal:") => {
                debug!(event = other, "broadcast control frame");
                Inbound::Ignore
            }
            _ => Inbound::Frame(PushFrame {
                channel,
                event,
                data: unwrap_string_payload(data),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthenticatedProtocol;

impl WireProtocol for AuthenticatedProtocol {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Authenticated
    }

    fn subscribe_frame(&self, channel: &str) -> String {
        json!({"event": "subscribe", "data": {"channel": channel}}).to_string()
    }

    fn unsubscribe_frame(&self, channel: &str) -> String {
        json!({"event": "unsubscribe", "data": {"channel": channel}}).to_string()
    }

    fn emit_frame(&self, event: &str, data: &Value) -> Result<String, RealtimeError> {
        if event.is_empty() {
            return Err(RealtimeError::Protocol("event name must not be empty".to_owned()));
        }
        Ok(json!({"event": event, "data": data}).to_string())
    }

    fn decode(&self, text: &str) -> Inbound {
        match split_frame(text) {
            Some((event, _, _)) if event == "ping" => {
                Inbound::Reply(json!({"event": "pong", "data": {}}).to_string())
            }
            Some((event, channel, data)) => Inbound::Frame(PushFrame {
                channel,
                event,
                data: unwrap_string_payload(data),
            }),
            None => Inbound::Ignore,
        }
    }
}

fn split_frame(text: &str) -> Option<(String, Option<String>, Value)> {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "dropping undecodable push frame");
            return None;
        }
    };
    let event = value.get("event")?.as_str()?.to_owned();
    let channel = value
        .get("channel")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
    Some((event, channel, data))
}

/// Pusher double-encodes payloads; decode the inner string when it is JSON.
fn unwrap_string_payload(data: Value) -> Value {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_decodes_string_encoded_payloads() {
        let text = r#"{"event":"order.created","channel":"admin-orders","data":"{\"title\":\"New order\",\"type\":\"info\",\"data\":{\"id\":5}}"}"#;
        let Inbound::Frame(frame) = BroadcastProtocol.decode(text) else {
            panic!("expected event frame");
        };
        assert_eq!(frame.channel.as_deref(), Some("admin-orders"));
        assert_eq!(frame.event, "order.created");
        assert_eq!(frame.data["data"]["id"], 5);
    }

    #[test]
    fn broadcast_answers_pings_and_hides_control_frames() {
        assert_eq!(
            BroadcastProtocol.decode(r#"{"event":"pusher:ping","data":{}}"#),
            Inbound::Reply(r#"{"event":"pusher:pong","data":{}}"#.to_owned())
        );
        assert_eq!(
            BroadcastProtocol.decode(
                r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\"}"}"#
            ),
            Inbound::Ignore
        );
        assert_eq!(BroadcastProtocol.decode("not json"), Inbound::Ignore);
    }

    #[test]
    fn broadcast_subscribe_frame_names_the_topic() {
        let frame: Value =
            serde_json::from_str(&BroadcastProtocol.subscribe_frame("admin-orders")).expect("json");
        assert_eq!(
            frame,
            json!({"event": "pusher:subscribe", "data": {"channel": "admin-orders"}})
        );
        assert!(BroadcastProtocol.emit_frame("x", &Value::Null).is_err());
    }

    #[test]
    fn authenticated_frames_carry_event_and_data() {
        let text = AuthenticatedProtocol
            .emit_frame("orders:getMyOrders", &json!({"status": "open", "requestId": 3}))
            .expect("frame");
        let Inbound::Frame(frame) = AuthenticatedProtocol.decode(&text) else {
            panic!("expected frame");
        };
        assert_eq!(frame.event, "orders:getMyOrders");
        assert_eq!(frame.channel, None);
        assert_eq!(frame.data["requestId"], 3);
    }
}
