//! NIP-01 wire frame encode/decode.
//!
//! The relay pool speaks raw JSON arrays over the WebSocket; this module
//! is the only place that knows the frame shapes, grounded in the
//! `["EVENT"|"OK"|"EOSE"|"NOTICE", ...]` parsing pattern used by a raw
//! relay client elsewhere in the pack.

use nostr::{ClientMessage, Event, Filter, JsonUtil, SubscriptionId};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// A parsed inbound relay-to-client message.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<Event> },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    Auth { challenge: String },
}

/// Parse one inbound text frame. Malformed frames are reported as
/// `CoreError::Decode` rather than silently dropped, so callers can log
/// the relay that sent garbage.
pub fn parse_relay_message(raw: &str) -> Result<RelayMessage> {
    let arr: Vec<Value> = serde_json::from_str(raw).map_err(|e| CoreError::Decode(e.to_string()))?;
    let cmd = arr
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Decode("empty frame".into()))?;

    match cmd {
        "EVENT" => {
            let sub_id = str_at(&arr, 1)?;
            let event_val = arr
                .get(2)
                .cloned()
                .ok_or_else(|| CoreError::Decode("EVENT missing payload".into()))?;
            let event: Event =
                serde_json::from_value(event_val).map_err(|e| CoreError::Decode(e.to_string()))?;
            Ok(RelayMessage::Event { sub_id, event: Box::new(event) })
        }
        "OK" => Ok(RelayMessage::Ok {
            event_id: str_at(&arr, 1)?,
            accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
            message: arr.get(3).and_then(Value::as_str).unwrap_or_default().to_string(),
        }),
        "EOSE" => Ok(RelayMessage::Eose { sub_id: str_at(&arr, 1)? }),
        "CLOSED" => Ok(RelayMessage::Closed {
            sub_id: str_at(&arr, 1)?,
            message: arr.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
        }),
        "NOTICE" => Ok(RelayMessage::Notice { message: str_at(&arr, 1)? }),
        "AUTH" => Ok(RelayMessage::Auth { challenge: str_at(&arr, 1)? }),
        other => Err(CoreError::Decode(format!("unknown frame kind: {other}"))),
    }
}

fn str_at(arr: &[Value], idx: usize) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::Decode(format!("missing string field at index {idx}")))
}

/// Serialize a `REQ id filter...` frame.
pub fn encode_req(sub_id: &SubscriptionId, filters: &[Filter]) -> String {
    ClientMessage::req(sub_id.clone(), filters.to_vec()).as_json()
}

/// Serialize a `CLOSE id` frame.
pub fn encode_close(sub_id: &SubscriptionId) -> String {
    ClientMessage::close(sub_id.clone()).as_json()
}

/// Serialize an `EVENT event` publish frame.
pub fn encode_event(event: &Event) -> String {
    ClientMessage::event(event.clone()).as_json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eose() {
        let msg = parse_relay_message(r#"["EOSE","sub1"]"#).unwrap();
        matches!(msg, RelayMessage::Eose { sub_id } if sub_id == "sub1");
    }

    #[test]
    fn parses_notice() {
        let msg = parse_relay_message(r#"["NOTICE","rate limited"]"#).unwrap();
        match msg {
            RelayMessage::Notice { message } => assert_eq!(message, "rate limited"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_relay_message(r#"["WAT"]"#).is_err());
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_relay_message("not json").is_err());
    }
}
