//! NIP-01 wire frames.
//!
//! Client to relay: EVENT, REQ, CLOSE.
//! Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE.

use nostr_events::{Filter, SignedEvent};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames the pool sends to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(SignedEvent),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }

    /// Subscription id carried by REQ and CLOSE frames.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Req {
                subscription_id, ..
            }
            | ClientMessage::Close { subscription_id } => Some(subscription_id),
            ClientMessage::Event(_) => None,
        }
    }
}

/// Frames a relay sends to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: SignedEvent,
    },

    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let kind = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match kind {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1, "subscription_id")?;
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or(MessageError::MissingField("event"))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: serde_json::from_value(event)?,
                })
            }
            "OK" => {
                let event_id = string_at(&frame, 1, "event_id")?;
                let accepted = frame
                    .get(2)
                    .ok_or(MessageError::MissingField("accepted"))?
                    .as_bool()
                    .ok_or_else(|| MessageError::InvalidFormat("accepted not a boolean".to_string()))?;
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message: optional_string_at(&frame, 3),
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
                message: optional_string_at(&frame, 2),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&frame, 1, "message")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
        };
        Ok(value.to_string())
    }
}

fn string_at(frame: &[Value], index: usize, field: &'static str) -> Result<String, MessageError> {
    frame
        .get(index)
        .ok_or(MessageError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

// Relays commonly omit the trailing message or send null.
fn optional_string_at(frame: &[Value], index: usize) -> String {
    frame
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_events::{SigningKey, UnsignedEvent};

    #[test]
    fn test_req_frame_layout() {
        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![Filter::new().kind(1), Filter::new().kind(7).limit(10)],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "sub1");
        assert_eq!(value[2]["kinds"], serde_json::json!([1]));
        assert_eq!(value[3]["limit"], serde_json::json!(10));
        assert_eq!(value.as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_close_frame() {
        let msg = ClientMessage::Close {
            subscription_id: "abc".to_string(),
        };
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","abc"]"#);
        assert_eq!(msg.subscription_id(), Some("abc"));
    }

    #[test]
    fn test_parse_ok_without_message() {
        let msg = RelayMessage::from_json(r#"["OK","abcd",false]"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Ok {
                event_id: "abcd".to_string(),
                accepted: false,
                message: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_event_frame() {
        let key = SigningKey::generate();
        let event = UnsignedEvent::new(key.public_key_hex(), 1, "hi")
            .sign(&key)
            .unwrap();
        let frame = RelayMessage::Event {
            subscription_id: "s".to_string(),
            event: event.clone(),
        }
        .to_json()
        .unwrap();

        match RelayMessage::from_json(&frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "s");
                assert_eq!(parsed, event);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            RelayMessage::from_json("{}"),
            Err(MessageError::InvalidFormat(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#),
            Err(MessageError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(MessageError::MissingField("subscription_id"))
        ));
    }
}
