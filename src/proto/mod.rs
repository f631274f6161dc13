//! Wire message shapes and the sequencing codec.
//!
//! Three envelopes travel between the engine and its client: requests,
//! responses and events. Every envelope carries a `seq` that is unique and
//! increasing across everything a single [`MessageCodec`] produces, no matter
//! which thread asked for it.

pub mod framing;

use crate::error::Error;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Request envelope.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Response envelope.
///
/// The protocol allows responses with no `body` at all, so the body stays an
/// optional `serde_json::Value` rather than a typed shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(r) => r.serialize(serializer),
            Message::Response(r) => r.serialize(serializer),
            Message::Event(e) => e.serialize(serializer),
        }
    }
}

impl Message {
    pub fn seq(&self) -> i64 {
        match self {
            Message::Request(r) => r.seq,
            Message::Response(r) => r.seq,
            Message::Event(e) => e.seq,
        }
    }
}

fn require<'a>(obj: &'a serde_json::Map<String, Value>, field: &'static str) -> Result<&'a Value, Error> {
    obj.get(field).ok_or(Error::MissingField(field))
}

fn require_i64(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<i64, Error> {
    require(obj, field)?
        .as_i64()
        .ok_or(Error::MissingField(field))
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, Error> {
    require(obj, field)?
        .as_str()
        .ok_or(Error::MissingField(field))
}

/// Serializer/deserializer for wire messages plus the session-wide sequence
/// counter. A single codec instance is shared by everything that emits
/// messages; cloning the counter would break the global-ordering invariant.
#[derive(Debug)]
pub struct MessageCodec {
    next_seq: AtomicI64,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::with_start(1)
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec whose first issued sequence number is `start`.
    pub fn with_start(start: i64) -> Self {
        MessageCodec {
            next_seq: AtomicI64::new(start),
        }
    }

    /// Next sequence number. Strictly increasing and safe under concurrent
    /// callers: N callers issuing K numbers each observe N*K distinct values
    /// forming a contiguous range from the configured start.
    pub fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Parse raw bytes into a [`Message`].
    ///
    /// Fails with a ProtocolError-class [`Error`] when the payload is not
    /// well-formed JSON, lacks `seq` or `type`, declares an unknown type, or
    /// lacks the fields mandatory for its variant.
    pub fn parse(&self, bytes: &[u8]) -> Result<Message, Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        let obj = value.as_object().ok_or(Error::NotAnObject)?;

        let seq = require_i64(obj, "seq")?;
        let r#type = require_str(obj, "type")?;

        match r#type {
            "request" => Ok(Message::Request(Request {
                seq,
                r#type: "request",
                command: require_str(obj, "command")?.to_owned(),
                arguments: obj.get("arguments").cloned(),
            })),
            "response" => Ok(Message::Response(Response {
                seq,
                r#type: "response",
                request_seq: require_i64(obj, "request_seq")?,
                success: require(obj, "success")?
                    .as_bool()
                    .ok_or(Error::MissingField("success"))?,
                command: require_str(obj, "command")?.to_owned(),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
                body: obj.get("body").cloned(),
            })),
            "event" => Ok(Message::Event(Event {
                seq,
                r#type: "event",
                event: require_str(obj, "event")?.to_owned(),
                body: obj.get("body").cloned(),
            })),
            unknown => Err(Error::UnknownMessageType(unknown.to_owned())),
        }
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(message)?)
    }

    pub fn request(&self, command: impl Into<String>, arguments: Option<Value>) -> Request {
        Request {
            seq: self.next_seq(),
            r#type: "request",
            command: command.into(),
            arguments,
        }
    }

    pub fn response(&self, request: &Request, body: Option<Value>) -> Response {
        Response {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    /// Canonical failed response: human-readable `message` plus a structured
    /// `body.error` discriminator and the offending command under
    /// `body.details`.
    pub fn error_response(&self, request: &Request, error: &Error) -> Response {
        Response {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(error.to_string()),
            body: Some(serde_json::json!({
                "error": error.kind(),
                "details": { "command": request.command },
            })),
        }
    }

    pub fn event(&self, event: impl Into<String>, body: Option<Value>) -> Event {
        Event {
            seq: self.next_seq(),
            r#type: "event",
            event: event.into(),
            body,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn codec() -> MessageCodec {
        MessageCodec::new()
    }

    #[test]
    fn parse_request() {
        let raw = br#"{"seq": 3, "type": "request", "command": "continue", "arguments": {"threadId": 1}}"#;
        let msg = codec().parse(raw).unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.seq, 3);
        assert_eq!(req.command, "continue");
        assert_eq!(req.arguments, Some(json!({"threadId": 1})));
    }

    #[test]
    fn parse_rejects_missing_seq() {
        let err = codec()
            .parse(br#"{"type": "request", "command": "x"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "ProtocolError");
        assert!(matches!(err, Error::MissingField("seq")));
    }

    #[test]
    fn parse_rejects_missing_type() {
        let err = codec().parse(br#"{"seq": 1}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("type")));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = codec()
            .parse(br#"{"seq": 1, "type": "notify"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(t) if t == "notify"));
    }

    #[test]
    fn parse_rejects_incomplete_response() {
        for raw in [
            br#"{"seq": 1, "type": "response", "success": true, "command": "c"}"#.as_slice(),
            br#"{"seq": 1, "type": "response", "request_seq": 2, "command": "c"}"#.as_slice(),
            br#"{"seq": 1, "type": "response", "request_seq": 2, "success": true}"#.as_slice(),
        ] {
            let err = codec().parse(raw).unwrap_err();
            assert_eq!(err.kind(), "ProtocolError", "payload: {raw:?}");
        }
    }

    #[test]
    fn parse_rejects_event_without_name() {
        let err = codec().parse(br#"{"seq": 1, "type": "event"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("event")));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            codec().parse(b"not json at all"),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(codec().parse(b"[1, 2]"), Err(Error::NotAnObject)));
    }

    #[test]
    fn roundtrip_is_structurally_identical() {
        let raws = [
            json!({"seq": 1, "type": "request", "command": "launch", "arguments": {"program": "/bin/x"}}),
            json!({"seq": 2, "type": "response", "request_seq": 1, "success": false, "command": "launch", "message": "boom", "body": {"error": "OperationError"}}),
            json!({"seq": 3, "type": "event", "event": "stopped", "body": {"reason": "pause"}}),
            json!({"seq": 4, "type": "request", "command": "threads"}),
        ];
        let codec = codec();
        for raw in raws {
            let bytes = serde_json::to_vec(&raw).unwrap();
            let msg = codec.parse(&bytes).unwrap();
            let back: Value = serde_json::from_slice(&codec.encode(&msg).unwrap()).unwrap();
            assert_eq!(back, raw);
        }
    }

    #[test]
    fn error_response_carries_discriminator() {
        let codec = codec();
        let req = codec.request("evaluate", None);
        let resp = codec.error_response(&req, &Error::NoDebuggee);
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("no debuggee process"));
        let body = resp.body.unwrap();
        assert_eq!(body["error"], "OperationError");
        assert_eq!(body["details"]["command"], "evaluate");
    }

    #[test]
    fn concurrent_seq_numbers_are_contiguous() {
        use std::collections::HashSet;
        use std::sync::Arc;

        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;

        let codec = Arc::new(MessageCodec::with_start(10));
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let codec = codec.clone();
                std::thread::spawn(move || {
                    (0..PER_PRODUCER).map(|_| codec.next_seq()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "duplicate seq {seq}");
            }
        }
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(*seen.iter().min().unwrap(), 10);
        assert_eq!(
            *seen.iter().max().unwrap(),
            10 + (PRODUCERS * PER_PRODUCER) as i64 - 1
        );
    }
}
