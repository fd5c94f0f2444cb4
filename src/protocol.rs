//! Browser wire protocol.
//!
//! One JSON object per WebSocket text message, discriminated by `kind`:
//!
//! - client → server: `connect`, `input`, `disconnect`
//! - server → client: `data`, `status`, `error`
//!
//! Client envelopes are decoded into the closed [`ClientMessage`] type and
//! validated field by field; nothing dynamically shaped leaks past
//! [`decode`]. Older dashboards send `type` instead of `kind` and nest the
//! connect fields under `data`; both shapes are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::driver::{Credentials, Target};

/// Interrupt (Ctrl-C).
pub const ETX: char = '\u{3}';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidJson(String),

    #[error("Invalid message format: envelope must be a JSON object")]
    NotAnObject,

    #[error("Invalid message format: missing kind")]
    MissingKind,

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("message kind not accepted from clients: {0}")]
    UnsupportedKind(String),

    #[error("{kind} requires field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind}.{field} {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: &'static str,
    },

    #[error("Missing required connection parameters: password and/or privateKey")]
    MissingCredentials,
}

/// A validated client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Connect {
        session_id: Option<String>,
        target: Target,
    },
    Input {
        session_id: Option<String>,
        payload: String,
    },
    Disconnect {
        session_id: String,
    },
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Data { session_id: String, payload: String },

    #[serde(rename_all = "camelCase")]
    Status { session_id: String, message: String },

    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
}

impl ServerMessage {
    pub fn data(session_id: &str, payload: String) -> Self {
        Self::Data {
            session_id: session_id.to_owned(),
            payload,
        }
    }

    pub fn status(session_id: &str, message: &str) -> Self {
        Self::Status {
            session_id: session_id.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Remote stderr, relayed verbatim in `payload`.
    pub fn stderr(session_id: &str, payload: String) -> Self {
        Self::Error {
            session_id: Some(session_id.to_owned()),
            code: None,
            message: None,
            payload: Some(payload),
        }
    }

    /// A recoverable failure description.
    pub fn error(session_id: Option<&str>, code: &str, message: String) -> Self {
        Self::Error {
            session_id: session_id.map(str::to_owned),
            code: Some(code.to_owned()),
            message: Some(message),
            payload: None,
        }
    }
}

/// Serialize an outbound message to its wire text.
pub fn encode(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Parse and validate one inbound wire message.
pub fn decode(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let envelope = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let kind = envelope
        .get("kind")
        .or_else(|| envelope.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?;

    match kind {
        "connect" => decode_connect(envelope),
        "input" => {
            let payload = match envelope.get("payload") {
                Some(Value::String(s)) => s.clone(),
                Some(_) => {
                    return Err(ProtocolError::InvalidField {
                        kind: "input",
                        field: "payload",
                        reason: "must be a string",
                    })
                }
                None => {
                    return Err(ProtocolError::MissingField {
                        kind: "input",
                        field: "payload",
                    })
                }
            };
            Ok(ClientMessage::Input {
                session_id: optional_string(envelope, "input", "sessionId")?,
                payload,
            })
        }
        "disconnect" => Ok(ClientMessage::Disconnect {
            session_id: required_string(envelope, "disconnect", "sessionId")?,
        }),
        "data" | "status" | "error" => Err(ProtocolError::UnsupportedKind(kind.to_owned())),
        other => Err(ProtocolError::UnknownKind(other.to_owned())),
    }
}

fn decode_connect(envelope: &Map<String, Value>) -> Result<ClientMessage, ProtocolError> {
    const KIND: &str = "connect";

    let fields = match envelope.get("data") {
        Some(Value::Object(inner)) => inner,
        _ => envelope,
    };

    let session_id = match optional_string(envelope, KIND, "sessionId")? {
        Some(id) => Some(id),
        None => optional_string(fields, KIND, "sessionId")?,
    };

    Ok(ClientMessage::Connect {
        session_id,
        target: decode_target(fields, KIND)?,
    })
}

/// Default command for [`decode_exec`].
pub const DEFAULT_EXEC_COMMAND: &str = "whoami";

/// Validate a one-shot exec request body: the `connect` fields plus an
/// optional `command`.
pub fn decode_exec(body: &Value) -> Result<(Target, String), ProtocolError> {
    const KIND: &str = "exec";

    let fields = body.as_object().ok_or(ProtocolError::NotAnObject)?;
    let target = decode_target(fields, KIND)?;
    let command = optional_string(fields, KIND, "command")?
        .unwrap_or_else(|| DEFAULT_EXEC_COMMAND.to_owned());
    Ok((target, command))
}

fn decode_target(fields: &Map<String, Value>, kind: &'static str) -> Result<Target, ProtocolError> {
    let host = required_string(fields, kind, "host")?;
    let port = match fields.get("port") {
        None | Some(Value::Null) => {
            return Err(ProtocolError::MissingField {
                kind,
                field: "port",
            })
        }
        Some(value) => value
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or(ProtocolError::InvalidField {
                kind,
                field: "port",
                reason: "must be an integer between 1 and 65535",
            })?,
    };
    let username = required_string(fields, kind, "username")?;

    let credentials = Credentials {
        password: optional_string(fields, kind, "password")?,
        private_key: optional_string(fields, kind, "privateKey")?,
        passphrase: optional_string(fields, kind, "passphrase")?,
    };
    if credentials.is_empty() {
        return Err(ProtocolError::MissingCredentials);
    }

    Ok(Target {
        host,
        port,
        username,
        credentials,
    })
}

/// Absent, `null` and `""` all read as `None`.
fn optional_string(
    fields: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::InvalidField {
            kind,
            field,
            reason: "must be a string",
        }),
    }
}

fn required_string(
    fields: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    optional_string(fields, kind, field)?.ok_or(ProtocolError::MissingField { kind, field })
}

/// Incremental UTF-8 decoder for one remote output stream.
///
/// The transport chunks bytes arbitrarily, so a multi-byte character may be
/// split across two chunks. The incomplete tail is held back until the next
/// chunk completes it; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct TextDecoder {
    carry: Vec<u8>,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}
