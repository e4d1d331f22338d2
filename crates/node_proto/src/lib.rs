//! Wire types for the hopmesh line protocol.
//!
//! Every TCP connection carries exactly one request line and one reply line:
//! a UTF-8 JSON [`Envelope`] terminated by `\n`. The `payload` is always a JSON
//! object; its shape depends on [`Action`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound for a single envelope line, newline included.
pub const MAX_LINE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a {expected} envelope, got {actual}")]
    WrongAction { expected: Action, actual: Action },
    #[error("empty line")]
    Empty,
}

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Opaque application data.
    Generic,
    /// Discovery: the sender's listening port and known-node table.
    Hello,
    /// Delivery acknowledgement, optionally carrying the sender's public key.
    Ack,
    /// KEM encapsulation token establishing a pairwise key.
    Kex,
    /// Application data encrypted under the pairwise key.
    Sealed,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::Hello => write!(f, "hello"),
            Self::Ack => write!(f, "ack"),
            Self::Kex => write!(f, "kex"),
            Self::Sealed => write!(f, "sealed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub action: Action,
    pub payload: Map<String, Value>,
}

/// One row of a discovery table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(default)]
    pub pubkey: String,
    pub latency: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub nodes: Vec<NodeReport>,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexPayload {
    pub token: String,
}

/// Body of a [`Action::Sealed`] envelope: `base64(ciphertext ‖ nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub sealed: String,
}

impl Envelope {
    pub fn generic(from: &str, to: &str, payload: Map<String, Value>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: Action::Generic,
            payload,
        }
    }

    pub fn hello(from: &str, to: &str, hello: &HelloPayload) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: Action::Hello,
            payload: to_object(hello),
        }
    }

    pub fn kex(from: &str, to: &str, token: String) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: Action::Kex,
            payload: to_object(&KexPayload { token }),
        }
    }

    pub fn sealed(from: &str, to: &str, sealed: String) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: Action::Sealed,
            payload: to_object(&SealedPayload { sealed }),
        }
    }

    /// Build the ACK reply for `received`, with `from`/`to` swapped.
    pub fn ack_for(received: &Envelope, pubkey: Option<String>) -> Self {
        Self {
            from: received.to.clone(),
            to: received.from.clone(),
            action: Action::Ack,
            payload: to_object(&AckPayload { pubkey }),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.action == Action::Ack
    }

    pub fn hello_payload(&self) -> Result<HelloPayload> {
        self.typed_payload(Action::Hello)
    }

    pub fn ack_payload(&self) -> Result<AckPayload> {
        self.typed_payload(Action::Ack)
    }

    pub fn kex_payload(&self) -> Result<KexPayload> {
        self.typed_payload(Action::Kex)
    }

    pub fn sealed_payload(&self) -> Result<SealedPayload> {
        self.typed_payload(Action::Sealed)
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(&self, expected: Action) -> Result<T> {
        if self.action != expected {
            return Err(ProtoError::WrongAction {
                expected,
                actual: self.action,
            });
        }
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Serialize an envelope as one newline-terminated line.
pub fn encode_line(envelope: &Envelope) -> Result<String> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (trailing `\r\n` / `\n` tolerated) into an envelope.
pub fn decode_line(line: &str) -> Result<Envelope> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(ProtoError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}
