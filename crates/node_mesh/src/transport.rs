//! Transport abstraction for one request/reply exchange with a next hop.
//!
//! The baseline is connection-per-message TCP (`tcp_transport`); anything that
//! can deliver one envelope and hand back one reply can stand in for it
//! without touching routing or discovery.

use std::collections::VecDeque;
use std::time::Duration;

use node_proto::{Action, Envelope, ProtoError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::membership::Node;

/// Why a delivery attempt failed. Every variant is treated as a NAK.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before a reply line")]
    Closed,
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] ProtoError),
    #[error("expected an ack reply, got {0}")]
    NotAck(Action),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `target` and return its single reply envelope.
    async fn request(&self, target: &Node, envelope: &Envelope) -> Result<Envelope, TransportError>;
}

/// Test transport: records requests and replays canned replies.
///
/// With `acking()` every request is answered with an ack; otherwise replies
/// are popped from the queue and an empty queue fails the request.
#[doc(hidden)]
pub struct MockTransport {
    auto_ack: bool,
    responses: Mutex<VecDeque<Envelope>>,
    sent: Mutex<Vec<(Node, Envelope)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            auto_ack: false,
            responses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn acking() -> Self {
        Self {
            auto_ack: true,
            ..Self::new()
        }
    }

    pub fn push_response(&self, env: Envelope) {
        self.responses.lock().push_back(env);
    }

    pub fn take_sent(&self) -> Vec<(Node, Envelope)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        target: &Node,
        envelope: &Envelope,
    ) -> Result<Envelope, TransportError> {
        self.sent.lock().push((target.clone(), envelope.clone()));
        if self.auto_ack {
            return Ok(Envelope::ack_for(envelope, None));
        }
        self.responses
            .lock()
            .pop_front()
            .ok_or(TransportError::Closed)
    }
}
