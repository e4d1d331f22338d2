//! Serialized outbound pipeline.
//!
//! A single worker pops one [`Payload`] at a time, hands it to the
//! [`Transport`], and reports the outcome to the payload's listeners. Message
//! N+1 is not attempted before message N's attempt has finished. Failed
//! payloads with retry enabled go back on the queue after an exponential
//! backoff until the policy's attempt ceiling turns the NAK permanent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use node_proto::Envelope;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::membership::Node;
use crate::transport::{Transport, TransportError};

/// Notified once per delivery attempt.
#[async_trait::async_trait]
pub trait DeliveryListener: Send + Sync {
    async fn receive_ack(&self, payload: &Payload, reply: &Envelope);
    async fn receive_nak(&self, payload: &Payload, failure: &DeliveryFailure);
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub error: TransportError,
    /// No further attempt will be made for this payload.
    pub permanent: bool,
}

/// One outbound envelope plus its delivery metadata.
#[derive(Clone)]
pub struct Payload {
    pub id: Uuid,
    pub envelope: Envelope,
    /// The node actually dialed; may be a relay rather than `envelope.to`.
    pub target: Node,
    pub listeners: Vec<Arc<dyn DeliveryListener>>,
    pub retry: bool,
    /// Attempts made so far.
    pub attempts: u32,
}

impl Payload {
    pub fn new(
        envelope: Envelope,
        target: Node,
        listeners: Vec<Arc<dyn DeliveryListener>>,
        retry: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope,
            target,
            listeners,
            retry,
            attempts: 0,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("id", &self.id)
            .field("action", &self.envelope.action)
            .field("to", &self.envelope.to)
            .field("target", &self.target.label)
            .field("retry", &self.retry)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Backoff schedule for failed payloads that allow retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Total attempts allowed per payload. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            max_attempts: Some(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempts` (1-based).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(30);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn allows_another(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Handle for enqueueing; cloning shares the same worker.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Payload>,
    enqueued: Arc<AtomicU64>,
}

impl SendQueue {
    /// Spawn the worker. It runs until `shutdown` flips.
    pub fn start(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            enqueued: Arc::new(AtomicU64::new(0)),
        };
        let worker = tokio::spawn(run_worker(queue.clone(), rx, transport, policy, shutdown));
        (queue, worker)
    }

    /// Returns false once the worker has stopped.
    pub fn enqueue(&self, payload: Payload) -> bool {
        debug!(?payload, "enqueue");
        match self.tx.send(payload) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Payloads accepted so far, retries included.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    queue: SendQueue,
    mut rx: mpsc::UnboundedReceiver<Payload>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };
        deliver(&queue, transport.as_ref(), &policy, payload, &shutdown).await;
    }
    debug!("send queue worker stopped");
}

async fn deliver(
    queue: &SendQueue,
    transport: &dyn Transport,
    policy: &RetryPolicy,
    mut payload: Payload,
    shutdown: &watch::Receiver<bool>,
) {
    payload.attempts += 1;
    let outcome = match transport.request(&payload.target, &payload.envelope).await {
        Ok(reply) if reply.is_ack() => Ok(reply),
        Ok(reply) => Err(TransportError::NotAck(reply.action)),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(reply) => {
            for listener in &payload.listeners {
                listener.receive_ack(&payload, &reply).await;
            }
        }
        Err(error) => {
            let permanent = !payload.retry || !policy.allows_another(payload.attempts);
            warn!(
                id = %payload.id,
                peer = %payload.target,
                attempts = payload.attempts,
                permanent,
                "delivery failed: {error}"
            );
            let failure = DeliveryFailure { error, permanent };
            for listener in &payload.listeners {
                listener.receive_nak(&payload, &failure).await;
            }
            if !permanent {
                let delay = policy.backoff(payload.attempts);
                requeue_later(queue.clone(), payload, delay, shutdown.clone());
            }
        }
    }
}

fn requeue_later(
    queue: SendQueue,
    payload: Payload,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if delay.is_zero() {
        queue.enqueue(payload);
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(delay) => {
                queue.enqueue(payload);
            }
        }
    });
}
