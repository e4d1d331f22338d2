//! Discovery heartbeat and ACK/NAK-driven liveness.
//!
//! Every round stamps the discovery time in the node map and sends each
//! direct neighbor a hello carrying this node's known-node table (split
//! horizon applied) and listening port. Hellos are fire-and-forget: the
//! [`AckTracker`] turns the outcome into liveness.

use std::sync::Arc;
use std::time::Duration;

use node_proto::{Action, Envelope, HelloPayload};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::listeners::MeshLog;
use crate::membership::now_ms;
use crate::node_map::SharedNodeMap;
use crate::send_queue::{DeliveryFailure, DeliveryListener, Payload, SendQueue};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Applies delivery outcomes to the node map.
///
/// An ACK marks the dialed node alive (hellos re-measure latency) and
/// stores any public key it carries. A NAK marks the dialed node dead.
pub struct AckTracker {
    node_map: SharedNodeMap,
    log: MeshLog,
}

impl AckTracker {
    pub fn new(node_map: SharedNodeMap, log: MeshLog) -> Self {
        Self { node_map, log }
    }
}

#[async_trait::async_trait]
impl DeliveryListener for AckTracker {
    async fn receive_ack(&self, payload: &Payload, reply: &Envelope) {
        let pubkey = reply
            .ack_payload()
            .ok()
            .and_then(|ack| ack.pubkey)
            .filter(|key| !key.is_empty());

        let mut map = self.node_map.write().await;
        if let Some(pubkey) = pubkey {
            if map.set_pubkey(&reply.from, &pubkey) {
                self.log
                    .debug("discovery", format!("pubkey for {} updated", reply.from));
            }
        }

        let target = &payload.target;
        if !map.is_direct(&target.label) {
            return;
        }
        if payload.envelope.action == Action::Hello {
            map.set_direct(target.clone(), true);
        } else {
            map.touch_alive(&target.label);
        }
    }

    async fn receive_nak(&self, payload: &Payload, failure: &DeliveryFailure) {
        let label = &payload.target.label;
        let was_alive = {
            let mut map = self.node_map.write().await;
            let was_alive = map.liveness(label).map_or(false, |l| l.is_alive());
            map.mark_dead(label);
            was_alive
        };
        if was_alive {
            self.log
                .info("discovery", format!("{label} is unreachable: {}", failure.error));
        }
    }
}

/// One node's discovery broadcaster.
pub struct Discovery {
    local_label: String,
    port: u16,
    node_map: SharedNodeMap,
    queue: SendQueue,
    tracker: Arc<AckTracker>,
    log: MeshLog,
}

impl Discovery {
    pub fn new(
        local_label: &str,
        port: u16,
        node_map: SharedNodeMap,
        queue: SendQueue,
        tracker: Arc<AckTracker>,
        log: MeshLog,
    ) -> Self {
        Self {
            local_label: local_label.to_string(),
            port,
            node_map,
            queue,
            tracker,
            log,
        }
    }

    /// Broadcast one hello to every direct neighbor. Returns how many were queued.
    pub async fn run_round(&self) -> usize {
        let batch: Vec<_> = {
            let mut map = self.node_map.write().await;
            map.begin_discovery_round(now_ms());
            map.direct_neighbors()
                .into_iter()
                .map(|node| {
                    let table = map.table_for(&node.label);
                    (node, table)
                })
                .collect()
        };

        let mut queued = 0;
        for (node, nodes) in batch {
            let hello = HelloPayload {
                nodes,
                port: self.port,
            };
            let envelope = Envelope::hello(&self.local_label, &node.label, &hello);
            let listeners = vec![self.tracker.clone() as Arc<dyn DeliveryListener>];
            if self.queue.enqueue(Payload::new(envelope, node, listeners, false)) {
                queued += 1;
            }
        }
        self.log
            .debug("discovery", format!("hello sent to {queued} neighbors"));
        queued
    }

    /// Run a round every `interval` until `shutdown` flips.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.run_round().await;
                    }
                }
            }
            self.log.debug("discovery", "heartbeat stopped");
        })
    }
}
