//! What a node does with one inbound envelope.
//!
//! Hellos feed the node map, messages for this node go to the data
//! listeners (after key installation or decryption where needed), and
//! messages for anyone else are relayed unchanged to the next hop. Every
//! non-ack envelope is answered with an ack.

use std::net::SocketAddr;
use std::sync::Arc;

use node_crypto::CryptoEngine;
use node_proto::{Action, Envelope};
use serde_json::Value;

use crate::discovery::AckTracker;
use crate::listeners::{DataListener, ListenerSet, MeshLog};
use crate::membership::Node;
use crate::node_map::SharedNodeMap;
use crate::send_queue::{DeliveryListener, Payload, SendQueue};
use crate::tcp_transport::EnvelopeHandler;

pub struct InboundHandler {
    local_label: String,
    node_map: SharedNodeMap,
    crypto: Arc<CryptoEngine>,
    queue: SendQueue,
    tracker: Arc<AckTracker>,
    data_listeners: Arc<ListenerSet<DataListener>>,
    log: MeshLog,
}

impl InboundHandler {
    pub fn new(
        local_label: &str,
        node_map: SharedNodeMap,
        crypto: Arc<CryptoEngine>,
        queue: SendQueue,
        tracker: Arc<AckTracker>,
        data_listeners: Arc<ListenerSet<DataListener>>,
        log: MeshLog,
    ) -> Self {
        Self {
            local_label: local_label.to_string(),
            node_map,
            crypto,
            queue,
            tracker,
            data_listeners,
            log,
        }
    }

    /// Register or refresh the sender at its observed address, then merge
    /// its table. Returns false if the hello payload is malformed.
    async fn on_hello(&self, envelope: &Envelope, peer: SocketAddr) -> bool {
        let hello = match envelope.hello_payload() {
            Ok(hello) => hello,
            Err(e) => {
                self.log
                    .error("discovery", format!("bad hello from {}: {e}", envelope.from));
                return false;
            }
        };
        if envelope.from == self.local_label {
            return true;
        }

        let sender = Node::new(&envelope.from, &peer.ip().to_string(), hello.port);
        let mut map = self.node_map.write().await;
        let known_alive = map
            .liveness(&sender.label)
            .map_or(false, |l| l.is_alive());
        if known_alive {
            map.update_address(&sender.label, &sender.ip, sender.port);
        } else if map.set_direct(sender.clone(), true) {
            self.log
                .info("discovery", format!("new neighbor {sender}"));
        }
        map.learn_neighbor_table(&envelope.from, Some(&hello.nodes));
        true
    }

    async fn relay(&self, envelope: Envelope) {
        let next_hop = self.node_map.read().await.resolve(&envelope.to);
        let Some(next_hop) = next_hop else {
            self.log.error(
                "relay",
                format!("no route to {} for message from {}", envelope.to, envelope.from),
            );
            return;
        };
        self.log.debug(
            "relay",
            format!("{} -> {} via {}", envelope.from, envelope.to, next_hop.label),
        );
        let listeners = vec![self.tracker.clone() as Arc<dyn DeliveryListener>];
        self.queue
            .enqueue(Payload::new(envelope, next_hop, listeners, false));
    }

    fn on_kex(&self, envelope: &Envelope) {
        let token = match envelope.kex_payload() {
            Ok(kex) => kex.token,
            Err(e) => {
                self.log
                    .error("crypto", format!("bad kex from {}: {e}", envelope.from));
                return;
            }
        };
        match self.crypto.decapsulate(&envelope.from, &token) {
            Ok(()) => self
                .log
                .info("crypto", format!("key established with {}", envelope.from)),
            Err(e) => self.log.error(
                "crypto",
                format!("key exchange from {} failed: {e}", envelope.from),
            ),
        }
    }

    fn on_sealed(&self, envelope: &Envelope) {
        let opened = envelope
            .sealed_payload()
            .map_err(|e| e.to_string())
            .and_then(|body| {
                self.crypto
                    .decrypt(&envelope.from, &body.sealed)
                    .map_err(|e| e.to_string())
            });
        match opened {
            Ok(data) => self.dispatch(&envelope.from, &data),
            Err(e) => self.log.error(
                "crypto",
                format!("dropping sealed message from {}: {e}", envelope.from),
            ),
        }
    }

    fn dispatch(&self, from: &str, data: &Value) {
        for listener in self.data_listeners.snapshot() {
            listener(from, data);
        }
    }
}

#[async_trait::async_trait]
impl EnvelopeHandler for InboundHandler {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Option<Envelope> {
        let for_me = envelope.to == self.local_label;
        let pubkey = for_me.then(|| self.crypto.public_key_base64());
        let reply = Envelope::ack_for(&envelope, pubkey);

        let action = envelope.action;
        match action {
            Action::Ack => return None,
            Action::Hello => {
                if !self.on_hello(&envelope, peer).await {
                    return None;
                }
            }
            Action::Generic | Action::Kex | Action::Sealed if !for_me => {
                self.relay(envelope).await
            }
            Action::Kex => self.on_kex(&envelope),
            Action::Sealed => self.on_sealed(&envelope),
            Action::Generic => {
                let from = envelope.from;
                self.dispatch(&from, &Value::Object(envelope.payload));
            }
        }
        Some(reply)
    }
}
