//! The mesh facade: one running node.
//!
//! `Mesh::start` binds the listener, spawns the accept loop, the send-queue
//! worker and the discovery heartbeat, and hands back a cheap-to-clone
//! handle. Sends return whether the message was queued, never whether it
//! was delivered; delivery shows up asynchronously as node map liveness.

use std::sync::Arc;
use std::time::Duration;

use node_crypto::{CryptoEngine, KeyPair};
use node_proto::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::discovery::{AckTracker, Discovery, DEFAULT_HEARTBEAT};
use crate::error::{MeshError, Result};
use crate::handler::InboundHandler;
use crate::listeners::{DataListener, ListenerId, ListenerSet, LogRecord, MeshLog};
use crate::membership::{Liveness, Node};
use crate::node_map::{KnownNode, NodeMap, SharedNodeMap};
use crate::send_queue::{DeliveryListener, Payload, RetryPolicy, SendQueue};
use crate::tcp_transport::{MeshServer, TcpTransport, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub label: String,
    pub bind_addr: String,
    /// 0 picks an ephemeral port; see [`Mesh::port`].
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub retry: RetryPolicy,
    /// Generated at startup when absent.
    pub keypair: Option<KeyPair>,
    /// Static peers as `(label, "host:port")`.
    pub seeds: Vec<(String, String)>,
}

impl MeshConfig {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            bind_addr: "0.0.0.0".into(),
            port: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            retry: RetryPolicy::default(),
            keypair: None,
            seeds: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    label: String,
    port: u16,
    node_map: SharedNodeMap,
    crypto: Arc<CryptoEngine>,
    queue: SendQueue,
    tracker: Arc<AckTracker>,
    discovery: Arc<Discovery>,
    data_listeners: Arc<ListenerSet<DataListener>>,
    log: MeshLog,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Mesh {
    /// Start a node on TCP. A bind failure is returned here and is fatal.
    pub async fn start(config: MeshConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.connect_timeout, config.io_timeout));
        Self::start_with_transport(config, transport).await
    }

    /// Start a node whose outbound traffic goes through `transport`. The
    /// inbound listener is always TCP.
    pub async fn start_with_transport(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if config.label.trim().is_empty() {
            return Err(MeshError::InvalidLabel(config.label));
        }
        let seeds = config
            .seeds
            .iter()
            .map(|(label, address)| Node::parse(label, address))
            .collect::<Result<Vec<_>>>()?;

        let server = MeshServer::bind(&config.bind_addr, config.port, config.io_timeout).await?;
        let port = server.local_port()?;

        let keypair = config.keypair.unwrap_or_else(KeyPair::generate);
        let crypto = Arc::new(CryptoEngine::new(keypair));
        let local = Node::new(&config.label, &config.bind_addr, port);
        let mut map = NodeMap::new(local, &crypto.public_key_base64());
        for seed in seeds {
            map.add_direct(seed);
        }
        let node_map: SharedNodeMap = Arc::new(RwLock::new(map));

        let log = MeshLog::new(&config.label);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (queue, worker) = SendQueue::start(transport, config.retry, shutdown_rx.clone());
        let tracker = Arc::new(AckTracker::new(node_map.clone(), log.clone()));
        let data_listeners = Arc::new(ListenerSet::new());

        let handler = Arc::new(InboundHandler::new(
            &config.label,
            node_map.clone(),
            crypto.clone(),
            queue.clone(),
            tracker.clone(),
            data_listeners.clone(),
            log.clone(),
        ));
        let server_task = tokio::spawn(Arc::new(server).serve(handler, shutdown_rx.clone()));

        let discovery = Arc::new(Discovery::new(
            &config.label,
            port,
            node_map.clone(),
            queue.clone(),
            tracker.clone(),
            log.clone(),
        ));
        let heartbeat = discovery
            .clone()
            .spawn_heartbeat(config.heartbeat_interval, shutdown_rx);

        info!(label = %config.label, port, "mesh node started");
        Ok(Self {
            inner: Arc::new(MeshInner {
                label: config.label,
                port,
                node_map,
                crypto,
                queue,
                tracker,
                discovery,
                data_listeners,
                log,
                shutdown,
                tasks: Mutex::new(vec![server_task, worker, heartbeat]),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn public_key(&self) -> String {
        self.inner.crypto.public_key_base64()
    }

    /// Register a static peer. Returns false if the label was already a
    /// direct neighbor (its address is refreshed).
    pub async fn add_peer(&self, label: &str, address: &str) -> Result<bool> {
        let node = Node::parse(label, address)?;
        let added = self.inner.node_map.write().await.add_direct(node);
        if added {
            self.inner.log.info("peers", format!("added {label} at {address}"));
        }
        Ok(added)
    }

    pub async fn remove_peer(&self, label: &str) -> bool {
        let removed = self.inner.node_map.write().await.remove_node(label);
        if let Some(node) = &removed {
            self.inner.log.info("peers", format!("removed {node}"));
        }
        removed.is_some()
    }

    /// Queue `payload` (a JSON object) for `label` with retry enabled.
    pub async fn send(&self, label: &str, payload: Value) -> Result<bool> {
        self.send_with(label, payload, Vec::new(), true).await
    }

    /// Like [`Mesh::send`] with extra delivery listeners and an explicit retry flag.
    pub async fn send_with(
        &self,
        label: &str,
        payload: Value,
        listeners: Vec<Arc<dyn DeliveryListener>>,
        retry: bool,
    ) -> Result<bool> {
        let Value::Object(body) = payload else {
            return Err(MeshError::PayloadNotObject);
        };
        let envelope = Envelope::generic(&self.inner.label, label, body);
        Ok(self.route_and_enqueue(envelope, listeners, retry).await)
    }

    /// Encrypt `payload` under the key shared with `label` and queue it.
    pub async fn send_sealed(&self, label: &str, payload: &Value) -> Result<bool> {
        let sealed = self.inner.crypto.encrypt(label, payload)?;
        let envelope = Envelope::sealed(&self.inner.label, label, sealed);
        Ok(self.route_and_enqueue(envelope, Vec::new(), true).await)
    }

    /// Encapsulate a fresh key against `label`'s public key and send it the
    /// token. The local side holds the key as soon as this returns `Ok(true)`.
    pub async fn establish_key(&self, label: &str) -> Result<bool> {
        let pubkey = {
            let map = self.inner.node_map.read().await;
            if map.resolve(label).is_none() {
                return Ok(false);
            }
            map.get_pubkey(label)
                .map(str::to_string)
                .ok_or_else(|| MeshError::UnknownPubkey(label.to_string()))?
        };
        let token = self.inner.crypto.encapsulate(label, &pubkey)?;
        let envelope = Envelope::kex(&self.inner.label, label, token);
        Ok(self.route_and_enqueue(envelope, Vec::new(), true).await)
    }

    /// Send `payload` to every known label. Returns how many were queued.
    pub async fn broadcast(&self, payload: Value) -> Result<usize> {
        let Value::Object(body) = payload else {
            return Err(MeshError::PayloadNotObject);
        };
        let labels = self.inner.node_map.read().await.all_known_labels();
        let mut queued = 0;
        for label in labels {
            let envelope = Envelope::generic(&self.inner.label, &label, body.clone());
            if self.route_and_enqueue(envelope, Vec::new(), true).await {
                queued += 1;
            }
        }
        Ok(queued)
    }

    async fn route_and_enqueue(
        &self,
        envelope: Envelope,
        extra: Vec<Arc<dyn DeliveryListener>>,
        retry: bool,
    ) -> bool {
        if envelope.to == self.inner.label {
            self.inner.log.debug("send", "not sending to self");
            return false;
        }
        let next_hop = self.inner.node_map.read().await.resolve(&envelope.to);
        let Some(next_hop) = next_hop else {
            self.inner
                .log
                .debug("send", format!("no route to {}", envelope.to));
            return false;
        };
        let mut listeners = vec![self.inner.tracker.clone() as Arc<dyn DeliveryListener>];
        listeners.extend(extra);
        self.inner
            .queue
            .enqueue(Payload::new(envelope, next_hop, listeners, retry))
    }

    pub fn add_data_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.inner.data_listeners.add(Arc::new(listener))
    }

    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        self.inner.data_listeners.remove(id)
    }

    pub fn add_log_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        self.inner.log.sinks().add(Arc::new(listener))
    }

    pub fn remove_log_listener(&self, id: ListenerId) -> bool {
        self.inner.log.sinks().remove(id)
    }

    pub async fn resolve(&self, label: &str) -> Option<Node> {
        self.inner.node_map.read().await.resolve(label)
    }

    pub async fn known_nodes(&self) -> Vec<KnownNode> {
        self.inner.node_map.read().await.known_nodes()
    }

    pub async fn liveness(&self, label: &str) -> Option<Liveness> {
        self.inner.node_map.read().await.liveness(label)
    }

    pub fn node_map(&self) -> SharedNodeMap {
        self.inner.node_map.clone()
    }

    pub fn crypto(&self) -> Arc<CryptoEngine> {
        self.inner.crypto.clone()
    }

    /// Run one discovery round now instead of waiting for the heartbeat.
    pub async fn discover_now(&self) -> usize {
        self.inner.discovery.run_round().await
    }

    /// Stop the heartbeat, the send-queue worker and the listener, abort
    /// in-flight inbound handlers and wait for all of it. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(label = %self.inner.label, "mesh node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use node_proto::Action;
    use serde_json::json;

    async fn node_with(seeds: &[(&str, &str)]) -> (Mesh, Arc<MockTransport>) {
        let mut config = MeshConfig::new("x");
        config.bind_addr = "127.0.0.1".into();
        config.heartbeat_interval = Duration::from_secs(3600);
        config.seeds = seeds
            .iter()
            .map(|(l, a)| (l.to_string(), a.to_string()))
            .collect();
        let transport = Arc::new(MockTransport::acking());
        let mesh = Mesh::start_with_transport(config, transport.clone())
            .await
            .unwrap();
        (mesh, transport)
    }

    async fn generic_sends(transport: &MockTransport, want: usize) -> Vec<(Node, Envelope)> {
        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.extend(
                transport
                    .take_sent()
                    .into_iter()
                    .filter(|(_, env)| env.action != Action::Hello),
            );
            if seen.len() >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen
    }

    #[tokio::test]
    async fn send_to_unknown_label_is_not_queued() {
        let (mesh, transport) = node_with(&[]).await;
        assert!(!mesh.send("nobody", json!({"a": 1})).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.sent_count(), 0);
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_self_is_not_queued() {
        let (mesh, _) = node_with(&[]).await;
        assert!(!mesh.send("x", json!({})).await.unwrap());
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let (mesh, _) = node_with(&[("y", "127.0.0.1:7001")]).await;
        let err = mesh.send("y", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, MeshError::PayloadNotObject));
        let err = mesh.broadcast(json!("text")).await.unwrap_err();
        assert!(matches!(err, MeshError::PayloadNotObject));
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_seed_goes_out_and_marks_it_alive() {
        let (mesh, transport) = node_with(&[("y", "127.0.0.1:7001")]).await;
        assert!(mesh.send("y", json!({"n": 1})).await.unwrap());

        let sent = generic_sends(&transport, 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.address(), "127.0.0.1:7001");
        assert_eq!(sent[0].1.payload["n"], json!(1));
        for _ in 0..50 {
            if mesh.liveness("y").await.is_some_and(|l| l.is_alive()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mesh.liveness("y").await.unwrap().is_alive());
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_counts_known_labels() {
        let (mesh, transport) =
            node_with(&[("y", "127.0.0.1:7001"), ("z", "127.0.0.1:7002")]).await;
        assert_eq!(mesh.broadcast(json!({"all": true})).await.unwrap(), 2);
        assert_eq!(generic_sends(&transport, 2).await.len(), 2);
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn sealed_send_without_key_fails_before_queueing() {
        let (mesh, transport) = node_with(&[("y", "127.0.0.1:7001")]).await;
        let err = mesh.send_sealed("y", &json!({"s": 1})).await.unwrap_err();
        assert!(matches!(err, MeshError::Crypto(_)));
        assert!(generic_sends(&transport, 1).await.is_empty());
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn establish_key_needs_a_pubkey() {
        let (mesh, transport) = node_with(&[("y", "127.0.0.1:7001")]).await;
        let err = mesh.establish_key("y").await.unwrap_err();
        assert!(matches!(err, MeshError::UnknownPubkey(label) if label == "y"));

        let peer = CryptoEngine::generate();
        mesh.node_map()
            .write()
            .await
            .set_pubkey("y", &peer.public_key_base64());
        assert!(mesh.establish_key("y").await.unwrap());
        assert!(mesh.crypto().supports_crypto("y"));

        let sent = generic_sends(&transport, 1).await;
        assert_eq!(sent[0].1.action, Action::Kex);
        let token = sent[0].1.kex_payload().unwrap().token;
        peer.decapsulate("x", &token).unwrap();
        assert_eq!(
            peer.key_fingerprint("x"),
            mesh.crypto().key_fingerprint("y")
        );
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_seed_is_rejected_at_startup() {
        let mut config = MeshConfig::new("x");
        config.bind_addr = "127.0.0.1".into();
        config.seeds = vec![("y".into(), "no-port".into())];
        let result = Mesh::start_with_transport(config, Arc::new(MockTransport::acking())).await;
        assert!(matches!(result, Err(MeshError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn peers_can_be_added_and_removed() {
        let (mesh, _) = node_with(&[]).await;
        assert!(mesh.add_peer("y", "127.0.0.1:7001").await.unwrap());
        assert!(!mesh.add_peer("y", "127.0.0.1:7005").await.unwrap());
        assert_eq!(mesh.resolve("y").await.unwrap().port, 7005);
        assert!(mesh.add_peer("y", "bad").await.is_err());

        assert!(mesh.remove_peer("y").await);
        assert!(!mesh.remove_peer("y").await);
        assert!(mesh.resolve("y").await.is_none());
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_sending() {
        let (mesh, _) = node_with(&[("y", "127.0.0.1:7001")]).await;
        mesh.shutdown().await;
        mesh.shutdown().await;
        assert!(!mesh.send("y", json!({})).await.unwrap());
    }
}
