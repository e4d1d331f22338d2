//! Integration tests: real nodes on loopback TCP.
//!
//! X - Y - Z line topology: X learns Z through Y's hellos, traffic from X to Z
//! is relayed by Y, and keys established end to end seal payloads that only Z
//! can open.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use node_mesh::{
    DeliveryFailure, DeliveryListener, Liveness, Mesh, MeshConfig, Payload, RetryPolicy,
};
use node_proto::Envelope;
use parking_lot::Mutex;
use serde_json::{json, Value};

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn config(label: &str, seeds: &[(&str, u16)]) -> MeshConfig {
    let mut config = MeshConfig::new(label);
    config.bind_addr = "127.0.0.1".into();
    config.heartbeat_interval = Duration::from_millis(100);
    config.connect_timeout = Duration::from_millis(500);
    config.io_timeout = Duration::from_millis(500);
    config.seeds = seeds
        .iter()
        .map(|(l, port)| (l.to_string(), format!("127.0.0.1:{port}")))
        .collect();
    config
}

type Inbox = Arc<Mutex<Vec<(String, Value)>>>;

fn inbox(mesh: &Mesh) -> Inbox {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    mesh.add_data_listener(move |from, data| {
        sink.lock().push((from.to_string(), data.clone()));
    });
    inbox
}

/// Starts Z, then Y seeded with Z, then X seeded with Y.
async fn line() -> (Mesh, Mesh, Mesh) {
    let z = Mesh::start(config("z", &[])).await.unwrap();
    let y = Mesh::start(config("y", &[("z", z.port())])).await.unwrap();
    let x = Mesh::start(config("x", &[("y", y.port())])).await.unwrap();
    (x, y, z)
}

async fn learns_pubkey(mesh: &Mesh, label: &str, expected: &str) -> bool {
    wait_until(|| async move {
        let map = mesh.node_map();
        let found = map.read().await.get_pubkey(label) == Some(expected);
        found
    })
    .await
}

async fn wait_for_route(x: &Mesh) {
    let routed = wait_until(|| async move {
        x.resolve("z").await.is_some_and(|n| n.label == "y")
    })
    .await;
    assert!(routed, "x never learned a route to z");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_through_middle_node() {
    let (x, y, z) = line().await;
    let z_inbox = inbox(&z);
    let y_inbox = inbox(&y);

    wait_for_route(&x).await;
    let known = x.known_nodes().await;
    let to_z = known.iter().find(|k| k.label == "z").unwrap();
    assert_eq!(to_z.via.as_deref(), Some("y"));

    assert!(x.send("z", json!({"hello": "z"})).await.unwrap());
    let z_seen = &z_inbox;
    let delivered = wait_until(|| async move { !z_seen.lock().is_empty() }).await;
    assert!(delivered, "z never received the relayed message");

    let received = z_inbox.lock().clone();
    assert_eq!(received, vec![("x".to_string(), json!({"hello": "z"}))]);
    assert!(y_inbox.lock().is_empty(), "relay must not dispatch locally");

    x.shutdown().await;
    y.shutdown().await;
    z.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_acks_carry_public_keys() {
    let (x, y, z) = line().await;

    assert!(learns_pubkey(&x, "y", &y.public_key()).await);
    // z's key reaches x only through y's table
    assert!(learns_pubkey(&x, "z", &z.public_key()).await);

    x.shutdown().await;
    y.shutdown().await;
    z.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sealed_message_crosses_the_relay() {
    let (x, y, z) = line().await;
    let z_inbox = inbox(&z);
    wait_for_route(&x).await;
    assert!(learns_pubkey(&x, "z", &z.public_key()).await);

    assert!(x.establish_key("z").await.unwrap());
    let z_crypto = z.crypto();
    let installed = wait_until(|| {
        let ready = z_crypto.supports_crypto("x");
        async move { ready }
    })
    .await;
    assert!(installed);
    assert_eq!(x.crypto().key_fingerprint("z"), z.crypto().key_fingerprint("x"));
    assert!(!y.crypto().supports_crypto("x"));

    assert!(x.send_sealed("z", &json!({"pin": 1234})).await.unwrap());
    let z_seen = &z_inbox;
    let delivered = wait_until(|| async move { !z_seen.lock().is_empty() }).await;
    assert!(delivered);
    assert_eq!(z_inbox.lock()[0], ("x".to_string(), json!({"pin": 1234})));

    x.shutdown().await;
    y.shutdown().await;
    z.shutdown().await;
}

#[tokio::test]
async fn unknown_label_is_not_queued() {
    let x = Mesh::start(config("x", &[])).await.unwrap();
    assert!(!x.send("ghost", json!({"a": 1})).await.unwrap());
    assert!(x.known_nodes().await.iter().all(|k| k.label == "x"));
    x.shutdown().await;
}

#[derive(Default)]
struct NakLog {
    naks: Mutex<Vec<(u32, bool)>>,
}

#[async_trait::async_trait]
impl DeliveryListener for NakLog {
    async fn receive_ack(&self, _payload: &Payload, _reply: &Envelope) {}

    async fn receive_nak(&self, payload: &Payload, failure: &DeliveryFailure) {
        self.naks.lock().push((payload.attempts, failure.permanent));
    }
}

#[tokio::test]
async fn unreachable_peer_is_retried_then_marked_dead() {
    // Bind and drop a listener to get a port nobody answers on.
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = config("x", &[("gone", closed_port)]);
    cfg.heartbeat_interval = Duration::from_secs(3600);
    cfg.retry = RetryPolicy {
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        max_attempts: Some(3),
    };
    let x = Mesh::start(cfg).await.unwrap();

    let log = Arc::new(NakLog::default());
    let listeners = vec![log.clone() as Arc<dyn DeliveryListener>];
    assert!(x.send_with("gone", json!({"n": 1}), listeners, true).await.unwrap());

    let naks = &log.naks;
    let finished = wait_until(|| async move { naks.lock().len() == 3 }).await;
    assert!(finished);
    assert_eq!(*log.naks.lock(), vec![(1, false), (2, false), (3, true)]);
    assert_eq!(x.liveness("gone").await, Some(Liveness::Dead));

    x.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_listener() {
    let x = Mesh::start(config("x", &[])).await.unwrap();
    let port = x.port();
    x.shutdown().await;

    let refused = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn second_bind_on_same_port_fails() {
    let x = Mesh::start(config("x", &[])).await.unwrap();
    let mut clash = config("x2", &[]);
    clash.port = x.port();
    let result = Mesh::start(clash).await;
    assert!(matches!(result, Err(node_mesh::MeshError::Bind { .. })));
    x.shutdown().await;
}
