//! Virtual point-to-point mesh: distance-vector routing, discovery heartbeat,
//! serialized reliable delivery with relaying, and per-peer payload sealing.

pub mod discovery;
pub mod error;
pub mod handler;
pub mod listeners;
pub mod membership;
pub mod mesh;
pub mod node_map;
pub mod send_queue;
pub mod tcp_transport;
pub mod transport;

pub use error::{MeshError, Result};
pub use listeners::{DataListener, ListenerId, LogLevel, LogListener, LogRecord};
pub use membership::{Liveness, Node};
pub use mesh::{Mesh, MeshConfig};
pub use node_map::{KnownNode, NodeMap, Route, SharedNodeMap};
pub use send_queue::{DeliveryFailure, DeliveryListener, Payload, RetryPolicy, SendQueue};
pub use transport::{Transport, TransportError};

#[doc(hidden)]
pub use transport::MockTransport;
