//! Node identity and three-state liveness for direct neighbors.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MeshError, Result};

/// A peer as seen by this instance. Identity is the label.
#[derive(Debug, Clone, Eq)]
pub struct Node {
    pub label: String,
    pub ip: String,
    pub port: u16,
}

impl Node {
    pub fn new(label: &str, ip: &str, port: u16) -> Self {
        Self {
            label: label.to_string(),
            ip: normalize_host(ip),
            port,
        }
    }

    /// Build a node from a `host:port` string. IPv6 hosts use `[addr]:port`.
    pub fn parse(label: &str, address: &str) -> Result<Self> {
        let invalid = || MeshError::InvalidAddress(address.to_string());
        if label.trim().is_empty() {
            return Err(MeshError::InvalidLabel(label.to_string()));
        }
        let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = normalize_host(host);
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self {
            label: label.to_string(),
            ip: host,
            port,
        })
    }

    pub fn address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.label.hash(state);
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.label, self.address())
    }
}

/// Strip the leading slash some socket APIs prepend to textual addresses
/// and unwrap IPv4-mapped IPv6 addresses.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_start_matches('/');
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => host.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Known (e.g. seeded) but never confirmed either way.
    Unknown,
    /// Answered recently; `latency_ms` is the last measured round trip.
    Alive { latency_ms: i64 },
    /// Last delivery attempt failed.
    Dead,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive { .. })
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }

    pub fn latency(&self) -> Option<i64> {
        match self {
            Self::Alive { latency_ms } => Some(*latency_ms),
            _ => None,
        }
    }
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Alive { latency_ms } => write!(f, "Alive({latency_ms}ms)"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
