use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("payload must be a JSON object")]
    PayloadNotObject,
    #[error("no public key known for {0}")]
    UnknownPubkey(String),
    #[error(transparent)]
    Crypto(#[from] node_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, MeshError>;
