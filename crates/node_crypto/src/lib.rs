//! Node key material, KEM key exchange and payload sealing.
//!
//! Each node owns one Kyber768 keypair. A pairwise 32-byte key is derived when
//! one side encapsulates against the *other* side's public key and the other
//! decapsulates the resulting token. Payload bodies are sealed with
//! ChaCha20-Poly1305 and shipped as `base64(ciphertext || nonce)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::RwLock;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// ChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const KEY_DOMAIN: &[u8] = b"hopmesh-kem-v1:";
const PUBLIC_KEY_FILE: &str = "kem.pub";
const SECRET_KEY_FILE: &str = "kem.key";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no symmetric key established with {0}")]
    MissingKey(String),
    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid {0} bytes")]
    InvalidKeyMaterial(&'static str),
    #[error("authenticated encryption failed")]
    Cipher,
    #[error("plaintext is not valid json: {0}")]
    Plaintext(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// This node's KEM keypair.
#[derive(Clone)]
pub struct KeyPair {
    public: kyber768::PublicKey,
    secret: kyber768::SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let (public, secret) = kyber768::keypair();
        Self { public, secret }
    }

    /// Rebuild a keypair from previously exported bytes.
    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self> {
        let public = kyber768::PublicKey::from_bytes(public)
            .map_err(|_| CryptoError::InvalidKeyMaterial("public key"))?;
        let secret = kyber768::SecretKey::from_bytes(secret)
            .map_err(|_| CryptoError::InvalidKeyMaterial("secret key"))?;
        Ok(Self { public, secret })
    }

    pub fn public_bytes(&self) -> &[u8] {
        self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.as_bytes()
    }

    pub fn public_base64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &fingerprint(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Write the keypair as base64 text files in `dir`.
pub fn write_keypair(keypair: &KeyPair, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let public_path = dir.join(PUBLIC_KEY_FILE);
    let secret_path = dir.join(SECRET_KEY_FILE);
    std::fs::write(&public_path, B64.encode(keypair.public_bytes()))?;
    std::fs::write(&secret_path, B64.encode(keypair.secret_bytes()))?;
    Ok((public_path, secret_path))
}

/// Read a keypair written by [`write_keypair`]. `Ok(None)` if none is stored.
pub fn read_keypair(dir: &Path) -> Result<Option<KeyPair>> {
    let public_path = dir.join(PUBLIC_KEY_FILE);
    let secret_path = dir.join(SECRET_KEY_FILE);
    if !public_path.exists() || !secret_path.exists() {
        return Ok(None);
    }
    let public = B64.decode(std::fs::read_to_string(&public_path)?.trim())?;
    let secret = B64.decode(std::fs::read_to_string(&secret_path)?.trim())?;
    KeyPair::from_bytes(&public, &secret).map(Some)
}

/// Load the keypair stored in `dir`, generating and persisting one if absent.
pub fn load_or_generate(dir: &Path) -> Result<KeyPair> {
    if let Some(keypair) = read_keypair(dir)? {
        return Ok(keypair);
    }
    let keypair = KeyPair::generate();
    write_keypair(&keypair, dir)?;
    Ok(keypair)
}

/// Short hex fingerprint of key material, safe to log.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}

/// Owns this node's keypair and the pairwise keys derived with peers.
pub struct CryptoEngine {
    keypair: KeyPair,
    symmetric_keys: RwLock<HashMap<String, [u8; 32]>>,
}

impl CryptoEngine {
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            keypair,
            symmetric_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn generate() -> Self {
        Self::new(KeyPair::generate())
    }

    pub fn public_key_base64(&self) -> String {
        self.keypair.public_base64()
    }

    /// Encapsulate against `peer_public_key` (base64), store the derived key
    /// for `peer` and return the base64 token to send to that peer.
    pub fn encapsulate(&self, peer: &str, peer_public_key: &str) -> Result<String> {
        let bytes = B64.decode(peer_public_key)?;
        let peer_key = kyber768::PublicKey::from_bytes(&bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial("public key"))?;
        let (shared, token) = kyber768::encapsulate(&peer_key);
        self.install(peer, derive_key(shared.as_bytes()));
        Ok(B64.encode(token.as_bytes()))
    }

    /// Recover the key a peer encapsulated for us and store it for `peer`.
    pub fn decapsulate(&self, peer: &str, token: &str) -> Result<()> {
        let bytes = B64.decode(token)?;
        let token = kyber768::Ciphertext::from_bytes(&bytes)
            .map_err(|_| CryptoError::InvalidKeyMaterial("kem token"))?;
        let shared = kyber768::decapsulate(&token, &self.keypair.secret);
        self.install(peer, derive_key(shared.as_bytes()));
        Ok(())
    }

    pub fn supports_crypto(&self, peer: &str) -> bool {
        self.symmetric_keys.read().contains_key(peer)
    }

    pub fn forget(&self, peer: &str) -> bool {
        self.symmetric_keys.write().remove(peer).is_some()
    }

    /// Fingerprint of the key shared with `peer`, if any.
    pub fn key_fingerprint(&self, peer: &str) -> Option<String> {
        self.symmetric_keys
            .read()
            .get(peer)
            .map(|key| fingerprint(key))
    }

    pub fn encrypt(&self, peer: &str, plaintext: &Value) -> Result<String> {
        let cipher = self.cipher_for(peer)?;
        let body = serde_json::to_vec(plaintext)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut sealed = cipher
            .encrypt(&nonce, body.as_slice())
            .map_err(|_| CryptoError::Cipher)?;
        sealed.extend_from_slice(nonce.as_slice());
        Ok(B64.encode(sealed))
    }

    pub fn decrypt(&self, peer: &str, sealed: &str) -> Result<Value> {
        let cipher = self.cipher_for(peer)?;
        let bytes = B64.decode(sealed)?;
        if bytes.len() < NONCE_LEN {
            return Err(CryptoError::Truncated(bytes.len()));
        }
        let (ciphertext, nonce) = bytes.split_at(bytes.len() - NONCE_LEN);
        let body = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Cipher)?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn install(&self, peer: &str, key: [u8; 32]) {
        debug!(peer, key = %fingerprint(&key), "installed pairwise key");
        self.symmetric_keys.write().insert(peer.to_string(), key);
    }

    fn cipher_for(&self, peer: &str) -> Result<ChaCha20Poly1305> {
        let keys = self.symmetric_keys.read();
        let key = keys
            .get(peer)
            .ok_or_else(|| CryptoError::MissingKey(peer.to_string()))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
    }
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs the handshake in the direction `initiator -> responder`.
    fn handshake(
        initiator: &CryptoEngine,
        init_label: &str,
        responder: &CryptoEngine,
        resp_label: &str,
    ) {
        let token = initiator
            .encapsulate(resp_label, &responder.public_key_base64())
            .unwrap();
        responder.decapsulate(init_label, &token).unwrap();
    }

    #[test]
    fn kem_handshake_yields_same_key_on_both_sides() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        handshake(&alice, "alice", &bob, "bob");

        assert!(alice.supports_crypto("bob"));
        assert!(bob.supports_crypto("alice"));
        assert_eq!(alice.key_fingerprint("bob"), bob.key_fingerprint("alice"));
    }

    #[test]
    fn mismatched_keypair_never_matches() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        let mallory = CryptoEngine::generate();

        let token = alice
            .encapsulate("bob", &bob.public_key_base64())
            .unwrap();
        mallory.decapsulate("alice", &token).unwrap();
        assert_ne!(alice.key_fingerprint("bob"), mallory.key_fingerprint("alice"));

        let sealed = alice.encrypt("bob", &json!({"secret": 1})).unwrap();
        assert!(matches!(
            mallory.decrypt("alice", &sealed),
            Err(CryptoError::Cipher)
        ));
    }

    #[test]
    fn encrypt_decrypt_across_peers() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        handshake(&alice, "alice", &bob, "bob");

        let message = json!({"text": "hello over the mesh", "n": [1, 2, 3]});
        let sealed = alice.encrypt("bob", &message).unwrap();
        assert_eq!(bob.decrypt("alice", &sealed).unwrap(), message);

        let reply = json!({"ok": true});
        let sealed = bob.encrypt("alice", &reply).unwrap();
        assert_eq!(alice.decrypt("bob", &sealed).unwrap(), reply);
    }

    #[test]
    fn fresh_nonce_per_message() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        handshake(&alice, "alice", &bob, "bob");

        let message = json!({"same": "body"});
        let a = alice.encrypt("bob", &message).unwrap();
        let b = alice.encrypt("bob", &message).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_without_key_fails() {
        let engine = CryptoEngine::generate();
        assert!(matches!(
            engine.encrypt("ghost", &json!({})),
            Err(CryptoError::MissingKey(_))
        ));
        assert!(matches!(
            engine.decrypt("ghost", "AAAA"),
            Err(CryptoError::MissingKey(_))
        ));
    }

    #[test]
    fn truncated_or_tampered_ciphertext_fails() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        handshake(&alice, "alice", &bob, "bob");

        let short = B64.encode([0u8; NONCE_LEN - 1]);
        assert!(matches!(
            bob.decrypt("alice", &short),
            Err(CryptoError::Truncated(11))
        ));

        let sealed = alice.encrypt("bob", &json!({"v": 42})).unwrap();
        let mut bytes = B64.decode(&sealed).unwrap();
        bytes[0] ^= 0x01;
        let tampered = B64.encode(bytes);
        assert!(matches!(
            bob.decrypt("alice", &tampered),
            Err(CryptoError::Cipher)
        ));

        assert!(matches!(
            bob.decrypt("alice", "not base64!"),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn rekey_replaces_previous_key() {
        let alice = CryptoEngine::generate();
        let bob = CryptoEngine::generate();
        handshake(&alice, "alice", &bob, "bob");
        let first = alice.key_fingerprint("bob");

        handshake(&alice, "alice", &bob, "bob");
        let second = alice.key_fingerprint("bob");
        assert_ne!(first, second);
        assert_eq!(second, bob.key_fingerprint("alice"));

        assert!(alice.forget("bob"));
        assert!(!alice.supports_crypto("bob"));
    }

    #[test]
    fn rejects_bad_key_material() {
        let engine = CryptoEngine::generate();
        assert!(matches!(
            engine.encapsulate("x", &B64.encode([1u8; 10])),
            Err(CryptoError::InvalidKeyMaterial("public key"))
        ));
        assert!(matches!(
            engine.decapsulate("x", &B64.encode([1u8; 10])),
            Err(CryptoError::InvalidKeyMaterial("kem token"))
        ));
        assert!(KeyPair::from_bytes(&[0u8; 3], &[0u8; 3]).is_err());
    }

    #[test]
    fn keypair_bytes_roundtrip() {
        let original = KeyPair::generate();
        let restored =
            KeyPair::from_bytes(original.public_bytes(), original.secret_bytes()).unwrap();
        assert_eq!(original.public_base64(), restored.public_base64());

        let peer = CryptoEngine::generate();
        let restored_engine = CryptoEngine::new(restored);
        let token = peer
            .encapsulate("node", &original.public_base64())
            .unwrap();
        restored_engine.decapsulate("peer", &token).unwrap();
        assert_eq!(peer.key_fingerprint("node"), restored_engine.key_fingerprint("peer"));
    }

    #[test]
    fn write_and_read_keypair() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(read_keypair(tmp.path()).unwrap().is_none());

        let generated = load_or_generate(tmp.path()).unwrap();
        assert!(tmp.path().join(PUBLIC_KEY_FILE).exists());
        assert!(tmp.path().join(SECRET_KEY_FILE).exists());

        let loaded = load_or_generate(tmp.path()).unwrap();
        assert_eq!(generated.public_base64(), loaded.public_base64());
    }
}
