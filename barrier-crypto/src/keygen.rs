//! Pooled key generation (spec §4.4).
//!
//! One bounded worker pool per algorithm, started at construction, draining
//! a buffered channel on `get`. Shares the worker-pool shape of a typical
//! producer/consumer service but generalized to the eleven algorithms the
//! barrier needs material for, with an explicit `max_ready` watermark as the
//! channel capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ed25519_dalek::SigningKey as Ed25519SigningKey;
use p256::ecdsa::SigningKey as P256SigningKey;
use p384::ecdsa::SigningKey as P384SigningKey;
use p521::ecdsa::SigningKey as P521SigningKey;
use pkcs8::EncodePrivateKey;
use rand_core::{OsRng, RngCore};
use rsa::RsaPrivateKey;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::{BarrierError, BarrierResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Rsa2048,
    Rsa3072,
    EcdsaP256,
    EcdsaP384,
    EcdsaP521,
    EdDsa,
    Aes128,
    Aes192,
    Aes256,
    Hmac256,
    UuidV7,
}

impl KeyKind {
    pub const ALL: [KeyKind; 11] = [
        KeyKind::Rsa2048,
        KeyKind::Rsa3072,
        KeyKind::EcdsaP256,
        KeyKind::EcdsaP384,
        KeyKind::EcdsaP521,
        KeyKind::EdDsa,
        KeyKind::Aes128,
        KeyKind::Aes192,
        KeyKind::Aes256,
        KeyKind::Hmac256,
        KeyKind::UuidV7,
    ];

    /// Accept only the FIPS-140-3-approved algorithm names; reject the
    /// spec's banned list (and anything else) as `Invalid` rather than
    /// panicking, so the rejection is testable (spec §8 Property 11).
    pub fn parse(name: &str) -> BarrierResult<Self> {
        match name {
            "rsa-2048" => Ok(KeyKind::Rsa2048),
            "rsa-3072" => Ok(KeyKind::Rsa3072),
            "ecdsa-p256" => Ok(KeyKind::EcdsaP256),
            "ecdsa-p384" => Ok(KeyKind::EcdsaP384),
            "ecdsa-p521" => Ok(KeyKind::EcdsaP521),
            "ed25519" => Ok(KeyKind::EdDsa),
            "aes-128" => Ok(KeyKind::Aes128),
            "aes-192" => Ok(KeyKind::Aes192),
            "aes-256" => Ok(KeyKind::Aes256),
            "hmac-256" => Ok(KeyKind::Hmac256),
            "uuidv7" => Ok(KeyKind::UuidV7),
            "bcrypt" | "scrypt" | "argon2" | "md5" | "sha1" | "des" | "3des" | "rc4"
            | "rsa-1024" | "ec-p224" | "dsa" => {
                Err(BarrierError::invalid(format!("algorithm '{}' is banned, not FIPS-140-3-approved", name)))
            }
            other => Err(BarrierError::invalid(format!("unknown key kind '{}'", other))),
        }
    }
}

/// Generated key material. Private bytes are PKCS#8 DER for asymmetric
/// kinds, raw for symmetric kinds; zeroized on drop.
pub enum GeneratedKey {
    Asymmetric { kind: KeyKind, private_der: Vec<u8>, public: Vec<u8> },
    Symmetric { kind: KeyKind, bytes: Vec<u8> },
    UuidV7(Uuid),
}

impl Drop for GeneratedKey {
    fn drop(&mut self) {
        match self {
            GeneratedKey::Asymmetric { private_der, .. } => private_der.zeroize(),
            GeneratedKey::Symmetric { bytes, .. } => bytes.zeroize(),
            GeneratedKey::UuidV7(_) => {}
        }
    }
}

impl GeneratedKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            GeneratedKey::Asymmetric { kind, .. } => *kind,
            GeneratedKey::Symmetric { kind, .. } => *kind,
            GeneratedKey::UuidV7(_) => KeyKind::UuidV7,
        }
    }
}

fn generate(kind: KeyKind) -> GeneratedKey {
    match kind {
        KeyKind::Rsa2048 | KeyKind::Rsa3072 => {
            let bits = if kind == KeyKind::Rsa2048 { 2048 } else { 3072 };
            let private = RsaPrivateKey::new(&mut OsRng, bits).expect("RSA keygen");
            let der = private.to_pkcs8_der().expect("PKCS8 encoding").as_bytes().to_vec();
            let public = private.to_public_key().n().to_bytes_be();
            GeneratedKey::Asymmetric { kind, private_der: der, public }
        }
        KeyKind::EcdsaP256 => {
            let sk = P256SigningKey::random(&mut OsRng);
            let der = sk.to_pkcs8_der().expect("PKCS8 encoding").as_bytes().to_vec();
            let public = sk.verifying_key().to_encoded_point(false).as_bytes().to_vec();
            GeneratedKey::Asymmetric { kind, private_der: der, public }
        }
        KeyKind::EcdsaP384 => {
            let sk = P384SigningKey::random(&mut OsRng);
            let der = sk.to_pkcs8_der().expect("PKCS8 encoding").as_bytes().to_vec();
            let public = sk.verifying_key().to_encoded_point(false).as_bytes().to_vec();
            GeneratedKey::Asymmetric { kind, private_der: der, public }
        }
        KeyKind::EcdsaP521 => {
            let sk = P521SigningKey::random(&mut OsRng);
            let der = sk.to_pkcs8_der().expect("PKCS8 encoding").as_bytes().to_vec();
            let public = sk.verifying_key().to_encoded_point(false).as_bytes().to_vec();
            GeneratedKey::Asymmetric { kind, private_der: der, public }
        }
        KeyKind::EdDsa => {
            let sk = Ed25519SigningKey::generate(&mut OsRng);
            let der = sk.to_pkcs8_der().expect("PKCS8 encoding").as_bytes().to_vec();
            let public = sk.verifying_key().to_bytes().to_vec();
            GeneratedKey::Asymmetric { kind, private_der: der, public }
        }
        KeyKind::Aes128 => GeneratedKey::Symmetric { kind, bytes: random_bytes(16) },
        KeyKind::Aes192 => GeneratedKey::Symmetric { kind, bytes: random_bytes(24) },
        KeyKind::Aes256 => GeneratedKey::Symmetric { kind, bytes: random_bytes(32) },
        KeyKind::Hmac256 => GeneratedKey::Symmetric { kind, bytes: random_bytes(32) },
        KeyKind::UuidV7 => GeneratedKey::UuidV7(Uuid::now_v7()),
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[derive(Clone, Copy, Debug)]
pub struct KeyGenConfig {
    pub min_ready: usize,
    pub max_ready: usize,
    pub workers: usize,
}

impl Default for KeyGenConfig {
    fn default() -> Self {
        Self { min_ready: 1, max_ready: 8, workers: 2 }
    }
}

struct Pool {
    receiver: Mutex<mpsc::Receiver<GeneratedKey>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Pooled generator. Pools for all eleven kinds are started eagerly at
/// construction (spec §4.4).
pub struct KeyGen {
    pools: HashMap<KeyKind, Pool>,
    shutdown: std::sync::Arc<AtomicBool>,
}

impl KeyGen {
    pub fn new(config: KeyGenConfig) -> Self {
        let shutdown = std::sync::Arc::new(AtomicBool::new(false));
        let mut pools = HashMap::new();
        for kind in KeyKind::ALL {
            let (tx, rx) = mpsc::sync_channel::<GeneratedKey>(config.max_ready);
            let mut handles = Vec::with_capacity(config.workers);
            for _ in 0..config.workers {
                let tx = tx.clone();
                let flag = shutdown.clone();
                handles.push(thread::spawn(move || worker_loop(kind, tx, flag)));
            }
            drop(tx);
            pools.insert(kind, Pool { receiver: Mutex::new(rx), handles: Mutex::new(handles) });
        }
        tracing::info!(pools = KeyKind::ALL.len(), "key generator pools started");
        Self { pools, shutdown }
    }

    /// Take a ready key, blocking up to `timeout` for a worker to produce
    /// one. Returns `Unavailable` on timeout or after `shutdown`.
    pub fn get(&self, kind: KeyKind, timeout: Duration) -> BarrierResult<GeneratedKey> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(BarrierError::unavailable("key generator is shutting down"));
        }
        let pool = self
            .pools
            .get(&kind)
            .ok_or_else(|| BarrierError::invalid("no pool registered for this key kind"))?;
        let rx = pool.receiver.lock().expect("keygen receiver mutex poisoned");
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => BarrierError::unavailable("timed out waiting for a generated key"),
            RecvTimeoutError::Disconnected => BarrierError::unavailable("key generator is shutting down"),
        })
    }

    /// Stop all workers and unblock any outstanding reader with
    /// `Unavailable`. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("key generator shutting down");
        for pool in self.pools.values() {
            let handles = std::mem::take(&mut *pool.handles.lock().expect("keygen handle mutex poisoned"));
            for h in handles {
                let _ = h.join();
            }
        }
    }
}

impl Drop for KeyGen {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(kind: KeyKind, tx: mpsc::SyncSender<GeneratedKey>, shutdown: std::sync::Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let mut key = generate(kind);
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match tx.try_send(key) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    key = returned;
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_algorithms_are_rejected() {
        for name in ["bcrypt", "scrypt", "argon2", "md5", "sha1", "des", "rc4", "rsa-1024", "ec-p224", "dsa"] {
            assert!(matches!(KeyKind::parse(name), Err(BarrierError::Invalid(_))), "{} should be banned", name);
        }
    }

    #[test]
    fn unknown_algorithm_is_invalid_not_panic() {
        assert!(matches!(KeyKind::parse("whatever"), Err(BarrierError::Invalid(_))));
    }

    #[test]
    fn symmetric_pool_serves_keys() {
        let gen = KeyGen::new(KeyGenConfig { min_ready: 1, max_ready: 2, workers: 1 });
        let key = gen.get(KeyKind::Aes256, Duration::from_secs(5)).unwrap();
        match key {
            GeneratedKey::Symmetric { kind, bytes } => {
                assert_eq!(kind, KeyKind::Aes256);
                assert_eq!(bytes.len(), 32);
            }
            _ => panic!("expected symmetric key"),
        }
    }

    #[test]
    fn uuidv7_pool_serves_monotonic_ids() {
        let gen = KeyGen::new(KeyGenConfig { min_ready: 1, max_ready: 4, workers: 1 });
        let a = gen.get(KeyKind::UuidV7, Duration::from_secs(5)).unwrap();
        let b = gen.get(KeyKind::UuidV7, Duration::from_secs(5)).unwrap();
        match (a, b) {
            (GeneratedKey::UuidV7(a), GeneratedKey::UuidV7(b)) => assert!(a != b),
            _ => panic!("expected uuidv7 keys"),
        }
    }

    #[test]
    fn shutdown_unblocks_waiting_readers() {
        let gen = KeyGen::new(KeyGenConfig { min_ready: 1, max_ready: 1, workers: 1 });
        gen.shutdown();
        let err = gen.get(KeyKind::Rsa2048, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, BarrierError::Unavailable(_)));
    }
}
