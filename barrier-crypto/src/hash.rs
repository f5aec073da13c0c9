//! Versioned, peppered password hashing (spec §4.5).
//!
//! Mirrors the hash-record shape from spec §3:
//! `v:alg:params:base64(salt):base64(digest)`. The pepper never appears in
//! the record; it is loaded once at construction from one file per version
//! and held only in memory, zeroized on drop.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{BarrierError, BarrierResult};

pub const CURRENT_VERSION: u32 = 3;
/// The only hash category this service implements. Passed into `load` as an
/// explicit argument (rather than baked in unconditionally) so startup
/// configuration of a banned category is rejected instead of silently
/// unreachable.
pub const ALGORITHM: &str = "pbkdf2-hmac-sha256";
const SALT_LEN: usize = 16;
const OUTPUT_LEN: usize = 32;
const ITERATIONS: u32 = 600_000;
const ALG_TAG: &str = ALGORITHM;

fn is_banned(alg: &str) -> bool {
    matches!(
        alg.to_ascii_lowercase().as_str(),
        "bcrypt" | "scrypt" | "argon2" | "argon2i" | "argon2id" | "md5" | "sha1" | "des" | "3des" | "rc4"
    )
}

#[derive(Clone, Debug)]
struct HashParams {
    alg: String,
    iterations: u32,
    salt_len: usize,
    output_len: usize,
}

impl HashParams {
    fn current() -> Self {
        Self { alg: ALG_TAG.to_string(), iterations: ITERATIONS, salt_len: SALT_LEN, output_len: OUTPUT_LEN }
    }

    fn encode(&self) -> String {
        format!("iter={}", self.iterations)
    }
}

/// A parsed `v:alg:params:salt:digest` hash record.
struct HashRecord {
    version: u32,
    alg: String,
    iterations: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl HashRecord {
    fn parse(s: &str) -> BarrierResult<Self> {
        let parts: Vec<&str> = s.splitn(5, ':').collect();
        if parts.len() != 5 {
            return Err(BarrierError::invalid("malformed hash record"));
        }
        let version: u32 = parts[0].parse().map_err(|_| BarrierError::invalid("malformed hash record version"))?;
        let alg = parts[1].to_string();
        let iterations = parts[2]
            .strip_prefix("iter=")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| BarrierError::invalid("malformed hash record params"))?;
        let salt = STANDARD_NO_PAD.decode(parts[3]).map_err(|_| BarrierError::invalid("malformed hash record salt"))?;
        let digest = STANDARD_NO_PAD.decode(parts[4]).map_err(|_| BarrierError::invalid("malformed hash record digest"))?;
        Ok(Self { version, alg, iterations, salt, digest })
    }
}

/// Registry of password-hashing parameter sets plus loaded pepper material.
pub struct HashService {
    current_version: u32,
    params: HashMap<u32, HashParams>,
    peppers: HashMap<u32, Zeroizing<Vec<u8>>>,
}

impl HashService {
    /// Load the pepper for `current_version` (and any other registered
    /// version present) from `hash_pepper_v{n}` files under `pepper_dir`.
    /// `algorithm` is the hash category the caller intends to configure
    /// (spec.md §4.5, §8 Property 11 "configuring a banned hash category at
    /// startup refuses to start"); a banned or unsupported category is
    /// rejected here rather than silently assumed.
    pub fn load(pepper_dir: &Path, current_version: u32, algorithm: &str) -> BarrierResult<Self> {
        if is_banned(algorithm) {
            return Err(BarrierError::invalid(format!("hash category '{}' is not permitted", algorithm)));
        }
        if algorithm != ALG_TAG {
            return Err(BarrierError::invalid(format!("unsupported hash category '{}'", algorithm)));
        }
        let mut params = HashMap::new();
        params.insert(current_version, HashParams::current());

        let mut peppers = HashMap::new();
        let pepper_path = pepper_dir.join(format!("hash_pepper_v{}", current_version));
        let pepper = std::fs::read(&pepper_path)
            .map_err(|e| BarrierError::unavailable(format!("pepper unavailable for v{}: {}", current_version, e)))?;
        peppers.insert(current_version, Zeroizing::new(pepper));

        tracing::info!(version = current_version, "hash service loaded pepper");
        Ok(Self { current_version, params, peppers })
    }

    /// Register a historical version's parameters and pepper, so older
    /// records remain verifiable after an upgrade.
    pub fn register_historical(&mut self, version: u32, iterations: u32, pepper_dir: &Path) -> BarrierResult<()> {
        let pepper_path = pepper_dir.join(format!("hash_pepper_v{}", version));
        let pepper = std::fs::read(&pepper_path)
            .map_err(|e| BarrierError::unavailable(format!("pepper unavailable for v{}: {}", version, e)))?;
        self.peppers.insert(version, Zeroizing::new(pepper));
        self.params.insert(version, HashParams { alg: ALG_TAG.to_string(), iterations, salt_len: SALT_LEN, output_len: OUTPUT_LEN });
        Ok(())
    }

    /// Hash `password` under the current version.
    pub fn hash(&self, password: &str) -> BarrierResult<String> {
        self.hash_with_version(password, self.current_version)
    }

    fn hash_with_version(&self, password: &str, version: u32) -> BarrierResult<String> {
        let params = self.params.get(&version).ok_or_else(|| BarrierError::invalid("unknown-version"))?;
        let pepper = self.peppers.get(&version).ok_or_else(|| BarrierError::unavailable("pepper-unavailable"))?;
        let mut salt = vec![0u8; params.salt_len];
        OsRng.fill_bytes(&mut salt);
        let digest = derive(password, pepper, &salt, params.iterations, params.output_len);
        Ok(format!(
            "{}:{}:{}:{}:{}",
            version,
            params.alg,
            params.encode(),
            STANDARD_NO_PAD.encode(&salt),
            STANDARD_NO_PAD.encode(&digest),
        ))
    }

    /// Verify `password` against a stored record. `needs_upgrade` is true
    /// when the record's version predates the current one.
    pub fn verify(&self, hash_string: &str, password: &str) -> BarrierResult<(bool, bool)> {
        let record = HashRecord::parse(hash_string)?;
        if record.alg != ALG_TAG {
            return Err(BarrierError::invalid("unknown-version"));
        }
        let pepper = self
            .peppers
            .get(&record.version)
            .ok_or_else(|| BarrierError::unavailable("pepper-unavailable"))?;
        let candidate = derive(password, pepper, &record.salt, record.iterations, record.digest.len());
        let ok: bool = candidate.ct_eq(&record.digest).into();
        let needs_upgrade = ok && record.version != self.current_version;
        Ok((ok, needs_upgrade))
    }
}

fn derive(password: &str, pepper: &[u8], salt: &[u8], iterations: u32, output_len: usize) -> Vec<u8> {
    let mut peppered = Vec::with_capacity(password.len() + pepper.len());
    peppered.extend_from_slice(password.as_bytes());
    peppered.extend_from_slice(pepper);
    let mut out = vec![0u8; output_len];
    pbkdf2_hmac::<Sha256>(&peppered, salt, iterations, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pepper_dir_with(version: u32, bytes: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join(format!("hash_pepper_v{}", version))).unwrap();
        f.write_all(bytes).unwrap();
        dir
    }

    #[test]
    fn hash_then_verify_round_trips() {
        let dir = pepper_dir_with(CURRENT_VERSION, b"pepper-bytes-32-long-exactly!!!!");
        let svc = HashService::load(dir.path(), CURRENT_VERSION, ALGORITHM).unwrap();
        let record = svc.hash("correct horse battery staple").unwrap();
        let (ok, needs_upgrade) = svc.verify(&record, "correct horse battery staple").unwrap();
        assert!(ok);
        assert!(!needs_upgrade);
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let dir = pepper_dir_with(CURRENT_VERSION, b"pepper-bytes-32-long-exactly!!!!");
        let svc = HashService::load(dir.path(), CURRENT_VERSION, ALGORITHM).unwrap();
        let record = svc.hash("right-password").unwrap();
        let (ok, _) = svc.verify(&record, "wrong-password").unwrap();
        assert!(!ok);
    }

    #[test]
    fn different_pepper_breaks_verification() {
        let dir_a = pepper_dir_with(CURRENT_VERSION, b"pepper-aaaaaaaaaaaaaaaaaaaaaaaaa");
        let dir_b = pepper_dir_with(CURRENT_VERSION, b"pepper-bbbbbbbbbbbbbbbbbbbbbbbbb");
        let svc_a = HashService::load(dir_a.path(), CURRENT_VERSION, ALGORITHM).unwrap();
        let svc_b = HashService::load(dir_b.path(), CURRENT_VERSION, ALGORITHM).unwrap();
        let record = svc_a.hash("password").unwrap();
        let (ok, _) = svc_b.verify(&record, "password").unwrap();
        assert!(!ok);
    }

    #[test]
    fn historical_version_reports_needs_upgrade() {
        let next_version = CURRENT_VERSION + 1;
        let dir = pepper_dir_with(CURRENT_VERSION, b"pepper-v3-bytes-len-32-exactly!!");
        std::fs::write(dir.path().join(format!("hash_pepper_v{}", next_version)), b"pepper-v4-bytes-thirty-two-long!").unwrap();

        let old_record = HashService::load(dir.path(), CURRENT_VERSION, ALGORITHM).unwrap().hash("password").unwrap();

        let mut svc = HashService::load(dir.path(), next_version, ALGORITHM).unwrap();
        svc.register_historical(CURRENT_VERSION, ITERATIONS, dir.path()).unwrap();

        let (ok, needs_upgrade) = svc.verify(&old_record, "password").unwrap();
        assert!(ok);
        assert!(needs_upgrade);
    }

    #[test]
    fn banned_algorithms_are_rejected() {
        for alg in ["bcrypt", "scrypt", "argon2", "md5", "sha1", "des", "rc4"] {
            assert!(is_banned(alg));
        }
        assert!(!is_banned(ALG_TAG));
    }

    #[test]
    fn load_refuses_to_start_with_a_banned_category() {
        let dir = pepper_dir_with(CURRENT_VERSION, b"pepper-bytes-32-long-exactly!!!!");
        for alg in ["bcrypt", "scrypt", "argon2"] {
            let err = HashService::load(dir.path(), CURRENT_VERSION, alg).unwrap_err();
            assert!(matches!(err, BarrierError::Invalid(_)));
        }
    }

    #[test]
    fn load_refuses_an_unknown_category() {
        let dir = pepper_dir_with(CURRENT_VERSION, b"pepper-bytes-32-long-exactly!!!!");
        let err = HashService::load(dir.path(), CURRENT_VERSION, "whatever").unwrap_err();
        assert!(matches!(err, BarrierError::Invalid(_)));
    }
}
