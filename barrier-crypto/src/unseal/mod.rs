//! Unseal key assembly (spec §4.3): produces the set of outermost wrapping
//! keys at process start, in exactly one of three modes. Never persists
//! anything; idempotent within a process because the computed keys are
//! cached on the service after the first (and only) assembly.

pub mod shamir;

use std::path::PathBuf;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::{BarrierError, BarrierResult};
use crate::jose::{Jwk, JweAlg};

const SHARED_SECRET_INFO: &[u8] = b"barrier-unseal-shared-v1";
const FINGERPRINT_INFO: &[u8] = b"barrier-unseal-fingerprint-v1";

/// Selects how the unseal key set is assembled at boot.
pub enum UnsealMode {
    /// Keys supplied directly (test/dev).
    Simple(Vec<Jwk>),
    /// `m` shares out of `share_paths` reconstruct a secret, from which a
    /// single unseal key is derived by HKDF-SHA-256.
    SharedSecret { m: u8, share_paths: Vec<PathBuf> },
    /// Derives a single unseal key from stable host identifiers. Dev-only.
    Fingerprint,
}

pub struct UnsealService {
    keys: Vec<Jwk>,
}

impl UnsealService {
    /// Assemble the unseal key set for `mode`. All failure modes are fatal
    /// at boot (spec §4.3).
    pub fn boot(mode: UnsealMode) -> BarrierResult<Self> {
        let keys = match mode {
            UnsealMode::Simple(keys) => {
                if keys.is_empty() {
                    return Err(BarrierError::fatal("insufficient-shares: simple mode requires at least one key"));
                }
                keys
            }
            UnsealMode::SharedSecret { m, share_paths } => vec![Self::assemble_shared_secret(m, &share_paths)?],
            UnsealMode::Fingerprint => vec![Self::assemble_fingerprint()?],
        };
        tracing::info!(count = keys.len(), "unseal key set assembled");
        Ok(Self { keys })
    }

    /// The assembled unseal keys, in no particular order (spec §4.3:
    /// "insertion order irrelevant").
    pub fn keys(&self) -> &[Jwk] {
        &self.keys
    }

    fn assemble_shared_secret(m: u8, share_paths: &[PathBuf]) -> BarrierResult<Jwk> {
        if share_paths.is_empty() {
            return Err(BarrierError::fatal("insufficient-shares: no share files configured"));
        }
        let mut shares = Vec::with_capacity(share_paths.len());
        for path in share_paths {
            let bytes = std::fs::read(path)
                .map_err(|e| BarrierError::fatal(format!("unreadable-share: {}: {}", path.display(), e)))?;
            let share = shamir::Share::from_bytes(&bytes).map_err(|e| BarrierError::fatal(format!("invalid-share: {}", e)))?;
            shares.push(share);
        }
        if (shares.len() as u8) < m {
            return Err(BarrierError::fatal(format!(
                "insufficient-shares: need {}, found {} readable share files",
                m,
                shares.len()
            )));
        }
        let secret = shamir::combine(&shares).map_err(|e| BarrierError::fatal(format!("invalid-share: {}", e)))?;
        let derived = hkdf_derive(&secret, SHARED_SECRET_INFO);
        Ok(Jwk::new("unseal-shared", JweAlg::A256GcmKw, derived))
    }

    fn assemble_fingerprint() -> BarrierResult<Jwk> {
        let mut identifiers = Vec::new();

        let net_dir = std::fs::read_dir("/sys/class/net").map_err(|e| {
            BarrierError::fatal(format!("fingerprint-unavailable: cannot enumerate network interfaces: {}", e))
        })?;
        for entry in net_dir.flatten() {
            let address_path = entry.path().join("address");
            if let Ok(mac) = std::fs::read_to_string(&address_path) {
                let mac = mac.trim().to_ascii_lowercase();
                if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                    identifiers.push(mac);
                }
            }
        }
        if identifiers.is_empty() {
            return Err(BarrierError::fatal("fingerprint-unavailable: no usable network interfaces found"));
        }
        identifiers.sort();

        let machine_id = std::fs::read_to_string("/etc/machine-id")
            .map_err(|e| BarrierError::fatal(format!("fingerprint-unavailable: cannot read /etc/machine-id: {}", e)))?;
        identifiers.push(machine_id.trim().to_string());

        let mut hasher = Sha256::new();
        for id in &identifiers {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
        }
        let seed = hasher.finalize();
        let derived = hkdf_derive(&seed, FINGERPRINT_INFO);
        Ok(Jwk::new("unseal-fingerprint", JweAlg::A256GcmKw, derived))
    }
}

fn hkdf_derive(secret: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).expect("32-byte output is within HKDF-SHA-256's valid range");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unseal::shamir::split;

    #[test]
    fn simple_mode_requires_at_least_one_key() {
        assert!(matches!(UnsealService::boot(UnsealMode::Simple(vec![])), Err(BarrierError::Fatal(_))));
    }

    #[test]
    fn simple_mode_passes_through_keys() {
        let key = Jwk::generate("u1", JweAlg::A256GcmKw);
        let svc = UnsealService::boot(UnsealMode::Simple(vec![key])).unwrap();
        assert_eq!(svc.keys().len(), 1);
        assert_eq!(svc.keys()[0].kid, "u1");
    }

    #[test]
    fn shared_secret_mode_reconstructs_from_m_of_n_shares() {
        let dir = tempfile::tempdir().unwrap();
        let secret = [5u8; 32];
        let shares = split(&secret, 2, 3).unwrap();
        let mut paths = Vec::new();
        for (i, share) in shares.iter().enumerate() {
            let path = dir.path().join(format!("share-{}.json", i));
            std::fs::write(&path, share.to_bytes()).unwrap();
            paths.push(path);
        }
        // Only present 2 of the 3 share files; m=2 should still succeed.
        let present = vec![paths[0].clone(), paths[2].clone()];
        let svc = UnsealService::boot(UnsealMode::SharedSecret { m: 2, share_paths: present }).unwrap();
        assert_eq!(svc.keys().len(), 1);
        assert_eq!(svc.keys()[0].kid, "unseal-shared");
    }

    #[test]
    fn shared_secret_mode_fails_fatally_with_too_few_shares() {
        let dir = tempfile::tempdir().unwrap();
        let secret = [9u8; 32];
        let shares = split(&secret, 3, 3).unwrap();
        let path = dir.path().join("share-0.json");
        std::fs::write(&path, shares[0].to_bytes()).unwrap();
        let result = UnsealService::boot(UnsealMode::SharedSecret { m: 3, share_paths: vec![path] });
        assert!(matches!(result, Err(BarrierError::Fatal(_))));
    }

    #[test]
    fn shared_secret_mode_is_share_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let secret = [3u8; 32];
        let shares = split(&secret, 2, 3).unwrap();
        let mut paths = Vec::new();
        for (i, share) in shares.iter().enumerate() {
            let path = dir.path().join(format!("share-{}.json", i));
            std::fs::write(&path, share.to_bytes()).unwrap();
            paths.push(path);
        }
        let forward = vec![paths[0].clone(), paths[1].clone()];
        let backward = vec![paths[1].clone(), paths[0].clone()];
        let a = UnsealService::boot(UnsealMode::SharedSecret { m: 2, share_paths: forward }).unwrap();
        let b = UnsealService::boot(UnsealMode::SharedSecret { m: 2, share_paths: backward }).unwrap();
        assert_eq!(a.keys()[0].key_bytes(), b.keys()[0].key_bytes());
    }
}
