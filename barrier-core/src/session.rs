//! `SessionService`: browser/service token issuance and validation
//! (spec §4.8), signed with a barrier-protected signing key.

use barrier_crypto::jose::{self, CompactJwe, Jwk, JweAlg};
use barrier_crypto::keygen::{GeneratedKey, KeyGen, KeyKind};
use barrier_crypto::{BarrierError, BarrierResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;

use crate::barrier::BarrierService;

const DEFAULT_BROWSER_TTL_MINUTES: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    #[serde(rename = "browser")]
    Browser,
    #[serde(rename = "service")]
    Service,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub tenant: Uuid,
    pub realm: Uuid,
    pub kind: SessionKind,
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates session tokens. The signing key is itself
/// barrier-protected: its raw bytes are generated once, wrapped and
/// persisted as application ciphertext via `BarrierService::encrypt`, and
/// unwrapped on each process start via `BarrierService::decrypt`.
pub struct SessionService {
    barrier: Arc<BarrierService>,
    signing_key: Jwk,
    signing_key_storage: CompactJwe,
}

impl SessionService {
    /// Generate a fresh signing key and protect it under the barrier.
    pub async fn bootstrap_new_signing_key(barrier: Arc<BarrierService>, keygen: &KeyGen) -> BarrierResult<Self> {
        let bytes = match keygen.get(KeyKind::Hmac256, std::time::Duration::from_secs(10))? {
            GeneratedKey::Symmetric { bytes, .. } => bytes,
            _ => return Err(BarrierError::fatal("key generator returned unexpected kind for HMAC-256")),
        };
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| BarrierError::fatal("signing key has unexpected length"))?;
        let signing_key_storage = barrier.encrypt(&bytes).await?;
        let kid = signing_key_storage.peek_kid()?;
        Ok(Self { barrier, signing_key: Jwk::new(kid, JweAlg::Dir, bytes), signing_key_storage })
    }

    /// Restore a `SessionService` from a previously persisted, barrier-
    /// wrapped signing key.
    pub async fn from_storage(barrier: Arc<BarrierService>, signing_key_storage: CompactJwe) -> BarrierResult<Self> {
        let bytes = barrier.decrypt(&signing_key_storage).await?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| BarrierError::corruption("signing key has unexpected length"))?;
        let kid = signing_key_storage.peek_kid()?;
        Ok(Self { barrier, signing_key: Jwk::new(kid, JweAlg::Dir, bytes), signing_key_storage })
    }

    pub fn storage(&self) -> &CompactJwe {
        &self.signing_key_storage
    }

    /// Issue a short-lived browser-session token.
    pub fn issue_browser(&self, subject: Uuid, tenant: Uuid, realm: Uuid) -> BarrierResult<CompactJwe> {
        self.issue(subject, tenant, realm, SessionKind::Browser, ChronoDuration::minutes(DEFAULT_BROWSER_TTL_MINUTES))
    }

    /// Issue a service-to-service token.
    pub fn issue_service(&self, subject: Uuid, tenant: Uuid, realm: Uuid, ttl: ChronoDuration) -> BarrierResult<CompactJwe> {
        self.issue(subject, tenant, realm, SessionKind::Service, ttl)
    }

    fn issue(&self, subject: Uuid, tenant: Uuid, realm: Uuid, kind: SessionKind, ttl: ChronoDuration) -> BarrierResult<CompactJwe> {
        let claims = SessionClaims { sub: subject, tenant, realm, kind, expires_at: Utc::now() + ttl };
        let payload = serde_json::to_vec(&claims).map_err(|e| BarrierError::fatal(format!("claims serialization: {}", e)))?;
        jose::encrypt_direct(&self.signing_key, &payload)
    }

    /// Validate a token signed by the current signing key, rejecting
    /// expired tokens and tokens from a signing key that is no longer this
    /// one (e.g. after a forced purge — the caller is expected to try
    /// `from_storage` against whichever key is still loadable).
    pub fn validate(&self, token: &CompactJwe) -> BarrierResult<SessionClaims> {
        if token.peek_kid()? != self.signing_key.kid {
            return Err(BarrierError::unauthorized("token was not signed by the active signing key"));
        }
        let payload = jose::decrypt_direct(&self.signing_key, token)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|e| BarrierError::invalid(format!("malformed session claims: {}", e)))?;
        if claims.expires_at < Utc::now() {
            return Err(BarrierError::unauthorized("session token expired"));
        }
        Ok(claims)
    }
}
