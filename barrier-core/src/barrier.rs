//! `BarrierService`: bootstrap, cache, encrypt/decrypt, and rotation for the
//! three-tier key hierarchy (spec §4.2).

use std::time::Duration;

use barrier_crypto::hash::{HashService, ALGORITHM as HASH_ALGORITHM};
use barrier_crypto::jose::{self, CompactJwe, Jwk, JweAlg, MultiRecipientJwe};
use barrier_crypto::keygen::{GeneratedKey, KeyGen, KeyKind};
use barrier_crypto::unseal::UnsealService;
use barrier_crypto::{BarrierError, BarrierResult};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::repository::{BarrierRepository, Tier};

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(10);

struct ActiveKeys {
    root: Jwk,
    root_created_at: DateTime<Utc>,
    intermediate: Jwk,
    intermediate_created_at: DateTime<Utc>,
    content: Jwk,
    content_created_at: DateTime<Utc>,
}

/// Snapshot of the active key at every tier (spec §4.2 `status()`).
#[derive(Clone, Debug)]
pub struct BarrierStatus {
    pub root_kid: Uuid,
    pub root_created_at: DateTime<Utc>,
    pub intermediate_kid: Uuid,
    pub intermediate_created_at: DateTime<Utc>,
    pub content_kid: Uuid,
    pub content_created_at: DateTime<Utc>,
}

pub struct BarrierService {
    hash: HashService,
    keygen: KeyGen,
    unseal: UnsealService,
    repo: BarrierRepository,
    cache: RwLock<ActiveKeys>,
    rotate_root: Mutex<()>,
    rotate_intermediate: Mutex<()>,
    rotate_content: Mutex<()>,
}

impl BarrierService {
    /// Bootstrap sequence (spec §4.2): load-or-create root under the
    /// unseal keys, then intermediate under root, then content under
    /// intermediate, caching all three under one lock.
    pub async fn bootstrap(
        hash: HashService,
        keygen: KeyGen,
        unseal: UnsealService,
        repo: BarrierRepository,
        create_if_empty: bool,
    ) -> BarrierResult<Self> {
        let (root, root_created_at) = Self::load_or_create_root(&keygen, &unseal, &repo, create_if_empty).await?;
        let (intermediate, intermediate_created_at) =
            Self::load_or_create_intermediate(&keygen, &repo, &root, create_if_empty).await?;
        let (content, content_created_at) =
            Self::load_or_create_content(&keygen, &repo, &intermediate, create_if_empty).await?;

        tracing::info!(
            root_kid = %root.kid,
            intermediate_kid = %intermediate.kid,
            content_kid = %content.kid,
            "barrier bootstrapped"
        );

        Ok(Self {
            hash,
            keygen,
            unseal,
            repo,
            cache: RwLock::new(ActiveKeys {
                root,
                root_created_at,
                intermediate,
                intermediate_created_at,
                content,
                content_created_at,
            }),
            rotate_root: Mutex::new(()),
            rotate_intermediate: Mutex::new(()),
            rotate_content: Mutex::new(()),
        })
    }

    pub fn hash_service(&self) -> &HashService {
        &self.hash
    }

    async fn fresh_aes256(keygen: &KeyGen) -> BarrierResult<[u8; 32]> {
        match keygen.get(KeyKind::Aes256, KEYGEN_TIMEOUT)? {
            GeneratedKey::Symmetric { bytes, .. } => {
                bytes.try_into().map_err(|_| BarrierError::fatal("generated AES-256 key has unexpected length"))
            }
            _ => Err(BarrierError::fatal("key generator returned unexpected key kind for AES-256")),
        }
    }

    async fn fresh_kid(keygen: &KeyGen) -> BarrierResult<Uuid> {
        match keygen.get(KeyKind::UuidV7, KEYGEN_TIMEOUT)? {
            GeneratedKey::UuidV7(id) => Ok(id),
            _ => Err(BarrierError::fatal("key generator returned unexpected key kind for UUIDv7")),
        }
    }

    async fn load_or_create_root(
        keygen: &KeyGen,
        unseal: &UnsealService,
        repo: &BarrierRepository,
        create_if_empty: bool,
    ) -> BarrierResult<(Jwk, DateTime<Utc>)> {
        let row = match repo.get_active(Tier::Root).await? {
            Some(row) => row,
            None if create_if_empty => {
                let bytes = Self::fresh_aes256(keygen).await?;
                let kid = Self::fresh_kid(keygen).await?;
                let envelope = jose::wrap_key_multi(unseal.keys(), &bytes)?;
                let serialized = String::from_utf8(envelope.to_bytes())
                    .map_err(|_| BarrierError::fatal("root envelope is not valid UTF-8"))?;
                let created_at = Utc::now();
                repo.insert_active(Tier::Root, kid, &serialized, None, created_at).await?;
                repo.get_active(Tier::Root).await?.ok_or_else(|| BarrierError::fatal("root row vanished after insert"))?
            }
            None => return Err(BarrierError::sealed("no root key exists and create_if_empty is false")),
        };
        let envelope = MultiRecipientJwe::from_bytes(row.serialized.as_bytes())
            .map_err(|e| BarrierError::corruption(format!("malformed root envelope: {}", e)))?;
        let bytes = jose::unwrap_key_multi_any(unseal.keys(), &envelope)?;
        Ok((Jwk::new(row.kid.to_string(), JweAlg::A256GcmKw, bytes), row.created_at))
    }

    async fn load_or_create_intermediate(
        keygen: &KeyGen,
        repo: &BarrierRepository,
        root: &Jwk,
        create_if_empty: bool,
    ) -> BarrierResult<(Jwk, DateTime<Utc>)> {
        let root_kid = Uuid::parse_str(&root.kid).expect("root kid is always a valid UUID");
        let row = match repo.get_active(Tier::Intermediate).await? {
            Some(row) => row,
            None if create_if_empty => {
                let bytes = Self::fresh_aes256(keygen).await?;
                let kid = Self::fresh_kid(keygen).await?;
                let jwe = jose::wrap_key(root, &bytes)?;
                let created_at = Utc::now();
                repo.insert_active(Tier::Intermediate, kid, jwe.as_str(), Some(root_kid), created_at).await?;
                repo.get_active(Tier::Intermediate)
                    .await?
                    .ok_or_else(|| BarrierError::fatal("intermediate row vanished after insert"))?
            }
            None => return Err(BarrierError::sealed("no intermediate key exists and create_if_empty is false")),
        };
        let jwe = CompactJwe::parse(row.serialized.clone())?;
        let bytes = jose::unwrap_key(root, &jwe)?;
        Ok((Jwk::new(row.kid.to_string(), JweAlg::A256GcmKw, bytes), row.created_at))
    }

    async fn load_or_create_content(
        keygen: &KeyGen,
        repo: &BarrierRepository,
        intermediate: &Jwk,
        create_if_empty: bool,
    ) -> BarrierResult<(Jwk, DateTime<Utc>)> {
        let intermediate_kid = Uuid::parse_str(&intermediate.kid).expect("intermediate kid is always a valid UUID");
        let row = match repo.get_active(Tier::Content).await? {
            Some(row) => row,
            None if create_if_empty => {
                let bytes = Self::fresh_aes256(keygen).await?;
                let kid = Self::fresh_kid(keygen).await?;
                let jwe = jose::wrap_key(intermediate, &bytes)?;
                let created_at = Utc::now();
                repo.insert_active(Tier::Content, kid, jwe.as_str(), Some(intermediate_kid), created_at).await?;
                repo.get_active(Tier::Content).await?.ok_or_else(|| BarrierError::fatal("content row vanished after insert"))?
            }
            None => return Err(BarrierError::sealed("no content key exists and create_if_empty is false")),
        };
        let jwe = CompactJwe::parse(row.serialized.clone())?;
        let bytes = jose::unwrap_key(intermediate, &jwe)?;
        Ok((Jwk::new(row.kid.to_string(), JweAlg::Dir, bytes), row.created_at))
    }

    /// Encrypt `plaintext` under the currently active content key.
    pub async fn encrypt(&self, plaintext: &[u8]) -> BarrierResult<CompactJwe> {
        let cache = self.cache.read().await;
        jose::encrypt_direct(&cache.content, plaintext)
    }

    /// Decrypt `jwe`, resolving its content key by `kid` whether active or
    /// historical, walking up to intermediate/root as needed.
    pub async fn decrypt(&self, jwe: &CompactJwe) -> BarrierResult<Vec<u8>> {
        let kid = Uuid::parse_str(&jwe.peek_kid()?).map_err(|e| BarrierError::invalid(format!("bad kid: {}", e)))?;
        let content_key = self.resolve_content_key(kid).await?;
        jose::decrypt_direct(&content_key, jwe)
    }

    async fn resolve_content_key(&self, kid: Uuid) -> BarrierResult<Jwk> {
        {
            let cache = self.cache.read().await;
            if cache.content.kid == kid.to_string() {
                return Ok(cache.content.clone());
            }
        }
        let row = self
            .repo
            .get_by_kid(Tier::Content, kid)
            .await?
            .ok_or_else(|| BarrierError::not_found("unknown content kid"))?;
        let parent_kid = row.parent_kid.ok_or_else(|| BarrierError::corruption("content row missing parent_kid"))?;
        let intermediate_key = self.resolve_intermediate_key(parent_kid).await?;
        let jwe = CompactJwe::parse(row.serialized)?;
        let bytes = jose::unwrap_key(&intermediate_key, &jwe)?;
        Ok(Jwk::new(row.kid.to_string(), JweAlg::Dir, bytes))
    }

    async fn resolve_intermediate_key(&self, kid: Uuid) -> BarrierResult<Jwk> {
        {
            let cache = self.cache.read().await;
            if cache.intermediate.kid == kid.to_string() {
                return Ok(cache.intermediate.clone());
            }
        }
        let row = self
            .repo
            .get_by_kid(Tier::Intermediate, kid)
            .await?
            .ok_or_else(|| BarrierError::not_found("unknown intermediate kid"))?;
        let parent_kid = row.parent_kid.ok_or_else(|| BarrierError::corruption("intermediate row missing parent_kid"))?;
        let root_key = self.resolve_root_key(parent_kid).await?;
        let jwe = CompactJwe::parse(row.serialized)?;
        let bytes = jose::unwrap_key(&root_key, &jwe)?;
        Ok(Jwk::new(row.kid.to_string(), JweAlg::A256GcmKw, bytes))
    }

    async fn resolve_root_key(&self, kid: Uuid) -> BarrierResult<Jwk> {
        {
            let cache = self.cache.read().await;
            if cache.root.kid == kid.to_string() {
                return Ok(cache.root.clone());
            }
        }
        let row = self.repo.get_by_kid(Tier::Root, kid).await?.ok_or_else(|| BarrierError::not_found("unknown root kid"))?;
        let envelope = MultiRecipientJwe::from_bytes(row.serialized.as_bytes())
            .map_err(|e| BarrierError::corruption(format!("malformed root envelope: {}", e)))?;
        let bytes = jose::unwrap_key_multi_any(self.unseal.keys(), &envelope)
            .map_err(|_| BarrierError::sealed("historical root is not openable by any currently available unseal key"))?;
        Ok(Jwk::new(row.kid.to_string(), JweAlg::A256GcmKw, bytes))
    }

    /// Generate a new content key wrapped under the active intermediate,
    /// insert it as active, and update the cache. Leaves the intermediate
    /// and root tiers untouched.
    pub async fn rotate_content(&self) -> BarrierResult<Uuid> {
        let _guard = self.rotate_content.lock().await;
        let intermediate = {
            let cache = self.cache.read().await;
            cache.intermediate.clone()
        };
        let intermediate_kid = Uuid::parse_str(&intermediate.kid).expect("intermediate kid is always valid");
        let bytes = Self::fresh_aes256(&self.keygen).await?;
        let kid = Self::fresh_kid(&self.keygen).await?;
        let jwe = jose::wrap_key(&intermediate, &bytes)?;
        let created_at = Utc::now();
        self.repo.insert_active(Tier::Content, kid, jwe.as_str(), Some(intermediate_kid), created_at).await?;

        let mut cache = self.cache.write().await;
        cache.content = Jwk::new(kid.to_string(), JweAlg::Dir, bytes);
        cache.content_created_at = created_at;
        tracing::info!(%kid, "content key rotated");
        Ok(kid)
    }

    /// Generate a new intermediate key wrapped under the active root,
    /// insert it as active, and update the cache. Existing content rows
    /// remain decryptable: their header still names the prior intermediate
    /// kid, which stays loadable as a historical row.
    pub async fn rotate_intermediate(&self) -> BarrierResult<Uuid> {
        let _guard = self.rotate_intermediate.lock().await;
        let root = {
            let cache = self.cache.read().await;
            cache.root.clone()
        };
        let root_kid = Uuid::parse_str(&root.kid).expect("root kid is always valid");
        let bytes = Self::fresh_aes256(&self.keygen).await?;
        let kid = Self::fresh_kid(&self.keygen).await?;
        let jwe = jose::wrap_key(&root, &bytes)?;
        let created_at = Utc::now();
        self.repo.insert_active(Tier::Intermediate, kid, jwe.as_str(), Some(root_kid), created_at).await?;

        let mut cache = self.cache.write().await;
        cache.intermediate = Jwk::new(kid.to_string(), JweAlg::A256GcmKw, bytes);
        cache.intermediate_created_at = created_at;
        tracing::info!(%kid, "intermediate key rotated");
        Ok(kid)
    }

    /// Generate a new root key, re-encrypt it to every currently available
    /// unseal key, and insert it as active. Does not rewrap existing
    /// intermediate records.
    pub async fn rotate_root(&self) -> BarrierResult<Uuid> {
        let _guard = self.rotate_root.lock().await;
        let bytes = Self::fresh_aes256(&self.keygen).await?;
        let kid = Self::fresh_kid(&self.keygen).await?;
        let envelope = jose::wrap_key_multi(self.unseal.keys(), &bytes)?;
        let serialized =
            String::from_utf8(envelope.to_bytes()).map_err(|_| BarrierError::fatal("root envelope is not valid UTF-8"))?;
        let created_at = Utc::now();
        self.repo.insert_active(Tier::Root, kid, &serialized, None, created_at).await?;

        let mut cache = self.cache.write().await;
        cache.root = Jwk::new(kid.to_string(), JweAlg::A256GcmKw, bytes);
        cache.root_created_at = created_at;
        tracing::info!(%kid, "root key rotated");
        Ok(kid)
    }

    pub async fn status(&self) -> BarrierStatus {
        let cache = self.cache.read().await;
        BarrierStatus {
            root_kid: Uuid::parse_str(&cache.root.kid).expect("root kid is always valid"),
            root_created_at: cache.root_created_at,
            intermediate_kid: Uuid::parse_str(&cache.intermediate.kid).expect("intermediate kid is always valid"),
            intermediate_created_at: cache.intermediate_created_at,
            content_kid: Uuid::parse_str(&cache.content.kid).expect("content kid is always valid"),
            content_created_at: cache.content_created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrier_crypto::keygen::KeyGenConfig;
    use barrier_crypto::unseal::UnsealMode;

    async fn bootstrap_service() -> BarrierService {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hash_pepper_v3"), b"pepper-bytes-thirty-two-long!!!").unwrap();
        let hash = HashService::load(dir.path(), 3, HASH_ALGORITHM).unwrap();
        let keygen = KeyGen::new(KeyGenConfig::default());
        let unseal = UnsealService::boot(UnsealMode::Simple(vec![Jwk::generate("u1", JweAlg::A256GcmKw)])).unwrap();
        let repo = BarrierRepository::connect("sqlite::memory:").await.unwrap();
        repo.migrate().await.unwrap();
        BarrierService::bootstrap(hash, keygen, unseal, repo, true).await.unwrap()
    }

    #[tokio::test]
    async fn bootstrap_then_encrypt_decrypt_round_trips() {
        let svc = bootstrap_service().await;
        let jwe = svc.encrypt(b"top secret").await.unwrap();
        let plaintext = svc.decrypt(&jwe).await.unwrap();
        assert_eq!(plaintext, b"top secret");
    }

    #[tokio::test]
    async fn rotate_content_keeps_old_ciphertext_decryptable() {
        let svc = bootstrap_service().await;
        let old_jwe = svc.encrypt(b"before rotation").await.unwrap();

        svc.rotate_content().await.unwrap();

        let still_works = svc.decrypt(&old_jwe).await.unwrap();
        assert_eq!(still_works, b"before rotation");

        let new_jwe = svc.encrypt(b"after rotation").await.unwrap();
        assert_ne!(old_jwe.peek_kid().unwrap(), new_jwe.peek_kid().unwrap());
    }

    #[tokio::test]
    async fn rotate_intermediate_keeps_content_decryptable() {
        let svc = bootstrap_service().await;
        let jwe = svc.encrypt(b"spans a rotation").await.unwrap();

        svc.rotate_intermediate().await.unwrap();

        let plaintext = svc.decrypt(&jwe).await.unwrap();
        assert_eq!(plaintext, b"spans a rotation");
    }

    #[tokio::test]
    async fn rotate_root_keeps_content_decryptable() {
        let svc = bootstrap_service().await;
        let jwe = svc.encrypt(b"spans a root rotation").await.unwrap();

        svc.rotate_root().await.unwrap();

        let plaintext = svc.decrypt(&jwe).await.unwrap();
        assert_eq!(plaintext, b"spans a root rotation");
    }

    #[tokio::test]
    async fn status_reflects_current_active_kids() {
        let svc = bootstrap_service().await;
        let before = svc.status().await;
        svc.rotate_content().await.unwrap();
        let after = svc.status().await;
        assert_eq!(before.root_kid, after.root_kid);
        assert_eq!(before.intermediate_kid, after.intermediate_kid);
        assert_ne!(before.content_kid, after.content_kid);
    }

    #[tokio::test]
    async fn sealed_without_create_if_empty_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hash_pepper_v3"), b"pepper-bytes-thirty-two-long!!!").unwrap();
        let hash = HashService::load(dir.path(), 3, HASH_ALGORITHM).unwrap();
        let keygen = KeyGen::new(KeyGenConfig::default());
        let unseal = UnsealService::boot(UnsealMode::Simple(vec![Jwk::generate("u1", JweAlg::A256GcmKw)])).unwrap();
        let repo = BarrierRepository::connect("sqlite::memory:").await.unwrap();
        repo.migrate().await.unwrap();
        let result = BarrierService::bootstrap(hash, keygen, unseal, repo, false).await;
        assert!(matches!(result, Err(BarrierError::Sealed(_))));
    }
}
