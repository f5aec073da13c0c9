//! `UserService`: polymorphic registration/login over a caller-supplied
//! `UserModel` + `UserRepository` pair (spec §4.8).

use async_trait::async_trait;
use barrier_crypto::{BarrierError, BarrierResult};
use uuid::Uuid;

use std::sync::Arc;

use crate::barrier::BarrierService;

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;

/// Capability set a concrete user type must expose.
pub trait UserModel: Send + Sync {
    fn id(&self) -> Uuid;
    fn username(&self) -> &str;
    fn password_hash(&self) -> &str;
    fn set_password_hash(&mut self, hash: String);
}

#[async_trait]
pub trait UserRepository<U: UserModel>: Send + Sync {
    async fn create(&self, tenant_id: Uuid, username: &str, password_hash: &str) -> BarrierResult<U>;
    async fn find_by_username(&self, tenant_id: Uuid, username: &str) -> BarrierResult<Option<U>>;
    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> BarrierResult<Option<U>>;
    async fn update_password_hash(&self, tenant_id: Uuid, id: Uuid, password_hash: &str) -> BarrierResult<()>;
}

pub struct UserService<U, R>
where
    U: UserModel,
    R: UserRepository<U>,
{
    barrier: Arc<BarrierService>,
    repo: R,
    _marker: std::marker::PhantomData<U>,
}

impl<U, R> UserService<U, R>
where
    U: UserModel,
    R: UserRepository<U>,
{
    pub fn new(barrier: Arc<BarrierService>, repo: R) -> Self {
        Self { barrier, repo, _marker: std::marker::PhantomData }
    }

    fn validate_username(username: &str) -> BarrierResult<()> {
        if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&username.len()) {
            return Err(BarrierError::invalid(format!(
                "username must be {}..{} characters",
                MIN_USERNAME_LEN, MAX_USERNAME_LEN
            )));
        }
        Ok(())
    }

    /// Validate, check for a duplicate username, hash with the current
    /// version, and persist.
    pub async fn register(&self, tenant_id: Uuid, username: &str, password: &str) -> BarrierResult<U> {
        Self::validate_username(username)?;
        if password.is_empty() {
            return Err(BarrierError::invalid("password must not be empty"));
        }
        if self.repo.find_by_username(tenant_id, username).await?.is_some() {
            return Err(BarrierError::conflict("username already registered"));
        }
        let password_hash = self.barrier.hash_service().hash(password)?;
        self.repo.create(tenant_id, username, &password_hash).await
    }

    /// Verify credentials and return the subject id on success. If the
    /// stored hash is from an older version, rehashes and persists
    /// asynchronously (fire-and-forget from the caller's perspective).
    pub async fn login(&self, tenant_id: Uuid, username: &str, password: &str) -> BarrierResult<Uuid> {
        let user = self
            .repo
            .find_by_username(tenant_id, username)
            .await?
            .ok_or_else(|| BarrierError::unauthorized("invalid username or password"))?;
        let (ok, needs_upgrade) = self.barrier.hash_service().verify(user.password_hash(), password)?;
        if !ok {
            return Err(BarrierError::unauthorized("invalid username or password"));
        }
        if needs_upgrade {
            let upgraded = self.barrier.hash_service().hash(password)?;
            self.repo.update_password_hash(tenant_id, user.id(), &upgraded).await?;
        }
        Ok(user.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrier_crypto::hash::{HashService, ALGORITHM as HASH_ALGORITHM};
    use barrier_crypto::jose::{Jwk, JweAlg};
    use barrier_crypto::keygen::{KeyGen, KeyGenConfig};
    use barrier_crypto::unseal::{UnsealMode, UnsealService};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::repository::BarrierRepository;

    #[derive(Clone)]
    struct TestUser {
        id: Uuid,
        username: String,
        password_hash: String,
    }

    impl UserModel for TestUser {
        fn id(&self) -> Uuid {
            self.id
        }
        fn username(&self) -> &str {
            &self.username
        }
        fn password_hash(&self) -> &str {
            &self.password_hash
        }
        fn set_password_hash(&mut self, hash: String) {
            self.password_hash = hash;
        }
    }

    #[derive(Default)]
    struct InMemoryUsers {
        by_username: Mutex<HashMap<(Uuid, String), TestUser>>,
    }

    #[async_trait]
    impl UserRepository<TestUser> for InMemoryUsers {
        async fn create(&self, tenant_id: Uuid, username: &str, password_hash: &str) -> BarrierResult<TestUser> {
            let user = TestUser { id: Uuid::now_v7(), username: username.to_string(), password_hash: password_hash.to_string() };
            self.by_username.lock().unwrap().insert((tenant_id, username.to_string()), user.clone());
            Ok(user)
        }
        async fn find_by_username(&self, tenant_id: Uuid, username: &str) -> BarrierResult<Option<TestUser>> {
            Ok(self.by_username.lock().unwrap().get(&(tenant_id, username.to_string())).cloned())
        }
        async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> BarrierResult<Option<TestUser>> {
            Ok(self
                .by_username
                .lock()
                .unwrap()
                .iter()
                .find(|((t, _), u)| *t == tenant_id && u.id == id)
                .map(|(_, u)| u.clone()))
        }
        async fn update_password_hash(&self, tenant_id: Uuid, id: Uuid, password_hash: &str) -> BarrierResult<()> {
            let mut map = self.by_username.lock().unwrap();
            if let Some((_, entry)) = map.iter_mut().find(|((t, _), u)| *t == tenant_id && u.id == id) {
                entry.set_password_hash(password_hash.to_string());
            }
            Ok(())
        }
    }

    async fn barrier() -> Arc<BarrierService> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hash_pepper_v3"), b"pepper-bytes-thirty-two-long!!!").unwrap();
        let hash = HashService::load(dir.path(), 3, HASH_ALGORITHM).unwrap();
        let keygen = KeyGen::new(KeyGenConfig::default());
        let unseal = UnsealService::boot(UnsealMode::Simple(vec![Jwk::generate("u1", JweAlg::A256GcmKw)])).unwrap();
        let repo = BarrierRepository::connect("sqlite::memory:").await.unwrap();
        repo.migrate().await.unwrap();
        Arc::new(BarrierService::bootstrap(hash, keygen, unseal, repo, true).await.unwrap())
    }

    #[tokio::test]
    async fn register_rejects_short_username() {
        let barrier = barrier().await;
        let svc = UserService::new(barrier, InMemoryUsers::default());
        let err = svc.register(Uuid::now_v7(), "ab", "password123").await.unwrap_err();
        assert!(matches!(err, BarrierError::Invalid(_)));
    }

    #[tokio::test]
    async fn register_then_login_succeeds() {
        let barrier = barrier().await;
        let svc = UserService::new(barrier, InMemoryUsers::default());
        let tenant = Uuid::now_v7();
        let user = svc.register(tenant, "alice", "hunter222").await.unwrap();
        let subject = svc.login(tenant, "alice", "hunter222").await.unwrap();
        assert_eq!(subject, user.id);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let barrier = barrier().await;
        let svc = UserService::new(barrier, InMemoryUsers::default());
        let tenant = Uuid::now_v7();
        svc.register(tenant, "alice", "hunter222").await.unwrap();
        let err = svc.login(tenant, "alice", "wrong-password").await.unwrap_err();
        assert!(matches!(err, BarrierError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_username() {
        let barrier = barrier().await;
        let svc = UserService::new(barrier, InMemoryUsers::default());
        let tenant = Uuid::now_v7();
        svc.register(tenant, "alice", "hunter222").await.unwrap();
        let err = svc.register(tenant, "alice", "another-pass").await.unwrap_err();
        assert!(matches!(err, BarrierError::Conflict(_)));
    }
}
