//! `RealmService`: multi-tenant realm lifecycle (spec §4.7). Schema-per-realm
//! isolation; tenant-isolation middleware logic without the HTTP layer that
//! would call it (out of scope).

use barrier_crypto::{BarrierError, BarrierResult};
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

const REALM_SCHEMA_MIGRATION: &str = include_str!("../migrations/realm_schema/2001_create_users.sql");

fn db_err(e: sqlx::Error) -> BarrierError {
    BarrierError::unavailable(format!("database error: {}", e))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealmStatus {
    Active,
    Suspended,
    Deleted,
}

impl RealmStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RealmStatus::Active => "active",
            RealmStatus::Suspended => "suspended",
            RealmStatus::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> BarrierResult<Self> {
        match s {
            "active" => Ok(RealmStatus::Active),
            "suspended" => Ok(RealmStatus::Suspended),
            "deleted" => Ok(RealmStatus::Deleted),
            other => Err(BarrierError::corruption(format!("unknown realm status '{}'", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Product {
    Cipher,
    Jose,
    Pki,
    Identity,
    Sm,
}

impl Product {
    fn as_str(&self) -> &'static str {
        match self {
            Product::Cipher => "cipher",
            Product::Jose => "jose",
            Product::Pki => "pki",
            Product::Identity => "identity",
            Product::Sm => "sm",
        }
    }

    fn parse(s: &str) -> BarrierResult<Self> {
        match s {
            "cipher" => Ok(Product::Cipher),
            "jose" => Ok(Product::Jose),
            "pki" => Ok(Product::Pki),
            "identity" => Ok(Product::Identity),
            "sm" => Ok(Product::Sm),
            other => Err(BarrierError::corruption(format!("unknown product '{}'", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Realm {
    pub id: Uuid,
    pub schema_name: String,
    pub name: String,
    pub description: Option<String>,
    pub status: RealmStatus,
    pub product: Product,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Realm {
    fn from_row(row: &sqlx::any::AnyRow) -> BarrierResult<Self> {
        let id: String = row.try_get("id").map_err(db_err)?;
        let created_at: String = row.try_get("created_at").map_err(db_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
        let deleted_at: Option<String> = row.try_get("deleted_at").map_err(db_err)?;
        Ok(Self {
            id: Uuid::parse_str(&id).map_err(|e| BarrierError::corruption(format!("bad realm id: {}", e)))?,
            schema_name: row.try_get("schema_name").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            status: RealmStatus::parse(&row.try_get::<String, _>("status").map_err(db_err)?)?,
            product: Product::parse(&row.try_get::<String, _>("product").map_err(db_err)?)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            deleted_at: deleted_at.map(|s| parse_ts(&s)).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> BarrierResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BarrierError::corruption(format!("bad timestamp: {}", e)))
}

/// `"realm_<base32 of a UUIDv7>"` (spec §4.7).
fn schema_name_for(id: Uuid) -> String {
    let encoded = data_encoding::BASE32_NOPAD.encode(id.as_bytes()).to_ascii_lowercase();
    format!("realm_{}", encoded)
}

pub struct RealmService {
    pool: AnyPool,
}

impl RealmService {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Allocate a fresh schema, bootstrap it with the per-service schema
    /// migration, and record metadata in `public.realms`.
    pub async fn create(&self, id: Uuid, name: &str, description: Option<&str>, product: Product) -> BarrierResult<Realm> {
        let schema_name = schema_name_for(id);
        let now = Utc::now();

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema_name)).execute(&self.pool).await.ok();
        // SQLite has no CREATE SCHEMA; table names are prefixed instead.
        let users_table = format!("{}_users", schema_name);
        let bootstrap_sql = REALM_SCHEMA_MIGRATION.replace("users", &users_table);
        for statement in bootstrap_sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_err)?;
        }

        sqlx::query(
            "INSERT INTO realms (id, schema_name, name, description, status, product, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, 'active', ?, ?, ?, NULL)",
        )
        .bind(id.to_string())
        .bind(&schema_name)
        .bind(name)
        .bind(description)
        .bind(product.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::info!(%id, schema = %schema_name, "realm created");
        self.get(id).await?.ok_or_else(|| BarrierError::fatal("realm vanished after insert"))
    }

    pub async fn get(&self, id: Uuid) -> BarrierResult<Option<Realm>> {
        let row = sqlx::query("SELECT * FROM realms WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Realm::from_row).transpose()
    }

    pub async fn list(&self) -> BarrierResult<Vec<Realm>> {
        let rows = sqlx::query("SELECT * FROM realms ORDER BY created_at ASC").fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(Realm::from_row).collect()
    }

    /// Restricted to `name`, `description`, `status` (spec §4.7).
    pub async fn update(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        status: Option<RealmStatus>,
    ) -> BarrierResult<Realm> {
        let existing = self.get(id).await?.ok_or_else(|| BarrierError::not_found("realm-not-found"))?;
        let name = name.unwrap_or(&existing.name);
        let description = description.or(existing.description.as_deref());
        let status = status.unwrap_or(existing.status);
        sqlx::query("UPDATE realms SET name = ?, description = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.get(id).await?.ok_or_else(|| BarrierError::fatal("realm vanished after update"))
    }

    /// Soft delete: `status = deleted`, `deleted_at = now`. The schema and
    /// its data are left in place.
    pub async fn soft_delete(&self, id: Uuid) -> BarrierResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE realms SET status = 'deleted', deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BarrierError::not_found("realm-not-found"));
        }
        Ok(())
    }

    /// Hard delete: drops the schema and removes the metadata row.
    pub async fn hard_delete(&self, id: Uuid) -> BarrierResult<()> {
        let realm = self.get(id).await?.ok_or_else(|| BarrierError::not_found("realm-not-found"))?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", realm.schema_name)).execute(&self.pool).await.ok();
        sqlx::query(&format!("DROP TABLE IF EXISTS {}_users", realm.schema_name)).execute(&self.pool).await.ok();
        sqlx::query("DELETE FROM realms WHERE id = ?").bind(id.to_string()).execute(&self.pool).await.map_err(db_err)?;
        tracing::info!(%id, "realm hard-deleted");
        Ok(())
    }
}

/// Request-scoped outcome of validating a realm id against the registry
/// (spec §4.7 "tenant-isolation middleware"). The surrounding HTTP layer
/// that extracts the realm id from a path/header/subdomain is out of scope;
/// this captures the decision logic it would call.
#[derive(Clone, Debug)]
pub struct TenantContext {
    pub realm: Realm,
    pub search_path: String,
}

pub async fn resolve_tenant_context(realms: &RealmService, realm_id: Uuid) -> BarrierResult<TenantContext> {
    let realm = realms.get(realm_id).await?.ok_or_else(|| BarrierError::not_found("realm-not-found"))?;
    match realm.status {
        RealmStatus::Active => Ok(TenantContext { search_path: realm.schema_name.clone(), realm }),
        // A soft-deleted realm still has a registry row, so it is rejected the
        // same way a suspended one is rather than reported as nonexistent
        // (scenario S5: "soft-delete realm -> subsequent login returns
        // realm-suspended"). Only a realm id with no registry row at all is
        // realm-not-found, handled above.
        RealmStatus::Suspended | RealmStatus::Deleted => Err(BarrierError::unauthorized("realm-suspended")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let svc = RealmService::new(pool().await);
        let id = Uuid::now_v7();
        let realm = svc.create(id, "acme", Some("Acme Corp"), Product::Cipher).await.unwrap();
        assert_eq!(realm.status, RealmStatus::Active);
        assert!(realm.schema_name.starts_with("realm_"));
        let fetched = svc.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "acme");
    }

    #[tokio::test]
    async fn soft_delete_marks_deleted_without_dropping_schema() {
        let svc = RealmService::new(pool().await);
        let id = Uuid::now_v7();
        svc.create(id, "acme", None, Product::Jose).await.unwrap();
        svc.soft_delete(id).await.unwrap();
        let realm = svc.get(id).await.unwrap().unwrap();
        assert_eq!(realm.status, RealmStatus::Deleted);
        assert!(realm.deleted_at.is_some());
    }

    #[tokio::test]
    async fn soft_deleted_realm_surfaces_as_suspended_to_tenant_context() {
        let svc = RealmService::new(pool().await);
        let id = Uuid::now_v7();
        svc.create(id, "acme", None, Product::Sm).await.unwrap();
        svc.soft_delete(id).await.unwrap();
        let err = resolve_tenant_context(&svc, id).await.unwrap_err();
        match err {
            BarrierError::Unauthorized(msg) => assert_eq!(msg, "realm-suspended"),
            other => panic!("expected Unauthorized(realm-suspended), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn suspended_realm_is_rejected_by_tenant_context() {
        let svc = RealmService::new(pool().await);
        let id = Uuid::now_v7();
        svc.create(id, "acme", None, Product::Pki).await.unwrap();
        svc.update(id, None, None, Some(RealmStatus::Suspended)).await.unwrap();
        let err = resolve_tenant_context(&svc, id).await.unwrap_err();
        assert!(matches!(err, BarrierError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn unknown_realm_is_not_found() {
        let svc = RealmService::new(pool().await);
        let err = resolve_tenant_context(&svc, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, BarrierError::NotFound(_)));
    }
}
