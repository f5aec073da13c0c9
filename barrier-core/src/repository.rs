//! `BarrierRepository`: persistence facade over the three key tiers
//! (spec §4.6), backed by SQLite (dev/test) or PostgreSQL (prod) through
//! `sqlx::Any` so the same queries run against either backend.

use barrier_crypto::{BarrierError, BarrierResult};
use chrono::{DateTime, Utc};
use sqlx::any::{AnyKind, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations");

const PG_ADVISORY_LOCK_KEY: i64 = 0x4241_5252; // "BARR" in hex, arbitrary but stable

fn db_err(e: sqlx::Error) -> BarrierError {
    match e {
        sqlx::Error::RowNotFound => BarrierError::not_found("row not found"),
        other => BarrierError::unavailable(format!("database error: {}", other)),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Root,
    Intermediate,
    Content,
}

impl Tier {
    fn table(&self) -> &'static str {
        match self {
            Tier::Root => "barrier_root_keys",
            Tier::Intermediate => "barrier_intermediate_keys",
            Tier::Content => "barrier_content_keys",
        }
    }
}

/// One persisted row at a tier (spec §3 "Key (common record shape)").
#[derive(Clone, Debug)]
pub struct KeyRow {
    pub kid: Uuid,
    pub serialized: String,
    pub parent_kid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl KeyRow {
    fn from_row(row: &sqlx::any::AnyRow) -> BarrierResult<Self> {
        let kid: String = row.try_get("kid").map_err(db_err)?;
        let serialized: String = row.try_get("serialized").map_err(db_err)?;
        let parent_kid: Option<String> = row.try_get("parent_kid").map_err(db_err)?;
        let created_at: String = row.try_get("created_at").map_err(db_err)?;
        let active: i64 = row.try_get("active").map_err(db_err)?;
        Ok(Self {
            kid: Uuid::parse_str(&kid).map_err(|e| BarrierError::corruption(format!("bad kid: {}", e)))?,
            serialized,
            parent_kid: parent_kid
                .map(|s| Uuid::parse_str(&s).map_err(|e| BarrierError::corruption(format!("bad parent_kid: {}", e))))
                .transpose()?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| BarrierError::corruption(format!("bad created_at: {}", e)))?
                .with_timezone(&Utc),
            active: active != 0,
        })
    }
}

pub struct BarrierRepository {
    pool: AnyPool,
}

impl BarrierRepository {
    pub async fn connect(database_url: &str) -> BarrierResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Apply migrations 1001+ ascending, exactly once, serialized across
    /// concurrent instances by an advisory lock: `pg_advisory_lock` on
    /// PostgreSQL, a `BEGIN IMMEDIATE` transaction on SQLite (which has no
    /// advisory-lock primitive of its own).
    pub async fn migrate(&self) -> BarrierResult<()> {
        match self.pool.any_kind() {
            AnyKind::Postgres => {
                sqlx::query("SELECT pg_advisory_lock($1)")
                    .bind(PG_ADVISORY_LOCK_KEY)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                let result = MIGRATOR.run(&self.pool).await;
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(PG_ADVISORY_LOCK_KEY)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                result.map_err(|e| BarrierError::unavailable(format!("migration failed: {}", e)))?;
            }
            _ => {
                let mut conn = self.pool.acquire().await.map_err(db_err)?;
                sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.map_err(db_err)?;
                let result = MIGRATOR.run(&mut *conn).await;
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(db_err)?;
                result.map_err(|e| BarrierError::unavailable(format!("migration failed: {}", e)))?;
            }
        }
        tracing::info!("barrier migrations applied");
        Ok(())
    }

    pub async fn get_active(&self, tier: Tier) -> BarrierResult<Option<KeyRow>> {
        let sql = format!("SELECT kid, serialized, parent_kid, created_at, active FROM {} WHERE active = 1", tier.table());
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await.map_err(db_err)?;
        row.as_ref().map(KeyRow::from_row).transpose()
    }

    pub async fn get_by_kid(&self, tier: Tier, kid: Uuid) -> BarrierResult<Option<KeyRow>> {
        let sql = format!("SELECT kid, serialized, parent_kid, created_at, active FROM {} WHERE kid = ?", tier.table());
        let row = sqlx::query(&sql).bind(kid.to_string()).fetch_optional(&self.pool).await.map_err(db_err)?;
        row.as_ref().map(KeyRow::from_row).transpose()
    }

    pub async fn iter_historical(&self, tier: Tier) -> BarrierResult<Vec<KeyRow>> {
        let sql = format!(
            "SELECT kid, serialized, parent_kid, created_at, active FROM {} WHERE active = 0 ORDER BY created_at ASC",
            tier.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(KeyRow::from_row).collect()
    }

    /// Insert a new active row, flipping the previous active row (if any)
    /// to historical in the same transaction.
    pub async fn insert_active(
        &self,
        tier: Tier,
        kid: Uuid,
        serialized: &str,
        parent_kid: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> BarrierResult<()> {
        let table = tier.table();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(&format!("UPDATE {} SET active = 0 WHERE active = 1", table))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(&format!(
            "INSERT INTO {} (kid, serialized, parent_kid, created_at, active) VALUES (?, ?, ?, ?, 1)",
            table
        ))
        .bind(kid.to_string())
        .bind(serialized)
        .bind(parent_kid.map(|u| u.to_string()))
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Delete a historical row, only if no row at the tier below still
    /// names it as `parent_kid`.
    pub async fn delete(&self, tier: Tier, kid: Uuid) -> BarrierResult<()> {
        if let Some(child_table) = child_table_of(tier) {
            let referenced: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {} WHERE parent_kid = ?", child_table))
                .bind(kid.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .try_get("n")
                .map_err(db_err)?;
            if referenced > 0 {
                return Err(BarrierError::conflict("cannot delete a key still referenced by a child tier"));
            }
        }
        let result = sqlx::query(&format!("DELETE FROM {} WHERE kid = ? AND active = 0", tier.table()))
            .bind(kid.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BarrierError::not_found("no historical row with that kid"));
        }
        Ok(())
    }
}

fn child_table_of(tier: Tier) -> Option<&'static str> {
    match tier {
        Tier::Root => Some("barrier_intermediate_keys"),
        Tier::Intermediate => Some("barrier_content_keys"),
        Tier::Content => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memdb() -> BarrierRepository {
        let repo = BarrierRepository::connect("sqlite::memory:").await.unwrap();
        repo.migrate().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn insert_active_flips_previous_row() {
        let repo = memdb().await;
        let first = Uuid::now_v7();
        repo.insert_active(Tier::Content, first, "jwe-1", Some(Uuid::now_v7()), Utc::now()).await.unwrap();
        let second = Uuid::now_v7();
        repo.insert_active(Tier::Content, second, "jwe-2", Some(Uuid::now_v7()), Utc::now()).await.unwrap();

        let active = repo.get_active(Tier::Content).await.unwrap().unwrap();
        assert_eq!(active.kid, second);

        let historical = repo.iter_historical(Tier::Content).await.unwrap();
        assert_eq!(historical.len(), 1);
        assert_eq!(historical[0].kid, first);
    }

    #[tokio::test]
    async fn delete_rejects_referenced_parent() {
        let repo = memdb().await;
        let root = Uuid::now_v7();
        repo.insert_active(Tier::Root, root, "root-jwe", None, Utc::now()).await.unwrap();
        let intermediate = Uuid::now_v7();
        repo.insert_active(Tier::Intermediate, intermediate, "int-jwe", Some(root), Utc::now()).await.unwrap();
        // root is still active, but even a historical root referenced by a child must refuse deletion.
        let root2 = Uuid::now_v7();
        repo.insert_active(Tier::Root, root2, "root-jwe-2", None, Utc::now()).await.unwrap();

        let err = repo.delete(Tier::Root, root).await.unwrap_err();
        assert!(matches!(err, BarrierError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_succeeds_once_unreferenced() {
        let repo = memdb().await;
        let root = Uuid::now_v7();
        repo.insert_active(Tier::Root, root, "root-jwe", None, Utc::now()).await.unwrap();
        let root2 = Uuid::now_v7();
        repo.insert_active(Tier::Root, root2, "root-jwe-2", None, Utc::now()).await.unwrap();

        repo.delete(Tier::Root, root).await.unwrap();
        assert!(repo.get_by_kid(Tier::Root, root).await.unwrap().is_none());
    }
}
