//! Postgres-backed chain store.
//!
//! ## Error mapping
//!
//! | SQLx error | PostgreSQL code | LedgerError | Scenario |
//! |------------|-----------------|-------------|----------|
//! | Database (lock not available) | `55P03` | `Contention` | Another writer holds the tail lock (`FOR UPDATE NOWAIT`) |
//! | Database (unique violation) | `23505` | `Contention` | Concurrent append slipped between tail read and insert |
//! | Database (other) | any other | `Storage` | Constraint/serialization problems |
//! | PoolClosed / network | n/a | `Storage` | Pool shut down, connection failures |
//!
//! ## Concurrency
//!
//! `append` runs in one short transaction: `SELECT ... FOR UPDATE NOWAIT` on
//! the tail row (supported by the `(tenant_id, sequence DESC)` index), link,
//! insert, commit. Whoever loses the lock race gets `Contention` immediately
//! instead of queueing on a row lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use loomerp_core::{TenantId, UserId};

use crate::record::{AuditRecord, RecordDraft};
use crate::store::{ChainStore, LedgerError};

/// Schema for the audit chain. The primary key gives the per-tenant total
/// order; the descending index serves the tail lock.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    tenant_id        UUID        NOT NULL,
    sequence         BIGINT      NOT NULL CHECK (sequence > 0),
    user_id          UUID        NOT NULL,
    service_name     TEXT        NOT NULL,
    method           TEXT        NOT NULL,
    path             TEXT        NOT NULL,
    status_code      INT         NOT NULL,
    request_digest   TEXT        NOT NULL,
    response_digest  TEXT        NOT NULL,
    occurred_at      TIMESTAMPTZ NOT NULL,
    previous_hash    TEXT        NOT NULL,
    hash             TEXT        NOT NULL,
    PRIMARY KEY (tenant_id, sequence)
);
CREATE INDEX IF NOT EXISTS audit_records_tail
    ON audit_records (tenant_id, sequence DESC);
"#;

#[derive(Debug, Clone)]
pub struct PostgresChainStore {
    pool: Arc<PgPool>,
}

impl PostgresChainStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the audit table if missing (idempotent).
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| LedgerError::Storage(format!("ensure_schema: {e}")))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db) = e {
        match db.code().as_deref() {
            // lock_not_available (NOWAIT) or a racing insert.
            Some("55P03") | Some("23505") => return LedgerError::Contention,
            _ => {}
        }
    }
    LedgerError::Storage(format!("{operation}: {e}"))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<AuditRecord, sqlx::Error> {
    Ok(AuditRecord {
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        service_name: row.try_get("service_name")?,
        method: row.try_get("method")?,
        path: row.try_get("path")?,
        status_code: row.try_get::<i32, _>("status_code")? as u16,
        request_digest: row.try_get("request_digest")?,
        response_digest: row.try_get("response_digest")?,
        occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at")?,
        previous_hash: row.try_get("previous_hash")?,
        hash: row.try_get("hash")?,
    })
}

#[async_trait]
impl ChainStore for PostgresChainStore {
    #[instrument(skip(self, draft), fields(tenant_id = %tenant_id), err)]
    async fn append(
        &self,
        tenant_id: TenantId,
        draft: RecordDraft,
    ) -> Result<AuditRecord, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("append/begin", e))?;

        let tail_row = sqlx::query(
            r#"
            SELECT sequence, hash
            FROM audit_records
            WHERE tenant_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("append/lock_tail", e))?;

        let tail: Option<(u64, String)> = match tail_row {
            Some(row) => {
                let sequence: i64 = row
                    .try_get("sequence")
                    .map_err(|e| LedgerError::Storage(format!("append/tail_row: {e}")))?;
                let hash: String = row
                    .try_get("hash")
                    .map_err(|e| LedgerError::Storage(format!("append/tail_row: {e}")))?;
                Some((sequence as u64, hash))
            }
            None => None,
        };

        let record = AuditRecord::chained(
            tenant_id,
            tail.as_ref().map(|(seq, hash)| (*seq, hash.as_str())),
            draft,
        );

        sqlx::query(
            r#"
            INSERT INTO audit_records (
                tenant_id, sequence, user_id, service_name, method, path,
                status_code, request_digest, response_digest, occurred_at,
                previous_hash, hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.tenant_id.as_uuid())
        .bind(record.sequence as i64)
        .bind(record.user_id.as_uuid())
        .bind(&record.service_name)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.status_code as i32)
        .bind(&record.request_digest)
        .bind(&record.response_digest)
        .bind(record.occurred_at)
        .bind(&record.previous_hash)
        .bind(&record.hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("append/insert", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append/commit", e))?;

        Ok(record)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn read_range(
        &self,
        tenant_id: TenantId,
        start_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, sequence, user_id, service_name, method, path,
                   status_code, request_digest, response_digest, occurred_at,
                   previous_hash, hash
            FROM audit_records
            WHERE tenant_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(start_sequence as i64)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_range", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(
                record_from_row(row)
                    .map_err(|e| LedgerError::Storage(format!("read_range/row: {e}")))?,
            );
        }
        Ok(records)
    }

    async fn chain_size(&self, tenant_id: TenantId) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_records WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("chain_size", e))?;
        Ok(count as u64)
    }

    async fn tail(&self, tenant_id: TenantId) -> Result<Option<AuditRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, sequence, user_id, service_name, method, path,
                   status_code, request_digest, response_digest, occurred_at,
                   previous_hash, hash
            FROM audit_records
            WHERE tenant_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tail", e))?;

        match row {
            Some(row) => Ok(Some(
                record_from_row(&row)
                    .map_err(|e| LedgerError::Storage(format!("tail/row: {e}")))?,
            )),
            None => Ok(None),
        }
    }
}
