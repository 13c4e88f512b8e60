//! Postgres-backed saga repository (feature `postgres`).
//!
//! Instances of every saga type share one table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS saga_instances (
//!     saga_type      TEXT        NOT NULL,
//!     correlation_id TEXT        NOT NULL,
//!     state          TEXT        NOT NULL,
//!     version        BIGINT      NOT NULL CHECK (version > 0),
//!     data           JSONB       NOT NULL,
//!     updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (saga_type, correlation_id)
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | Condition | SagaRepositoryError |
//! |-----------|---------------------|
//! | Unique violation `23505` on insert | `Conflict` |
//! | `UPDATE ... WHERE version = $expected` touched no row | `Conflict` |
//! | JSON (de)serialization of `data` | `Serialization` |
//! | Anything else from sqlx | `Storage` |
//!
//! ## Runtime Bridging
//!
//! The repository trait is synchronous (saga consumers are plain threads). The
//! repository keeps a handle to a tokio runtime and blocks on it, so it must not be
//! called from inside that runtime's async tasks.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use jobservice_core::{ExpectedVersion, SagaInstance};

use super::r#trait::{SagaRecord, SagaRepository, SagaRepositoryError};

/// DDL for the shared saga table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saga_instances (
    saga_type      TEXT        NOT NULL,
    correlation_id TEXT        NOT NULL,
    state          TEXT        NOT NULL,
    version        BIGINT      NOT NULL CHECK (version > 0),
    data           JSONB       NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (saga_type, correlation_id)
)
"#;

#[derive(Debug)]
pub struct PostgresSagaRepository<I> {
    pool: PgPool,
    runtime: Handle,
    _instance: PhantomData<fn() -> I>,
}

impl<I> Clone for PostgresSagaRepository<I> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            runtime: self.runtime.clone(),
            _instance: PhantomData,
        }
    }
}

impl<I> PostgresSagaRepository<I>
where
    I: SagaInstance + Serialize + DeserializeOwned,
{
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime,
            _instance: PhantomData,
        }
    }

    /// Create the saga table if it does not exist.
    pub async fn migrate(&self) -> Result<(), SagaRepositoryError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(saga_type = I::saga_type(), correlation_id = %id), err)]
    pub async fn load_async(
        &self,
        id: &I::Id,
    ) -> Result<Option<SagaRecord<I>>, SagaRepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT version, data
            FROM saga_instances
            WHERE saga_type = $1 AND correlation_id = $2
            "#,
        )
        .bind(I::saga_type())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("load", e))?;
        let data: serde_json::Value = row.try_get("data").map_err(|e| map_sqlx_error("load", e))?;
        let instance: I = serde_json::from_value(data)
            .map_err(|e| SagaRepositoryError::Serialization(e.to_string()))?;

        Ok(Some(SagaRecord {
            instance,
            version: version as u64,
        }))
    }

    #[instrument(
        skip(self, instance),
        fields(
            saga_type = I::saga_type(),
            correlation_id = %instance.correlation_id(),
            state = instance.state_tag(),
            expected = ?expected
        ),
        err
    )]
    pub async fn save_async(
        &self,
        instance: &I,
        expected: ExpectedVersion,
    ) -> Result<u64, SagaRepositoryError> {
        let data = serde_json::to_value(instance)
            .map_err(|e| SagaRepositoryError::Serialization(e.to_string()))?;
        let correlation_id = instance.correlation_id().to_string();

        match expected {
            ExpectedVersion::NoInstance => {
                sqlx::query(
                    r#"
                    INSERT INTO saga_instances (saga_type, correlation_id, state, version, data)
                    VALUES ($1, $2, $3, 1, $4)
                    "#,
                )
                .bind(I::saga_type())
                .bind(&correlation_id)
                .bind(instance.state_tag())
                .bind(&data)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("insert", e))?;
                Ok(1)
            }
            ExpectedVersion::Exact(version) => {
                let result = sqlx::query(
                    r#"
                    UPDATE saga_instances
                    SET state = $3, version = version + 1, data = $4, updated_at = now()
                    WHERE saga_type = $1 AND correlation_id = $2 AND version = $5
                    "#,
                )
                .bind(I::saga_type())
                .bind(&correlation_id)
                .bind(instance.state_tag())
                .bind(&data)
                .bind(version as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("update", e))?;

                if result.rows_affected() == 0 {
                    return Err(SagaRepositoryError::Conflict(format!(
                        "{} {correlation_id}: expected version {version}",
                        I::saga_type()
                    )));
                }
                Ok(version + 1)
            }
            ExpectedVersion::Any => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO saga_instances (saga_type, correlation_id, state, version, data)
                    VALUES ($1, $2, $3, 1, $4)
                    ON CONFLICT (saga_type, correlation_id) DO UPDATE
                    SET state = EXCLUDED.state,
                        version = saga_instances.version + 1,
                        data = EXCLUDED.data,
                        updated_at = now()
                    RETURNING version
                    "#,
                )
                .bind(I::saga_type())
                .bind(&correlation_id)
                .bind(instance.state_tag())
                .bind(&data)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("upsert", e))?;

                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| map_sqlx_error("upsert", e))?;
                Ok(version as u64)
            }
        }
    }
}

impl<I> SagaRepository<I> for PostgresSagaRepository<I>
where
    I: SagaInstance + Serialize + DeserializeOwned,
{
    fn load(&self, id: &I::Id) -> Result<Option<SagaRecord<I>>, SagaRepositoryError> {
        self.runtime.block_on(self.load_async(id))
    }

    fn save(&self, instance: &I, expected: ExpectedVersion) -> Result<u64, SagaRepositoryError> {
        self.runtime.block_on(self.save_async(instance, expected))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SagaRepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SagaRepositoryError::Conflict(msg),
                _ => SagaRepositoryError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            SagaRepositoryError::NotFound(format!("unexpected row not found in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            SagaRepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        other => SagaRepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
