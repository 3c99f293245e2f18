use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::{
    ParkReason, Saga, SagaRecord, SagaStatus, StepRecord, StepStatus,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::store::{SagaStore, lease_expiry};
use crate::{Result, SagaId, StoreError, Version};

const SAGA_COLUMNS: &str = "id, name, description, saga_type, correlation_id, status, \
     created_at, started_at, completed_at, failed_at, timeout_ms, max_retry_attempts, \
     current_retry_attempt, current_step_index, context, error_message, parked, \
     skipped_compensations, version";

const STEP_COLUMNS: &str = "saga_id, step_order, id, name, service_name, action_type, \
     action_payload, compensation_action_type, compensation_payload, status, started_at, \
     completed_at, failed_at, compensation_started_at, compensation_completed_at, timeout_ms, \
     retry_attempts, max_retries, response_payload, error_message, compensation_error";

/// PostgreSQL-backed saga store implementation.
///
/// Sagas live in `sagas`, steps in `saga_steps` keyed by `(saga_id, step_order)`.
/// Leases are columns on the saga row and are never touched by `save`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_step(row: &PgRow) -> Result<StepRecord> {
        Ok(StepRecord {
            id: row.try_get::<Uuid, _>("id")?.into(),
            saga_id: row.try_get::<Uuid, _>("saga_id")?.into(),
            order: row.try_get::<i32, _>("step_order")? as u32,
            name: row.try_get("name")?,
            service_name: row.try_get("service_name")?,
            action_type: row.try_get("action_type")?,
            action_payload: row.try_get("action_payload")?,
            compensation_action_type: row.try_get("compensation_action_type")?,
            compensation_payload: row.try_get("compensation_payload")?,
            status: row.try_get::<String, _>("status")?.parse::<StepStatus>()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            compensation_started_at: row.try_get("compensation_started_at")?,
            compensation_completed_at: row.try_get("compensation_completed_at")?,
            timeout: millis_to_duration(row.try_get("timeout_ms")?),
            retry_attempts: row.try_get::<i32, _>("retry_attempts")? as u32,
            max_retries: row.try_get::<i32, _>("max_retries")? as u32,
            response_payload: row.try_get("response_payload")?,
            error_message: row.try_get("error_message")?,
            compensation_error: row.try_get("compensation_error")?,
        })
    }

    fn row_to_record(row: &PgRow, steps: Vec<StepRecord>) -> Result<SagaRecord> {
        let context: serde_json::Value = row.try_get("context")?;
        let context: BTreeMap<String, serde_json::Value> = serde_json::from_value(context)?;
        let parked = row
            .try_get::<Option<String>, _>("parked")?
            .map(|reason| reason.parse::<ParkReason>())
            .transpose()?;
        let skipped: Vec<i32> = row.try_get("skipped_compensations")?;

        Ok(SagaRecord {
            id: row.try_get::<Uuid, _>("id")?.into(),
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            saga_type: row.try_get("saga_type")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get::<String, _>("status")?.parse::<SagaStatus>()?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            timeout: millis_to_duration(row.try_get("timeout_ms")?),
            max_retry_attempts: row.try_get::<i32, _>("max_retry_attempts")? as u32,
            current_retry_attempt: row.try_get::<i32, _>("current_retry_attempt")? as u32,
            current_step_index: row.try_get::<i32, _>("current_step_index")? as usize,
            context,
            error_message: row.try_get("error_message")?,
            parked,
            skipped_compensations: skipped.into_iter().map(|order| order as u32).collect(),
            version: Version::new(row.try_get("version")?),
            steps,
        })
    }

    /// Loads the steps for a batch of saga rows and rebuilds the sagas.
    async fn rebuild(&self, rows: Vec<PgRow>) -> Result<Vec<Saga>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let step_rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps WHERE saga_id = ANY($1) ORDER BY saga_id, step_order"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut steps_by_saga: HashMap<Uuid, Vec<StepRecord>> = HashMap::new();
        for row in &step_rows {
            let step = Self::row_to_step(row)?;
            steps_by_saga
                .entry(step.saga_id.as_uuid())
                .or_default()
                .push(step);
        }

        rows.iter()
            .zip(ids)
            .map(|(row, id)| -> Result<Saga> {
                let steps = steps_by_saga.remove(&id).unwrap_or_default();
                let record = Self::row_to_record(row, steps)?;
                Ok(Saga::from_record(record)?)
            })
            .collect()
    }

    async fn current_version(
        conn: &mut sqlx::PgConnection,
        saga_id: SagaId,
    ) -> Result<Option<Version>> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM sagas WHERE id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(conn)
            .await?;
        Ok(version.map(Version::new))
    }
}

/// Binds the saga columns `$1..$19` in `SAGA_COLUMNS` order, followed by `total_steps` as `$20`.
fn bind_saga<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &SagaRecord,
    version: Version,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let context = serde_json::to_value(&record.context)?;
    let skipped: Vec<i32> = record
        .skipped_compensations
        .iter()
        .map(|order| *order as i32)
        .collect();

    Ok(query
        .bind(record.id.as_uuid())
        .bind(record.name.clone())
        .bind(record.description.clone())
        .bind(record.saga_type.clone())
        .bind(record.correlation_id.clone())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.failed_at)
        .bind(duration_to_millis(record.timeout))
        .bind(record.max_retry_attempts as i32)
        .bind(record.current_retry_attempt as i32)
        .bind(record.current_step_index as i32)
        .bind(context)
        .bind(record.error_message.clone())
        .bind(record.parked.map(|reason| reason.as_str()))
        .bind(skipped)
        .bind(version.as_i64())
        .bind(record.steps.len() as i32))
}

fn millis_to_duration(millis: Option<i64>) -> Option<Duration> {
    millis.map(|ms| Duration::from_millis(ms.max(0) as u64))
}

fn duration_to_millis(duration: Option<Duration>) -> Option<i64> {
    duration.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn save(&self, saga: &Saga) -> Result<Version> {
        let record = saga.to_record();
        let saga_id = record.id;
        let expected = record.version;
        let next = expected.next();

        let mut tx = self.pool.begin().await?;

        let rows_affected = if expected == Version::initial() {
            let sql = format!(
                r#"
                INSERT INTO sagas ({SAGA_COLUMNS}, total_steps)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                ON CONFLICT (id) DO NOTHING
                "#
            );
            bind_saga(sqlx::query(&sql), &record, next)?
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            let query = sqlx::query(
                r#"
                UPDATE sagas SET
                    name = $2, description = $3, saga_type = $4, correlation_id = $5,
                    status = $6, created_at = $7, started_at = $8, completed_at = $9,
                    failed_at = $10, timeout_ms = $11, max_retry_attempts = $12,
                    current_retry_attempt = $13, current_step_index = $14, context = $15,
                    error_message = $16, parked = $17, skipped_compensations = $18,
                    version = $19, total_steps = $20
                WHERE id = $1 AND version = $21
                "#,
            );
            bind_saga(query, &record, next)?
                .bind(expected.as_i64())
                .execute(&mut *tx)
                .await?
                .rows_affected()
        };

        if rows_affected == 0 {
            let actual = Self::current_version(&mut *tx, saga_id)
                .await?
                .unwrap_or(Version::initial());
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            });
        }

        for step in &record.steps {
            sqlx::query(&format!(
                r#"
                INSERT INTO saga_steps ({STEP_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                ON CONFLICT (saga_id, step_order) DO UPDATE SET
                    status = EXCLUDED.status,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at,
                    failed_at = EXCLUDED.failed_at,
                    compensation_started_at = EXCLUDED.compensation_started_at,
                    compensation_completed_at = EXCLUDED.compensation_completed_at,
                    retry_attempts = EXCLUDED.retry_attempts,
                    response_payload = EXCLUDED.response_payload,
                    error_message = EXCLUDED.error_message,
                    compensation_error = EXCLUDED.compensation_error
                "#
            ))
            .bind(saga_id.as_uuid())
            .bind(step.order as i32)
            .bind(step.id.as_uuid())
            .bind(&step.name)
            .bind(&step.service_name)
            .bind(&step.action_type)
            .bind(&step.action_payload)
            .bind(&step.compensation_action_type)
            .bind(&step.compensation_payload)
            .bind(step.status.as_str())
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(step.failed_at)
            .bind(step.compensation_started_at)
            .bind(step.compensation_completed_at)
            .bind(duration_to_millis(step.timeout))
            .bind(step.retry_attempts as i32)
            .bind(step.max_retries as i32)
            .bind(&step.response_payload)
            .bind(&step.error_message)
            .bind(&step.compensation_error)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(%saga_id, version = %next, "saga saved");
        Ok(next)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1"))
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.rebuild(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn load_runnable(&self, now: DateTime<Utc>) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE archived_at IS NULL
              AND parked IS NULL
              AND status IN ('Created', 'Running', 'Compensating')
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY created_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        self.rebuild(rows).await
    }

    async fn load_parked(&self) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE archived_at IS NULL AND parked IS NOT NULL
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        self.rebuild(rows).await
    }

    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired = sqlx::query(
            r#"
            UPDATE sagas
            SET lease_owner = $2, lease_expires_at = $3
            WHERE id = $1
              AND (lease_owner IS NULL OR lease_owner = $2
                   OR lease_expires_at IS NULL OR lease_expires_at <= $4)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !acquired {
            let mut conn = self.pool.acquire().await?;
            if Self::current_version(&mut *conn, saga_id).await?.is_none() {
                return Err(StoreError::SagaNotFound(saga_id));
            }
        }
        Ok(acquired)
    }

    async fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sagas SET lease_owner = NULL, lease_expires_at = NULL WHERE id = $1 AND lease_owner = $2",
        )
        .bind(saga_id.as_uuid())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive(&self, saga_id: SagaId) -> Result<()> {
        let archived = sqlx::query(
            r#"
            UPDATE sagas
            SET archived_at = COALESCE(archived_at, NOW()), lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status IN ('Completed', 'Compensated', 'Failed')
            "#,
        )
        .bind(saga_id.as_uuid())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if archived == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM sagas WHERE id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;
            return match status {
                Some(status) => Err(StoreError::NotTerminal {
                    saga_id,
                    status: status.parse()?,
                }),
                None => Err(StoreError::SagaNotFound(saga_id)),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_millis_conversion() {
        assert_eq!(duration_to_millis(Some(Duration::from_secs(2))), Some(2000));
        assert_eq!(duration_to_millis(None), None);
        assert_eq!(millis_to_duration(Some(1500)), Some(Duration::from_millis(1500)));
        assert_eq!(millis_to_duration(Some(-1)), Some(Duration::ZERO));
    }
}
