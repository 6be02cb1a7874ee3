use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::model::{Message, SyncStatus};
use crate::persistence::schema;
use crate::persistence::{PersistenceError, Result};

/// A single just-committed result row, handed back so callers (the Sync
/// Engine's realtime mode) can enqueue a send job without a second
/// round-trip to the store.
#[derive(Debug, Clone)]
pub struct PersistedResult {
    pub result_id: String,
    pub order_id: String,
}

/// A flattened, join-resolved view of one unsynced result, carrying enough
/// of its parent patient/order to build the outbound batch payload without
/// further queries.
#[derive(Debug, Clone)]
pub struct SyncRow {
    pub result_id: String,
    pub attempt_count: i64,
    pub patient_external_id: String,
    pub patient_internal_id: String,
    pub patient_full_name: String,
    pub patient_dob: Option<DateTime<Utc>>,
    pub patient_sex: Option<String>,
    pub patient_physician: Option<String>,
    pub order_sample_id: String,
    pub order_ordered_at: Option<DateTime<Utc>>,
    pub order_universal_service_id: String,
    pub test_code: String,
    pub value: String,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub abnormal_flags: Vec<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl SyncRow {
    /// Sort key for the Sync Engine's per-batch ordering: by patient, then
    /// observation time, then row id, so retries of a partially-sent batch
    /// resend rows in a stable order.
    pub fn sort_key(&self) -> (String, Option<DateTime<Utc>>, String) {
        let patient_id = if !self.patient_external_id.is_empty() {
            self.patient_external_id.clone()
        } else {
            self.patient_internal_id.clone()
        };
        (patient_id, self.observed_at, self.result_id.clone())
    }
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Upserts a decoded `Message` as a patient row, one order row per
    /// `OrderGroup`, and one result row per `TestResult`. Runs inside a
    /// single transaction so a crash mid-write never leaves a dangling order
    /// or result.
    pub async fn persist_message(
        &self,
        analyzer_instance: &str,
        message: &Message,
    ) -> Result<Vec<PersistedResult>> {
        let patient = message
            .patient
            .as_ref()
            .ok_or(PersistenceError::MissingPatientIdentity)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let patient_id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query(
            r#"
            INSERT INTO patients (id, analyzer_instance, external_id, internal_id, full_name, dob, sex, physician, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(analyzer_instance, external_id, internal_id) DO UPDATE SET
                full_name = excluded.full_name,
                dob = excluded.dob,
                sex = excluded.sex,
                physician = excluded.physician
            RETURNING id
            "#,
        )
        .bind(&patient_id)
        .bind(analyzer_instance)
        .bind(&patient.external_id)
        .bind(&patient.internal_id)
        .bind(&patient.full_name)
        .bind(patient.dob)
        .bind(&patient.sex)
        .bind(&patient.physician)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let patient_id: String = row.try_get("id")?;

        let mut persisted = Vec::new();

        for group in &message.orders {
            let order_id = uuid::Uuid::new_v4().to_string();
            let row = sqlx::query(
                r#"
                INSERT INTO orders (id, analyzer_instance, patient_id, sample_id, ordered_at, universal_service_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(analyzer_instance, sample_id) DO UPDATE SET
                    ordered_at = excluded.ordered_at,
                    universal_service_id = excluded.universal_service_id
                RETURNING id
                "#,
            )
            .bind(&order_id)
            .bind(analyzer_instance)
            .bind(&patient_id)
            .bind(&group.order.sample_id)
            .bind(group.order.ordered_at)
            .bind(&group.order.universal_service_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            let order_id: String = row.try_get("id")?;

            for result in &group.results {
                let result_id = uuid::Uuid::new_v4().to_string();
                let abnormal_flags = result.abnormal_flags.join(",");
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO results (
                        id, order_id, test_code, value, units, reference_range,
                        abnormal_flags, observed_at, sync_status, attempt_count,
                        next_attempt_at, created_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                    ON CONFLICT(order_id, test_code, observed_at) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(&result_id)
                .bind(&order_id)
                .bind(&result.test_code)
                .bind(&result.value)
                .bind(&result.units)
                .bind(&result.reference_range)
                .bind(&abnormal_flags)
                .bind(result.observed_at)
                .bind(SyncStatus::Local.as_str())
                .bind(now)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(row) = inserted {
                    let result_id: String = row.try_get("id")?;
                    persisted.push(PersistedResult {
                        result_id,
                        order_id: order_id.clone(),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(persisted)
    }

    /// Selects up to `limit` `local` rows whose retry schedule has come due,
    /// joined with their parent order/patient.
    pub async fn fetch_sync_batch(&self, limit: i64) -> Result<Vec<SyncRow>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            SELECT
                r.id AS result_id, r.attempt_count, r.test_code, r.value, r.units,
                r.reference_range, r.abnormal_flags, r.observed_at,
                p.external_id AS patient_external_id, p.internal_id AS patient_internal_id,
                p.full_name AS patient_full_name, p.dob AS patient_dob, p.sex AS patient_sex,
                p.physician AS patient_physician,
                o.sample_id AS order_sample_id, o.ordered_at AS order_ordered_at,
                o.universal_service_id AS order_universal_service_id
            FROM results r
            JOIN orders o ON o.id = r.order_id
            JOIN patients p ON p.id = o.patient_id
            WHERE r.sync_status = 'local' AND r.next_attempt_at <= ?
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let abnormal_flags_raw: String = row.try_get("abnormal_flags")?;
            result.push(SyncRow {
                result_id: row.try_get("result_id")?,
                attempt_count: row.try_get("attempt_count")?,
                patient_external_id: row.try_get("patient_external_id")?,
                patient_internal_id: row.try_get("patient_internal_id")?,
                patient_full_name: row.try_get("patient_full_name")?,
                patient_dob: row.try_get("patient_dob")?,
                patient_sex: row.try_get("patient_sex")?,
                patient_physician: row.try_get("patient_physician")?,
                order_sample_id: row.try_get("order_sample_id")?,
                order_ordered_at: row.try_get("order_ordered_at")?,
                order_universal_service_id: row.try_get("order_universal_service_id")?,
                test_code: row.try_get("test_code")?,
                value: row.try_get("value")?,
                units: row.try_get("units")?,
                reference_range: row.try_get("reference_range")?,
                abnormal_flags: abnormal_flags_raw
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect(),
                observed_at: row.try_get("observed_at")?,
            });
        }
        Ok(result)
    }

    /// One result, flattened for the realtime sync path: a send job is
    /// enqueued for each newly persisted result.
    pub async fn fetch_sync_row(&self, result_id: &str) -> Result<Option<SyncRow>> {
        let all = self.fetch_sync_batch(i64::MAX).await?;
        Ok(all.into_iter().find(|r| r.result_id == result_id))
    }

    pub async fn mark_synced(&self, result_ids: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for id in result_ids {
            sqlx::query("UPDATE results SET sync_status = 'synced', synced_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn schedule_retry(
        &self,
        result_id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE results SET attempt_count = ?, next_attempt_at = ? WHERE id = ?",
        )
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(result_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Excludes a row from all future sync attempts: any non-retryable 4xx
    /// (anything but 408/429) marks the row poisoned instead of scheduling
    /// another retry.
    pub async fn mark_poisoned(&self, result_id: &str) -> Result<()> {
        sqlx::query("UPDATE results SET sync_status = 'poisoned' WHERE id = ?")
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, Patient, TestResult};

    fn sample_message() -> Message {
        let mut msg = Message::new("SYSMEX-XN");
        msg.set_patient(Patient::new("322288".into(), String::new()).unwrap());
        msg.push_order(Order::new("SID01".into(), "322288".into()));
        msg.push_result(TestResult::new("GLU".into(), "5.3".into(), "SID01".into()))
            .unwrap();
        msg
    }

    #[tokio::test]
    async fn persists_patient_order_and_result() {
        let store = Store::connect_in_memory().await.unwrap();
        let persisted = store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        assert_eq!(persisted.len(), 1);

        let batch = store.fetch_sync_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].patient_external_id, "322288");
        assert_eq!(batch[0].order_sample_id, "SID01");
        assert_eq!(batch[0].test_code, "GLU");
    }

    #[tokio::test]
    async fn resending_same_message_does_not_duplicate_result() {
        let store = Store::connect_in_memory().await.unwrap();
        store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        let second = store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        assert!(second.is_empty(), "conflicting insert should be a no-op");

        let batch = store.fetch_sync_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn mark_synced_removes_row_from_future_batches() {
        let store = Store::connect_in_memory().await.unwrap();
        let persisted = store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        store.mark_synced(&[persisted[0].result_id.clone()]).await.unwrap();

        let batch = store.fetch_sync_batch(10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn poisoned_row_is_excluded_from_future_batches() {
        let store = Store::connect_in_memory().await.unwrap();
        let persisted = store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        store.mark_poisoned(&persisted[0].result_id).await.unwrap();

        let batch = store.fetch_sync_batch(10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn scheduled_retry_in_the_future_is_excluded_until_due() {
        let store = Store::connect_in_memory().await.unwrap();
        let persisted = store.persist_message("SYSMEX-XN-01", &sample_message()).await.unwrap();
        let far_future = Utc::now() + chrono::Duration::hours(1);
        store
            .schedule_retry(&persisted[0].result_id, 1, far_future)
            .await
            .unwrap();

        let batch = store.fetch_sync_batch(10).await.unwrap();
        assert!(batch.is_empty());
    }
}
