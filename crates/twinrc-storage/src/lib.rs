//! Persistence collaborator: the [`SensorStore`] contract plus Postgres and
//! in-memory implementations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use twinrc_core::{
    AuditEntry, CanonicalSample, PatientId, PersistedRecord, Prediction, SensorPayload,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "twinrc-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown patient profile {0}")]
    UnknownPatient(PatientId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage contract required by the ingestion pipeline: insert records and
/// commit them as one batch keyed by patient identity. The engine behind it
/// is not prescribed.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Create a patient profile and return its id.
    async fn create_patient_profile(
        &self,
        demographics: serde_json::Value,
        medical_history: &str,
    ) -> Result<PatientId, StoreError>;

    /// Persist one upload's samples as `wearable_csv` records inside a single
    /// atomic transaction: either every sample in the slice commits or none
    /// do. Returns the number of records written.
    async fn persist_samples(
        &self,
        patient_id: PatientId,
        samples: &[CanonicalSample],
    ) -> Result<usize, StoreError>;

    /// Persist one standalone record (the patient self-report path).
    async fn persist_record(&self, record: &PersistedRecord) -> Result<(), StoreError>;

    /// Persist a prediction result for later review.
    async fn persist_prediction(
        &self,
        patient_id: PatientId,
        model_version: &str,
        result: &Prediction,
    ) -> Result<(), StoreError>;

    /// Append an audit trail entry.
    async fn record_audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        meta: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Schema statements applied in order; each is idempotent.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS patient_profiles (
        id              BIGSERIAL PRIMARY KEY,
        demographics    JSONB,
        medical_history TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_streams (
        id          BIGSERIAL PRIMARY KEY,
        patient_id  BIGINT NOT NULL REFERENCES patient_profiles(id) ON DELETE CASCADE,
        recorded_at TIMESTAMPTZ NOT NULL,
        sensor_type TEXT NOT NULL,
        payload     JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        id            BIGSERIAL PRIMARY KEY,
        patient_id    BIGINT NOT NULL REFERENCES patient_profiles(id) ON DELETE CASCADE,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        model_version TEXT,
        result        JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id          UUID PRIMARY KEY,
        user_id     BIGINT,
        action      TEXT NOT NULL,
        meta        JSONB NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PgSensorStore {
    pool: PgPool,
}

impl PgSensorStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = MIGRATIONS.len(), "schema migrations applied");
        Ok(())
    }

    /// Map foreign-key violations on `patient_id` to the domain error.
    fn classify(patient_id: PatientId, err: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23503") {
                return StoreError::UnknownPatient(patient_id);
            }
        }
        StoreError::Database(err)
    }
}

#[async_trait]
impl SensorStore for PgSensorStore {
    async fn create_patient_profile(
        &self,
        demographics: serde_json::Value,
        medical_history: &str,
    ) -> Result<PatientId, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO patient_profiles (demographics, medical_history)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(demographics)
        .bind(medical_history)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn persist_samples(
        &self,
        patient_id: PatientId,
        samples: &[CanonicalSample],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            let payload = SensorPayload::from(sample);
            sqlx::query(
                r#"
                INSERT INTO sensor_streams (patient_id, recorded_at, sensor_type, payload)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(patient_id)
            .bind(sample.timestamp)
            .bind(payload.sensor_type())
            .bind(serde_json::to_value(&payload).map_err(|e| {
                StoreError::Unavailable(format!("serializing sensor payload: {e}"))
            })?)
            .execute(&mut *tx)
            .await
            .map_err(|err| Self::classify(patient_id, err))?;
        }
        tx.commit().await?;
        info!(patient_id, rows = samples.len(), "sample batch committed");
        Ok(samples.len())
    }

    async fn persist_record(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sensor_streams (patient_id, recorded_at, sensor_type, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.patient_id)
        .bind(record.recorded_at)
        .bind(record.payload.sensor_type())
        .bind(serde_json::to_value(&record.payload).map_err(|e| {
            StoreError::Unavailable(format!("serializing sensor payload: {e}"))
        })?)
        .execute(&self.pool)
        .await
        .map_err(|err| Self::classify(record.patient_id, err))?;
        Ok(())
    }

    async fn persist_prediction(
        &self,
        patient_id: PatientId,
        model_version: &str,
        result: &Prediction,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO predictions (patient_id, model_version, result)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(patient_id)
        .bind(model_version)
        .bind(serde_json::to_value(result).map_err(|e| {
            StoreError::Unavailable(format!("serializing prediction: {e}"))
        })?)
        .execute(&self.pool)
        .await
        .map_err(|err| Self::classify(patient_id, err))?;
        Ok(())
    }

    async fn record_audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        meta: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, user_id, action, meta, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(action)
        .bind(meta)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_patient_id: PatientId,
    patients: HashSet<PatientId>,
    records: Vec<PersistedRecord>,
    predictions: Vec<(PatientId, String, Prediction)>,
    audits: Vec<AuditEntry>,
}

/// Store backed by process memory. Enforces the same patient foreign-key
/// invariant as the Postgres schema and the same all-or-nothing batch
/// semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail_next_batch: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `persist_samples` call to fail before writing
    /// anything. Used to exercise the pipeline's persistence-failure path.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn records_for(&self, patient_id: PatientId) -> Vec<PersistedRecord> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.patient_id == patient_id)
            .cloned()
            .collect()
    }

    pub async fn audit_actions(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .audits
            .iter()
            .map(|a| a.action.clone())
            .collect()
    }

    pub async fn predictions_for(&self, patient_id: PatientId) -> Vec<Prediction> {
        self.inner
            .lock()
            .await
            .predictions
            .iter()
            .filter(|(id, _, _)| *id == patient_id)
            .map(|(_, _, p)| *p)
            .collect()
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn create_patient_profile(
        &self,
        _demographics: serde_json::Value,
        _medical_history: &str,
    ) -> Result<PatientId, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_patient_id += 1;
        let id = inner.next_patient_id;
        inner.patients.insert(id);
        Ok(id)
    }

    async fn persist_samples(
        &self,
        patient_id: PatientId,
        samples: &[CanonicalSample],
    ) -> Result<usize, StoreError> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected batch failure".into()));
        }
        let mut inner = self.inner.lock().await;
        if !inner.patients.contains(&patient_id) {
            return Err(StoreError::UnknownPatient(patient_id));
        }
        for sample in samples {
            inner.records.push(PersistedRecord {
                patient_id,
                recorded_at: sample.timestamp,
                payload: SensorPayload::from(sample),
            });
        }
        Ok(samples.len())
    }

    async fn persist_record(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.patients.contains(&record.patient_id) {
            return Err(StoreError::UnknownPatient(record.patient_id));
        }
        inner.records.push(record.clone());
        Ok(())
    }

    async fn persist_prediction(
        &self,
        patient_id: PatientId,
        model_version: &str,
        result: &Prediction,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.patients.contains(&patient_id) {
            return Err(StoreError::UnknownPatient(patient_id));
        }
        inner
            .predictions
            .push((patient_id, model_version.to_string(), *result));
        Ok(())
    }

    async fn record_audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        meta: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.audits.push(AuditEntry {
            id: Uuid::new_v4(),
            user_id,
            action: action.to_string(),
            meta,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use twinrc_core::Mood;

    fn sample(step_count: f64) -> CanonicalSample {
        CanonicalSample {
            timestamp: Utc::now(),
            accel: [0.1, 0.2, 0.3],
            emg: 0.4,
            spo2: 97.0,
            hr: 72.0,
            step_count,
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_unknown_patient() {
        let store = MemoryStore::new();
        let err = store.persist_samples(42, &[sample(0.0)]).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownPatient(42)));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn memory_store_commits_batches_per_patient() {
        let store = MemoryStore::new();
        let a = store
            .create_patient_profile(serde_json::json!({}), "")
            .await
            .unwrap();
        let b = store
            .create_patient_profile(serde_json::json!({}), "")
            .await
            .unwrap();

        store
            .persist_samples(a, &[sample(1.0), sample(2.0)])
            .await
            .unwrap();
        store.persist_samples(b, &[sample(3.0)]).await.unwrap();

        assert_eq!(store.records_for(a).await.len(), 2);
        assert_eq!(store.records_for(b).await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failure_commits_nothing() {
        let store = MemoryStore::new();
        let patient = store
            .create_patient_profile(serde_json::json!({}), "")
            .await
            .unwrap();
        store.fail_next_batch();
        let err = store
            .persist_samples(patient, &[sample(0.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.record_count().await, 0);

        // Failure injection is one-shot.
        store.persist_samples(patient, &[sample(0.0)]).await.unwrap();
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn patient_report_records_keep_their_discriminator() {
        let store = MemoryStore::new();
        let patient = store
            .create_patient_profile(serde_json::json!({"age": 45}), "post-op")
            .await
            .unwrap();
        store
            .persist_record(&PersistedRecord {
                patient_id: patient,
                recorded_at: Utc::now(),
                payload: SensorPayload::PatientReport {
                    pain: 3,
                    mood: Mood::Good,
                },
            })
            .await
            .unwrap();
        let records = store.records_for(patient).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.sensor_type(), "patient_report");
    }
}
