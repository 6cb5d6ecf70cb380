//! Core domain model for the Recovery Companion ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "twinrc-core";

/// Patient profile primary key. Every persisted sensor record references one.
pub type PatientId = i64;

/// One normalized wearable reading. Produced by the row normalizer, one per
/// uploaded CSV row, in input order; immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSample {
    pub timestamp: DateTime<Utc>,
    /// Accelerometer axes `[x, y, z]`.
    pub accel: [f64; 3],
    pub emg: f64,
    pub spo2: f64,
    pub hr: f64,
    pub step_count: f64,
}

impl CanonicalSample {
    /// Euclidean magnitude of the accelerometer triple.
    pub fn accel_magnitude(&self) -> f64 {
        let [x, y, z] = self.accel;
        (x * x + y * y + z * z).sqrt()
    }
}

/// Self-reported mood from the patient check-in path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Sad,
    Ok,
    Good,
}

/// Typed sensor payload, discriminated by `sensor_type`. Each variant carries
/// a fixed field set; there is no schemaless JSON escape hatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sensor_type", rename_all = "snake_case")]
pub enum SensorPayload {
    /// One wearable CSV row (accelerometer, EMG, SpO2, heart rate, steps).
    WearableCsv {
        accel: [f64; 3],
        emg: f64,
        spo2: f64,
        hr: f64,
        step_count: f64,
    },
    /// Patient self-report: pain on a 0-10 scale plus a mood label.
    PatientReport { pain: u8, mood: Mood },
}

impl SensorPayload {
    /// Discriminator string as stored in the `sensor_type` column.
    pub fn sensor_type(&self) -> &'static str {
        match self {
            SensorPayload::WearableCsv { .. } => "wearable_csv",
            SensorPayload::PatientReport { .. } => "patient_report",
        }
    }
}

impl From<&CanonicalSample> for SensorPayload {
    fn from(sample: &CanonicalSample) -> Self {
        SensorPayload::WearableCsv {
            accel: sample.accel,
            emg: sample.emg,
            spo2: sample.spo2,
            hr: sample.hr,
            step_count: sample.step_count,
        }
    }
}

/// A sensor payload bound to a patient profile and a recording time.
/// Created at ingestion, never mutated, removed only by cascade when the
/// owning profile is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub patient_id: PatientId,
    pub recorded_at: DateTime<Utc>,
    pub payload: SensorPayload,
}

/// Fixed-shape numeric summary of one uploaded series. Recomputed fresh per
/// upload over the complete parsed input; never derived from the persisted
/// (capped) subset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub acc_mag_mean: f64,
    pub acc_mag_std: f64,
    pub emg_rms: f64,
    pub hr_mean: f64,
    pub spo2_mean: f64,
    pub cadence_est: f64,
}

impl FeatureVector {
    /// Feature slots in model-input order, before the scenario parameter is
    /// appended.
    pub fn as_slots(&self) -> [f64; 6] {
        [
            self.acc_mag_mean,
            self.acc_mag_std,
            self.emg_rms,
            self.hr_mean,
            self.spo2_mean,
            self.cadence_est,
        ]
    }
}

/// What-if scenario parameter handed to the prediction collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Additional minutes of balance training per day.
    pub extra_minutes_balance: f64,
}

/// Prediction collaborator output contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted change in gait speed, clamped to `[0, 100]` percent.
    pub gait_speed_change_pct: f64,
    pub adherence_score: f64,
}

/// Audit trail entry written alongside pipeline and prediction calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Option<i64>,
    pub action: String,
    pub meta: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
