//! Wearable CSV ingestion pipeline: schema validation, row normalization,
//! capped bulk persistence, and feature extraction.
//!
//! The orchestrator ([`IngestPipeline::ingest`]) is the only entry point
//! external callers use. Stages run strictly in order; validation and
//! normalization failures abort before any persistence happens, and the
//! feature vector is always computed over the complete parsed series, not
//! the persisted (capped) subset.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use twinrc_core::{CanonicalSample, FeatureVector, PatientId};
use twinrc_storage::{SensorStore, StoreError};

pub const CRATE_NAME: &str = "twinrc-ingest";

/// Header names an upload must provide, case- and whitespace-insensitive,
/// in any column order.
pub const REQUIRED_COLUMNS: [&str; 8] = [
    "timestamp",
    "accel_x",
    "accel_y",
    "accel_z",
    "emg",
    "spo2",
    "hr",
    "step_count",
];

/// Upper bound on records persisted per upload call. Bounds transaction size
/// for one interactive upload; feature extraction is unaffected by it.
pub const PERSIST_CAP: usize = 2000;

/// Number of leading samples returned to the caller for display.
pub const PREVIEW_ROWS: usize = 10;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required columns: {missing:?}; expected {expected:?}")]
    Schema {
        missing: Vec<String>,
        expected: Vec<&'static str>,
    },
    #[error("row {row}: cannot parse numeric field '{column}' from value '{raw}'")]
    TypeCast {
        /// 1-based line in the uploaded file, header included.
        row: usize,
        column: &'static str,
        raw: String,
    },
    #[error("upload contains no data rows")]
    EmptyInput,
    #[error("malformed csv: {0}")]
    Malformed(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Positions of the required columns within one upload's header row.
#[derive(Debug, Clone)]
pub struct ColumnIndex {
    positions: HashMap<&'static str, usize>,
}

impl ColumnIndex {
    fn position(&self, column: &'static str) -> usize {
        // Validation guarantees every required column is present.
        self.positions[column]
    }
}

/// Normalize header names (trim, lowercase) and confirm every required
/// column is present. Pure check; the error names every missing column and
/// echoes the full expected set.
pub fn validate_schema(headers: &StringRecord) -> Result<ColumnIndex, IngestError> {
    let normalized: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let mut positions = HashMap::new();
    let mut missing = Vec::new();
    for column in REQUIRED_COLUMNS {
        match normalized.iter().position(|h| h == column) {
            Some(idx) => {
                positions.insert(column, idx);
            }
            None => missing.push(column.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(ColumnIndex { positions })
    } else {
        Err(IngestError::Schema {
            missing,
            expected: REQUIRED_COLUMNS.to_vec(),
        })
    }
}

fn numeric_field(
    record: &StringRecord,
    index: &ColumnIndex,
    column: &'static str,
    row: usize,
) -> Result<f64, IngestError> {
    let raw = record.get(index.position(column)).unwrap_or_default().trim();
    raw.parse::<f64>().map_err(|_| IngestError::TypeCast {
        row,
        column,
        raw: raw.to_string(),
    })
}

/// Parse a timestamp cell, accepting RFC 3339 plus the common layouts
/// wearable exports use. An unparsable value falls back to the current
/// wall-clock time: a single malformed timestamp must not abort an
/// otherwise-valid upload.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return naive.and_utc();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return naive.and_utc();
        }
    }
    Utc::now()
}

// Numeric casting is all-or-nothing for the upload: a non-numeric value
// fails the whole ingestion rather than skipping the row.
fn normalize_row(
    record: &StringRecord,
    index: &ColumnIndex,
    row: usize,
) -> Result<CanonicalSample, IngestError> {
    let timestamp_raw = record
        .get(index.position("timestamp"))
        .unwrap_or_default();
    Ok(CanonicalSample {
        timestamp: parse_timestamp(timestamp_raw),
        accel: [
            numeric_field(record, index, "accel_x", row)?,
            numeric_field(record, index, "accel_y", row)?,
            numeric_field(record, index, "accel_z", row)?,
        ],
        emg: numeric_field(record, index, "emg", row)?,
        spo2: numeric_field(record, index, "spo2", row)?,
        hr: numeric_field(record, index, "hr", row)?,
        step_count: numeric_field(record, index, "step_count", row)?,
    })
}

/// Parse a full CSV buffer into canonical samples, preserving input order.
/// Extra columns are ignored; zero data rows after the header is fatal.
pub fn parse_upload(raw: &[u8]) -> Result<Vec<CanonicalSample>, IngestError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(raw);
    let headers = reader.headers()?.clone();
    let index = validate_schema(&headers)?;

    let mut samples = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let record = record?;
        // Header occupies line 1.
        samples.push(normalize_row(&record, &index, offset + 2)?);
    }
    if samples.is_empty() {
        return Err(IngestError::EmptyInput);
    }
    Ok(samples)
}

/// Compute the engineered feature vector over the complete normalized series.
///
/// `cadence_est` averages the non-negative first differences of
/// `step_count` (counter resets clamp to zero, the first row contributes
/// zero) and scales by 60. That assumes one-sample-per-second-equivalent
/// spacing and ignores the actual timestamp deltas, so treat it as an
/// approximation for irregularly sampled series. `acc_mag_std` is the
/// population standard deviation.
pub fn extract_features(samples: &[CanonicalSample]) -> FeatureVector {
    if samples.is_empty() {
        return FeatureVector::default();
    }
    let n = samples.len() as f64;

    let magnitudes: Vec<f64> = samples.iter().map(CanonicalSample::accel_magnitude).collect();
    let acc_mag_mean = magnitudes.iter().sum::<f64>() / n;
    let acc_mag_var = magnitudes
        .iter()
        .map(|m| (m - acc_mag_mean).powi(2))
        .sum::<f64>()
        / n;

    let emg_rms = (samples.iter().map(|s| s.emg * s.emg).sum::<f64>() / n).sqrt();
    let hr_mean = samples.iter().map(|s| s.hr).sum::<f64>() / n;
    let spo2_mean = samples.iter().map(|s| s.spo2).sum::<f64>() / n;

    let clamped_diff_sum: f64 = samples
        .windows(2)
        .map(|pair| (pair[1].step_count - pair[0].step_count).max(0.0))
        .sum();
    // First row's undefined difference counts as zero, so divide by n.
    let cadence_est = clamped_diff_sum / n * 60.0;

    FeatureVector {
        acc_mag_mean,
        acc_mag_std: acc_mag_var.sqrt(),
        emg_rms,
        hr_mean,
        spo2_mean,
        cadence_est,
    }
}

/// Writes canonical samples through the store, stopping at the persistence
/// cap. The underlying store commits the batch atomically, so a mid-batch
/// failure leaves nothing behind.
pub struct BulkPersister {
    store: Arc<dyn SensorStore>,
    cap: usize,
}

impl BulkPersister {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self {
            store,
            cap: PERSIST_CAP,
        }
    }

    #[cfg(test)]
    fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub async fn persist(
        &self,
        patient_id: PatientId,
        samples: &[CanonicalSample],
    ) -> Result<usize, StoreError> {
        let batch = &samples[..samples.len().min(self.cap)];
        self.store.persist_samples(patient_id, batch).await
    }
}

/// Result handed back to the caller: a short preview for display plus the
/// feature vector for display and prediction input.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub preview: Vec<CanonicalSample>,
    pub features: FeatureVector,
    pub parsed_rows: usize,
    pub persisted_rows: usize,
}

/// Sequences validation, normalization, persistence, and extraction for one
/// upload. Request-scoped: all inputs arrive as parameters, and concurrent
/// invocations share only the store.
pub struct IngestPipeline {
    persister: BulkPersister,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self {
            persister: BulkPersister::new(store),
        }
    }

    /// Ingest one CSV upload for `patient_id`. Reads the full buffer before
    /// processing; no partial writes can result from malformed input.
    pub async fn ingest(
        &self,
        raw: &[u8],
        patient_id: PatientId,
    ) -> Result<IngestReport, IngestError> {
        let samples = parse_upload(raw)?;
        let persisted_rows = self.persister.persist(patient_id, &samples).await?;
        let features = extract_features(&samples);
        let preview = samples.iter().take(PREVIEW_ROWS).cloned().collect();

        info!(
            patient_id,
            parsed_rows = samples.len(),
            persisted_rows,
            "upload ingested"
        );
        Ok(IngestReport {
            preview,
            features,
            parsed_rows: samples.len(),
            persisted_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use twinrc_storage::MemoryStore;

    const HEADER: &str = "timestamp,accel_x,accel_y,accel_z,emg,spo2,hr,step_count";

    fn row(ts: &str, accel: [f64; 3], emg: f64, hr: f64, steps: f64) -> String {
        format!(
            "{ts},{},{},{},{emg},97.0,{hr},{steps}",
            accel[0], accel[1], accel[2]
        )
    }

    fn upload(rows: &[String]) -> Vec<u8> {
        format!("{HEADER}\n{}", rows.join("\n")).into_bytes()
    }

    async fn pipeline_with_patient() -> (IngestPipeline, Arc<MemoryStore>, PatientId) {
        let store = Arc::new(MemoryStore::new());
        let patient = store
            .create_patient_profile(serde_json::json!({}), "")
            .await
            .unwrap();
        (IngestPipeline::new(store.clone()), store, patient)
    }

    #[test]
    fn schema_accepts_case_and_whitespace_variants() {
        let headers = StringRecord::from(vec![
            " Timestamp ", "ACCEL_X", "accel_y", "Accel_Z", "EMG", "SpO2", "hr", "Step_Count",
            "battery",
        ]);
        assert!(validate_schema(&headers).is_ok());
    }

    #[test]
    fn schema_error_names_exactly_the_missing_columns() {
        let headers = StringRecord::from(vec![
            "timestamp", "accel_x", "accel_y", "accel_z", "emg", "hr", "step_count",
        ]);
        match validate_schema(&headers).unwrap_err() {
            IngestError::Schema { missing, expected } => {
                assert_eq!(missing, vec!["spo2".to_string()]);
                assert_eq!(expected, REQUIRED_COLUMNS.to_vec());
            }
            other => panic!("expected schema error, got {other}"),
        }
    }

    #[test]
    fn unparsable_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_timestamp("not-a-time");
        let after = Utc::now();
        assert!(parsed >= before && parsed <= after);
    }

    #[test]
    fn common_timestamp_layouts_parse() {
        assert_eq!(
            parse_timestamp("2026-08-01T10:30:00Z").to_rfc3339(),
            "2026-08-01T10:30:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2026-08-01 10:30:00").to_rfc3339(),
            "2026-08-01T10:30:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2026-08-01").to_rfc3339(),
            "2026-08-01T00:00:00+00:00"
        );
    }

    #[test]
    fn non_numeric_field_fails_the_whole_upload() {
        let bytes = upload(&[
            row("2026-08-01T00:00:00Z", [0.0, 0.0, 1.0], 0.1, 70.0, 0.0),
            "2026-08-01T00:00:01Z,0.0,0.0,1.0,abc,97.0,70.0,1.0".to_string(),
        ]);
        match parse_upload(&bytes).unwrap_err() {
            IngestError::TypeCast { row, column, raw } => {
                assert_eq!(row, 3);
                assert_eq!(column, "emg");
                assert_eq!(raw, "abc");
            }
            other => panic!("expected type-cast error, got {other}"),
        }
    }

    #[test]
    fn header_only_upload_is_empty_input() {
        let err = parse_upload(HEADER.as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::EmptyInput));
    }

    #[test]
    fn unit_accel_axes_have_unit_mean_and_zero_std() {
        let bytes = upload(&[
            row("2026-08-01T00:00:00Z", [1.0, 0.0, 0.0], 0.0, 70.0, 0.0),
            row("2026-08-01T00:00:01Z", [0.0, 1.0, 0.0], 0.0, 70.0, 0.0),
            row("2026-08-01T00:00:02Z", [0.0, 0.0, 1.0], 0.0, 70.0, 0.0),
        ]);
        let features = extract_features(&parse_upload(&bytes).unwrap());
        assert!((features.acc_mag_mean - 1.0).abs() < 1e-12);
        assert!(features.acc_mag_std.abs() < 1e-12);
    }

    #[test]
    fn cadence_clamps_negative_step_deltas() {
        let steps = [0.0, 5.0, 3.0, 10.0];
        let rows: Vec<String> = steps
            .iter()
            .map(|s| row("2026-08-01T00:00:00Z", [0.0, 0.0, 1.0], 0.0, 70.0, *s))
            .collect();
        let features = extract_features(&parse_upload(&upload(&rows)).unwrap());
        // Clamped diffs [0, 5, 0, 7], mean 3.0, times 60.
        assert!((features.cadence_est - 180.0).abs() < 1e-9);
    }

    #[test]
    fn single_row_series_has_zero_std_and_cadence() {
        let bytes = upload(&[row("2026-08-01T00:00:00Z", [0.0, 3.0, 4.0], 2.0, 64.0, 12.0)]);
        let features = extract_features(&parse_upload(&bytes).unwrap());
        assert!((features.acc_mag_mean - 5.0).abs() < 1e-12);
        assert_eq!(features.acc_mag_std, 0.0);
        assert_eq!(features.cadence_est, 0.0);
        assert!((features.emg_rms - 2.0).abs() < 1e-12);
        assert!((features.hr_mean - 64.0).abs() < 1e-12);
    }

    #[test]
    fn empty_series_yields_zero_vector_not_a_panic() {
        let features = extract_features(&[]);
        assert_eq!(features, FeatureVector::default());
    }

    #[tokio::test]
    async fn persistence_cap_bounds_writes_but_not_features() {
        let store = Arc::new(MemoryStore::new());
        let patient = store
            .create_patient_profile(serde_json::json!({}), "")
            .await
            .unwrap();
        let persister = BulkPersister::new(store.clone()).with_cap(5);

        let rows: Vec<String> = (0..8)
            .map(|i| row("2026-08-01T00:00:00Z", [0.0, 0.0, 1.0], 0.0, 70.0, i as f64))
            .collect();
        let samples = parse_upload(&upload(&rows)).unwrap();
        let persisted = persister.persist(patient, &samples).await.unwrap();

        assert_eq!(persisted, 5);
        assert_eq!(store.record_count().await, 5);
        assert_eq!(samples.len(), 8);
    }

    #[tokio::test]
    async fn schema_failure_persists_nothing() {
        let (pipeline, store, patient) = pipeline_with_patient().await;
        let bytes = b"timestamp,accel_x\n2026-08-01T00:00:00Z,0.1".to_vec();
        let err = pipeline.ingest(&bytes, patient).await.unwrap_err();
        assert!(matches!(err, IngestError::Schema { .. }));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn typecast_failure_persists_nothing() {
        let (pipeline, store, patient) = pipeline_with_patient().await;
        let bytes = upload(&["2026-08-01T00:00:00Z,0,0,1,abc,97,70,0".to_string()]);
        let err = pipeline.ingest(&bytes, patient).await.unwrap_err();
        assert!(matches!(err, IngestError::TypeCast { .. }));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn store_failure_surfaces_and_commits_nothing() {
        let (pipeline, store, patient) = pipeline_with_patient().await;
        store.fail_next_batch();
        let bytes = upload(&[row("2026-08-01T00:00:00Z", [0.0, 0.0, 1.0], 0.0, 70.0, 0.0)]);
        let err = pipeline.ingest(&bytes, patient).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn preview_holds_at_most_ten_rows_in_input_order() {
        let (pipeline, _store, patient) = pipeline_with_patient().await;
        let rows: Vec<String> = (0..25)
            .map(|i| row("2026-08-01T00:00:00Z", [0.0, 0.0, 1.0], 0.0, 70.0, i as f64))
            .collect();
        let report = pipeline.ingest(&upload(&rows), patient).await.unwrap();
        assert_eq!(report.preview.len(), PREVIEW_ROWS);
        let previewed: Vec<f64> = report.preview.iter().map(|s| s.step_count).collect();
        assert_eq!(previewed, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }
}
