//! Axum glue over the ingestion pipeline and prediction collaborator.
//!
//! Thin by design: handlers translate HTTP into pipeline calls and render
//! JSON. Dashboard rendering, auth, and report generation live elsewhere.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;
use twinrc_core::{FeatureVector, Mood, PatientId, PersistedRecord, Scenario, SensorPayload};
use twinrc_ingest::{IngestError, IngestPipeline};
use twinrc_model::{predict_with_fallback, TwinModel, MODEL_VERSION};
use twinrc_storage::{MemoryStore, PgSensorStore, SensorStore, StoreError};

pub const CRATE_NAME: &str = "twinrc-web";

/// Environment-driven configuration for the service binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub web_port: u16,
    pub model_weights: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            web_port: std::env::var("TWINRC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            model_weights: std::env::var("TWINRC_MODEL_WEIGHTS").ok().map(PathBuf::from),
        }
    }
}

pub struct AppState {
    pub store: Arc<dyn SensorStore>,
    pub pipeline: IngestPipeline,
    pub model: Option<TwinModel>,
}

impl AppState {
    pub fn new(store: Arc<dyn SensorStore>, model: Option<TwinModel>) -> Self {
        Self {
            pipeline: IngestPipeline::new(store.clone()),
            store,
            model,
        }
    }
}

/// Build state from config: Postgres when a database URL is set, otherwise
/// an in-memory store. A missing or malformed weights file downgrades to the
/// deterministic fallback rather than failing startup.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn SensorStore> = match &config.database_url {
        Some(url) => {
            let pg = PgSensorStore::connect(url).await?;
            pg.run_migrations().await?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let model = match &config.model_weights {
        Some(path) => match TwinModel::from_weights_file(path) {
            Ok(model) => Some(model),
            Err(err) => {
                warn!(%err, "regressor not loaded; predictions will use the fallback");
                None
            }
        },
        None => None,
    };
    Ok(AppState::new(store, model))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/patients", post(create_patient_handler))
        .route("/patients/{id}/uploads", post(upload_handler))
        .route("/patients/{id}/reports", post(report_handler))
        .route("/patients/{id}/predict", post(predict_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let state = build_state(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize, Default)]
struct CreatePatientBody {
    #[serde(default)]
    demographics: serde_json::Value,
    #[serde(default)]
    medical_history: String,
}

async fn create_patient_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePatientBody>,
) -> Response {
    match state
        .store
        .create_patient_profile(body.demographics, &body.medical_history)
        .await
    {
        Ok(patient_id) => Json(serde_json::json!({ "patient_id": patient_id })).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(patient_id): AxumPath<PatientId>,
    body: Bytes,
) -> Response {
    match state.pipeline.ingest(&body, patient_id).await {
        Ok(report) => {
            audit(
                &state,
                "csv_upload",
                serde_json::json!({
                    "patient_id": patient_id,
                    "parsed_rows": report.parsed_rows,
                    "persisted_rows": report.persisted_rows,
                }),
            )
            .await;
            Json(report).into_response()
        }
        Err(err) => ingest_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReportBody {
    pain: u8,
    mood: Mood,
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(patient_id): AxumPath<PatientId>,
    Json(body): Json<ReportBody>,
) -> Response {
    if body.pain > 10 {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "pain must be on the 0-10 scale",
        );
    }
    let record = PersistedRecord {
        patient_id,
        recorded_at: Utc::now(),
        payload: SensorPayload::PatientReport {
            pain: body.pain,
            mood: body.mood,
        },
    };
    match state.store.persist_record(&record).await {
        Ok(()) => {
            audit(
                &state,
                "patient_report",
                serde_json::json!({ "patient_id": patient_id, "pain": body.pain }),
            )
            .await;
            Json(serde_json::json!({ "saved": true })).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct PredictBody {
    features: FeatureVector,
    #[serde(default)]
    extra_minutes_balance: f64,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    gait_speed_change_pct: f64,
    adherence_score: f64,
    used_fallback: bool,
    model_version: &'static str,
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(patient_id): AxumPath<PatientId>,
    Json(body): Json<PredictBody>,
) -> Response {
    let scenario = Scenario {
        extra_minutes_balance: body.extra_minutes_balance,
    };
    let (prediction, used_fallback) =
        predict_with_fallback(state.model.as_ref(), &body.features, scenario);

    let model_version = if used_fallback { "fallback" } else { MODEL_VERSION };
    if let Err(err) = state
        .store
        .persist_prediction(patient_id, model_version, &prediction)
        .await
    {
        return store_error_response(err);
    }
    audit(
        &state,
        "prediction",
        serde_json::json!({
            "patient_id": patient_id,
            "extra_minutes_balance": body.extra_minutes_balance,
            "used_fallback": used_fallback,
        }),
    )
    .await;
    Json(PredictResponse {
        gait_speed_change_pct: prediction.gait_speed_change_pct,
        adherence_score: prediction.adherence_score,
        used_fallback,
        model_version,
    })
    .into_response()
}

/// Audit writes are best-effort; a failed trail entry must not fail the
/// request that already committed.
async fn audit(state: &AppState, action: &str, meta: serde_json::Value) {
    if let Err(err) = state.store.record_audit(None, action, meta).await {
        warn!(%err, action, "audit write failed");
    }
}

fn ingest_error_response(err: IngestError) -> Response {
    match err {
        IngestError::Store(store_err) => store_error_response(store_err),
        IngestError::Schema { .. }
        | IngestError::TypeCast { .. }
        | IngestError::EmptyInput
        | IngestError::Malformed(_) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string())
        }
    }
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::UnknownPatient(_) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
        StoreError::Database(_) | StoreError::Unavailable(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
