use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use boxoffice_core::error::ImportError;
use boxoffice_core::ledger::{self, ImportJob, JobPage};
use boxoffice_core::orchestrator::ImportResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub filename: String,
    pub entity_type: String,
    /// Raw JSON text of the uploaded file.
    pub records: String,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

pub async fn submit_import(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, (StatusCode, Json<Value>)> {
    app_state
        .pipeline()
        .import_file(
            &payload.filename,
            &payload.entity_type,
            payload.records.as_bytes(),
        )
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn list_imports(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> Result<Json<JobPage>, (StatusCode, Json<Value>)> {
    ledger::list_jobs_page(app_state.pipeline().pool(), params.page, params.per_page)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn get_import(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ImportJob>, (StatusCode, Json<Value>)> {
    ledger::get_job(app_state.pipeline().pool(), job_id)
        .await
        .map(Json)
        .map_err(error_response)
}

fn error_response(err: ImportError) -> (StatusCode, Json<Value>) {
    let (status, body) = match &err {
        ImportError::Validation(errors) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": "validation failed", "details": errors }),
        ),
        ImportError::NoProcessor(kind) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": format!("unsupported entity type '{kind}'") }),
        ),
        ImportError::DuplicateKey(detail) => (
            StatusCode::CONFLICT,
            json!({ "error": detail }),
        ),
        ImportError::JobNotFound(job_id) => (
            StatusCode::NOT_FOUND,
            json!({ "error": format!("import job {job_id} not found") }),
        ),
        other => {
            tracing::error!(error = %other, "import request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal error" }),
            )
        }
    };
    (status, Json(body))
}
