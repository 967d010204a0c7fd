//! HTTP surface of the bulk export API.

use axum::{
    Extension, Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;

use bulkport_api::{ApiResponse, FHIR_NDJSON, X_PROGRESS, empty_response, validate_export_headers};
use bulkport_core::{ExportKind, ExportRequest, JobId};

use super::error::{ExportError, http_date};
use super::status::{JOB_NOT_FOUND, StatusView, parse_status_filter};
use crate::config::ServerConfig;
use crate::middleware::AuthData;
use crate::server::AppState;

pub fn export_routes() -> Router<AppState> {
    Router::new()
        .route("/api/{version}/Patient/$export", get(patient_export))
        .route("/api/{version}/Group/{group_id}/$export", get(group_export))
        .route("/api/{version}/jobs", get(list_jobs))
        .route(
            "/api/{version}/jobs/{job_id}",
            get(job_status).delete(cancel_job),
        )
        .route("/data/{job_id}/{file_name}", get(data_file))
}

/// Public origin for links: the configured base URL, otherwise the
/// request's `Host` with `X-Forwarded-Proto`.
pub fn base_url(cfg: &ServerConfig, headers: &HeaderMap) -> String {
    if let Some(base) = &cfg.base_url {
        return base.trim_end_matches('/').to_string();
    }
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|s| *s == "https")
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

fn parse_job_id(raw: &str) -> Result<JobId, ExportError> {
    raw.parse().map_err(|_| ExportError::not_found(JOB_NOT_FOUND))
}

async fn patient_export(
    State(state): State<AppState>,
    Path(version): Path<String>,
    Extension(auth): Extension<AuthData>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Result<Response, ExportError> {
    validate_export_headers(&headers).map_err(ExportError::Header)?;
    let request = state
        .validator
        .validate(&version, query.as_deref().unwrap_or(""))?;
    submit(&state, &auth, &headers, &uri, request).await
}

async fn group_export(
    State(state): State<AppState>,
    Path((version, group_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthData>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Result<Response, ExportError> {
    validate_export_headers(&headers).map_err(ExportError::Header)?;
    let request = state
        .validator
        .validate(&version, query.as_deref().unwrap_or(""))?;
    let kind = ExportKind::for_group(
        &group_id,
        request.since.is_some(),
        state.config.export.group_features(),
    )?;
    submit(&state, &auth, &headers, &uri, request.with_kind(kind)).await
}

async fn submit(
    state: &AppState,
    auth: &AuthData,
    headers: &HeaderMap,
    uri: &Uri,
    request: ExportRequest,
) -> Result<Response, ExportError> {
    let base = base_url(&state.config.server, headers);
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request_url = format!("{base}{path_and_query}");
    let version = request.version.clone();

    let job = state
        .orchestrator
        .submit(&auth.tenant_id, request, &request_url)
        .await?;

    let location = format!("{base}/api/{version}/jobs/{}", job.id);
    let location = HeaderValue::from_str(&location)
        .map_err(|e| ExportError::fatal(format!("invalid Content-Location: {e}")))?;
    Ok(empty_response(
        StatusCode::ACCEPTED,
        vec![(header::CONTENT_LOCATION, location)],
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(version): Path<String>,
    Extension(auth): Extension<AuthData>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, ExportError> {
    let statuses = parse_status_filter(query.as_deref().unwrap_or(""))?;
    let jobs_url = format!("{}/api/{version}/jobs", base_url(&state.config.server, &headers));
    let bundle = state
        .status
        .list_jobs(&auth.tenant_id, &statuses, &jobs_url)
        .await?;
    Ok(ApiResponse::ok(bundle).into_response())
}

async fn job_status(
    State(state): State<AppState>,
    Path((_version, job_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthData>,
    headers: HeaderMap,
) -> Result<Response, ExportError> {
    let id = parse_job_id(&job_id)?;
    let base = base_url(&state.config.server, &headers);

    match state.status.get_status(id, &auth.tenant_id, &base).await? {
        StatusView::InProgress { progress } => {
            let progress = HeaderValue::from_str(&progress)
                .map_err(|e| ExportError::fatal(format!("invalid progress header: {e}")))?;
            Ok(empty_response(
                StatusCode::ACCEPTED,
                vec![(X_PROGRESS, progress)],
            ))
        }
        StatusView::Completed { manifest, expires } => {
            let mut response = ApiResponse::ok(manifest);
            if let Ok(value) = HeaderValue::from_str(&http_date(expires)) {
                response = response.with_header(header::EXPIRES, value);
            }
            Ok(response.into_response())
        }
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    Path((_version, job_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthData>,
) -> Result<Response, ExportError> {
    let id = parse_job_id(&job_id)?;
    state.status.cancel(id, &auth.tenant_id).await?;
    Ok(empty_response(StatusCode::ACCEPTED, Vec::new()))
}

async fn data_file(
    State(state): State<AppState>,
    Path((job_id, file_name)): Path<(String, String)>,
    Extension(auth): Extension<AuthData>,
) -> Result<Response, ExportError> {
    let id = parse_job_id(&job_id)?;
    let path = state.status.data_file(id, &auth.tenant_id, &file_name).await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ExportError::not_found("File not found"))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_NDJSON));
    Ok(response)
}
