//! HTTP API for the upload service.
//!
//! Provides endpoints for uploading bundles and polling deployment status.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{DeployError, DeployResult, ErrorResponse};
use crate::pipeline::Pipeline;
use crate::receiver::{BundleReceiver, BundleUpload};
use crate::store::JobStore;
use crate::types::{DeploymentJob, JobId, JobStatus};

/// Shared application state for the upload service.
pub struct AppState {
    /// Job registry read by the status endpoints.
    pub store: Arc<JobStore>,
    /// Validates, persists and unpacks uploads.
    pub receiver: BundleReceiver,
    /// Runs build/deploy for accepted jobs.
    pub pipeline: Arc<Pipeline>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    // The ceiling covers the whole request, form fields and framing included.
    let body_limit = state.receiver.max_upload_bytes();

    Router::new()
        .route("/healthz", get(health_check))
        .route("/deploy", post(deploy))
        .route("/status/latest", get(latest_status))
        .route("/status/", get(missing_id))
        .route("/status/{id}", get(job_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Accept a bundle upload and start its pipeline.
async fn deploy(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> DeployResult<impl IntoResponse> {
    let multipart = multipart.map_err(|e| DeployError::InvalidMultipart(e.body_text()))?;
    let limit = state.receiver.max_upload_bytes();
    let upload = read_upload(multipart, limit).await?;

    let job = state.receiver.accept(upload).await?;
    state.pipeline.launch(job.id.clone());

    info!(job_id = %job.id, "pipeline launched");

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            id: job.id,
            status: job.status,
            message: "bundle accepted; build and deploy started",
        }),
    ))
}

/// Collect the form fields of a deploy request.
async fn read_upload(mut multipart: Multipart, limit: usize) -> DeployResult<BundleUpload> {
    let mut service = None;
    let mut namespace = None;
    let mut bundle = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(&e, limit))?
    {
        match field.name() {
            Some("service") => {
                service = Some(field.text().await.map_err(|e| multipart_error(&e, limit))?);
            }
            Some("namespace") => {
                namespace = Some(field.text().await.map_err(|e| multipart_error(&e, limit))?);
            }
            Some("bundle") => {
                let Some(file_name) = field.file_name().map(str::to_owned) else {
                    return Err(DeployError::MissingBundle);
                };
                let bytes = field.bytes().await.map_err(|e| multipart_error(&e, limit))?;
                bundle = Some((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let (file_name, bytes) = bundle.ok_or(DeployError::MissingBundle)?;
    Ok(BundleUpload {
        service,
        namespace,
        file_name,
        bytes,
    })
}

fn multipart_error(err: &MultipartError, limit: usize) -> DeployError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        DeployError::PayloadTooLarge { limit }
    } else {
        DeployError::InvalidMultipart(err.body_text())
    }
}

/// Latest job record.
async fn latest_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.latest() {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("no deployments yet")),
        )
            .into_response(),
    }
}

/// Job record by ID.
async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> DeployResult<Json<DeploymentJob>> {
    let id = JobId::new(id);
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| DeployError::JobNotFound(id.to_string()))
}

async fn missing_id() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("missing deployment id")),
    )
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct DeployResponse {
    id: JobId,
    status: JobStatus,
    message: &'static str,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::PipelineMode;

    const BOUNDARY: &str = "upload-api-test-boundary";

    fn test_app(max_upload_bytes: usize) -> (Router, Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::new());
        let receiver = BundleReceiver::new(dir.path(), max_upload_bytes, Arc::clone(&store));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&store),
            PipelineMode::Mock {
                step_delay: Duration::from_millis(1),
            },
        ));
        let state = Arc::new(AppState {
            store,
            receiver,
            pipeline,
        });
        (router(Arc::clone(&state)), state, dir)
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"bundle\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn deploy_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/deploy")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn tar_bundle() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"print('hello')";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "app.py", &data[..]).unwrap();
        builder.into_inner().unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _state, _dir) = test_app(1024);

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn latest_is_not_found_before_any_upload() {
        let (app, _state, _dir) = test_app(1024);

        let response = app
            .oneshot(Request::get("/status/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "no deployments yet");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (app, _state, _dir) = test_app(1024);

        let response = app
            .oneshot(Request::get("/status/dep-000123").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "deployment not found");
    }

    #[tokio::test]
    async fn empty_job_id_is_bad_request() {
        let (app, _state, _dir) = test_app(1024);

        let response = app
            .oneshot(Request::get("/status/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "missing deployment id");
    }

    #[tokio::test]
    async fn deploy_accepts_tar_bundle() {
        let (app, state, dir) = test_app(1 << 20);
        let body = multipart_body(
            &[("service", "My App"), ("namespace", "")],
            Some(("bundle.tar", &tar_bundle())),
        );

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["id"], "dep-000001");
        assert_eq!(json["status"], "PENDING_UPLOAD_VALIDATION");
        assert_eq!(json["message"], "bundle accepted; build and deploy started");

        let job = state.store.get(&JobId::new("dep-000001")).unwrap();
        assert_eq!(job.service_name, "my-app");
        assert_eq!(job.namespace, "default");
        assert!(dir.path().join("dep-000001/bundle.tar").is_file());
        assert!(dir.path().join("dep-000001/src/app.py").is_file());

        state.pipeline.drain().await;
        assert_eq!(
            state.store.get(&JobId::new("dep-000001")).unwrap().status,
            JobStatus::Ready
        );
    }

    #[tokio::test]
    async fn deploy_without_bundle_is_rejected() {
        let (app, state, _dir) = test_app(1024);
        let body = multipart_body(&[("service", "svc")], None);

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "bundle field is required");
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn deploy_rejects_unsupported_extension() {
        let (app, state, _dir) = test_app(1024);
        let body = multipart_body(&[], Some(("bundle.rar", b"rar!")));

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "bundle must be one of: .zip, .tar, .tar.gz, .tgz"
        );
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn deploy_rejects_oversized_bundle() {
        let (app, state, _dir) = test_app(16);
        let body = multipart_body(&[], Some(("bundle.tar", &tar_bundle())));

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_even_when_bundle_fits() {
        let bundle = tar_bundle();
        let limit = bundle.len() + 512;
        let (app, state, dir) = test_app(limit);
        let service = "a".repeat(8 * 1024);
        let body = multipart_body(&[("service", &service)], Some(("bundle.tar", &bundle)));
        assert!(body.len() > limit);

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            format!("request body exceeds {limit} bytes")
        );
        assert!(state.store.is_empty());
        assert!(!dir.path().join("dep-000001").exists());
    }

    #[tokio::test]
    async fn body_within_limit_is_accepted() {
        let bundle = tar_bundle();
        let body = multipart_body(&[("service", "svc")], Some(("bundle.tar", &bundle)));
        let (app, _state, _dir) = test_app(body.len());

        let response = app.oneshot(deploy_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn deploy_requires_multipart() {
        let (app, _state, _dir) = test_app(1024);

        let response = app
            .oneshot(
                Request::post("/deploy")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid multipart form"));
    }
}
