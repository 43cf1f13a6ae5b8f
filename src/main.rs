mod attachments;
mod config;
mod decode;
mod domain;
mod http;
mod i18n;
mod lifecycle;
mod metrics;
mod models;
mod notify;
mod pipeline;
mod processor;
mod queue;
mod schema;
mod security;
mod splitter;
mod store;

use attachments::LocalAttachments;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::ImportConfig;
use domain::{DemoCatalog, StaticCategories};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ErroneousRow, JobStatusView, SubmitResponse};
use notify::{LogNotifier, Notifier, WebhookNotifier};
use pipeline::{Collaborators, ImportPipeline, PipelineError, PipelineErrorKind};
use queue::{JobQueue, WorkerPool};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{ImportStore, MemoryStore, RedisStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "hermes.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ImportConfig::from_env();
    let store: Arc<dyn ImportStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .wrap_err("connecting to redis")?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            config.http_timeout,
            config.http_connect_timeout,
        )),
        None => Arc::new(LogNotifier),
    };
    let attachments = Arc::new(
        LocalAttachments::new(&config.attachment_dir).wrap_err("preparing attachment directory")?,
    );

    let (queue, receiver) = JobQueue::channel();
    let pipeline = Arc::new(ImportPipeline::new(
        &config,
        Collaborators {
            store,
            attachments,
            queue: Arc::new(queue),
            builder: Arc::new(DemoCatalog::new()),
            categories: Arc::new(StaticCategories::default()),
            notifier,
        },
    ));
    let pool = WorkerPool::spawn(pipeline.clone(), receiver, config.workers);
    info!(
        target = "hermes.api",
        workers = pool.size(),
        batch_size = config.batch_size,
        redis = config.redis_url.is_some(),
        "import workers started"
    );

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let state = AppState {
        pipeline,
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
    };
    let app = router(state, AuthState::from_env(), config.max_upload_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "hermes.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("serving http")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ImportPipeline>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn router(state: AppState, auth: AuthState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/imports", post(submit_import))
        .route("/imports/{id}", get(get_import).delete(delete_import))
        .route("/imports/{id}/errors", get(list_errors))
        .route("/imports/{id}/errors.csv", get(export_errors))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "hermes-import-rs",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state.prometheus_handle.render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    filename: String,
}

/// Submit a listing file for import.
///
/// - Method: `POST`
/// - Path: `/imports?filename=<name>.csv`
/// - Auth: `Authorization: Bearer <key>` or `X-Import-Key: <key>`
/// - Body: the raw file
/// - Response: `202` with `SubmitResponse`
async fn submit_import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    metrics::inc_requests("/imports");
    info!(
        target = "hermes.api",
        user_id = %context.user_id,
        api_key = %context.api_key_id,
        filename = %query.filename,
        "import upload received",
    );
    let job = state
        .pipeline
        .submit(&context.user_id, &query.filename, &body)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

async fn get_import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, AppError> {
    metrics::inc_requests("/imports/{id}");
    let id = parse_job_id(&id)?;
    Ok(Json(state.pipeline.status(&context.user_id, id).await?))
}

async fn list_errors(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ErroneousRow>>, AppError> {
    metrics::inc_requests("/imports/{id}/errors");
    let id = parse_job_id(&id)?;
    Ok(Json(state.pipeline.erroneous_rows(&context.user_id, id).await?))
}

/// Failed rows as a `;` separated file that can be fixed and uploaded again.
async fn export_errors(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/imports/{id}/errors.csv");
    let id = parse_job_id(&id)?;
    let body = state.pipeline.export_errors_csv(&context.user_id, id).await?;
    let disposition = format!("attachment; filename=\"import-{id}-errors.csv\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn delete_import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/imports/{id}#delete");
    let id = parse_job_id(&id)?;
    state.pipeline.delete(&context.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::Pipeline(PipelineError::invalid_input("imports", "invalid_job_id")))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
