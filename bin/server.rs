// Finance Migration - Web Server
// REST API over the migration service: synchronous mappings and pollable jobs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use finance_migration::{
    logging, EntityStore, MappingRequest, MigrationConfig, MigrationError, MigrationService,
    SqliteStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<MigrationService>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Mapping request plus the owner the records are recreated under
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingBody {
    #[serde(default)]
    target_owner_id: Option<String>,
    #[serde(flatten)]
    request: MappingRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: String,
}

fn error_response(status: StatusCode, err: &MigrationError) -> Response {
    (status, Json(ApiResponse::<()>::err(err.to_string()))).into_response()
}

fn status_for(err: &MigrationError) -> StatusCode {
    match err {
        MigrationError::MissingOwner => StatusCode::BAD_REQUEST,
        MigrationError::UnknownJob(_) => StatusCode::NOT_FOUND,
        MigrationError::JobFailed { .. } | MigrationError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MigrationError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/mappings - Run a mapping request and return the full result
async fn map_request(State(state): State<AppState>, Json(body): Json<MappingBody>) -> Response {
    match state
        .service
        .map_request(body.target_owner_id.as_deref(), body.request)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::ok(result))).into_response(),
        Err(e) => {
            error!(error = %e, "mapping request failed");
            error_response(status_for(&e), &e)
        }
    }
}

/// POST /api/jobs - Start a background mapping job
async fn start_job(State(state): State<AppState>, Json(body): Json<MappingBody>) -> Response {
    match state.service.start_job(body.target_owner_id, body.request) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::ok(JobAccepted { job_id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

/// GET /api/jobs/:id - Poll a job's progress
async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    // Decode URL-encoded job id
    let decoded = urlencoding::decode(&job_id)
        .map(|id| id.into_owned())
        .unwrap_or(job_id);

    match state.service.progress(&decoded) {
        Ok(snapshot) => (StatusCode::OK, Json(ApiResponse::ok(snapshot))).into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/mappings", post(map_request))
        .route("/jobs", post(start_job))
        .route("/jobs/:id", get(get_job))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    println!("🌐 Finance Migration - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db_path = std::env::var("FINANCE_MIGRATION_DB").unwrap_or_else(|_| "migration.db".to_string());
    let addr = std::env::var("FINANCE_MIGRATION_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let store: Arc<dyn EntityStore> = Arc::new(SqliteStore::open(std::path::Path::new(&db_path))?);
    println!("✓ Database opened: {}", db_path);

    let state = AppState {
        service: Arc::new(MigrationService::start(store, MigrationConfig::from_env())),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    println!("\n🚀 Server running on http://{}", addr);
    println!("   POST /api/mappings   run a mapping request");
    println!("   POST /api/jobs       start a background job");
    println!("   GET  /api/jobs/:id   poll job progress");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
