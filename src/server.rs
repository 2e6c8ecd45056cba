//! HTTP surface: code submission, health, and log inspection endpoints.

use crate::config::ServiceConfig;
use crate::emitter::{Emitted, FigureEmitter};
use crate::engine::{ExecutionOptions, PythonEngine};
use crate::errors::{ExecError, Result};
use crate::logview::{self, REQUEST_COMPLETED, REQUEST_STARTED};
use crate::preprocess::normalize;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_LOG_LIMIT: usize = 100;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn PythonEngine>,
    emitter: FigureEmitter,
    config: Arc<ServiceConfig>,
    permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: ServiceConfig, engine: Arc<dyn PythonEngine>) -> Self {
        Self {
            emitter: FigureEmitter::new(config.picture_dir.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_renders)),
            config: Arc::new(config),
            engine,
        }
    }
}

/// Body of `POST /execute-code`
#[derive(Debug, Clone, Deserialize)]
pub struct CodeRequest {
    pub code: String,
    /// Seconds; the configured default applies when absent
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<String>,
    total_lines: usize,
    returned_lines: usize,
    log_file: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

/// HTTP status for a failed render
pub fn status_for(err: &ExecError) -> StatusCode {
    match err {
        ExecError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        err if err.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render error rendered as `{ "detail": "<message>\n\n<trace>" }`
#[derive(Debug)]
pub struct ApiError(pub ExecError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let detail = match self.0.trace().filter(|t| !t.trim().is_empty()) {
            Some(trace) => format!("{}\n\n{}", self.0, trace),
            None => self.0.to_string(),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        ApiError(err)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/execute-code", post(execute_code))
        .route("/logs", get(get_logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Plot rendering API: run matplotlib code and get the figure back as PNG",
        "endpoints": {
            "/execute-code": "POST - execute Python plotting code and return the image",
            "/health": "GET - health check",
            "/logs": "GET - recent service log lines (?limit=N)",
        },
        "usage": {
            "method": "POST",
            "url": "/execute-code",
            "body": {
                "code": "import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])",
                "timeout": 30,
            },
        },
    }))
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        message: "API service is running",
    })
}

async fn execute_code(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> std::result::Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let timestamp = chrono::Utc::now().timestamp();
    let started = Instant::now();
    let timeout = state.config.request_timeout(request.timeout);

    info!(
        request_id = %request_id,
        code_len = request.code.len(),
        timeout_secs = timeout.as_secs(),
        "{}", REQUEST_STARTED
    );
    debug!(request_id = %request_id, "Submitted code:\n{}", request.code);

    match render(&state, request_id, &request.code, timeout, timestamp).await {
        Ok(emitted) => {
            info!(
                request_id = %request_id,
                path = %emitted.artifact.path.display(),
                size = emitted.artifact.size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{}", REQUEST_COMPLETED
            );
            let disposition = format!("attachment; filename={}", emitted.artifact.file_name);
            Ok((
                [
                    (header::CONTENT_TYPE, "image/png".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                emitted.png,
            )
                .into_response())
        }
        Err(err) => {
            error!(
                request_id = %request_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                user_error = err.is_user_error(),
                "Request failed: {}", err
            );
            if let Some(trace) = err.trace() {
                error!(request_id = %request_id, "Traceback:\n{}", trace);
            }
            Err(ApiError(err))
        }
    }
}

async fn render(
    state: &AppState,
    request_id: Uuid,
    code: &str,
    timeout: Duration,
    timestamp: i64,
) -> Result<Emitted> {
    let normalized = normalize(code);
    if !normalized.applied.is_empty() {
        debug!(request_id = %request_id, rules = ?normalized.applied, "Submission normalized");
    }
    if normalized.is_empty() {
        return Err(ExecError::EmptySubmission);
    }

    let _permit = state
        .permits
        .acquire()
        .await
        .map_err(|_| ExecError::InternalError("render pool closed".to_string()))?;

    let options = ExecutionOptions {
        timeout,
        dpi: state.config.dpi,
        policy: state.config.policy.clone(),
        env_vars: HashMap::new(),
    };
    let output = state.engine.execute(&normalized.source, &options).await?;

    if let Some(stdout) = &output.stdout {
        debug!(request_id = %request_id, "Submission stdout:\n{}", stdout);
    }
    if let Some(stderr) = &output.stderr {
        debug!(request_id = %request_id, "Submission stderr:\n{}", stderr);
    }
    debug!(
        request_id = %request_id,
        figures = output.figures,
        from_fallback = output.from_fallback,
        "Render finished"
    );

    let emitter = state.emitter.clone();
    tokio::task::spawn_blocking(move || emitter.emit(output, timestamp))
        .await
        .map_err(|e| ExecError::InternalError(format!("image write task failed: {}", e)))?
}

async fn get_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let log_file = &state.config.log_file;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);

    let path = log_file.clone();
    let read = tokio::task::spawn_blocking(move || logview::read_lines(&path))
        .await
        .unwrap_or_else(|e| Err(ExecError::InternalError(format!("log read task failed: {}", e))));

    match read {
        Ok(lines) => {
            let logs = logview::tail(&lines, limit).to_vec();
            Json(LogsResponse {
                returned_lines: logs.len(),
                total_lines: lines.len(),
                logs,
                log_file: log_file.display().to_string(),
            })
            .into_response()
        }
        Err(ExecError::LogFileNotFound(path)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Log file not found: {}", path) })),
        )
            .into_response(),
        Err(err) => {
            warn!("Failed to read log file {:?}: {}", log_file, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("Failed to read logs: {}", err) })),
            )
                .into_response()
        }
    }
}

/// Bind and serve until Ctrl-C, then shut the engine down
pub async fn serve(state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| ExecError::InternalError(format!("invalid listen address: {}", e)))?;
    let engine = state.engine.clone();

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    info!("Engine: {:?}", engine.capabilities());

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    engine.shutdown().await
}
