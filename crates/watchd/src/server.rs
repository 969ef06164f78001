//! Aggregation HTTP API for the 7-day dashboard.
//!
//! Local-only REST surface over the history store and module registry.
//! Every read endpoint is a pure function of current store+registry state;
//! `POST /api/modules/{id}/update` is the only mutator and runs parse+merge
//! synchronously under the module's merge gate. Read-path data corruption
//! never produces a 500 — it degrades to an empty history plus a warning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use watch_core::{ExecutionRecord, LogParser, ModuleRegistry, TestStatus};

use crate::history::{HistoryStore, RETENTION_DAYS};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub registry: ModuleRegistry,
    pub store: Arc<HistoryStore>,
    /// Budget for one synchronous parse+merge pass.
    pub update_timeout: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/modules", get(list_modules))
        .route("/api/modules/{module_id}/test-cases", get(list_test_cases))
        .route(
            "/api/modules/{module_id}/test-cases/{test_name}/history",
            get(test_history),
        )
        .route("/api/modules/{module_id}/download-log", get(download_log))
        .route("/api/modules/{module_id}/update", post(update_module))
        .route("/api/update-all", post(update_all))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}

// --- Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ModuleSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct TestCaseSummary {
    pub test_name: String,
    pub last_status: TestStatus,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<ExecutionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Counts returned by an update call.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub added: usize,
    pub duplicates: usize,
    pub pruned: usize,
    pub skipped_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub modules: Vec<String>,
    pub timestamp: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn module_not_found() -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "module not found".to_string(),
        }),
    )
}

// --- Handlers ---

/// GET /api/health - liveness probe.
///
/// 200 only when the history store's directory is reachable.
async fn health_check(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, HandlerError> {
    if let Err(e) = std::fs::create_dir_all(state.store.dir()) {
        error!(error = %e, "history store unreachable");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: format!("history store unreachable: {e}"),
            }),
        ));
    }

    Ok(Json(HealthResponse {
        status: "running",
        modules: state
            .registry
            .modules()
            .iter()
            .map(|m| m.id.clone())
            .collect(),
        timestamp: Local::now().naive_local().to_string(),
    }))
}

/// GET /api/modules - list configured modules.
async fn list_modules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let modules: Vec<ModuleSummary> = state
        .registry
        .modules()
        .iter()
        .map(|m| ModuleSummary {
            id: m.id.clone(),
            name: m.name.clone(),
        })
        .collect();
    Json(modules)
}

/// GET /api/modules/{module_id}/test-cases - test cases with last status.
///
/// Union of tests seen in history and tests declared in the module's
/// source files, so never-run tests appear as NOT_RUN.
async fn list_test_cases(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if state.registry.get(&module_id).is_none() {
        return Err(module_not_found());
    }

    let loaded = state.store.load(&module_id);
    let mut names: std::collections::BTreeSet<String> =
        loaded.tests.keys().cloned().collect();
    names.extend(state.registry.declared_tests(&module_id));

    let cases: Vec<TestCaseSummary> = names
        .into_iter()
        .map(|test_name| {
            let last_status = loaded
                .tests
                .get(&test_name)
                .and_then(|entries| entries.iter().max_by_key(|e| e.datetime))
                .map_or(TestStatus::NotRun, |e| e.status);
            TestCaseSummary {
                test_name,
                last_status,
            }
        })
        .collect();

    Ok(Json(cases))
}

/// GET /api/modules/{module_id}/test-cases/{test_name}/history
///
/// Ordered records for one test within the trailing window. An empty
/// history is a normal answer for a registered-but-never-run test, and a
/// corrupt document degrades to empty + warning instead of an error.
async fn test_history(
    State(state): State<Arc<AppState>>,
    Path((module_id, test_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    if state.registry.get(&module_id).is_none() {
        return Err(module_not_found());
    }

    let (mut history, warning) = state.store.get_history(&module_id, &test_name);

    // Pruning happens on merge; clamp reads too so a quiet module never
    // serves records older than the window.
    let cutoff = Local::now().naive_local() - chrono::Duration::days(RETENTION_DAYS);
    history.retain(|e| e.datetime >= cutoff);

    Ok(Json(HistoryResponse { history, warning }))
}

/// GET /api/modules/{module_id}/download-log - raw log file.
async fn download_log(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let Some(log_path) = state.registry.log_path(&module_id).map(std::path::Path::to_path_buf)
    else {
        return Err(module_not_found());
    };

    let content = tokio::fs::read(&log_path).await.map_err(|e| {
        warn!(module = %module_id, error = %e, "log file unreadable");
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "log file not found".to_string(),
            }),
        )
    })?;

    let filename = log_path
        .file_name()
        .map_or_else(|| format!("{module_id}.log"), |n| n.to_string_lossy().to_string());

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        content,
    ))
}

/// POST /api/modules/{module_id}/update - parse the log and merge.
///
/// The only mutating endpoint. Serializes with other updates for the same
/// module on the store's merge gate and returns once the pruned history is
/// persisted.
async fn update_module(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if state.registry.get(&module_id).is_none() {
        return Err(module_not_found());
    }

    let response = run_update(&state, &module_id).await?;
    Ok(Json(response))
}

/// POST /api/update-all - update every configured module.
async fn update_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut results = serde_json::Map::new();
    let ids: Vec<String> = state
        .registry
        .modules()
        .iter()
        .map(|m| m.id.clone())
        .collect();

    for module_id in ids {
        let value = match run_update(&state, &module_id).await {
            Ok(report) => serde_json::json!({
                "status": "updated",
                "added": report.added,
                "duplicates": report.duplicates,
                "pruned": report.pruned,
            }),
            Err((status, Json(body))) => serde_json::json!({
                "status": "error",
                "error": body.error,
                "code": status.as_u16(),
            }),
        };
        results.insert(module_id, value);
    }

    Json(serde_json::Value::Object(results))
}

/// Shared update path: gate, parse, merge, persist.
async fn run_update(state: &Arc<AppState>, module_id: &str) -> Result<UpdateResponse, HandlerError> {
    let gate = state.store.merge_gate(module_id).await;
    // Waiting here is how concurrent updates for one module serialize.
    let _guard = gate.lock().await;

    let log_path = state
        .registry
        .log_path(module_id)
        .map(std::path::Path::to_path_buf)
        .ok_or_else(module_not_found)?;

    if !log_path.exists() {
        return Ok(UpdateResponse {
            added: 0,
            duplicates: 0,
            pruned: 0,
            skipped_lines: 0,
            warning: Some("log file not found".to_string()),
        });
    }

    let store = Arc::clone(&state.store);
    let module = module_id.to_string();
    let known_tests = state.registry.declared_tests(module_id);
    let work = tokio::task::spawn_blocking(move || {
        // Fallback timestamp for records with no parseable Start: line.
        let fallback = std::fs::metadata(&log_path)
            .and_then(|m| m.modified())
            .map(|mtime| chrono::DateTime::<Local>::from(mtime).naive_local())
            .unwrap_or_else(|_| Local::now().naive_local());

        let text = std::fs::read_to_string(&log_path)?;
        let outcome = LogParser::new(fallback)
            .with_known_tests(known_tests)
            .parse(&text);
        let report = store.merge(&module, &outcome.records, Local::now().naive_local())?;
        Ok::<_, crate::history::HistoryError>((report, outcome.skipped))
    });

    match tokio::time::timeout(state.update_timeout, work).await {
        Ok(Ok(Ok((report, skipped)))) => {
            info!(
                module = module_id,
                added = report.added,
                duplicates = report.duplicates,
                pruned = report.pruned,
                skipped,
                "history updated"
            );
            Ok(UpdateResponse {
                added: report.added,
                duplicates: report.duplicates,
                pruned: report.pruned,
                skipped_lines: skipped,
                warning: None,
            })
        }
        Ok(Ok(Err(e))) => {
            // Persistence already retried once inside the store; surface
            // the failure as a recoverable warning, not a crash.
            error!(module = module_id, error = %e, "history update failed");
            Ok(UpdateResponse {
                added: 0,
                duplicates: 0,
                pruned: 0,
                skipped_lines: 0,
                warning: Some(format!("failed to update history: {e}")),
            })
        }
        Ok(Err(join_err)) => {
            error!(module = module_id, error = %join_err, "update task panicked");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "update task failed".to_string(),
                }),
            ))
        }
        Err(_) => {
            warn!(module = module_id, "update timed out");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "update timed out, retry".to_string(),
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use watch_core::config::{Config, ModuleConfig};

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let config = Config {
            modules: vec![ModuleConfig {
                id: "employer".to_string(),
                name: "Employer".to_string(),
                log_file: dir.path().join("employer.log"),
                test_files: vec![],
            }],
            ..Config::default()
        };
        Arc::new(AppState {
            registry: ModuleRegistry::from_config(&config),
            store: Arc::new(HistoryStore::new(dir.path().join("history"))),
            update_timeout: Duration::from_secs(10),
        })
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_module_returns_404() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        for uri in [
            "/api/modules/nope/test-cases",
            "/api/modules/nope/test-cases/test_x/history",
            "/api/modules/nope/download-log",
        ] {
            let response: Response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn update_on_unknown_module_returns_404() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/modules/nope/update")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_modules_returns_configured_set() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/api/modules")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn download_log_missing_file_returns_404() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/api/modules/employer/download-log")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_log_preserves_filename() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("employer.log"), "TEST test_a: PASS\n").unwrap();
        let app = create_router(test_state(&dir));

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/api/modules/employer/download-log")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("employer.log"));
    }
}
