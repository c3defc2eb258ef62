//! HTTP surface: submit, watch, poll, download and clean up tasks.
//!
//! | Method | Path                       | Response                              |
//! |--------|----------------------------|---------------------------------------|
//! | GET    | `/api/health`              | `{status, tasks}`                     |
//! | POST   | `/api/convert?filename=`   | 202 `{task_id, websocket_url, …}`     |
//! | GET    | `/ws/{task_id}`            | WebSocket, one JSON event per message |
//! | GET    | `/api/events/{task_id}`    | NDJSON, one event per line            |
//! | GET    | `/api/status/{task_id}`    | task snapshot + subscriber count      |
//! | GET    | `/api/download/{task_id}`  | `text/html`, 409 until `completed`    |
//! | GET    | `/api/tasks`               | tasks inside the retention window     |
//! | DELETE | `/api/task/{task_id}`      | 204, drops task and event history     |
//!
//! Errors are JSON `{"error": …, "code": …}`.

use crate::broadcast::Subscription;
use crate::config::ConversionConfig;
use crate::error::Pdf2HtmlError;
use crate::orchestrator::TaskOrchestrator;
use crate::pipeline::input::ResolvedInput;
use crate::task::{TaskId, TaskSnapshot, TaskStatus};
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How often the retention sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Pdf2HtmlError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Task {0} has no result yet (status: {1})")]
    NotReady(TaskId, TaskStatus),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Core(core) => {
                let status = match core {
                    Pdf2HtmlError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                    Pdf2HtmlError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    Pdf2HtmlError::InvalidInput { .. }
                    | Pdf2HtmlError::NotAPdf { .. }
                    | Pdf2HtmlError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                    Pdf2HtmlError::ProviderNotConfigured { .. }
                    | Pdf2HtmlError::RendererUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    other => {
                        error!(error = %other, "request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, core.code())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotReady(..) => (StatusCode::CONFLICT, "not_ready"),
        };

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

// ── State ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: TaskOrchestrator,
    pub retention: Duration,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(orchestrator: TaskOrchestrator, config: &ConversionConfig) -> Self {
        Self {
            orchestrator,
            retention: config.task_retention(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // Let oversized uploads reach the handler so they get a JSON 413.
    let body_limit = state.max_upload_bytes.saturating_add(1024 * 1024);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/convert", post(convert))
        .route("/ws/{task_id}", get(ws_events))
        .route("/api/events/{task_id}", get(ndjson_events))
        .route("/api/status/{task_id}", get(status))
        .route("/api/download/{task_id}", get(download))
        .route("/api/tasks", get(list_tasks))
        .route("/api/task/{task_id}", delete(remove_task))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C. Expired tasks are swept every ten
/// minutes.
pub async fn serve(
    addr: SocketAddr,
    orchestrator: TaskOrchestrator,
    config: &ConversionConfig,
) -> Result<(), Pdf2HtmlError> {
    let state = AppState::new(orchestrator, config);
    let shutdown = CancellationToken::new();
    let sweeper = state.orchestrator.registry().spawn_retention_sweeper(
        state.retention,
        SWEEP_INTERVAL,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Pdf2HtmlError::Internal(format!("cannot bind {addr}: {e}")))?;
    info!("Listening on http://{}", addr);

    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .map_err(|e| Pdf2HtmlError::Internal(format!("server error: {e}")));

    shutdown.cancel();
    let _ = sweeper.await;
    result
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a task id")))
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "tasks": state.orchestrator.registry().len(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConvertParams {
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct Submitted {
    task_id: TaskId,
    websocket_url: String,
    events_url: String,
    status_url: String,
}

async fn convert(
    State(state): State<AppState>,
    Query(params): Query<ConvertParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Submitted>)> {
    let name = params.filename.as_deref().unwrap_or("upload.pdf");
    let input = ResolvedInput::from_bytes(&body, name, state.max_upload_bytes).await?;
    let task_id = state.orchestrator.submit(input);
    info!(task_id = %task_id, bytes = body.len(), "conversion submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Submitted {
            task_id,
            websocket_url: format!("/ws/{task_id}"),
            events_url: format!("/api/events/{task_id}"),
            status_url: format!("/api/status/{task_id}"),
        }),
    ))
}

fn subscribe(state: &AppState, raw: &str) -> ApiResult<Subscription> {
    let id = parse_task_id(raw)?;
    Ok(state.orchestrator.registry().broadcaster().subscribe(id)?)
}

async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let subscription = subscribe(&state, &task_id)?;
    Ok(ws.on_upgrade(move |socket| forward_to_socket(socket, subscription, state)))
}

async fn forward_to_socket(socket: WebSocket, mut subscription: Subscription, state: AppState) {
    let task_id = subscription.task_id();
    debug!(task_id = %task_id, subscriber = subscription.id(), "WebSocket connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "cannot serialise event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    debug!(task_id = %task_id, "WebSocket sink closed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state
        .orchestrator
        .registry()
        .broadcaster()
        .detach(task_id, subscription.id());
    debug!(task_id = %task_id, "WebSocket disconnected");
}

async fn ndjson_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let subscription = subscribe(&state, &task_id)?;
    let lines = subscription.into_stream().map(|event| {
        serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        })
    });
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    snapshot: TaskSnapshot,
    subscribers: usize,
}

async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let id = parse_task_id(&task_id)?;
    let registry = state.orchestrator.registry();
    let snapshot = registry.snapshot(id).ok_or(Pdf2HtmlError::TaskNotFound(id))?;
    Ok(Json(StatusView {
        snapshot,
        subscribers: registry.broadcaster().subscriber_count(id),
    }))
}

async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_task_id(&task_id)?;
    let task = state
        .orchestrator
        .registry()
        .get(id)
        .ok_or(Pdf2HtmlError::TaskNotFound(id))?;
    let document = task.result().ok_or(ApiError::NotReady(id, task.status()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}.html\""),
            ),
        ],
        document.html.clone(),
    )
        .into_response())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskSnapshot>> {
    Json(state.orchestrator.registry().list_active(state.retention))
}

async fn remove_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_task_id(&task_id)?;
    if state.orchestrator.registry().remove(id) {
        info!(task_id = %id, "task removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Pdf2HtmlError::TaskNotFound(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ProgressBroadcaster;
    use crate::error::PageError;
    use crate::output::{Dimensions, DocumentMetadata};
    use crate::pipeline::{
        Extraction, Generator, PageContext, RasterPage, Rasterizer, RenderSession, Renderer,
        Screenshot, SimilarityReport,
    };
    use crate::registry::TaskRegistry;
    use async_trait::async_trait;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::path::{Path as FsPath, PathBuf};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct OnePage;

    #[async_trait]
    impl Rasterizer for OnePage {
        async fn rasterize(&self, _: &FsPath) -> Result<Extraction, Pdf2HtmlError> {
            let page = RasterPage {
                page_number: 1,
                image_path: PathBuf::from("/nonexistent/page_0001.png"),
                geometry: Dimensions::new(612.0, 792.0),
                pixel_geometry: Dimensions::new(1275.0, 1650.0),
            };
            Ok(Extraction::new(vec![page], DocumentMetadata::default(), None))
        }
    }

    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        async fn generate_initial(&self, _: &FsPath, _: &PageContext) -> Result<String, PageError> {
            Ok("<html><body><p>hello</p></body></html>".into())
        }
        async fn refine(
            &self,
            _: &FsPath,
            m: &str,
            _: &Screenshot,
            _: &PageContext,
            _: u32,
        ) -> Result<String, PageError> {
            Ok(m.to_string())
        }
        async fn score_similarity(
            &self,
            _: &FsPath,
            _: &Screenshot,
            _: &PageContext,
        ) -> Result<SimilarityReport, PageError> {
            Ok(SimilarityReport::default())
        }
    }

    struct NoRender;

    #[async_trait]
    impl Renderer for NoRender {
        async fn start(&self, page: &PageContext) -> Result<Box<dyn RenderSession>, PageError> {
            Err(PageError::RenderFailed {
                page: page.page_number,
                detail: "unused".into(),
            })
        }
    }

    fn app() -> (Router, Arc<TaskRegistry>) {
        let config = ConversionConfig::builder().max_iterations(0).build().unwrap();
        let registry = Arc::new(TaskRegistry::new(Arc::new(ProgressBroadcaster::default())));
        let orchestrator = TaskOrchestrator::new(
            Arc::clone(&registry),
            Arc::new(OnePage),
            Arc::new(Echo),
            Arc::new(NoRender),
            &config,
        );
        (router(AppState::new(orchestrator, &config)), registry)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        send(app, Method::GET, uri, Body::empty()).await
    }

    async fn wait_for_completion(registry: &TaskRegistry, id: TaskId) {
        for _ in 0..200 {
            if registry.snapshot(id).is_some_and(|s| s.status.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/api/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn non_pdf_upload_is_rejected() {
        let (app, registry) = app();
        let (status, body) = send(&app, Method::POST, "/api/convert", Body::from("hello")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "invalid_input");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let (app, _) = app();
        let (status, _) = get(&app, &format!("/api/status/{}", TaskId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(&app, Method::GET, "/api/status/nope", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn submit_poll_download_delete() {
        let (app, registry) = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/convert?filename=doc.pdf",
            Body::from("%PDF-1.7\n%%EOF"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id: TaskId = json["task_id"].as_str().unwrap().parse().unwrap();
        assert_eq!(json["websocket_url"], format!("/ws/{id}"));

        wait_for_completion(&registry, id).await;

        let (status, body) = get(&app, &format!("/api/status/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result_available"], true);
        assert_eq!(json["source"], "doc.pdf");

        let (status, body) = get(&app, &format!("/api/download/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("<p>hello</p>"));

        let (status, body) = send(&app, Method::GET, "/api/tasks", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let list: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.len(), 1);

        let (status, _) =
            send(&app, Method::DELETE, &format!("/api/task/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = get(&app, &format!("/api/download/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_before_completion_conflicts() {
        let (app, registry) = app();
        let id = registry.create("pending.pdf");
        let (status, body) = get(&app, &format!("/api/download/{id}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "not_ready");
    }

    #[tokio::test]
    async fn ndjson_replays_finished_task() {
        let (app, registry) = app();
        let (_, body) = send(&app, Method::POST, "/api/convert", Body::from("%PDF-1.7\n")).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id: TaskId = json["task_id"].as_str().unwrap().parse().unwrap();
        wait_for_completion(&registry, id).await;

        let (status, body) = get(&app, &format!("/api/events/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let kinds: Vec<String> = String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|l| {
                let event: serde_json::Value = serde_json::from_str(l).unwrap();
                event["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("connection"));
        assert_eq!(kinds.last().map(String::as_str), Some("task_completed"));
        assert!(kinds.iter().any(|k| k == "page_completed"));
    }
}
