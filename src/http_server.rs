//! HTTP server implementation using Axum: the UI page plus the editor,
//! preview and terminal endpoints it talks to.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::error::{DevError, DevResult};
use crate::orchestrator::SetupState;
use crate::preview::PreviewState;
use crate::process::TerminalSize;
use crate::state::AppState;
use crate::terminal::TerminalWidget;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Serialize)]
struct StateResponse {
    setup: SetupState,
    preview: PreviewState,
    address: Option<String>,
    source_path: String,
    source_revision: u64,
    sync_error: Option<String>,
}

#[derive(Serialize)]
struct SourceResponse {
    path: String,
    contents: String,
    revision: u64,
}

#[derive(Deserialize)]
struct UpdateSourceRequest {
    contents: String,
}

#[derive(Serialize)]
struct UpdateSourceResponse {
    revision: u64,
}

#[derive(Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(axum::http::HeaderValue::from_static("*"));

    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/source", get(get_source).put(put_source))
        .route("/api/files/*path", get(read_file))
        .route("/ws/terminal", get(terminal_ws))
        .route("/ws/preview", get(preview_ws))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Run the HTTP server on the given port until `shutdown` resolves.
pub async fn run_server(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn index(State(state): State<AppState>) -> Response {
    let Some(dir) = state.static_dir else {
        return Html(INDEX_HTML).into_response();
    };
    match tokio::fs::read_to_string(dir.join("index.html")).await {
        Ok(contents) => Html(contents).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn get_state(State(state): State<AppState>) -> Json<StateResponse> {
    let orchestrator = &state.orchestrator;
    let preview = orchestrator.preview().current();
    let source = orchestrator.source();
    Json(StateResponse {
        setup: orchestrator.state(),
        address: preview.address(),
        preview,
        source_path: source.path().to_string(),
        source_revision: source.revision(),
        sync_error: source.last_error(),
    })
}

async fn get_source(State(state): State<AppState>) -> Json<SourceResponse> {
    let source = state.orchestrator.source();
    Json(SourceResponse {
        path: source.path().to_string(),
        contents: source.contents(),
        revision: source.revision(),
    })
}

async fn put_source(
    State(state): State<AppState>,
    Json(req): Json<UpdateSourceRequest>,
) -> Json<UpdateSourceResponse> {
    let revision = state.orchestrator.source().set(req.contents);
    debug!(revision, "PUT /api/source");
    Json(UpdateSourceResponse { revision })
}

async fn read_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> DevResult<Response> {
    let sandbox = state.orchestrator.session().ok_or(DevError::NotBooted)?;
    let contents = sandbox.read_file(&path).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], contents).into_response())
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> impl IntoResponse {
    let defaults = TerminalSize::default();
    let size = TerminalSize {
        cols: query.cols.filter(|&c| c > 0).unwrap_or(defaults.cols),
        rows: query.rows.filter(|&r| r > 0).unwrap_or(defaults.rows),
    };
    ws.on_upgrade(move |socket| host_terminal(state, size, socket))
}

/// The websocket is the terminal's hosting surface: the widget lives exactly
/// as long as the connection.
async fn host_terminal(state: AppState, size: TerminalSize, socket: WebSocket) {
    let terminal = TerminalWidget::new(size);
    let id = terminal.id();
    info!(terminal_id = %id, cols = size.cols, rows = size.rows, "Terminal connected");

    state.orchestrator.attach_terminal(terminal.clone());
    terminal.attach_socket(socket).await;
    state.orchestrator.detach_terminal(id);
    info!(terminal_id = %id, "Terminal disconnected");
}

async fn preview_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_preview(state, socket))
}

/// Push the preview state on connect and after every change.
async fn push_preview(state: AppState, socket: WebSocket) {
    let mut updates = state.orchestrator.preview().subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            let current = updates.borrow_and_update().clone();
            let Ok(text) = serde_json::to_string(&PreviewMessage::from(current)) else {
                break;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
    send_task.abort();
}

#[derive(Serialize)]
struct PreviewMessage {
    url: Option<String>,
    generation: u64,
    address: Option<String>,
}

impl From<PreviewState> for PreviewMessage {
    fn from(state: PreviewState) -> Self {
        Self {
            address: state.address(),
            url: state.url,
            generation: state.generation,
        }
    }
}
