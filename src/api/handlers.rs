//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    AgentSnapshot, ChatResponse, ErrorResponse, ModelsResponse, SelectToolsRequest,
    SelectToolsResponse, SessionCreatedResponse, SessionSnapshot, SourcesResponse,
    SuccessResponse, ToolInfo, ToolServerInfo, ToolsResponse, UploadFileRequest,
    UploadFileResponse,
};
use super::AppState;
use crate::error::{ErrorKind, TurnError};
use crate::runtime::{ModelClient, TurnRequest};
use crate::session::SessionError;
use crate::storage::FileStore;
use crate::tools::qualified_name;
use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;

/// Header carrying the authenticated caller
pub const USER_HEADER: &str = "x-user-id";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Session lifecycle
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(disconnect_session),
        )
        // Turn events
        .route("/api/sessions/:id/stream", get(stream_session))
        // User actions
        .route("/api/sessions/:id/chat", post(send_chat))
        .route("/api/sessions/:id/tools", post(select_tools))
        .route("/api/sessions/:id/files", post(upload_file))
        // Discovery
        .route("/api/models", get(list_models))
        .route("/api/tools", get(list_tools))
        .route("/api/sources", get(list_sources))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Caller identity
// ============================================================

/// The user a request acts for. Authentication happens upstream; this
/// service trusts the forwarded header.
pub struct UserId(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("Missing {USER_HEADER} header")))
    }
}

// ============================================================
// Session lifecycle
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Json<SessionCreatedResponse> {
    let handle = state.sessions.create(&user).await;
    Json(SessionCreatedResponse {
        session_id: handle.id().to_string(),
    })
}

/// Snapshot of committed state. Waits for a running turn to finish.
async fn get_session(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let handle = state.sessions.get(&id, &user).await?;
    let session = handle.lock().await;
    Ok(Json(SessionSnapshot {
        id: session.id.clone(),
        owner: session.owner.clone(),
        messages: session.history().to_vec(),
        selection: session.selection.clone(),
        sources: session.sources.iter().cloned().collect(),
        files: session.files.clone(),
        agent: AgentSnapshot {
            max_steps: session.agent.max_steps,
            current_step: session.agent.current_step,
            pending_question: session.agent.pending_question().map(str::to_string),
        },
        turn_running: handle.is_turn_running(),
    }))
}

async fn disconnect_session(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.sessions.remove(&id, &user).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn stream_session(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.sessions.get(&id, &user).await?;
    let rx = handle.subscribe();
    Ok(sse_stream(id, handle.is_turn_running(), rx))
}

// ============================================================
// User actions
// ============================================================

/// Run one turn and return its bundled response. The turn runs on its
/// own task so a dropped request does not abandon it halfway; events
/// keep flowing to stream subscribers either way.
async fn send_chat(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let handle = state.sessions.get(&id, &user).await?;
    let router = state.router.clone();
    let turn = tokio::spawn(async move { router.handle_turn(&handle, &user, request).await });
    let message = turn
        .await
        .map_err(|e| AppError::Internal(format!("Turn task failed: {e}")))??;
    Ok(Json(ChatResponse { message }))
}

async fn select_tools(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<SelectToolsRequest>,
) -> Result<Json<SelectToolsResponse>, AppError> {
    let handle = state.sessions.get(&id, &user).await?;
    let catalog = state.router.catalog();
    let mut targets = Vec::with_capacity(request.tools.len());
    for entry in &request.tools {
        targets.push(
            catalog
                .resolve_selection(entry)
                .await
                .map_err(AppError::BadRequest)?,
        );
    }

    let mut session = handle.lock().await;
    session.selection.replace(targets);
    Ok(Json(SelectToolsResponse {
        selection: session.selection.clone(),
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<UploadFileRequest>,
) -> Result<Json<UploadFileResponse>, AppError> {
    let handle = state.sessions.get(&id, &user).await?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("File name is required".to_string()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(request.data.as_bytes())
        .map_err(|e| AppError::BadRequest(format!("Invalid base64 data: {e}")))?;

    let stored = state
        .files
        .put(&user, name, bytes)
        .await
        .map_err(TurnError::from)?;
    tracing::info!(
        session_id = %id,
        file = %stored.name,
        size = stored.size,
        "File uploaded"
    );

    handle
        .lock()
        .await
        .files
        .insert(stored.name.clone(), stored.reference.clone());
    Ok(Json(UploadFileResponse {
        name: stored.name,
        reference: stored.reference,
        size: stored.size,
    }))
}

// ============================================================
// Discovery
// ============================================================

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.router.models();
    Json(ModelsResponse {
        models: models.model_info(),
        default: models.default_model_id(),
    })
}

/// Servers the caller may use and the tools each one lists
async fn list_tools(State(state): State<AppState>, UserId(user): UserId) -> Json<ToolsResponse> {
    let catalog = state.router.catalog();
    let mut servers = Vec::new();
    for name in state.authorizer.visible_servers(&user).await {
        let Some(server) = catalog.get(&name) else {
            continue;
        };
        let tools = match server.list_tools().await {
            Ok(specs) => specs
                .into_iter()
                .map(|spec| ToolInfo {
                    qualified_name: qualified_name(&name, &spec.name),
                    description: spec.description,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "Failed to list tools");
                Vec::new()
            }
        };
        servers.push(ToolServerInfo {
            exclusive: server.policy().exclusive,
            name,
            tools,
        });
    }
    Json(ToolsResponse { servers })
}

async fn list_sources(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<SourcesResponse>, AppError> {
    let sources = state.router.retrieval().discover(&user).await?;
    Ok(Json(SourcesResponse {
        sources: sources.into_iter().collect(),
    }))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("parley ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
    Turn(TurnError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::Forbidden(_) => AppError::Forbidden(err.to_string()),
        }
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        AppError::Turn(err)
    }
}

fn turn_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::Provider => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ErrorResponse::new(msg)),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorResponse::new(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
            AppError::Turn(err) => {
                let kind = err.kind();
                (
                    turn_status(kind),
                    ErrorResponse::new(err.user_message()).with_kind(kind),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
