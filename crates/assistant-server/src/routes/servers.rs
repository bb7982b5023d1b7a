use crate::error::ApiError;
use crate::state::AppState;
use assistant::models::server::{RemoteToolServer, ServerInfo, ServerRegistration};
use assistant::models::tool::Tool;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};

async fn list(State(state): State<AppState>) -> Json<Vec<ServerInfo>> {
    Json(state.assistant.list_servers().await)
}

async fn register(
    State(state): State<AppState>,
    Json(registration): Json<ServerRegistration>,
) -> Result<(StatusCode, Json<RemoteToolServer>), ApiError> {
    let server = state.assistant.register_server(registration).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.assistant.delete_server(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync(State(state): State<AppState>) -> Result<Json<Vec<Tool>>, ApiError> {
    Ok(Json(state.assistant.sync_tools().await?))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/mcp-servers", get(list).post(register))
        .route("/mcp-servers/sync", post(sync))
        .route("/mcp-servers/:name", delete(remove))
        .with_state(state)
}
