use crate::error::ApiError;
use crate::state::AppState;
use assistant::models::tool::{Tool, ToolId, ToolUpdate};
use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};

async fn list(State(state): State<AppState>) -> Json<Vec<Tool>> {
    Json(state.assistant.list_tools())
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<ToolId>,
    Json(update): Json<ToolUpdate>,
) -> Result<Json<Tool>, ApiError> {
    Ok(Json(state.assistant.update_tool(id, update).await?))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tools", get(list))
        .route("/tools/:id", patch(update))
        .with_state(state)
}
