// Export route modules
pub mod chat;
pub mod servers;
pub mod tools;

use crate::state::AppState;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(chat::routes(state.clone()))
        .merge(tools::routes(state.clone()))
        .merge(servers::routes(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = configure(test_support::state(vec![]).await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"status": "healthy"}));
    }
}
