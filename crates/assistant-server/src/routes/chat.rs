use crate::error::ApiError;
use crate::state::AppState;
use assistant::agent::StreamEvent;
use assistant::models::message::Message;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::{stream::StreamExt, Stream};
use serde::Deserialize;
use serde_json::Value;
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    history: Vec<Message>,
}

/// Server-sent events body fed from a channel
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
                (
                    header::HeaderName::from_static("x-accel-buffering"),
                    "no",
                ),
            ],
            body,
        )
            .into_response()
    }
}

fn format_frame(frame: &Value) -> String {
    format!("data: {}\n\n", frame)
}

async fn handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<SseResponse, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("No message provided"));
    }

    let (tx, rx) = mpsc::channel(100);
    let mut stream = state.assistant.chat(&request.message, request.history);

    tokio::spawn(async move {
        loop {
            match timeout(Duration::from_millis(500), stream.next()).await {
                Ok(Some(event)) => {
                    let last = !matches!(event, StreamEvent::ContentDelta(_));
                    if let Some(frame) = event.frame() {
                        if tx.send(format_frame(&frame)).await.is_err() {
                            tracing::debug!("client went away, cancelling turn");
                            break;
                        }
                    }
                    if last {
                        break;
                    }
                }
                Ok(None) => break,
                // Heartbeat, used to detect disconnected clients and then end running tools.
                Err(_) => {
                    if tx.is_closed() {
                        tracing::debug!("client went away, cancelling turn");
                        break;
                    }
                }
            }
        }
        // Dropping the stream here cancels whatever the turn still had in flight
    });

    Ok(SseResponse::new(ReceiverStream::new(rx)))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(handler))
        .with_state(state)
}
