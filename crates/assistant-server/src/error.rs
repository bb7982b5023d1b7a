use assistant::errors::ServiceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

const ENV_PREFIX: &str = "ASSISTANT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// The environment variable that sets a dotted configuration path,
/// e.g. `provider.api_key` -> `ASSISTANT_PROVIDER__API_KEY`
pub fn to_env_var(field_path: &str) -> String {
    format!("{}_{}", ENV_PREFIX, field_path.replace('.', "__").to_uppercase())
}

/// An error answered as `{"error": message}` with a matching status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Storage(e) => {
                tracing::error!("storage failure: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assistant::errors::ValidationError;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("provider.api_key"), "ASSISTANT_PROVIDER__API_KEY");
        assert_eq!(to_env_var("server.port"), "ASSISTANT_SERVER__PORT");
    }

    #[test]
    fn test_service_errors_map_to_status() {
        let err: ApiError = ServiceError::Validation(ValidationError::MissingField("url")).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "missing required field: url");

        let err: ApiError = ServiceError::NotFound("tool 9".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
