use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Missing subscription config")]
    MissingConfig,

    #[error("Invalid subscription config: {0}")]
    InvalidConfig(String),

    #[error("Invalid application config: {0}")]
    Config(String),

    #[error("Subscription already exists: {0}")]
    AlreadyExists(String),

    #[error("Subscription ID not found: {0}")]
    NotFound(String),

    #[error("Subscription not ready to send notifications")]
    InvalidState,

    #[error("Websocket connection not ready to send")]
    NotReady,

    #[error("Websocket connection already up")]
    AlreadyConnected,

    #[error("Websocket endpoint not accepting connections")]
    NotAccepting,

    #[error("Message handler already exists with name: {0}")]
    HandlerExists(String),

    #[error("Message handler does not exist with name: {0}")]
    HandlerNotFound(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("No response handler for sequence number: {0}")]
    UnknownSequence(u32),

    #[error("Websocket error: {0}")]
    Websocket(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected notification response status: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid notification request: {0}")]
    Request(#[from] axum::http::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// HTTP status the front-end answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotifyError::NotFound(_) | NotifyError::NotAccepting => StatusCode::NOT_FOUND,
            NotifyError::MissingConfig
            | NotifyError::InvalidConfig(_)
            | NotifyError::Json(_) => StatusCode::BAD_REQUEST,
            NotifyError::AlreadyExists(_) | NotifyError::InvalidState => StatusCode::CONFLICT,
            NotifyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            NotifyError::UnexpectedStatus(_)
            | NotifyError::Http(_)
            | NotifyError::NotReady
            | NotifyError::Callback(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_build_failure_is_not_a_websocket_error() {
        let err: NotifyError = axum::http::Request::builder()
            .uri("not a uri")
            .body(())
            .unwrap_err()
            .into();
        assert!(matches!(err, NotifyError::Request(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().starts_with("Invalid notification request"));
    }

    #[test]
    fn refused_upgrade_maps_to_not_found() {
        assert_eq!(NotifyError::NotAccepting.status_code(), StatusCode::NOT_FOUND);
    }
}
