use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WidgetError {
    #[error("chatbot request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("chatbot returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("widget {0} not found")]
    WidgetNotFound(String),

    #[error("text is required")]
    EmptyMessage,

    #[error("no suggestion at index {0}")]
    UnknownChip(usize),

    #[error("invalid {key}: {reason}")]
    Config { key: &'static str, reason: String },
}

impl IntoResponse for WidgetError {
    fn into_response(self) -> Response {
        let status = match self {
            WidgetError::WidgetNotFound(_) => StatusCode::NOT_FOUND,
            WidgetError::EmptyMessage | WidgetError::UnknownChip(_) => StatusCode::BAD_REQUEST,
            WidgetError::Request(_) | WidgetError::Status { .. } => StatusCode::BAD_GATEWAY,
            WidgetError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
