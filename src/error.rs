use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Request-scoped proxy errors, mapped onto the status codes clients see.
#[derive(Error, Debug)]
pub enum VproxError {
    #[error("Unknown host")]
    UnknownHost,

    #[error("Not Found or service disabled")]
    ServiceDisabled,

    #[error("WebSocket not enabled")]
    WebSocketDisabled,

    #[error("Backend error")]
    Upstream(#[source] reqwest::Error),

    #[error("Request build error")]
    RequestBuild,

    #[error("Gzip error")]
    Gzip(#[source] std::io::Error),
}

impl VproxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            VproxError::UnknownHost => StatusCode::BAD_REQUEST,
            VproxError::ServiceDisabled | VproxError::WebSocketDisabled => StatusCode::NOT_FOUND,
            VproxError::Upstream(_) => StatusCode::BAD_GATEWAY,
            VproxError::RequestBuild => StatusCode::INTERNAL_SERVER_ERROR,
            VproxError::Gzip(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for VproxError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
