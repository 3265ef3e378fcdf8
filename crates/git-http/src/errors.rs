use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Boundary errors for the upload-pack path. Everything that reaches the
/// client in-band travels as a pkt-line `ERR` frame instead; these map to
/// HTTP statuses only when no response bytes have been written yet.
#[derive(Debug)]
pub enum GitHttpError {
    NotFound,
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl GitHttpError {
    pub fn internal(msg: impl Into<String>) -> Self {
        GitHttpError::Internal(msg.into())
    }
}

impl std::fmt::Display for GitHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitHttpError::NotFound => write!(f, "not found"),
            GitHttpError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            GitHttpError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            GitHttpError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GitHttpError {}

impl From<std::io::Error> for GitHttpError {
    fn from(err: std::io::Error) -> Self {
        GitHttpError::Internal(err.to_string())
    }
}

impl IntoResponse for GitHttpError {
    fn into_response(self) -> Response {
        match self {
            GitHttpError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            GitHttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            GitHttpError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            GitHttpError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}
