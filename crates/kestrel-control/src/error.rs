use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kestrel_agent::error::{Classify, ErrorKind, format_error_chain};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::ClosedResource => StatusCode::GONE,
        ErrorKind::BuildFailure => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a ErrorBody,
}

/// An error as returned over HTTP: a status code plus `{"error": {...}}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.body.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::InvalidInput.code(), message)
    }

    pub fn unknown_method(category: &str, method: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "unknown_method",
            format!("no method {method} in category {category}"),
        )
    }

    /// Status and code come from the error's class; the message is its
    /// whole source chain.
    pub fn classified<E>(err: &E) -> Self
    where
        E: Classify + std::error::Error + 'static,
    {
        let kind = err.kind();
        Self::new(status_for(kind), kind.code(), format_error_chain(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope { error: &self.body })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 21);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.len() <= 21 + 2);
        assert_eq!(truncate_utf8("short", 21), "short");
    }

    #[test]
    fn kinds_map_to_distinct_statuses() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::ClosedResource), StatusCode::GONE);
        assert_eq!(status_for(ErrorKind::BuildFailure), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::IoFailure), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
