//! Failure classes shared by every subsystem, used by callers (and the RPC
//! layer) to choose a fallback or a status code without matching on each
//! concrete error type.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ClosedResource,
    BuildFailure,
    InvalidInput,
    IoFailure,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ClosedResource => "closed",
            ErrorKind::BuildFailure => "build_failed",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::IoFailure => "io_failure",
        }
    }
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Joins an error and its sources into one line, skipping repeats.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) && !parts.last().is_some_and(|p| p.ends_with(&s)) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
