//! Error kinds shared across the daemon surface.
//!
//! Subsystems define their own `thiserror` enums; each maps onto one of these
//! kinds so the RPC layer and the streaming gateway report a stable string.

use serde::Serialize;

/// Stable error kind reported to callers (RPC `data.kind`, agent
/// `error_message` classification).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Conflict,
    Validation,
    Transient,
    Timeout,
    Cancelled,
    DependencyFailed,
    ConditionUnmet,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::ConditionUnmet => "condition_unmet",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by subsystem errors so callers can classify without matching
/// on every variant.
pub trait Kinded {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::InvalidRequest.as_str(), "invalid_request");
        assert_eq!(ErrorKind::DependencyFailed.as_str(), "dependency_failed");
        assert_eq!(ErrorKind::ConditionUnmet.as_str(), "condition_unmet");
    }

    #[test]
    fn kind_serializes_to_string() {
        let v = serde_json::to_value(ErrorKind::Timeout).unwrap();
        assert_eq!(v, "timeout");
    }
}
