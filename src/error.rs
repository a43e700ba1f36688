//! Error types for the Tailscale operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error, including optimistic-concurrency conflicts
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing or malformed object template
    #[error("template error: {0}")]
    Template(String),

    /// Parent object lacks identity needed to build children
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is an API-server conflict (stale `resourceVersion`)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: a broken template surfaces at startup with the offending path
    #[test]
    fn story_template_errors_name_the_problem() {
        let err = Error::template("sts.yaml: pod template has no containers");
        assert!(err.to_string().contains("template error"));
        assert!(err.to_string().contains("no containers"));

        match Error::template("any") {
            Error::Template(msg) => assert_eq!(msg, "any"),
            _ => panic!("Expected Template variant"),
        }
    }

    /// Story: a Service without a uid cannot own children
    #[test]
    fn story_validation_error_for_incomplete_parent() {
        let err = Error::validation("Service default/web has no uid");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("default/web"));
    }

    /// Story: a write raced with another actor and the API server rejected
    /// the stale resourceVersion. The error is retryable like any other.
    #[test]
    fn story_conflicts_are_recognized_but_not_special_cased() {
        let conflict: Error = api_error(409, "Conflict").into();
        assert!(conflict.is_conflict());
        assert!(conflict.to_string().contains("kubernetes error"));

        let forbidden: Error = api_error(403, "Forbidden").into();
        assert!(!forbidden.is_conflict());
        assert!(!Error::serialization("bad yaml").is_conflict());
    }
}
