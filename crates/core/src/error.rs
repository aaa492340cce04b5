//! Error taxonomy for calls against the cluster resource API.

use thiserror::Error;

/// Typed failure of a cluster API call. Classified into outcomes at the
/// component that made the call; never forwarded raw across components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("version conflict: {0}")]
    VersionConflict(String),
    #[error("resume token expired")]
    ResumeTokenExpired,
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed spec: {0}")]
    MalformedSpec(String),
}

impl ClusterError {
    /// Errors that cannot be fixed by retrying the same call.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ClusterError::PermissionDenied(_) | ClusterError::MalformedSpec(_))
    }

    /// Map an HTTP-ish status code into the taxonomy.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => ClusterError::NotFound(message),
            409 if message.contains("already exists") => ClusterError::AlreadyExists(message),
            409 => ClusterError::VersionConflict(message),
            410 => ClusterError::ResumeTokenExpired,
            401 | 403 => ClusterError::PermissionDenied(message),
            400 | 422 => ClusterError::MalformedSpec(message),
            _ => ClusterError::TransientNetwork(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_taxonomy() {
        assert_eq!(ClusterError::from_status(404, "x"), ClusterError::NotFound("x".into()));
        assert_eq!(ClusterError::from_status(409, "the object has been modified"), ClusterError::VersionConflict("the object has been modified".into()));
        assert!(matches!(ClusterError::from_status(409, "configmaps \"a\" already exists"), ClusterError::AlreadyExists(_)));
        assert_eq!(ClusterError::from_status(410, "too old"), ClusterError::ResumeTokenExpired);
        assert!(ClusterError::from_status(403, "forbidden").is_permanent());
        assert!(ClusterError::from_status(422, "invalid").is_permanent());
        assert!(!ClusterError::from_status(503, "unavailable").is_permanent());
    }
}
