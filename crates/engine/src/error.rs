use thiserror::Error;
use versa_core::{CoreError, Diagnostic};
use versa_storage::StorageError;

/// Coarse classification used when mapping failures onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Deleted,
    VersionConflict,
    Forbidden,
    Storage,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid search parameters for {resource_type}: {}", .errors.join("; "))]
    InvalidQuery {
        resource_type: String,
        errors: Vec<String>,
    },

    #[error("{count} {resource_type} resources match {query}, expected at most one")]
    MultipleMatches {
        resource_type: String,
        query: String,
        count: usize,
    },

    #[error("unknown reference {reference} at {location}")]
    UnknownReference { location: String, reference: String },

    #[error("reference {reference} at {location} could not be resolved: {reason}")]
    ReferenceNotResolved {
        location: String,
        reference: String,
        reason: String,
    },

    #[error("update as create not allowed for {resource_type}/{id}")]
    UpdateAsCreateNotAllowed { resource_type: String, id: String },

    #[error("{resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },

    #[error("{resource_type}/{id} is deleted (last version {version})")]
    Deleted {
        resource_type: String,
        id: String,
        version: u64,
    },

    #[error("version conflict on {resource_type}/{id}: expected version {expected}, current version {actual}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { resource_type, id } => Self::NotFound { resource_type, id },
            StorageError::Deleted {
                resource_type,
                id,
                version,
            } => Self::Deleted {
                resource_type,
                id,
                version,
            },
            StorageError::VersionConflict {
                resource_type,
                id,
                expected,
                actual,
            } => Self::VersionConflict {
                resource_type,
                id,
                expected,
                actual,
            },
            StorageError::InvalidResource(message) => Self::BadRequest(message),
            StorageError::UnknownResourceType(name) => {
                Self::BadRequest(format!("unsupported resource type {name}"))
            }
            other => Self::Storage(other),
        }
    }
}

impl EngineError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_)
            | Self::InvalidQuery { .. }
            | Self::MultipleMatches { .. }
            | Self::UnknownReference { .. }
            | Self::ReferenceNotResolved { .. }
            | Self::UpdateAsCreateNotAllowed { .. } => ErrorKind::BadRequest,
            Self::Core(CoreError::InvalidUrl(_) | CoreError::InvalidResource(_)) => {
                ErrorKind::BadRequest
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Deleted { .. } => ErrorKind::Deleted,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Core(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::MultipleMatches { .. } => 412,
            Self::UpdateAsCreateNotAllowed { .. } => 405,
            _ => match self.kind() {
                ErrorKind::BadRequest => 400,
                ErrorKind::NotFound => 404,
                ErrorKind::Deleted => 410,
                ErrorKind::VersionConflict => 412,
                ErrorKind::Forbidden => 403,
                ErrorKind::Storage | ErrorKind::Internal => 500,
            },
        }
    }

    /// True for failures caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Storage | ErrorKind::Internal)
    }

    /// Client-facing description. Server-side failures are not echoed back.
    pub fn diagnostic(&self) -> Diagnostic {
        let code = match self.kind() {
            ErrorKind::BadRequest => match self {
                Self::MultipleMatches { .. } => "multiple-matches",
                Self::UnknownReference { .. } | Self::ReferenceNotResolved { .. } => "reference",
                Self::UpdateAsCreateNotAllowed { .. } => "not-supported",
                _ => "invalid",
            },
            ErrorKind::NotFound => "not-found",
            ErrorKind::Deleted => "deleted",
            ErrorKind::VersionConflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Storage | ErrorKind::Internal => "exception",
        };

        let diagnostic = if self.is_client_error() {
            Diagnostic::error(code, self.to_string())
        } else {
            Diagnostic::error(code, "internal server error")
        };

        match self {
            Self::UnknownReference { location, .. } | Self::ReferenceNotResolved { location, .. } => {
                diagnostic.at(location.clone())
            }
            _ => diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_outcomes_keep_their_meaning() {
        let err = EngineError::from(StorageError::Deleted {
            resource_type: "Patient".into(),
            id: "1".into(),
            version: 2,
        });
        assert_eq!((err.kind(), err.status()), (ErrorKind::Deleted, 410));

        let err = EngineError::from(StorageError::VersionConflict {
            resource_type: "Patient".into(),
            id: "1".into(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(err.status(), 412);

        let err = EngineError::from(StorageError::IllegalState("autocommit".into()));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.is_client_error());
    }

    #[test]
    fn server_errors_do_not_leak_details() {
        let err = EngineError::Internal("secret path /var/db".into());
        assert_eq!(err.status(), 500);
        assert_eq!(err.diagnostic().text, "internal server error");
    }

    #[test]
    fn reference_errors_carry_their_location() {
        let err = EngineError::UnknownReference {
            location: "Observation.subject".into(),
            reference: "urn:uuid:x".into(),
        };
        let diagnostic = err.diagnostic();
        assert_eq!(err.status(), 400);
        assert_eq!(diagnostic.code, "reference");
        assert_eq!(diagnostic.location.as_deref(), Some("Observation.subject"));
        assert!(diagnostic.text.contains("urn:uuid:x"));
    }

    #[test]
    fn ambiguous_matches_are_precondition_failures() {
        let err = EngineError::MultipleMatches {
            resource_type: "Patient".into(),
            query: "identifier=a|b".into(),
            count: 2,
        };
        assert_eq!((err.kind(), err.status()), (ErrorKind::BadRequest, 412));
    }
}
