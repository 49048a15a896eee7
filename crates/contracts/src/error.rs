use crate::fields::PatchError;

/// Error taxonomy shared by both services.
///
/// Lower layers produce these; only the HTTP layer of each service chooses a
/// status code. Messages are fixed strings or field names, never values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authentication(&'static str),
    #[error("{0}")]
    Authorization(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Unavailable(&'static str),
    #[error("{0}")]
    BadGateway(&'static str),
    /// The operation is disabled in the current deployment mode.
    #[error("{0}")]
    NotImplemented(&'static str),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Configuration(_) => "ERR_CONFIGURATION",
            ServiceError::Validation(_) => "ERR_VALIDATION",
            ServiceError::Authentication(_) => "ERR_AUTHENTICATION",
            ServiceError::Authorization(_) => "ERR_FORBIDDEN",
            ServiceError::NotFound(_) => "ERR_NOT_FOUND",
            ServiceError::Unavailable(_) => "ERR_UNAVAILABLE",
            ServiceError::BadGateway(_) => "ERR_BAD_GATEWAY",
            ServiceError::NotImplemented(_) => "ERR_NOT_IMPLEMENTED",
            ServiceError::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// Message safe to return to a caller. Internal and configuration
    /// detail is only exposed when `expose_internal` is set (development).
    pub fn public_message(&self, expose_internal: bool) -> String {
        match self {
            ServiceError::Internal(_) | ServiceError::Configuration(_) if !expose_internal => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<PatchError> for ServiceError {
    fn from(value: PatchError) -> Self {
        ServiceError::Validation(value.to_string())
    }
}
