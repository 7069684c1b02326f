//! Error types shared by every component

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Any failure reported by the Kubernetes API server or the client transport
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Another exchange/mesh session currently owns the service's routing
    #[error("service '{service}' is already in use by another session (locked {age_secs}s ago)")]
    Locked { service: String, age_secs: i64 },

    /// An external process stage failed to start or died
    #[error("{stage} failed: {message}")]
    Process { stage: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn internal(message: &str) -> Self {
        AppError::Internal(message.to_string())
    }

    pub fn not_found(kind: &'static str, name: &str) -> Self {
        AppError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn process(stage: &str, message: impl Into<String>) -> Self {
        AppError::Process {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// True when the error means the object does not exist (a 404 from the
    /// API server counts as well)
    pub fn is_not_found(&self) -> bool {
        match self {
            AppError::NotFound { .. } => true,
            AppError::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, AppError::Locked { .. })
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    #[test]
    fn test_api_404_is_not_found() {
        let err = AppError::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"x\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(err.is_not_found());
        assert!(!err.is_locked());
    }

    #[test]
    fn test_locked_message() {
        let err = AppError::Locked {
            service: "orders".to_string(),
            age_secs: 30,
        };
        assert!(err.is_locked());
        assert!(err.to_string().contains("orders"));
    }
}
