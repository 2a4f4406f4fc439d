use thiserror::Error;

/// Why the scheduler loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Explicit shutdown (signal or caller request).
    Shutdown,
    /// Configuration changed; the embedding daemon should reload and restart.
    Reload,
    /// The loop's top-level deadline elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Shutdown => "shutdown requested",
            Self::Reload => "reload requested",
            Self::DeadlineExceeded => "deadline exceeded",
        };
        f.write_str(s)
    }
}

/// Top-level error type for Hangar.
#[derive(Error, Debug)]
pub enum HangarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Security error: {0}")]
    Security(String),

    /// The workload ran and exited unsuccessfully.
    #[error("Workload exited with code {exit_code}")]
    Workload { exit_code: i64 },

    /// The container runtime no longer knows the requested object.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(StopCause),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl HangarError {
    /// True for errors that must stop the whole scheduler loop.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The stop cause carried by a cancellation error.
    pub fn stop_cause(&self) -> Option<StopCause> {
        match self {
            Self::Cancelled(cause) => Some(*cause),
            _ => None,
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, HangarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = HangarError::Config("missing key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HangarError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn workload_error_reports_exit_code() {
        let err = HangarError::Workload { exit_code: 3 };
        assert_eq!(err.to_string(), "Workload exited with code 3");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation_carries_cause() {
        let err = HangarError::Cancelled(StopCause::DeadlineExceeded);
        assert!(err.is_cancellation());
        assert_eq!(err.stop_cause(), Some(StopCause::DeadlineExceeded));
        assert_eq!(err.to_string(), "Cancelled: deadline exceeded");
        assert_eq!(HangarError::Other("x".into()).stop_cause(), None);
    }
}
