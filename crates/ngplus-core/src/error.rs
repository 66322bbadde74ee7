use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Target process not attached: {0}")]
    Attachment(String),

    #[error("Pointer '{name}' unresolved at hop {hop}: {reason}")]
    UnresolvedPointer {
        name: String,
        hop: usize,
        reason: String,
    },

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Memory access failed at address {address:#x}: {message}")]
    Access { address: u64, message: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("Monitor unavailable: {0}")]
    MonitorUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn access(address: u64, message: impl Into<String>) -> Self {
        Error::Access {
            address,
            message: message.into(),
        }
    }

    pub fn unresolved(name: impl Into<String>, hop: usize, reason: impl Into<String>) -> Self {
        Error::UnresolvedPointer {
            name: name.into(),
            hop,
            reason: reason.into(),
        }
    }

    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Recoverable errors are retried on a later tick or attachment.
    ///
    /// Schema and configuration faults are defects, not runtime conditions.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Schema(_) | Error::Config(_) | Error::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.is_not_found());

        let other_io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err2 = Error::Io(other_io_err);
        assert!(!err2.is_not_found());
    }

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(Error::Attachment("gone".into()).is_recoverable());
        assert!(Error::unresolved("ng_level", 1, "null").is_recoverable());
        assert!(Error::PatternNotFound("SpEffectParam".into()).is_recoverable());
        assert!(Error::access(0x1000, "partial read").is_recoverable());
        assert!(!Error::Schema("length mismatch".into()).is_recoverable());
        assert!(!Error::Config("missing field".into()).is_recoverable());
    }

    #[test]
    fn test_access_display() {
        let err = Error::access(0x7FF4_0000_0000, "read failed");
        assert_eq!(
            err.to_string(),
            "Memory access failed at address 0x7ff400000000: read failed"
        );
    }
}
