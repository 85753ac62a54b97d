use std::path::PathBuf;
use std::sync::Arc;

/// Errors produced by the resource managers and the guest host lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("manager is closed or was never initialized")]
    InvalidManagerState,

    #[error("resource does not belong to this manager")]
    InvalidResourceState,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("no available SCSI location across {controllers} controller(s)")]
    TooManyAttachments { controllers: u8 },

    #[error("not attached: {0}")]
    NotAttached(String),

    #[error("already attached: {0}")]
    AlreadyAttached(String),

    #[error("operation denied: {0}")]
    OperationDenied(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot {operation} guest host in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error(
        "failed to attach {} at controller {controller} lun {lun}: {source}",
        .host_path.display()
    )]
    Attach {
        host_path: PathBuf,
        controller: u8,
        lun: u8,
        #[source]
        source: Arc<Error>,
    },

    #[error("modify request failed: {0}")]
    Modify(String),

    #[error("guest host failed to start: {0}")]
    StartFailed(String),

    #[error("guest host {id} exited with error: {source}")]
    ExitedWithError {
        id: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported {kind} version {found} (supported: {supported})")]
    UnsupportedVersion {
        kind: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the innermost error, looking through attach and exit wrappers.
    ///
    /// Waiters on a shared attach receive the same wrapped error as the
    /// caller that issued it.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Attach { source, .. } | Error::ExitedWithError { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_manager_state() {
        let err = Error::InvalidManagerState;
        assert_eq!(
            err.to_string(),
            "manager is closed or was never initialized"
        );
    }

    #[test]
    fn error_display_too_many_attachments() {
        let err = Error::TooManyAttachments { controllers: 1 };
        assert_eq!(
            err.to_string(),
            "no available SCSI location across 1 controller(s)"
        );
    }

    #[test]
    fn error_display_invalid_state() {
        let err = Error::InvalidState {
            operation: "pause",
            state: "Created".to_string(),
        };
        assert_eq!(err.to_string(), "cannot pause guest host in state Created");
    }

    #[test]
    fn error_display_attach_includes_coordinates() {
        let err = Error::Attach {
            host_path: PathBuf::from("/disks/a.vhdx"),
            controller: 0,
            lun: 3,
            source: Arc::new(Error::Modify("host unavailable".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "failed to attach /disks/a.vhdx at controller 0 lun 3: modify request failed: host unavailable"
        );
    }

    #[test]
    fn error_display_unsupported_version() {
        let err = Error::UnsupportedVersion {
            kind: "scsi mount",
            found: 7,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported scsi mount version 7 (supported: 1)"
        );
    }

    #[test]
    fn root_cause_peels_nested_wrappers() {
        let inner = Arc::new(Error::TooManyAttachments { controllers: 4 });
        let attach = Error::Attach {
            host_path: PathBuf::from("/disks/b.vhdx"),
            controller: 1,
            lun: 0,
            source: inner,
        };
        let exited = Error::ExitedWithError {
            id: "vm".to_string(),
            source: Arc::new(attach),
        };
        assert!(matches!(
            exited.root_cause(),
            Error::TooManyAttachments { controllers: 4 }
        ));
    }

    #[test]
    fn root_cause_of_plain_error_is_itself() {
        let err = Error::Cancelled;
        assert!(matches!(err.root_cause(), Error::Cancelled));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
