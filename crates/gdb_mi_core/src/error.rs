use std::time::Duration;
use thiserror::Error;

use crate::types::Record;

#[derive(Error, Debug)]
pub enum MiError {
    #[error("session is already started")]
    AlreadyStarted,

    #[error("session is already killed")]
    AlreadyKilled,

    #[error("session is not started")]
    NotStarted,

    #[error("session is killed")]
    Killed,

    #[error("process already started")]
    ProcessAlreadyStarted,

    #[error("process already killed")]
    ProcessAlreadyKilled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stream}: {line}")]
    Stderr { stream: &'static str, line: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("gdb: timeout after {after:?} waiting for token {token}")]
    Timeout {
        token: String,
        after: Duration,
        skipped: Vec<Vec<Record>>,
    },

    #[error("session i/o loop has stopped")]
    LoopStopped,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl MiError {
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Record batches observed by a failed exchange before it gave up.
    pub fn take_skipped(&mut self) -> Vec<Vec<Record>> {
        match self {
            Self::Timeout { skipped, .. } => std::mem::take(skipped),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(MiError::AlreadyStarted.to_string(), "session is already started");
        assert_eq!(MiError::AlreadyKilled.to_string(), "session is already killed");
        assert_eq!(MiError::Killed.to_string(), "session is killed");
        assert_eq!(MiError::NotStarted.to_string(), "session is not started");

        let timeout_err = MiError::Timeout {
            token: "500".to_string(),
            after: Duration::from_secs(5),
            skipped: Vec::new(),
        };
        assert_eq!(
            timeout_err.to_string(),
            "gdb: timeout after 5s waiting for token 500"
        );

        let stderr_err = MiError::Stderr {
            stream: "tail",
            line: "tail: cannot open 'x'\n".to_string(),
        };
        assert!(stderr_err.to_string().starts_with("tail: tail: cannot open"));

        let invalid = MiError::invalid_response("unknown 'threads' type");
        assert_eq!(invalid.to_string(), "Invalid response: unknown 'threads' type");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let mi_err: MiError = io_err.into();
        match mi_err {
            MiError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_take_skipped_drains_timeout_batches() {
        let mut err = MiError::Timeout {
            token: "501".to_string(),
            after: Duration::from_millis(10),
            skipped: vec![vec![Record::default()], vec![]],
        };
        assert_eq!(err.take_skipped().len(), 2);
        assert!(err.take_skipped().is_empty());

        let mut other = MiError::LoopStopped;
        assert!(other.take_skipped().is_empty());
    }
}
