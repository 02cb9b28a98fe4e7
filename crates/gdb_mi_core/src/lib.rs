//! GDB/MI Core
//!
//! Drives a GDB process in machine-interface mode and turns its line-oriented
//! output into typed records. Provides the output parser, a pipe wrapper for
//! subprocesses, a session engine with token-correlated request/response, and
//! higher-level operations composed from those exchanges.

pub mod config;
pub mod error;
pub mod ops;
pub mod parser;
pub mod pipe;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::MiError;
pub use ops::{frame_variables, thread_snapshot, SnapshotError};
pub use parser::{parse_output, parse_record, PROMPT};
pub use session::{Exchange, Session, SessionEvents};
pub use types::{
    ExecState, FrameInfo, FrameVariables, Message, Nature, Record, Response, ThreadInfo,
    ThreadSnapshot, Value,
};

/// Result type alias using MiError
pub type Result<T> = std::result::Result<T, MiError>;
