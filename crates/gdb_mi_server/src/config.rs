use std::path::PathBuf;

use gdb_mi_core::SessionConfig;

pub const DEFAULT_SESSION_DIR_NAME: &str = "gdb_mi_sessions";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Template for each session; the log file is filled in per workspace.
    pub session: SessionConfig,
    /// Parent of the per-session workspaces.
    pub session_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            session_dir: std::env::temp_dir().join(DEFAULT_SESSION_DIR_NAME),
        }
    }
}

impl ServerConfig {
    pub fn new(session: SessionConfig, session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            session_dir: session_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        let session_dir = std::env::var_os("GDB_SESSION_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default().session_dir);

        Self {
            session: SessionConfig::from_env(),
            session_dir,
        }
    }
}
