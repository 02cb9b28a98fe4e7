//! Per-session scratch directories.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub const LOG_FILE_NAME: &str = "programOut.log";
const MAX_ATTEMPTS: u32 = 10;

/// Directory owned by one debugging session and the log file the inferior's
/// stdout is redirected into.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub dir: PathBuf,
    pub log_file: PathBuf,
}

impl Workspace {
    /// Deletes the directory and everything in it.
    pub async fn remove(&self) -> io::Result<()> {
        tokio::fs::remove_dir_all(&self.dir).await
    }
}

/// Creates `<base>/session_<millis>__<n>` with an empty log file inside.
/// `n` counts up from 0 while the name is taken.
pub async fn provision(base: &Path) -> io::Result<Workspace> {
    provision_named(base, &format!("session_{}", timestamp_millis())).await
}

async fn provision_named(base: &Path, stem: &str) -> io::Result<Workspace> {
    tokio::fs::create_dir_all(base).await?;

    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        let dir = base.join(format!("{stem}__{attempt}"));
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {
                let log_file = dir.join(LOG_FILE_NAME);
                tokio::fs::File::create(&log_file).await?;
                tracing::info!("provisioned session workspace {}", dir.display());
                return Ok(Workspace { dir, log_file });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AlreadyExists, "no free session directory name")
    }))
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
