use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_GDB_PATH: &str = "gdb";
pub const DEFAULT_INTERPRETER: &str = "mi";
pub const DEFAULT_RUNTIME_SCRIPT: &str = "/usr/local/go/src/runtime/runtime-gdb.py";
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_SKIPPED_BATCHES: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell launched as the direct child; gdb runs as a command inside it.
    /// Lines written after the launch command wait in the shell's stdin for
    /// gdb, so the shell must not read ahead on a pipe. bash reads a pipe
    /// byte by byte; dash buffers and swallows them.
    pub shell: String,
    pub gdb_path: String,
    pub interpreter: String,
    /// Sourced right after gdb starts. `None` skips the `source` command.
    pub runtime_script: Option<String>,
    /// File the inferior's stdout is redirected to and tailed from.
    pub log_file: Option<PathBuf>,
    pub response_timeout: Duration,
    /// Per-exchange cap on retained skipped record batches.
    pub max_skipped_batches: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            gdb_path: DEFAULT_GDB_PATH.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            runtime_script: Some(DEFAULT_RUNTIME_SCRIPT.to_string()),
            log_file: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_skipped_batches: DEFAULT_MAX_SKIPPED_BATCHES,
        }
    }
}

impl SessionConfig {
    pub fn new(gdb_path: impl Into<String>, runtime_script: Option<String>) -> Self {
        Self {
            gdb_path: gdb_path.into(),
            runtime_script,
            ..Self::default()
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_skipped_batches(mut self, max: usize) -> Self {
        self.max_skipped_batches = max.max(1);
        self
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let shell = std::env::var("GDB_SHELL").unwrap_or(defaults.shell);
        let gdb_path = std::env::var("GDB_BIN_PATH").unwrap_or(defaults.gdb_path);
        let interpreter = std::env::var("GDB_INTERPRETER").unwrap_or(defaults.interpreter);

        // An empty value disables the runtime-support script.
        let runtime_script = match std::env::var("GDB_RUNTIME_SCRIPT") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => defaults.runtime_script,
        };

        let response_timeout = std::env::var("GDB_RESPONSE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.response_timeout);

        let max_skipped_batches = std::env::var("GDB_MAX_SKIPPED_BATCHES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_skipped_batches);

        Self {
            shell,
            gdb_path,
            interpreter,
            runtime_script,
            log_file: None,
            response_timeout,
            max_skipped_batches,
        }
    }

    /// Command line written to the shell to launch gdb on `executable`.
    pub fn launch_command(&self, executable: &str) -> String {
        let line = format!("{} --interpreter {}", self.gdb_path, self.interpreter);
        if executable.is_empty() {
            line
        } else {
            format!("{line} {executable}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.shell, "bash");
        assert_eq!(config.gdb_path, "gdb");
        assert_eq!(config.interpreter, "mi");
        assert!(config.log_file.is_none());
        assert_eq!(config.response_timeout, Duration::from_secs(15));
        assert_eq!(config.max_skipped_batches, 256);
    }

    #[test]
    fn test_builder_setters() {
        let config = SessionConfig::new("/opt/gdb/bin/gdb", None)
            .with_shell("sh")
            .with_log_file("/tmp/session/programOut.log")
            .with_response_timeout(Duration::from_millis(250))
            .with_max_skipped_batches(0);

        assert_eq!(config.gdb_path, "/opt/gdb/bin/gdb");
        assert!(config.runtime_script.is_none());
        assert_eq!(config.shell, "sh");
        assert_eq!(
            config.log_file.as_deref(),
            Some(std::path::Path::new("/tmp/session/programOut.log"))
        );
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.max_skipped_batches, 1);
    }

    #[test]
    fn test_launch_command() {
        let config = SessionConfig::new("/usr/bin/gdb", None);
        assert_eq!(
            config.launch_command("./target/debug/app"),
            "/usr/bin/gdb --interpreter mi ./target/debug/app"
        );
        assert_eq!(config.launch_command(""), "/usr/bin/gdb --interpreter mi");
    }

    // Single test so the env mutations cannot race each other.
    #[test]
    fn test_from_env() {
        for key in [
            "GDB_SHELL",
            "GDB_BIN_PATH",
            "GDB_INTERPRETER",
            "GDB_RUNTIME_SCRIPT",
            "GDB_RESPONSE_TIMEOUT_MS",
            "GDB_MAX_SKIPPED_BATCHES",
        ] {
            std::env::remove_var(key);
        }

        let config = SessionConfig::from_env();
        assert_eq!(config.gdb_path, "gdb");
        assert_eq!(config.runtime_script.as_deref(), Some(DEFAULT_RUNTIME_SCRIPT));
        assert_eq!(config.response_timeout, DEFAULT_RESPONSE_TIMEOUT);

        std::env::set_var("GDB_BIN_PATH", "/custom/gdb");
        std::env::set_var("GDB_RUNTIME_SCRIPT", "");
        std::env::set_var("GDB_RESPONSE_TIMEOUT_MS", "5000");
        std::env::set_var("GDB_MAX_SKIPPED_BATCHES", "0");

        let config = SessionConfig::from_env();
        assert_eq!(config.gdb_path, "/custom/gdb");
        assert!(config.runtime_script.is_none());
        assert_eq!(config.response_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_skipped_batches, DEFAULT_MAX_SKIPPED_BATCHES);

        std::env::remove_var("GDB_BIN_PATH");
        std::env::remove_var("GDB_RUNTIME_SCRIPT");
        std::env::remove_var("GDB_RESPONSE_TIMEOUT_MS");
        std::env::remove_var("GDB_MAX_SKIPPED_BATCHES");
    }
}
