mod config;
mod workspace;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use gdb_mi_core::{
    frame_variables, thread_snapshot, ExecState, Message, MiError, Session, SessionEvents,
    SnapshotError,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::workspace::Workspace;

const MAX_RECENT_OUTPUT_EVENTS: usize = 1024;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbStartParams {
    /// Path of the program to debug.
    executable: String,
    /// Raw gdb commands sent right after launch, in order.
    #[serde(default)]
    commands: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbSendParams {
    command: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbCommandParams {
    /// MI command without a token, e.g. `-break-insert main.main`.
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbThreadsFramesParams {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbFrameVariablesParams {
    thread_id: String,
    level: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbPollOutputParams {
    /// Only return events with a sequence number at or after this one.
    #[serde(default)]
    since: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GdbReadFilesParams {
    /// Source files to read, e.g. the `fullname` of a stack frame.
    paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SessionState {
    Idle,
    Started,
    Killed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputEvent {
    /// A turn no synchronous command claimed.
    Gdb { message: Message },
    /// A line written by the program under debug.
    Inferior { line: String },
    /// The error that ended the session.
    Error { message: String },
}

#[derive(Debug, Default)]
struct OutputLog {
    next_seq: u64,
    events: VecDeque<(u64, OutputEvent)>,
    /// Most recent `*running` / `*stopped` seen in any turn.
    exec_state: Option<ExecState>,
}

impl OutputLog {
    fn push(&mut self, event: OutputEvent) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        push_recent_output_event(&mut self.events, seq, event);
    }

    fn push_message(&mut self, message: Message) {
        self.note_exec_state(&message);
        self.push(OutputEvent::Gdb { message });
    }

    fn note_exec_state(&mut self, message: &Message) {
        if let Some(state) = message.exec_state() {
            self.exec_state = Some(state);
        }
    }

    fn since(&self, since: u64) -> Vec<serde_json::Value> {
        self.events
            .iter()
            .filter(|(seq, _)| *seq >= since)
            .map(|(seq, event)| json!({ "seq": seq, "event": event }))
            .collect()
    }
}

struct ActiveSession {
    session: Arc<Session>,
    workspace: Workspace,
    collector: JoinHandle<()>,
}

struct SessionManager {
    active: Option<ActiveSession>,
}

impl SessionManager {
    fn new() -> Self {
        Self { active: None }
    }
}

#[derive(Clone)]
struct GdbMcpServer {
    tool_router: ToolRouter<Self>,
    config: Arc<ServerConfig>,
    session: Arc<Mutex<SessionManager>>,
    output: Arc<Mutex<OutputLog>>,
}

/// Drains the session's event streams into the shared log until every
/// stream has closed.
async fn collect_events(mut events: SessionEvents, log: Arc<Mutex<OutputLog>>) {
    let mut output_open = true;
    let mut inferior_open = true;
    let mut errors_open = true;

    while output_open || inferior_open || errors_open {
        tokio::select! {
            message = events.output.recv(), if output_open => match message {
                Some(message) => log.lock().await.push_message(message),
                None => output_open = false,
            },
            line = events.inferior_output.recv(), if inferior_open => match line {
                Some(line) => log.lock().await.push(OutputEvent::Inferior { line }),
                None => inferior_open = false,
            },
            err = events.errors.recv(), if errors_open => match err {
                Some(err) => {
                    tracing::warn!("gdb session ended with error: {}", err);
                    log.lock().await.push(OutputEvent::Error { message: err.to_string() });
                }
                None => errors_open = false,
            },
        }
    }
    tracing::debug!("session event collector finished");
}

fn push_recent_output_event(events: &mut VecDeque<(u64, OutputEvent)>, seq: u64, event: OutputEvent) {
    events.push_back((seq, event));
    while events.len() > MAX_RECENT_OUTPUT_EVENTS {
        events.pop_front();
    }
}

/// Reads each file independently; a failure becomes that entry's `error`.
async fn read_files(paths: &[String]) -> Vec<serde_json::Value> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let entry = match tokio::fs::read_to_string(path).await {
            Ok(contents) => json!({ "path": path, "contents": contents }),
            Err(e) => json!({ "path": path, "error": format!("Error reading {path}: {e}") }),
        };
        files.push(entry);
    }
    files
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn no_session_error(tool_name: &str) -> McpError {
    to_mcp_error(format!(
        "{tool_name} requires a gdb session. Call gdb_start first."
    ))
}

fn mi_error(tool_name: &str, mut err: MiError) -> McpError {
    let skipped = err.take_skipped();
    let message = format!("{tool_name} failed: {err}");
    if skipped.is_empty() {
        to_mcp_error(message)
    } else {
        McpError::internal_error(message, Some(json!({ "skipped": skipped })))
    }
}

fn snapshot_error(tool_name: &str, err: SnapshotError) -> McpError {
    McpError::internal_error(
        format!("{tool_name} failed: {err}"),
        Some(json!({ "skipped": err.skipped })),
    )
}

#[tool_router]
impl GdbMcpServer {
    fn new(config: ServerConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            session: Arc::new(Mutex::new(SessionManager::new())),
            output: Arc::new(Mutex::new(OutputLog::default())),
        }
    }

    async fn active_session(&self, tool_name: &str) -> Result<Arc<Session>, McpError> {
        let manager = self.session.lock().await;
        manager
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or_else(|| no_session_error(tool_name))
    }

    fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.session.response_timeout)
    }

    #[tool(description = "Launch gdb on an executable in a fresh session workspace")]
    async fn gdb_start(
        &self,
        params: Parameters<GdbStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut manager = self.session.lock().await;

        if let Some(active) = manager.active.as_ref() {
            if !active.session.is_killed().await {
                return Err(to_mcp_error(
                    "A gdb session is already running. Call gdb_kill before starting another.",
                ));
            }
        }

        let workspace = workspace::provision(&self.config.session_dir)
            .await
            .map_err(|e| {
                to_mcp_error(format!(
                    "Failed to provision session workspace under '{}': {e}",
                    self.config.session_dir.display()
                ))
            })?;

        let config = self
            .config
            .session
            .clone()
            .with_log_file(&workspace.log_file);
        let (session, events) = Session::new(config);
        if let Err(err) = session.start(&params.executable, &params.commands).await {
            if let Err(e) = workspace.remove().await {
                tracing::warn!(
                    "failed to remove workspace {} after start failure: {}",
                    workspace.dir.display(),
                    e
                );
            }
            return Err(mi_error("gdb_start", err));
        }

        if let Some(previous) = manager.active.take() {
            previous.collector.abort();
        }
        *self.output.lock().await = OutputLog::default();
        let collector = tokio::spawn(collect_events(events, Arc::clone(&self.output)));

        let result = json!({
            "ok": true,
            "state": SessionState::Started,
            "executable": params.executable,
            "workspace": workspace,
        });
        manager.active = Some(ActiveSession {
            session: Arc::new(session),
            workspace,
            collector,
        });

        Ok(CallToolResult::structured(result))
    }

    #[tool(description = "Run the program, redirecting its stdout to the session log")]
    async fn gdb_run(&self) -> Result<CallToolResult, McpError> {
        let session = self.active_session("gdb_run").await?;
        session.run().await.map_err(|e| mi_error("gdb_run", e))?;
        Ok(CallToolResult::structured(json!({ "ok": true })))
    }

    #[tool(description = "Send a raw line to gdb without waiting for a reply")]
    async fn gdb_send(
        &self,
        params: Parameters<GdbSendParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.active_session("gdb_send").await?;
        session
            .send(vec![params.command])
            .await
            .map_err(|e| mi_error("gdb_send", e))?;
        Ok(CallToolResult::structured(json!({ "ok": true })))
    }

    #[tool(description = "Send an MI command and wait for its token-matched reply")]
    async fn gdb_command(
        &self,
        params: Parameters<GdbCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.active_session("gdb_command").await?;
        let response = session
            .get_response(&params.command, self.timeout(params.timeout_ms))
            .await
            .map_err(|e| mi_error("gdb_command", e))?;
        self.output.lock().await.note_exec_state(&response.message);

        let record = response.record();
        Ok(CallToolResult::structured(json!({
            "ok": !record.is_error(),
            "token": record.token,
            "record": record,
            "message": response.message,
            "skipped": response.skipped,
            "dropped": response.dropped,
        })))
    }

    #[tool(description = "Collect every thread with its stack and each frame's variables")]
    async fn gdb_threads_frames(
        &self,
        params: Parameters<GdbThreadsFramesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.active_session("gdb_threads_frames").await?;
        let snapshot = thread_snapshot(&*session, self.timeout(params.timeout_ms))
            .await
            .map_err(|e| snapshot_error("gdb_threads_frames", e))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "threads": snapshot.threads,
            "skipped": snapshot.skipped,
        })))
    }

    #[tool(description = "List the variables of one frame in one thread")]
    async fn gdb_frame_variables(
        &self,
        params: Parameters<GdbFrameVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.active_session("gdb_frame_variables").await?;
        let vars = frame_variables(
            &*session,
            &params.thread_id,
            &params.level,
            self.timeout(params.timeout_ms),
        )
        .await
        .map_err(|e| snapshot_error("gdb_frame_variables", e))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": params.thread_id,
            "level": params.level,
            "variables": vars.variables,
            "skipped": vars.skipped,
        })))
    }

    #[tool(description = "Read buffered unsolicited gdb output, program output and session errors")]
    async fn gdb_poll_output(
        &self,
        params: Parameters<GdbPollOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let log = self.output.lock().await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "next_seq": log.next_seq,
            "events": log.since(params.since.unwrap_or(0)),
        })))
    }

    #[tool(description = "Read source files; each unreadable file gets its own error entry")]
    async fn gdb_read_files(
        &self,
        params: Parameters<GdbReadFilesParams>,
    ) -> Result<CallToolResult, McpError> {
        let files = read_files(&params.0.paths).await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "files": files,
        })))
    }

    #[tool(description = "Report the current gdb session state")]
    async fn gdb_status(&self) -> Result<CallToolResult, McpError> {
        let manager = self.session.lock().await;
        let Some(active) = manager.active.as_ref() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": SessionState::Idle,
            })));
        };

        let state = if active.session.is_killed().await {
            SessionState::Killed
        } else {
            SessionState::Started
        };
        let log = self.output.lock().await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": state,
            "workspace": active.workspace,
            "gdb_path": active.session.config().gdb_path,
            "exec_state": log.exec_state,
            "buffered_events": log.events.len(),
            "next_seq": log.next_seq,
        })))
    }

    #[tool(description = "Kill gdb and the log tail of the current session")]
    async fn gdb_kill(&self) -> Result<CallToolResult, McpError> {
        let manager = self.session.lock().await;
        let Some(active) = manager.active.as_ref() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": SessionState::Idle,
            })));
        };

        active.session.kill().await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": SessionState::Killed,
        })))
    }
}

#[tool_handler]
impl ServerHandler for GdbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "GDB/MI MCP Server driving a single gdb session in machine-interface mode".into(),
            ),
        }
    }
}

async fn shutdown(sessions: &Mutex<SessionManager>) {
    let mut manager = sessions.lock().await;
    if let Some(active) = manager.active.take() {
        active.session.kill().await;
        active.collector.abort();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP stream
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        "Starting GDB/MI MCP Server on stdio (gdb: {}, sessions under {})...",
        config.session.gdb_path,
        config.session_dir.display()
    );

    let server = GdbMcpServer::new(config);
    let sessions = Arc::clone(&server.session);
    let service = server.serve(transport::stdio()).await?;

    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    shutdown(&sessions).await;
    Ok(())
}
