//! Subprocess wrapper exposing stdin/stdout/stderr as line channels.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{MiError, Result};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// One item read from a process output stream.
#[derive(Debug)]
pub enum PipeEvent {
    /// A complete line, trailing newline included.
    Line(String),
    /// End of stream. `partial` holds any text after the last newline.
    Closed { partial: String },
    Failed {
        partial: String,
        error: std::io::Error,
    },
}

/// Channel ends handed out once the process is running.
#[derive(Debug)]
pub struct PipeIo {
    pub input: mpsc::UnboundedSender<String>,
    pub stdout: mpsc::Receiver<PipeEvent>,
    pub stderr: mpsc::Receiver<PipeEvent>,
}

pub struct PipeProcess {
    command: Command,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    killed: bool,
}

impl PipeProcess {
    pub fn new<I, S>(program: impl AsRef<OsStr>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command.args(args);
        Self {
            command,
            child: None,
            tasks: Vec::new(),
            started: false,
            killed: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Launches the process and starts pumping its pipes.
    pub fn start(&mut self) -> Result<PipeIo> {
        if self.started {
            return Err(MiError::ProcessAlreadyStarted);
        }
        if self.killed {
            return Err(MiError::ProcessAlreadyKilled);
        }

        let mut child = self
            .command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = |name| std::io::Error::new(std::io::ErrorKind::BrokenPipe, name);
        let stdin = child.stdin.take().ok_or_else(|| missing("missing stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("missing stdout pipe"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("missing stderr pipe"))?;

        tracing::debug!(
            "started {:?} (pid {:?})",
            self.command.as_std().get_program(),
            child.id()
        );

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        self.tasks.push(tokio::spawn(read_loop(stdout, stdout_tx)));
        self.tasks.push(tokio::spawn(read_loop(stderr, stderr_tx)));
        self.tasks.push(tokio::spawn(write_loop(stdin, input_rx)));

        self.child = Some(child);
        self.started = true;

        Ok(PipeIo {
            input: input_tx,
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }

    /// Kills the OS process, reaps it and stops the pipe tasks.
    /// Further calls are no-ops.
    pub async fn kill_release(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill process {:?}: {}", child.id(), e);
            }
            let _ = child.wait().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn read_loop<R>(stream: R, tx: mpsc::Sender<PipeEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let event = match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => PipeEvent::Closed {
                partial: String::new(),
            },
            Ok(_) if buf.ends_with(b"\n") => {
                PipeEvent::Line(String::from_utf8_lossy(&buf).into_owned())
            }
            Ok(_) => PipeEvent::Closed {
                partial: String::from_utf8_lossy(&buf).into_owned(),
            },
            Err(error) => PipeEvent::Failed {
                partial: String::from_utf8_lossy(&buf).into_owned(),
                error,
            },
        };
        let done = !matches!(event, PipeEvent::Line(_));
        if tx.send(event).await.is_err() || done {
            return;
        }
    }
}

// Ends when a write fails because the process is gone, or when every
// input sender has been dropped.
async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(e) = stdin.write_all(&bytes).await {
            tracing::debug!("stdin write failed, stopping writer: {}", e);
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!("stdin flush failed, stopping writer: {}", e);
            return;
        }
    }
}
