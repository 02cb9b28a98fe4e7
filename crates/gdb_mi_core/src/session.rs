use std::collections::VecDeque;
use std::ffi::OsStr;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::parser::PROMPT;
use crate::pipe::{PipeEvent, PipeIo, PipeProcess};
use crate::types::{Message, Record, Response};
use crate::{MiError, Result, SessionConfig};

/// First minted token is one past this.
const TOKEN_SEED: u64 = 499;

/// How long a closed stdout waits for the matching stderr to finish.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Token-correlated request/response against a running debugger.
pub trait Exchange {
    fn exchange(
        &self,
        command: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Response>> + Send;
}

/// Receiving ends of a session's event streams.
#[derive(Debug)]
pub struct SessionEvents {
    /// Turns not claimed by any pending exchange.
    pub output: mpsc::UnboundedReceiver<Message>,
    /// Lines appended to the inferior's log file.
    pub inferior_output: mpsc::UnboundedReceiver<String>,
    /// Fatal loop errors. The session is already killed when one arrives.
    pub errors: mpsc::UnboundedReceiver<MiError>,
}

enum Request {
    Send(Vec<String>),
    Exchange {
        token: String,
        line: String,
        reply: oneshot::Sender<Response>,
    },
    Withdraw {
        token: String,
        reply: oneshot::Sender<Vec<Vec<Record>>>,
    },
}

struct Wiring {
    requests: mpsc::UnboundedReceiver<Request>,
    output: mpsc::UnboundedSender<Message>,
    inferior: mpsc::UnboundedSender<String>,
    errors: mpsc::UnboundedSender<MiError>,
}

struct Lifecycle {
    started: bool,
    killed: bool,
    gdb: PipeProcess,
    tail: Option<PipeProcess>,
    wiring: Option<Wiring>,
}

pub struct Session {
    config: SessionConfig,
    lifecycle: Arc<Mutex<Lifecycle>>,
    next_token: AtomicU64,
    requests: mpsc::UnboundedSender<Request>,
}

impl Session {
    pub fn new(config: SessionConfig) -> (Self, SessionEvents) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (inferior_tx, inferior_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let gdb = PipeProcess::new(&config.shell, std::iter::empty::<&str>());
        let tail = config
            .log_file
            .as_ref()
            .map(|path| PipeProcess::new("tail", [OsStr::new("-f"), path.as_os_str()]));

        let lifecycle = Lifecycle {
            started: false,
            killed: false,
            gdb,
            tail,
            wiring: Some(Wiring {
                requests: requests_rx,
                output: output_tx,
                inferior: inferior_tx,
                errors: errors_tx,
            }),
        };

        let session = Self {
            config,
            lifecycle: Arc::new(Mutex::new(lifecycle)),
            next_token: AtomicU64::new(TOKEN_SEED),
            requests: requests_tx,
        };
        let events = SessionEvents {
            output: output_rx,
            inferior_output: inferior_rx,
            errors: errors_rx,
        };
        (session, events)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.started
    }

    pub async fn is_killed(&self) -> bool {
        self.lifecycle.lock().await.killed
    }

    /// Launches gdb on `executable` inside the shell, then sends each of
    /// `commands` verbatim.
    pub async fn start(&self, executable: &str, commands: &[String]) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.started {
            return Err(MiError::AlreadyStarted);
        }
        if state.killed {
            return Err(MiError::AlreadyKilled);
        }
        state.started = true;

        let gdb_io = match state.gdb.start() {
            Ok(io) => io,
            Err(e) => {
                release(&mut state).await;
                return Err(e);
            }
        };
        let tail_io = match state.tail.as_mut().map(PipeProcess::start).transpose() {
            Ok(io) => io,
            Err(e) => {
                release(&mut state).await;
                return Err(e);
            }
        };
        let Some(wiring) = state.wiring.take() else {
            release(&mut state).await;
            return Err(MiError::ChannelClosed("session wiring"));
        };

        let launch = self.config.launch_command(executable);
        tracing::info!("starting gdb session: {}", launch);

        let mut lines = vec![launch];
        if let Some(script) = &self.config.runtime_script {
            lines.push(format!("source {script}"));
        }
        lines.extend(commands.iter().cloned());
        for line in lines {
            if gdb_io.input.send(line).is_err() {
                release(&mut state).await;
                return Err(MiError::ChannelClosed("debugger stdin"));
            }
        }

        if let Some(tail_io) = tail_io {
            tokio::spawn(tail_loop(
                tail_io,
                wiring.inferior,
                wiring.errors.clone(),
                Arc::clone(&self.lifecycle),
            ));
        }
        tokio::spawn(io_loop(
            gdb_io,
            wiring.requests,
            Dispatcher::new(wiring.output, self.config.max_skipped_batches),
            wiring.errors,
            Arc::clone(&self.lifecycle),
        ));

        Ok(())
    }

    /// Starts the inferior, redirecting its stdout into the tailed log file.
    pub async fn run(&self) -> Result<()> {
        let command = match &self.config.log_file {
            Some(path) => format!("run > {}", path.display()),
            None => "run".to_string(),
        };
        self.send(vec![command]).await
    }

    /// Fire-and-forget: the lines go to gdb verbatim, without a token.
    pub async fn send(&self, commands: Vec<String>) -> Result<()> {
        self.ensure_running().await?;
        self.requests
            .send(Request::Send(commands))
            .map_err(|_| MiError::LoopStopped)
    }

    pub fn new_token(&self) -> String {
        (self.next_token.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Sends `command` prefixed with a fresh token and waits for the turn
    /// whose records carry that token.
    pub async fn get_response(&self, command: &str, timeout: Duration) -> Result<Response> {
        self.ensure_running().await?;

        let token = self.new_token();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        tracing::debug!("exchange {}: {}", token, command);
        self.requests
            .send(Request::Exchange {
                token: token.clone(),
                line: format!("{token}{command}"),
                reply: reply_tx,
            })
            .map_err(|_| MiError::LoopStopped)?;

        match tokio::time::timeout(timeout, &mut reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MiError::LoopStopped),
            Err(_) => {
                let skipped = self.withdraw(&token).await;
                // The reply may have landed between the timer firing and the withdrawal.
                if let Ok(response) = reply_rx.try_recv() {
                    return Ok(response);
                }
                tracing::warn!(
                    "no reply for token {} within {:?}, abandoning '{}'",
                    token,
                    timeout,
                    command
                );
                Err(MiError::Timeout {
                    token,
                    after: timeout,
                    skipped,
                })
            }
        }
    }

    pub async fn kill(&self) {
        let mut state = self.lifecycle.lock().await;
        if !state.killed {
            tracing::info!("killing gdb session");
        }
        release(&mut state).await;
    }

    async fn ensure_running(&self) -> Result<()> {
        let state = self.lifecycle.lock().await;
        if state.killed {
            return Err(MiError::Killed);
        }
        if !state.started {
            return Err(MiError::NotStarted);
        }
        Ok(())
    }

    async fn withdraw(&self, token: &str) -> Vec<Vec<Record>> {
        let (tx, rx) = oneshot::channel();
        let request = Request::Withdraw {
            token: token.to_string(),
            reply: tx,
        };
        if self.requests.send(request).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl Exchange for Session {
    fn exchange(
        &self,
        command: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Response>> + Send {
        self.get_response(command, timeout)
    }
}

async fn release(state: &mut Lifecycle) {
    if state.gdb.is_started() && !state.gdb.is_killed() {
        state.gdb.kill_release().await;
    }
    if let Some(tail) = state.tail.as_mut() {
        if tail.is_started() && !tail.is_killed() {
            tail.kill_release().await;
        }
    }
    state.killed = true;
}

struct Waiter {
    token: String,
    reply: oneshot::Sender<Response>,
    skipped: VecDeque<Vec<Record>>,
    dropped: usize,
}

impl Waiter {
    fn skip(&mut self, records: &[Record], cap: usize) {
        self.skipped.push_back(records.to_vec());
        while self.skipped.len() > cap {
            self.skipped.pop_front();
            if self.dropped == 0 {
                tracing::warn!(
                    "token {} exceeded {} skipped batches, discarding oldest",
                    self.token,
                    cap
                );
            }
            self.dropped += 1;
        }
    }
}

/// Routes each turn to the exchanges waiting on it, or to the output
/// subscriber when nobody claims it.
struct Dispatcher {
    waiters: Vec<Waiter>,
    output: mpsc::UnboundedSender<Message>,
    max_skipped: usize,
}

impl Dispatcher {
    fn new(output: mpsc::UnboundedSender<Message>, max_skipped: usize) -> Self {
        Self {
            waiters: Vec::new(),
            output,
            max_skipped: max_skipped.max(1),
        }
    }

    fn register(&mut self, token: String, reply: oneshot::Sender<Response>) {
        self.waiters.push(Waiter {
            token,
            reply,
            skipped: VecDeque::new(),
            dropped: 0,
        });
    }

    fn withdraw(&mut self, token: &str) -> Vec<Vec<Record>> {
        match self.waiters.iter().position(|w| w.token == token) {
            Some(pos) => self.waiters.remove(pos).skipped.into(),
            None => Vec::new(),
        }
    }

    fn dispatch(&mut self, message: Message) {
        self.waiters.retain(|w| !w.reply.is_closed());

        let (matched, pending): (Vec<Waiter>, Vec<Waiter>) = self
            .waiters
            .drain(..)
            .partition(|w| message.token_index(&w.token).is_some());
        self.waiters = pending;

        for waiter in &mut self.waiters {
            waiter.skip(&message.records, self.max_skipped);
        }

        let mut claimed = false;
        for waiter in matched {
            let Some(index) = message.token_index(&waiter.token) else {
                continue;
            };
            let response = Response {
                index,
                message: message.clone(),
                skipped: waiter.skipped.into(),
                dropped: waiter.dropped,
            };
            if waiter.reply.send(response).is_ok() {
                claimed = true;
            }
        }

        // Late replies to abandoned tokens end up here as unsolicited output.
        if !claimed && self.output.send(message).is_err() {
            tracing::trace!("no output subscriber, turn dropped");
        }
    }
}

async fn io_loop(
    mut gdb: PipeIo,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut dispatcher: Dispatcher,
    errors: mpsc::UnboundedSender<MiError>,
    lifecycle: Arc<Mutex<Lifecycle>>,
) {
    let result = pump(&mut gdb, &mut requests, &mut dispatcher).await;
    if result.is_ok() {
        // gdb is gone; nothing can answer further exchanges.
        release(&mut *lifecycle.lock().await).await;
    }
    // Pending exchanges fail with LoopStopped once their senders drop.
    drop(dispatcher);
    finish("gdb", result, &errors, &lifecycle).await;
}

async fn pump(
    gdb: &mut PipeIo,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    dispatcher: &mut Dispatcher,
) -> Result<()> {
    let mut buffer = String::new();
    let mut stderr_open = true;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    return Err(MiError::ChannelClosed("session input"));
                };
                match request {
                    Request::Send(lines) => {
                        for line in lines {
                            tracing::debug!(">> {}", line);
                            forward(gdb, line)?;
                        }
                    }
                    Request::Exchange { token, line, reply } => {
                        // Registered before writing so the reply cannot outrun it.
                        dispatcher.register(token, reply);
                        tracing::debug!(">> {}", line);
                        forward(gdb, line)?;
                    }
                    Request::Withdraw { token, reply } => {
                        let _ = reply.send(dispatcher.withdraw(&token));
                    }
                }
            }
            event = gdb.stdout.recv() => match event {
                Some(PipeEvent::Line(line)) => {
                    tracing::trace!("<< {}", line.trim_end());
                    let closes_turn = line.contains(PROMPT);
                    buffer.push_str(&line);
                    if closes_turn {
                        dispatcher.dispatch(Message::parse(std::mem::take(&mut buffer)));
                    }
                }
                Some(PipeEvent::Closed { partial }) => {
                    buffer.push_str(&partial);
                    if !buffer.trim().is_empty() {
                        dispatcher.dispatch(Message::parse(buffer));
                    }
                    return drain_error_stream("gdb", &mut gdb.stderr, stderr_open).await;
                }
                Some(PipeEvent::Failed { error, .. }) => return Err(error.into()),
                None => return drain_error_stream("gdb", &mut gdb.stderr, stderr_open).await,
            },
            event = gdb.stderr.recv(), if stderr_open => {
                stderr_open = check_error_stream("gdb", event)?;
            }
        }
    }
}

fn forward(gdb: &PipeIo, line: String) -> Result<()> {
    gdb.input
        .send(line)
        .map_err(|_| MiError::ChannelClosed("debugger stdin"))
}

/// Any content on an error stream is fatal. Returns whether the stream is
/// still open.
fn check_error_stream(stream: &'static str, event: Option<PipeEvent>) -> Result<bool> {
    match event {
        Some(PipeEvent::Line(line)) => Err(MiError::Stderr { stream, line }),
        Some(PipeEvent::Closed { partial }) if !partial.is_empty() => Err(MiError::Stderr {
            stream,
            line: partial,
        }),
        Some(PipeEvent::Failed { error, .. }) => Err(error.into()),
        Some(PipeEvent::Closed { .. }) | None => Ok(false),
    }
}

/// Reads an error stream to its end once stdout has closed, so a failure
/// written just before the process exited is still fatal.
async fn drain_error_stream(
    stream: &'static str,
    rx: &mut mpsc::Receiver<PipeEvent>,
    mut open: bool,
) -> Result<()> {
    let drain = async {
        while open {
            open = check_error_stream(stream, rx.recv().await)?;
        }
        Ok::<(), MiError>(())
    };
    match tokio::time::timeout(STDERR_DRAIN_GRACE, drain).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!("{} stderr still open after stdout closed", stream);
            Ok(())
        }
    }
}

async fn tail_loop(
    mut tail: PipeIo,
    inferior: mpsc::UnboundedSender<String>,
    errors: mpsc::UnboundedSender<MiError>,
    lifecycle: Arc<Mutex<Lifecycle>>,
) {
    let result: Result<()> = async {
        let mut stderr_open = true;
        loop {
            tokio::select! {
                event = tail.stdout.recv() => match event {
                    Some(PipeEvent::Line(line)) => {
                        let _ = inferior.send(line);
                    }
                    Some(PipeEvent::Closed { partial }) => {
                        if !partial.is_empty() {
                            let _ = inferior.send(partial);
                        }
                        return drain_error_stream("tail", &mut tail.stderr, stderr_open).await;
                    }
                    Some(PipeEvent::Failed { error, .. }) => return Err(error.into()),
                    None => return drain_error_stream("tail", &mut tail.stderr, stderr_open).await,
                },
                event = tail.stderr.recv(), if stderr_open => {
                    stderr_open = check_error_stream("tail", event)?;
                }
            }
        }
    }
    .await;
    finish("tail", result, &errors, &lifecycle).await;
}

async fn finish(
    name: &str,
    result: Result<()>,
    errors: &mpsc::UnboundedSender<MiError>,
    lifecycle: &Mutex<Lifecycle>,
) {
    match result {
        Ok(()) => tracing::info!("{} output closed, loop finished", name),
        Err(err) => {
            tracing::error!("{} loop failed: {}", name, err);
            release(&mut *lifecycle.lock().await).await;
            let _ = errors.send(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SHELL;
    use crate::types::Nature;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    static SCRATCH: AtomicUsize = AtomicUsize::new(0);

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gdb_mi_core_session_{}_{}",
            std::process::id(),
            SCRATCH.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    /// Stand-in for gdb: answers each tokenized command with `<token>^done`.
    const FAKE_GDB: &str = r#"
printf '=thread-group-added,id="i1"\n(gdb) \n'
first=""
while IFS= read -r line; do
  tok=${line%%[!0-9]*}
  cmd=${line#"$tok"}
  case "$cmd" in
    -hang) ;;
    -slow) sleep 1; printf '%s^done,late="y"\n(gdb) \n' "$tok" ;;
    -first) first=$tok ;;
    -second) printf '%s^done,which="second"\n(gdb) \n%s^done,which="first"\n(gdb) \n' "$tok" "$first" ;;
    -chatty) printf '=a\n(gdb) \n=b\n(gdb) \n=c\n(gdb) \n%s^done\n(gdb) \n' "$tok" ;;
    -explode) echo 'boom' >&2 ;;
    -quit) exit 0 ;;
    -die) echo 'fatal: gone' >&2; exit 1 ;;
    "run > "*) echo 'hello inferior' >> "${cmd#run > }"; printf '^running\n*running,thread-id="all"\n(gdb) \n' ;;
    *) printf '%s^done\n(gdb) \n' "$tok" ;;
  esac
done
"#;

    fn fake_gdb_script() -> PathBuf {
        let script = scratch_dir().join("fake-gdb.sh");
        std::fs::write(&script, FAKE_GDB).expect("fake gdb should be writable");
        script
    }

    fn fake_config() -> SessionConfig {
        let script = fake_gdb_script();
        SessionConfig::new(format!("sh {}", script.display()), None).with_shell(DEFAULT_SHELL)
    }

    /// The fake replaces the shell, so its exit closes the session's pipes.
    fn exec_fake_config() -> SessionConfig {
        let script = fake_gdb_script();
        SessionConfig::new(format!("exec sh {}", script.display()), None)
            .with_shell(DEFAULT_SHELL)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn tokens_start_at_500_and_increase() {
        let (session, _events) = Session::new(SessionConfig::default());
        let tokens: Vec<u64> = (0..5)
            .map(|_| session.new_token().parse().unwrap())
            .collect();
        assert_eq!(tokens, vec![500, 501, 502, 503, 504]);
    }

    #[tokio::test]
    async fn commands_rejected_before_start_and_after_kill() {
        let (session, _events) = Session::new(fake_config());
        assert!(matches!(
            session.get_response("-thread-info", WAIT).await,
            Err(MiError::NotStarted)
        ));
        assert!(matches!(
            session.send(vec!["info".to_string()]).await,
            Err(MiError::NotStarted)
        ));

        session.kill().await;
        assert!(session.is_killed().await);
        assert!(matches!(
            session.get_response("-thread-info", WAIT).await,
            Err(MiError::Killed)
        ));
        assert!(matches!(
            session.start("./app", &[]).await,
            Err(MiError::AlreadyKilled)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_twice_is_rejected_and_kill_is_idempotent() {
        let (session, _events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();
        assert!(session.is_started().await);
        assert!(matches!(
            session.start("./app", &[]).await,
            Err(MiError::AlreadyStarted)
        ));

        session.kill().await;
        session.kill().await;
        assert!(session.is_killed().await);
        assert!(matches!(
            session.send(vec!["-exec-next".to_string()]).await,
            Err(MiError::Killed)
        ));
    }

    #[tokio::test]
    async fn failed_launch_marks_session_killed() {
        let config = fake_config().with_shell("/definitely/not/a/shell");
        let (session, _events) = Session::new(config);
        assert!(matches!(session.start("./app", &[]).await, Err(MiError::Io(_))));
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sequential_exchanges_use_increasing_tokens() {
        let (session, mut events) = Session::new(fake_config());
        session
            .start("./app", &["-gdb-set pagination off".to_string()])
            .await
            .unwrap();

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let response = session.get_response("-exec-next", WAIT).await.unwrap();
            let record = response.record();
            assert_eq!(record.nature, Some(Nature::Result));
            assert_eq!(record.class, "done");
            tokens.push(record.token.clone().unwrap().parse::<u64>().unwrap());
        }
        assert_eq!(tokens, vec![500, 501, 502]);

        // The banner turn is unsolicited and reaches the output stream.
        let banner = tokio::time::timeout(WAIT, events.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(banner.records[0].class, "thread-group-added");
        assert!(banner.raw.contains(PROMPT));

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn out_of_order_replies_match_their_own_tokens() {
        let (session, _events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();
        // Drain startup output so the skipped lists only hold the exchange turns.
        session.get_response("-noop", WAIT).await.unwrap();

        let (first, second) = tokio::join!(
            session.get_response("-first", WAIT),
            session.get_response("-second", WAIT),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first.record().token.as_deref(), Some("501"));
        assert_eq!(second.record().token.as_deref(), Some("502"));
        assert_eq!(
            first.record().get("which").and_then(|v| v.as_str()),
            Some("first")
        );
        assert_eq!(
            second.record().get("which").and_then(|v| v.as_str()),
            Some("second")
        );

        // The reply to the second command arrived while the first was waiting.
        assert_eq!(first.skipped.len(), 1);
        assert!(first.skipped[0].iter().any(|r| r.has_token("502")));
        assert!(second.skipped.is_empty());

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prior_turns_are_returned_as_skipped_in_order() {
        let (session, _events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();
        session.get_response("-noop", WAIT).await.unwrap();

        let response = session.get_response("-chatty", WAIT).await.unwrap();
        let classes: Vec<&str> = response
            .skipped
            .iter()
            .map(|batch| batch[0].class.as_str())
            .collect();
        assert_eq!(classes, vec!["a", "b", "c"]);
        assert_eq!(response.dropped, 0);

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn skipped_batches_are_capped_oldest_first() {
        let (session, _events) = Session::new(fake_config().with_max_skipped_batches(2));
        session.start("./app", &[]).await.unwrap();
        session.get_response("-noop", WAIT).await.unwrap();

        let response = session.get_response("-chatty", WAIT).await.unwrap();
        let classes: Vec<&str> = response
            .skipped
            .iter()
            .map(|batch| batch[0].class.as_str())
            .collect();
        assert_eq!(classes, vec!["b", "c"]);
        assert_eq!(response.dropped, 1);

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_returns_no_message_and_session_survives() {
        let (session, _events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();

        let err = session
            .get_response("-hang", Duration::from_millis(200))
            .await
            .unwrap_err();
        match err {
            MiError::Timeout { token, after, .. } => {
                assert_eq!(token, "500");
                assert_eq!(after, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        assert!(!session.is_killed().await);
        let response = session.get_response("-noop", WAIT).await.unwrap();
        assert_eq!(response.record().token.as_deref(), Some("501"));

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn late_reply_for_abandoned_token_reaches_output() {
        let (session, mut events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();

        let err = session
            .get_response("-slow", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MiError::Timeout { .. }));

        let late = tokio::time::timeout(WAIT, async {
            loop {
                let message = events.output.recv().await.expect("output should stay open");
                if message.token_index("500").is_some() {
                    return message;
                }
            }
        })
        .await
        .expect("late reply should surface as unsolicited output");
        assert_eq!(
            late.records[late.token_index("500").unwrap()]
                .get("late")
                .and_then(|v| v.as_str()),
            Some("y")
        );

        session.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_output_is_fatal() {
        let (session, mut events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();
        session.send(vec!["-explode".to_string()]).await.unwrap();

        let err = tokio::time::timeout(WAIT, events.errors.recv())
            .await
            .unwrap()
            .unwrap();
        match err {
            MiError::Stderr { stream, line } => {
                assert_eq!(stream, "gdb");
                assert_eq!(line, "boom\n");
            }
            other => panic!("expected stderr error, got {other:?}"),
        }
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_redirects_inferior_output_to_tailed_log() {
        let log_file = scratch_dir().join("programOut.log");
        std::fs::write(&log_file, "").unwrap();
        let (session, mut events) = Session::new(fake_config().with_log_file(&log_file));
        session.start("./app", &[]).await.unwrap();
        session.run().await.unwrap();

        let line = tokio::time::timeout(WAIT, events.inferior_output.recv())
            .await
            .expect("tail should report the inferior's output")
            .unwrap();
        assert_eq!(line, "hello inferior\n");

        let running = tokio::time::timeout(WAIT, async {
            loop {
                let message = events.output.recv().await.unwrap();
                if let Some(state) = message.exec_state() {
                    return state;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(running.class, "running");

        session.kill().await;
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_fails_pending_exchange_with_loop_stopped() {
        let (session, _events) = Session::new(fake_config());
        session.start("./app", &[]).await.unwrap();

        let (pending, ()) = tokio::join!(session.get_response("-hang", WAIT), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.kill().await;
        });
        assert!(matches!(pending, Err(MiError::LoopStopped)));
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tail_failure_kills_session_and_reports_error() {
        let missing = scratch_dir().join("missing").join("programOut.log");
        let (session, mut events) = Session::new(fake_config().with_log_file(&missing));
        session.start("./app", &[]).await.unwrap();

        let err = tokio::time::timeout(WAIT, events.errors.recv())
            .await
            .expect("tail failure should be reported")
            .unwrap();
        match err {
            MiError::Stderr { stream, line } => {
                assert_eq!(stream, "tail");
                assert!(line.starts_with("tail:"), "unexpected tail error {line:?}");
            }
            other => panic!("expected stderr error, got {other:?}"),
        }
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_written_just_before_exit_is_fatal() {
        let (session, mut events) = Session::new(exec_fake_config());
        session.start("./app", &[]).await.unwrap();
        session.send(vec!["-die".to_string()]).await.unwrap();

        let err = tokio::time::timeout(WAIT, events.errors.recv())
            .await
            .expect("stderr before exit should be reported")
            .unwrap();
        match err {
            MiError::Stderr { stream, line } => {
                assert_eq!(stream, "gdb");
                assert_eq!(line, "fatal: gone\n");
            }
            other => panic!("expected stderr error, got {other:?}"),
        }
        assert!(session.is_killed().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn debugger_exit_ends_session_without_error() {
        let (session, mut events) = Session::new(exec_fake_config());
        session.start("./app", &[]).await.unwrap();
        session.get_response("-noop", WAIT).await.unwrap();
        session.send(vec!["-quit".to_string()]).await.unwrap();

        // The loop drops its error sender on a clean exit.
        let closed = tokio::time::timeout(WAIT, events.errors.recv())
            .await
            .expect("error channel should close");
        assert!(closed.is_none());
        assert!(session.is_killed().await);
        assert!(matches!(
            session.get_response("-noop", WAIT).await,
            Err(MiError::Killed)
        ));
    }
}
