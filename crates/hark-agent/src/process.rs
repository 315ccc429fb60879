//! Child process lifecycle: spawn, prompt submission, abort, restart.
//!
//! The process owns the child's stdin and stdout exclusively. A dedicated
//! reader task parses stdout lines; stdin writes are small and happen on the
//! submitter task. Stderr is collected into a rolling tail for diagnostics
//! and never drives state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use hark_types::TurnId;

use crate::events::{parse_line, AgentEvent};
use crate::AgentError;

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// Lifecycle state of the agent child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotStarted,
    Starting,
    /// Running and accepting prompt submissions.
    Ready,
    /// Working on a turn; submissions are rejected until it ends.
    BusyThinking,
    Exited {
        clean: bool,
    },
}

impl AgentState {
    pub fn is_running(self) -> bool {
        matches!(self, AgentState::Ready | AgentState::BusyThinking)
    }
}

/// How to launch and pace the child.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments selecting the structured streaming mode.
    pub args: Vec<String>,
    /// Optional model override, passed as `--model <value>`.
    pub model: Option<String>,
    /// Child working directory.
    pub work_dir: PathBuf,
    /// Hard cap a caller should place on awaiting a turn's completion.
    pub turn_timeout: Duration,
    /// How long an abort waits for the child's own end-of-turn event.
    pub abort_grace: Duration,
    /// How long a terminate waits after SIGTERM before SIGKILL.
    pub term_grace: Duration,
}

impl AgentConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        AgentConfig {
            program: "claude".to_string(),
            args: vec![
                "--input-format".to_string(),
                "stream-json".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            model: None,
            work_dir: work_dir.into(),
            turn_timeout: Duration::from_secs(300),
            abort_grace: Duration::from_secs(5),
            term_grace: Duration::from_secs(5),
        }
    }
}

/// Why an awaited turn did not produce a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    /// The turn was cancelled, by the child or by force.
    #[error("turn aborted")]
    Aborted,
    /// The child exited (or was restarted) before finishing the turn.
    #[error("agent process exited mid-turn")]
    AgentExited,
}

/// Why a submission was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// A turn is already in flight; the caller decides whether to retry.
    #[error("agent is busy with another turn")]
    Busy,
    /// The child is not in the `Ready` state.
    #[error("agent is not ready")]
    NotReady,
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Everything observable about the child, delivered to one consumer.
#[derive(Debug)]
pub enum AgentUpdate {
    /// A decoded stdout event.
    Event(AgentEvent),
    /// The lifecycle state changed.
    StateChanged(AgentState),
    /// The child exited unexpectedly (EOF on stdout outside a restart).
    Exited { clean: bool },
}

/// Completion channel handed back by [`AgentProcess::submit`].
pub type TurnReceiver = oneshot::Receiver<Result<String, TurnError>>;

struct CurrentTurn {
    turn_id: TurnId,
    buffer: String,
    waiter: oneshot::Sender<Result<String, TurnError>>,
}

struct Inner {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    current: Option<CurrentTurn>,
    /// Bumped on every (re)launch so tasks attached to a dead child are
    /// ignored when they report in late.
    generation: u64,
}

struct Shared {
    config: std::sync::Mutex<AgentConfig>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<AgentState>,
    updates: mpsc::UnboundedSender<AgentUpdate>,
    stderr_tail: std::sync::Mutex<VecDeque<String>>,
    aborting: AtomicBool,
}

/// Handle to the supervised child process. Cheap to clone.
#[derive(Clone)]
pub struct AgentProcess {
    shared: Arc<Shared>,
}

impl AgentProcess {
    /// Create the mediator. The child is not launched until [`start`].
    ///
    /// All observable activity is sent to `updates`.
    ///
    /// [`start`]: AgentProcess::start
    pub fn new(config: AgentConfig, updates: mpsc::UnboundedSender<AgentUpdate>) -> Self {
        let (state_tx, _) = watch::channel(AgentState::NotStarted);
        AgentProcess {
            shared: Arc::new(Shared {
                config: std::sync::Mutex::new(config),
                inner: Mutex::new(Inner {
                    child: None,
                    stdin: None,
                    current: None,
                    generation: 0,
                }),
                state_tx,
                updates,
                stderr_tail: std::sync::Mutex::new(VecDeque::new()),
                aborting: AtomicBool::new(false),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_watch(&self) -> watch::Receiver<AgentState> {
        self.shared.state_tx.subscribe()
    }

    /// Configured cap for awaiting a turn's completion.
    pub fn turn_timeout(&self) -> Duration {
        self.config_snapshot().turn_timeout
    }

    /// Replace the model override used on the next (re)launch.
    pub fn set_model(&self, model: Option<String>) {
        self.shared
            .config
            .lock()
            .expect("config lock poisoned")
            .model = model;
    }

    /// The last collected stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared
            .stderr_tail
            .lock()
            .expect("stderr lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn config_snapshot(&self) -> AgentConfig {
        self.shared
            .config
            .lock()
            .expect("config lock poisoned")
            .clone()
    }

    fn set_state(&self, state: AgentState) {
        let changed = *self.shared.state_tx.borrow() != state;
        self.shared.state_tx.send_replace(state);
        if changed {
            let _ = self.shared.updates.send(AgentUpdate::StateChanged(state));
        }
    }

    /// Launch the child if it is not already running.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut inner = self.shared.inner.lock().await;
        if self.state().is_running() {
            return Ok(());
        }
        self.launch_locked(&mut inner).await
    }

    async fn launch_locked(&self, inner: &mut Inner) -> Result<(), AgentError> {
        self.set_state(AgentState::Starting);
        let config = self.config_snapshot();

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&config.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(AgentState::Exited { clean: false });
            AgentError::Spawn(format!("{}: {e}", config.program))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Spawn("child stderr not captured".into()))?;

        inner.generation += 1;
        let generation = inner.generation;

        tracing::info!(
            program = %config.program,
            pid = child.id(),
            generation,
            "spawned agent in stream mode"
        );

        inner.child = Some(child);
        inner.stdin = Some(stdin);

        let reader = self.clone();
        tokio::spawn(async move {
            reader.read_stdout(generation, stdout).await;
        });

        let collector = self.clone();
        tokio::spawn(async move {
            collector.collect_stderr(stderr).await;
        });

        self.set_state(AgentState::Ready);
        Ok(())
    }

    async fn read_stdout(self, generation: u64, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Some(event) => self.handle_event(generation, event).await,
                    None => {
                        if !line.trim().is_empty() {
                            tracing::warn!(line = %line, "skipping malformed agent line");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "agent stdout read failed");
                    break;
                }
            }
        }
        self.handle_eof(generation).await;
    }

    async fn handle_event(&self, generation: u64, event: AgentEvent) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            return;
        }

        match &event {
            AgentEvent::TextChunk { delta, .. } => {
                if let Some(current) = &mut inner.current {
                    current.buffer.push_str(delta);
                }
            }
            AgentEvent::MessageEnd { .. } => {
                if let Some(current) = inner.current.take() {
                    tracing::debug!(turn_id = %current.turn_id, "turn complete");
                    let _ = current.waiter.send(Ok(current.buffer));
                }
                self.set_state(AgentState::Ready);
            }
            AgentEvent::Aborted { .. } => {
                if let Some(current) = inner.current.take() {
                    tracing::info!(turn_id = %current.turn_id, "child confirmed abort");
                    let _ = current.waiter.send(Err(TurnError::Aborted));
                }
                self.set_state(AgentState::Ready);
            }
            AgentEvent::Unknown { kind } => {
                tracing::debug!(kind = %kind, "ignoring unknown agent event kind");
                return;
            }
            _ => {}
        }
        drop(inner);

        let _ = self.shared.updates.send(AgentUpdate::Event(event));
    }

    async fn handle_eof(&self, generation: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            // A restart replaced this child; nothing to report.
            return;
        }

        let clean = match inner.child.take() {
            Some(mut child) => match child.wait().await {
                Ok(status) => status.success(),
                Err(_) => false,
            },
            None => true,
        };
        inner.stdin = None;

        if let Some(current) = inner.current.take() {
            tracing::warn!(turn_id = %current.turn_id, "agent exited mid-turn");
            let _ = current.waiter.send(Err(TurnError::AgentExited));
        }
        drop(inner);

        tracing::warn!(clean, "agent process exited");
        self.set_state(AgentState::Exited { clean });
        let _ = self.shared.updates.send(AgentUpdate::Exited { clean });
    }

    async fn collect_stderr(self, stderr: tokio::process::ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = self
                .shared
                .stderr_tail
                .lock()
                .expect("stderr lock poisoned");
            if tail.len() >= STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    /// Submit a prompt. Accepted only in the `Ready` state; returns a
    /// receiver that resolves with the turn's accumulated assistant text.
    pub async fn submit(&self, turn_id: &TurnId, text: &str) -> Result<TurnReceiver, SubmitError> {
        let mut inner = self.shared.inner.lock().await;
        match self.state() {
            AgentState::Ready => {}
            AgentState::BusyThinking => return Err(SubmitError::Busy),
            _ => return Err(SubmitError::NotReady),
        }

        let stdin = inner
            .stdin
            .as_mut()
            .ok_or(SubmitError::Agent(AgentError::NotRunning))?;
        let mut line = serde_json::json!({ "turn_id": turn_id, "text": text }).to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(AgentError::Io)?;
        stdin.flush().await.map_err(AgentError::Io)?;

        let (tx, rx) = oneshot::channel();
        inner.current = Some(CurrentTurn {
            turn_id: turn_id.clone(),
            buffer: String::new(),
            waiter: tx,
        });
        self.set_state(AgentState::BusyThinking);
        tracing::info!(turn_id = %turn_id, chars = text.chars().count(), "submitted prompt");
        Ok(rx)
    }

    /// Relay the operator's answer to an agent prompt back to the child.
    pub async fn respond_option(&self, turn_id: &TurnId, option: u32) -> Result<(), AgentError> {
        let mut inner = self.shared.inner.lock().await;
        let stdin = inner.stdin.as_mut().ok_or(AgentError::NotRunning)?;
        let mut line = serde_json::json!({ "turn_id": turn_id, "option": option }).to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        tracing::info!(turn_id = %turn_id, option, "relayed prompt option");
        Ok(())
    }

    /// Cancel the current turn.
    ///
    /// Sends SIGINT and waits a bounded window for the child's own end
    /// event; when the window expires the turn is forced into aborted and
    /// the accumulated buffer is discarded. A second abort while one is
    /// draining is a no-op. Returns whether an abort was performed.
    pub async fn abort(&self) -> Result<bool, AgentError> {
        if self.state() != AgentState::BusyThinking {
            return Ok(false);
        }
        if self.shared.aborting.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.abort_inner().await;
        self.shared.aborting.store(false, Ordering::SeqCst);
        result.map(|()| true)
    }

    async fn abort_inner(&self) -> Result<(), AgentError> {
        let pid = {
            let inner = self.shared.inner.lock().await;
            inner.child.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            tracing::info!(pid, "sending SIGINT to cancel current turn");
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(AgentError::Signal(format!("SIGINT: {e}"))),
            }
        }

        let grace = self.config_snapshot().abort_grace;
        let mut state_rx = self.shared.state_tx.subscribe();
        let drained = tokio::time::timeout(
            grace,
            state_rx.wait_for(|s| *s != AgentState::BusyThinking),
        )
        .await
        .map(|_| ());

        if drained.is_err() {
            tracing::warn!("abort window expired, forcing turn to aborted");
            let mut inner = self.shared.inner.lock().await;
            if let Some(current) = inner.current.take() {
                let _ = current.waiter.send(Err(TurnError::Aborted));
            }
            drop(inner);
            if self.state() == AgentState::BusyThinking {
                self.set_state(AgentState::Ready);
            }
        }
        Ok(())
    }

    /// Terminate and relaunch the child. Any pending turn fails with
    /// [`TurnError::AgentExited`].
    pub async fn restart(&self) -> Result<(), AgentError> {
        let mut inner = self.shared.inner.lock().await;
        // Invalidate the old reader before the child goes away so its EOF
        // is not reported as a crash.
        inner.generation += 1;

        if let Some(current) = inner.current.take() {
            let _ = current.waiter.send(Err(TurnError::AgentExited));
        }
        inner.stdin = None;
        if let Some(mut child) = inner.child.take() {
            let grace = self.config_snapshot().term_grace;
            terminate_child(&mut child, grace).await;
        }

        self.launch_locked(&mut inner).await
    }

    /// Orderly shutdown: terminate the child without relaunching.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.generation += 1;

        if let Some(current) = inner.current.take() {
            let _ = current.waiter.send(Err(TurnError::AgentExited));
        }
        inner.stdin = None;
        if let Some(mut child) = inner.child.take() {
            let grace = self.config_snapshot().term_grace;
            terminate_child(&mut child, grace).await;
        }
        drop(inner);
        self.set_state(AgentState::Exited { clean: true });
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        tracing::info!(pid, "terminating agent child");
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("agent ignored SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    /// Stub agent: replies to each prompt line with a text chunk and a
    /// message_end echoing the prompt's turn id. Lines containing "slow"
    /// park instead, and SIGINT is ignored so forced aborts are exercised
    /// deterministically.
    const STUB_AGENT: &str = r#"
trap '' INT
while IFS= read -r line; do
  case "$line" in
    *slow*) sleep 30 ;;
    *)
      id=$(printf '%s' "$line" | sed -n 's/.*"turn_id":"\([^"]*\)".*/\1/p')
      printf '{"type":"text_chunk","turn_id":"%s","delta":"hi"}\n' "$id"
      printf '{"type":"message_end","turn_id":"%s"}\n' "$id"
      ;;
  esac
done
"#;

    fn stub_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), STUB_AGENT.into()],
            model: None,
            work_dir: dir.to_path_buf(),
            turn_timeout: Duration::from_secs(10),
            abort_grace: Duration::from_millis(200),
            term_grace: Duration::from_secs(2),
        }
    }

    fn new_process(dir: &std::path::Path) -> (AgentProcess, mpsc::UnboundedReceiver<AgentUpdate>) {
        let (tx, rx) = unbounded_channel();
        (AgentProcess::new(stub_config(dir), tx), rx)
    }

    #[tokio::test]
    async fn submit_completes_a_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);

        let turn_id = TurnId::generate();
        let rx = agent.submit(&turn_id, "hello").await.unwrap();
        assert_eq!(agent.state(), AgentState::BusyThinking);

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), "hi");
        assert_eq!(agent.state(), AgentState::Ready);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn second_submit_while_busy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        agent.start().await.unwrap();

        let first = TurnId::generate();
        let _rx = agent.submit(&first, "slow one").await.unwrap();

        let second = TurnId::generate();
        match agent.submit(&second, "hello").await {
            Err(SubmitError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        match agent.submit(&TurnId::generate(), "hello").await {
            Err(SubmitError::NotReady) => {}
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_abort_resolves_pending_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        agent.start().await.unwrap();

        let rx = agent.submit(&TurnId::generate(), "slow one").await.unwrap();
        // The stub ignores SIGINT, so the grace window expires and the
        // abort is forced.
        assert!(agent.abort().await.unwrap());
        assert_eq!(agent.state(), AgentState::Ready);

        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TurnError::Aborted));

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn abort_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        agent.start().await.unwrap();
        assert!(!agent.abort().await.unwrap());
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn restart_fails_pending_turn_and_accepts_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _updates) = new_process(dir.path());
        agent.start().await.unwrap();

        let rx = agent.submit(&TurnId::generate(), "slow one").await.unwrap();
        agent.restart().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TurnError::AgentExited));
        assert_eq!(agent.state(), AgentState::Ready);

        // Same semantics as a fresh start.
        let rx = agent.submit(&TurnId::generate(), "hello").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), "hi");

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_exit_surfaces_as_update() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut updates) = unbounded_channel();
        let config = AgentConfig {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
            ..stub_config(dir.path())
        };
        let agent = AgentProcess::new(config, tx);
        agent.start().await.unwrap();

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = updates.recv().await {
                if let AgentUpdate::Exited { clean } = update {
                    return clean;
                }
            }
            panic!("updates channel closed without Exited");
        })
        .await
        .unwrap();
        assert!(exited);
        assert_eq!(agent.state(), AgentState::Exited { clean: true });
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _updates) = unbounded_channel();
        let config = AgentConfig {
            program: "/definitely/not/a/real/binary".into(),
            ..stub_config(dir.path())
        };
        let agent = AgentProcess::new(config, tx);
        match agent.start().await {
            Err(AgentError::Spawn(msg)) => assert!(msg.contains("not/a/real/binary")),
            other => panic!("expected Spawn error, got {other:?}"),
        }
        assert_eq!(agent.state(), AgentState::Exited { clean: false });
    }
}
