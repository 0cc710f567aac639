use super::command::LaunchPlan;
use super::protocol::{InputFormat, StreamMessage, TurnOutcome, TurnResult, encode_user_message};
use crate::errors::BridgeError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const LINE_QUEUE_CAPACITY: usize = 256;
const STDERR_TAIL_LINES: usize = 20;
const READER_DRAIN: Duration = Duration::from_millis(250);
const UNKNOWN_EXIT: ProcessExit = ProcessExit {
    code: None,
    success: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Error)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub continuation_token: Option<String>,
    pub exit: Option<ProcessExit>,
}

/// Everything the assistant produced for one input line, ending at its `result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub text: String,
    pub outcome: TurnOutcome,
    pub cost_usd: f64,
    pub is_error: bool,
    pub transcript: Vec<StreamMessage>,
}

impl TurnReply {
    fn finish(transcript: Vec<StreamMessage>, result: TurnResult) -> Self {
        let text = match result.result.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => transcript
                .iter()
                .filter_map(StreamMessage::display_text)
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        Self {
            text,
            cost_usd: result.cost(),
            is_error: result.is_error || result.outcome != TurnOutcome::Success,
            outcome: result.outcome,
            transcript,
        }
    }
}

/// Notifications for whoever owns the sessions; delivered in output order per process.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    Initialized {
        session_id: String,
        continuation_token: String,
    },
    Output {
        session_id: String,
        text: String,
    },
    /// Cost of a turn nobody was waiting on, such as the initial prompt.
    Cost {
        session_id: String,
        cost_usd: f64,
    },
    Exited {
        session_id: String,
        status: ProcessStatus,
        exit: ProcessExit,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownOutcome {
    pub forced: bool,
    pub exit: ProcessExit,
    pub status: ProcessStatus,
}

enum StreamLine {
    Stdout(String),
    Stderr(String),
}

type TurnSlot = SyncMutex<Option<mpsc::UnboundedSender<StreamMessage>>>;

pub struct AssistantProcess {
    session_id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    input_format: InputFormat,
    status: SyncRwLock<ProcessStatus>,
    stdin: Mutex<Option<ChildStdin>>,
    turn_lock: Arc<Mutex<()>>,
    turn_slot: TurnSlot,
    stream_closed: AtomicBool,
    continuation: SyncMutex<Option<String>>,
    stderr_tail: SyncMutex<VecDeque<String>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: SyncMutex<Option<oneshot::Sender<()>>>,
    turns_cancel: CancellationToken,
    readers_cancel: CancellationToken,
    events: mpsc::UnboundedSender<AssistantEvent>,
}

impl AssistantProcess {
    pub(crate) fn spawn(
        session_id: &str,
        plan: &LaunchPlan,
        input_format: InputFormat,
        resume_token: Option<String>,
        events: mpsc::UnboundedSender<AssistantEvent>,
    ) -> Result<Arc<Self>, BridgeError> {
        let mut child = plan.to_command().spawn().map_err(|e| {
            BridgeError::unavailable(
                session_id,
                format!("failed to launch {}: {e}", plan.program.display()),
            )
        })?;

        let missing = |stream: &str| {
            BridgeError::unavailable(session_id, format!("assistant {stream} was not captured"))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE_CAPACITY);

        let process = Arc::new(Self {
            session_id: session_id.to_string(),
            pid: child.id(),
            started_at: Utc::now(),
            input_format,
            status: SyncRwLock::new(ProcessStatus::Running),
            stdin: Mutex::new(Some(stdin)),
            turn_lock: Arc::new(Mutex::new(())),
            turn_slot: SyncMutex::new(None),
            stream_closed: AtomicBool::new(false),
            continuation: SyncMutex::new(resume_token),
            stderr_tail: SyncMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            exit_rx,
            kill_tx: SyncMutex::new(Some(kill_tx)),
            turns_cancel: CancellationToken::new(),
            readers_cancel: CancellationToken::new(),
            events,
        });

        log::info!(
            "[assistant:{session_id}] Spawned pid={:?}: {}",
            process.pid,
            plan.describe()
        );

        tokio::spawn(pump_lines(
            stdout,
            StreamLine::Stdout,
            line_tx.clone(),
            process.readers_cancel.clone(),
        ));
        tokio::spawn(pump_lines(
            stderr,
            StreamLine::Stderr,
            line_tx,
            process.readers_cancel.clone(),
        ));
        tokio::spawn(process.clone().consume(line_rx));
        tokio::spawn(process.clone().watch_exit(child, kill_rx, exit_tx));

        Ok(process)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.read()
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            session_id: self.session_id.clone(),
            pid: self.pid,
            status: self.status(),
            started_at: self.started_at,
            continuation_token: self.continuation.lock().clone(),
            exit: *self.exit_rx.borrow(),
        }
    }

    /// Writes the initial prompt in the background while holding the turn lock,
    /// so the first `send` cannot mistake the prompt's output for its reply.
    pub(crate) fn begin_initial_turn(self: &Arc<Self>, message: Option<String>) {
        let Some(message) = message.filter(|m| !m.trim().is_empty()) else {
            return;
        };
        let Ok(guard) = self.turn_lock.clone().try_lock_owned() else {
            log::warn!(
                "[assistant:{}] Turn already in progress; skipping initial prompt",
                self.session_id
            );
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            match this.open_turn(&message, guard).await {
                Ok(turn) => turn.settle("Initial prompt").await,
                Err(err) => {
                    log::warn!(
                        "[assistant:{}] Initial prompt was not delivered: {err}",
                        this.session_id
                    );
                }
            }
        });
    }

    /// A turn that times out keeps the turn lock until its late `result`
    /// arrives, so the next caller never receives someone else's reply.
    pub(crate) async fn send(
        self: &Arc<Self>,
        message: &str,
        wait: Duration,
    ) -> Result<TurnReply, BridgeError> {
        self.ensure_running()?;

        let guard = tokio::select! {
            guard = tokio::time::timeout(wait, self.turn_lock.clone().lock_owned()) => {
                guard.map_err(|_| self.timed_out(wait))?
            }
            _ = self.turns_cancel.cancelled() => {
                return Err(self.unavailable("assistant is stopping"));
            }
        };

        self.ensure_running()?;
        let mut turn = self.open_turn(message, guard).await?;
        match turn.wait_for_result(Some(wait)).await {
            Err(err @ BridgeError::AssistantTimeout { .. }) => {
                tokio::spawn(turn.settle("Timed-out turn"));
                Err(err)
            }
            outcome => outcome,
        }
    }

    /// Graceful stop: sentinel, close stdin, wait `grace`; then kill and reap.
    pub(crate) async fn shutdown(
        &self,
        grace: Duration,
        sentinel: Option<&str>,
    ) -> Result<ShutdownOutcome, BridgeError> {
        {
            let mut status = self.status.write();
            if *status == ProcessStatus::Running {
                *status = ProcessStatus::Stopping;
            }
        }
        self.turns_cancel.cancel();

        let graceful = async {
            let _turn = self.turn_lock.lock().await;
            if let Some(sentinel) = sentinel
                && !self.status().has_exited()
                && let Err(err) = self.write_line(sentinel).await
            {
                log::debug!(
                    "[assistant:{}] Exit sentinel not delivered: {err}",
                    self.session_id
                );
            }
            self.stdin.lock().await.take();
            self.wait_for_exit().await
        };

        let (exit, forced) = match tokio::time::timeout(grace, graceful).await {
            Ok(exit) => (exit, false),
            Err(_) => {
                log::warn!(
                    "[assistant:{}] Did not exit within {grace:?}; killing",
                    self.session_id
                );
                self.force_kill();
                let exit = tokio::time::timeout(grace, self.wait_for_exit())
                    .await
                    .map_err(|_| {
                        BridgeError::internal(format!(
                            "assistant process for session {} did not exit after kill",
                            self.session_id
                        ))
                    })?;
                (exit, true)
            }
        };

        Ok(ShutdownOutcome {
            forced,
            exit,
            status: self.status(),
        })
    }

    pub(crate) fn force_kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    async fn open_turn(
        self: &Arc<Self>,
        message: &str,
        guard: OwnedMutexGuard<()>,
    ) -> Result<PendingTurn, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.turn_slot.lock() = Some(tx);
        let turn = PendingTurn {
            process: self.clone(),
            rx,
            transcript: Vec::new(),
            _turn: guard,
        };
        if self.stream_closed.load(Ordering::SeqCst) {
            return Err(self.unavailable("assistant output stream is closed"));
        }

        let line = encode_user_message(message, self.input_format);
        tokio::select! {
            written = self.write_line(&line) => written?,
            _ = self.turns_cancel.cancelled() => {
                return Err(self.unavailable("assistant is stopping"));
            }
        }
        Ok(turn)
    }

    async fn write_line(&self, line: &str) -> Result<(), BridgeError> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(self.unavailable("assistant input is closed"));
        };

        let written: std::io::Result<()> = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await
        }
        .await;

        written.map_err(|e| self.unavailable(format!("failed to write to assistant: {e}")))
    }

    async fn consume(self: Arc<Self>, mut lines: mpsc::Receiver<StreamLine>) {
        while let Some(line) = lines.recv().await {
            match line {
                StreamLine::Stdout(text) => self.handle_stdout(&text),
                StreamLine::Stderr(text) => self.handle_stderr(text),
            }
        }

        self.stream_closed.store(true, Ordering::SeqCst);
        self.turn_slot.lock().take();
        log::debug!("[assistant:{}] Output stream closed", self.session_id);
    }

    fn handle_stdout(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = StreamMessage::parse(line);

        if let Some(token) = message.continuation_token() {
            let changed = {
                let mut current = self.continuation.lock();
                if current.as_deref() == Some(token) {
                    false
                } else {
                    *current = Some(token.to_string());
                    true
                }
            };
            if changed {
                self.emit(AssistantEvent::Initialized {
                    session_id: self.session_id.clone(),
                    continuation_token: token.to_string(),
                });
            }
        }

        if let Some(text) = message.display_text() {
            self.emit(AssistantEvent::Output {
                session_id: self.session_id.clone(),
                text,
            });
        }

        let unclaimed = {
            let slot = self.turn_slot.lock();
            match slot.as_ref() {
                Some(tx) => tx.send(message).err().map(|e| e.0),
                None => Some(message),
            }
        };
        if let Some(StreamMessage::Result(result)) = unclaimed
            && result.cost() > 0.0
        {
            self.emit(AssistantEvent::Cost {
                session_id: self.session_id.clone(),
                cost_usd: result.cost(),
            });
        }
    }

    fn handle_stderr(&self, line: String) {
        log::debug!("[assistant:{} stderr] {line}", self.session_id);
        let mut tail = self.stderr_tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
    ) {
        let waited = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(err) = child.start_kill() {
                    log::warn!("[assistant:{}] Kill failed: {err}", self.session_id);
                }
                child.wait().await
            }
        };

        let exit = match waited {
            Ok(status) => ProcessExit {
                code: status.code(),
                success: status.success(),
            },
            Err(err) => {
                log::error!("[assistant:{}] Failed to reap process: {err}", self.session_id);
                UNKNOWN_EXIT
            }
        };

        let status = {
            let mut current = self.status.write();
            let next = match *current {
                ProcessStatus::Running if !exit.success => ProcessStatus::Error,
                ProcessStatus::Running | ProcessStatus::Stopping => ProcessStatus::Stopped,
                other => other,
            };
            *current = next;
            next
        };

        if status == ProcessStatus::Error {
            log::error!(
                "[assistant:{}] Exited unexpectedly (code {:?}){}",
                self.session_id,
                exit.code,
                self.stderr_hint()
            );
        } else {
            log::info!(
                "[assistant:{}] Exited (code {:?})",
                self.session_id,
                exit.code
            );
        }

        let _ = exit_tx.send(Some(exit));
        self.emit(AssistantEvent::Exited {
            session_id: self.session_id.clone(),
            status,
            exit,
        });

        // Pipes inherited by grandchildren can outlive the process.
        tokio::time::sleep(READER_DRAIN).await;
        self.readers_cancel.cancel();
    }

    async fn wait_for_exit(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(UNKNOWN_EXIT),
            Err(_) => UNKNOWN_EXIT,
        }
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        match self.status() {
            ProcessStatus::Running => Ok(()),
            other => Err(self.unavailable(format!("assistant is {other}"))),
        }
    }

    fn emit(&self, event: AssistantEvent) {
        let _ = self.events.send(event);
    }

    fn unavailable(&self, message: impl ToString) -> BridgeError {
        BridgeError::unavailable(&self.session_id, message)
    }

    fn timed_out(&self, waited: Duration) -> BridgeError {
        BridgeError::AssistantTimeout {
            session_id: self.session_id.clone(),
            waited_secs: waited.as_secs(),
        }
    }

    fn stderr_hint(&self) -> String {
        let tail = self.stderr_tail.lock();
        match tail.back() {
            Some(last) => format!(": {last}"),
            None => String::new(),
        }
    }
}

/// One line written to the assistant whose `result` has not been read yet.
/// Owns the turn lock; dropping it frees the reply slot, then the lock.
struct PendingTurn {
    process: Arc<AssistantProcess>,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    transcript: Vec<StreamMessage>,
    _turn: OwnedMutexGuard<()>,
}

impl PendingTurn {
    async fn wait_for_result(&mut self, wait: Option<Duration>) -> Result<TurnReply, BridgeError> {
        let process = self.process.clone();
        loop {
            let next = tokio::select! {
                next = recv_within(&mut self.rx, wait) => next,
                _ = process.turns_cancel.cancelled() => {
                    return Err(process.unavailable("assistant is stopping"));
                }
            };

            match next {
                Err(_) => return Err(process.timed_out(wait.unwrap_or_default())),
                Ok(None) => {
                    return Err(process.unavailable(format!(
                        "assistant exited before replying{}",
                        process.stderr_hint()
                    )));
                }
                Ok(Some(StreamMessage::Result(result))) => {
                    return Ok(TurnReply::finish(std::mem::take(&mut self.transcript), result));
                }
                Ok(Some(other)) => self.transcript.push(other),
            }
        }
    }

    /// Waits without a deadline for a turn nobody is waiting on and reports its cost.
    async fn settle(mut self, label: &'static str) {
        let process = self.process.clone();
        match self.wait_for_result(None).await {
            Ok(reply) => {
                if reply.cost_usd > 0.0 {
                    process.emit(AssistantEvent::Cost {
                        session_id: process.session_id.clone(),
                        cost_usd: reply.cost_usd,
                    });
                }
                log::debug!("[assistant:{}] {label} completed", process.session_id);
            }
            Err(err) => {
                log::warn!(
                    "[assistant:{}] {label} did not complete: {err}",
                    process.session_id
                );
            }
        }
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        self.process.turn_slot.lock().take();
    }
}

async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<StreamMessage>,
    wait: Option<Duration>,
) -> Result<Option<StreamMessage>, tokio::time::error::Elapsed> {
    match wait {
        Some(limit) => tokio::time::timeout(limit, rx.recv()).await,
        None => Ok(rx.recv().await),
    }
}

async fn pump_lines<R>(
    reader: R,
    wrap: fn(String) -> StreamLine,
    queue: mpsc::Sender<StreamLine>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = cancel.cancelled() => break,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                tokio::select! {
                    sent = queue.send(wrap(line)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            Err(err) => {
                log::warn!("[assistant] Failed to read process output: {err}");
                break;
            }
        }
    }
}
