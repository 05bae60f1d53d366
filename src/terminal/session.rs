//! A reusable terminal session bound to one working directory.
//!
//! A session runs at most one command at a time. Output of finished commands
//! is queued until a caller retrieves it. Compound commands (`a && b`) can
//! report one completion per sub-invocation on hosts with shell integration;
//! the session collects those and finalizes once, either when the expected
//! count is reached or when a bounded wait expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::error::AppError;
use crate::terminal::command_parser::{self, estimate_process_count};
use crate::terminal::host::{ExecutionStream, HostTerminalId};
use crate::terminal::process::{lock, ExitCodeDetails, ProcessHandle, TerminalProcess};
use crate::terminal::runner::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalProvider {
    /// A visible terminal owned by the host editor.
    Integrated,
    /// A child process spawned directly, used for background work.
    Spawned,
}

/// Hooks invoked while a command runs. All methods default to no-ops.
pub trait RunCallbacks: Send + Sync {
    fn on_line(&self, _line: &str) {}

    /// Full output of the finished command.
    fn on_completed(&self, _output: &str) {}

    fn on_shell_execution_started(&self, _pid: Option<u32>) {}

    fn on_shell_execution_complete(&self, _details: &ExitCodeDetails) {}
}

#[derive(Debug, Default)]
pub struct NoopCallbacks;

impl RunCallbacks for NoopCallbacks {}

#[derive(Debug, Clone, Serialize)]
pub struct CompoundCompletion {
    pub exit_details: ExitCodeDetails,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CompoundTracker {
    is_compound: bool,
    completions: Vec<CompoundCompletion>,
    expected: usize,
    wait_timer: Option<JoinHandle<()>>,
}

impl CompoundTracker {
    fn cancel(&mut self) {
        if let Some(timer) = self.wait_timer.take() {
            timer.abort();
        }
        *self = CompoundTracker::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeTrigger {
    CountReached,
    /// Carries the tracking generation the timer was armed for.
    Timeout(u64),
    Explicit,
}

struct SessionState {
    busy: bool,
    /// Token of the lease currently holding this session, if any.
    reservation: Option<u64>,
    next_reservation: u64,
    compound_generation: u64,
    running: bool,
    disposed: bool,
    task_id: Option<String>,
    active_process: Option<Arc<TerminalProcess>>,
    active_callbacks: Option<Arc<dyn RunCallbacks>>,
    /// Most recent first.
    completed_processes: VecDeque<Arc<TerminalProcess>>,
    compound: CompoundTracker,
    stream_tasks: Vec<JoinHandle<()>>,
    last_command: Option<String>,
    last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub provider: TerminalProvider,
    pub cwd: PathBuf,
    pub busy: bool,
    pub running: bool,
    pub task_id: Option<String>,
    pub last_command: Option<String>,
    pub pending_output_processes: usize,
    pub last_used_iso: String,
}

pub struct Session {
    id: u64,
    provider: TerminalProvider,
    cwd: PathBuf,
    compound_wait: Duration,
    runner: Box<dyn CommandRunner>,
    state: StdMutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: u64,
        provider: TerminalProvider,
        cwd: PathBuf,
        compound_wait: Duration,
        runner: Box<dyn CommandRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            provider,
            cwd,
            compound_wait,
            runner,
            state: StdMutex::new(SessionState {
                busy: false,
                reservation: None,
                next_reservation: 0,
                compound_generation: 0,
                running: false,
                disposed: false,
                task_id: None,
                active_process: None,
                active_callbacks: None,
                completed_processes: VecDeque::new(),
                compound: CompoundTracker::default(),
                stream_tasks: Vec::new(),
                last_command: None,
                last_used: Utc::now(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn provider(&self) -> TerminalProvider {
        self.provider
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn task_id(&self) -> Option<String> {
        lock(&self.state).task_id.clone()
    }

    pub(crate) fn set_task_id(&self, task_id: Option<String>) {
        lock(&self.state).task_id = task_id;
    }

    /// True while a command runs or a lease holds the session.
    pub fn is_busy(&self) -> bool {
        let state = lock(&self.state);
        state.busy || state.reservation.is_some()
    }

    /// Claims the session for one caller. Returns `None` if it is busy,
    /// already leased or disposed.
    pub(crate) fn try_reserve(self: &Arc<Self>) -> Option<SessionLease> {
        let mut state = lock(&self.state);
        if state.busy || state.disposed || state.reservation.is_some() {
            return None;
        }
        state.next_reservation += 1;
        let token = state.next_reservation;
        state.reservation = Some(token);
        Some(SessionLease {
            session: self.clone(),
            token,
        })
    }

    fn release_reservation(&self, token: u64) {
        let mut state = lock(&self.state);
        if state.reservation == Some(token) {
            state.reservation = None;
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).disposed || self.runner.is_closed()
    }

    pub fn last_command(&self) -> Option<String> {
        lock(&self.state).last_command.clone()
    }

    pub fn host_terminal_id(&self) -> Option<HostTerminalId> {
        self.runner.host_terminal_id()
    }

    pub fn active_process(&self) -> Option<Arc<TerminalProcess>> {
        lock(&self.state).active_process.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let state = lock(&self.state);
        SessionInfo {
            id: self.id,
            provider: self.provider,
            cwd: self.cwd.clone(),
            busy: state.busy || state.reservation.is_some(),
            running: state.running,
            task_id: state.task_id.clone(),
            last_command: state.last_command.clone(),
            pending_output_processes: state.completed_processes.len(),
            last_used_iso: state.last_used.to_rfc3339(),
        }
    }

    /// Starts `command`. The session is marked busy before the provider gets
    /// a chance to produce output. Fails with `SessionBusy` while another
    /// caller holds a lease on the session.
    pub fn run_command(
        self: &Arc<Self>,
        command: &str,
        callbacks: Arc<dyn RunCallbacks>,
    ) -> Result<ProcessHandle, AppError> {
        self.start(command, callbacks, None)
    }

    #[instrument(skip(self, callbacks), fields(session_id = self.id))]
    fn start(
        self: &Arc<Self>,
        command: &str,
        callbacks: Arc<dyn RunCallbacks>,
        lease: Option<u64>,
    ) -> Result<ProcessHandle, AppError> {
        let process = {
            let mut state = lock(&self.state);
            if state.disposed {
                return Err(AppError::CommandExecutionError(format!(
                    "Session {} has been disposed",
                    self.id
                )));
            }
            if state.busy || (state.reservation.is_some() && state.reservation != lease) {
                return Err(AppError::SessionBusy(self.id));
            }
            state.reservation = None;
            let process = TerminalProcess::new(command);
            state.busy = true;
            state.running = true;
            state.active_process = Some(process.clone());
            state.active_callbacks = Some(callbacks.clone());
            state.last_command = Some(command.to_string());
            state.last_used = Utc::now();
            process
        };

        debug!(command = %command, provider = ?self.provider, "Running command");
        if let Err(e) = self.runner.start(self, &process, command, callbacks) {
            warn!(error = %e, command = %command, "Provider failed to start command");
            {
                let mut state = lock(&self.state);
                let still_active = state
                    .active_process
                    .as_ref()
                    .map_or(false, |p| Arc::ptr_eq(p, &process));
                if still_active {
                    state.busy = false;
                    state.running = false;
                    state.active_process = None;
                    state.active_callbacks = None;
                    state.compound.cancel();
                }
            }
            process.mark_completed(ExitCodeDetails::default());
            return Err(e);
        }

        Ok(ProcessHandle::new(self.id, process))
    }

    /// Attaches a host execution stream to the active process.
    pub fn set_active_stream(&self, stream: ExecutionStream) {
        let (process, callbacks) = {
            let mut state = lock(&self.state);
            let Some(process) = state.active_process.clone() else {
                debug!(session_id = self.id, "Execution stream without an active process; ignoring");
                return;
            };
            state.busy = true;
            state.running = true;
            (process, state.active_callbacks.clone())
        };

        let Some(mut receiver) = stream.take() else {
            debug!(session_id = self.id, "Execution stream already consumed");
            return;
        };

        if let Some(callbacks) = &callbacks {
            callbacks.on_shell_execution_started(process.pid());
        }

        let task = tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                process.append_output(&chunk);
                if let Some(callbacks) = &callbacks {
                    for line in chunk.lines() {
                        callbacks.on_line(line);
                    }
                }
            }
        });

        let mut state = lock(&self.state);
        state.stream_tasks.retain(|t| !t.is_finished());
        state.stream_tasks.push(task);
    }

    /// Waits (bounded) for attached execution streams to deliver what they
    /// have buffered.
    pub(crate) async fn flush_streams(&self, bound: Duration) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut lock(&self.state).stream_tasks);
        for task in pending {
            if tokio::time::timeout(bound, task).await.is_err() {
                debug!(session_id = self.id, "Execution stream still open after flush bound");
            }
        }
    }

    /// Resets compound tracking and starts it again if `command` looks
    /// compound. The expected count is a textual estimate; the wait timer
    /// bounds how long a wrong estimate can hold the session.
    pub fn detect_compound_command(self: &Arc<Self>, command: &str) {
        let parsed = command_parser::parse(command);
        let is_compound = parsed.is_compound || command_parser::has_background_operator(command);

        let mut state = lock(&self.state);
        state.compound.cancel();
        state.compound_generation += 1;
        if !is_compound {
            return;
        }

        let expected = estimate_process_count(command);
        state.compound.is_compound = true;
        state.compound.expected = expected;

        let weak: Weak<Session> = Arc::downgrade(self);
        let wait = self.compound_wait;
        let generation = state.compound_generation;
        state.compound.wait_timer = Some(tokio::spawn(async move {
            sleep(wait).await;
            if let Some(session) = weak.upgrade() {
                session.finalize(FinalizeTrigger::Timeout(generation));
            }
        }));
        debug!(session_id = self.id, expected, "Tracking compound command");
    }

    pub fn is_tracking_compound(&self) -> bool {
        lock(&self.state).compound.is_compound
    }

    pub fn expected_compound_count(&self) -> usize {
        lock(&self.state).compound.expected
    }

    pub fn compound_completions(&self) -> Vec<CompoundCompletion> {
        lock(&self.state).compound.completions.clone()
    }

    pub fn add_compound_process_completion(&self, exit_details: ExitCodeDetails, command: &str) {
        let reached = {
            let mut state = lock(&self.state);
            if !state.compound.is_compound {
                debug!(session_id = self.id, command = %command, "Compound completion received while not tracking; ignoring");
                return;
            }
            state.compound.completions.push(CompoundCompletion {
                exit_details,
                command: command.to_string(),
                timestamp: Utc::now(),
            });
            state.compound.completions.len() >= state.compound.expected
        };
        if reached {
            self.finalize(FinalizeTrigger::CountReached);
        }
    }

    /// Completes a tracked compound command using the last recorded stage's
    /// exit status. No-op if tracking was already cleared.
    pub fn finalize_compound_command(&self) {
        self.finalize(FinalizeTrigger::Explicit);
    }

    fn finalize(&self, trigger: FinalizeTrigger) {
        let details = {
            let mut state = lock(&self.state);
            if !state.compound.is_compound {
                return;
            }
            let timed_out = match trigger {
                // A timer that woke after tracking was reset belongs to an
                // earlier command.
                FinalizeTrigger::Timeout(generation) if generation != state.compound_generation => {
                    debug!(session_id = self.id, "Stale compound wait timer; ignoring");
                    return;
                }
                FinalizeTrigger::Timeout(_) => true,
                _ => false,
            };
            let timer = state.compound.wait_timer.take();
            // On timeout the caller is the timer task itself.
            if !timed_out {
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
            let received = state.compound.completions.len();
            if timed_out {
                warn!(
                    session_id = self.id,
                    received,
                    expected = state.compound.expected,
                    "Compound command wait expired; finalizing with partial completions"
                );
            }
            let details = state
                .compound
                .completions
                .last()
                .map(|c| c.exit_details.clone())
                .unwrap_or_default();
            state.compound = CompoundTracker::default();
            details
        };
        self.shell_execution_complete(details);
    }

    /// Marks the current command finished and notifies waiters.
    pub fn shell_execution_complete(&self, exit_details: ExitCodeDetails) {
        let (process, callbacks) = {
            let mut state = lock(&self.state);
            state.compound.cancel();
            state.busy = false;
            state.running = false;
            state.last_used = Utc::now();
            let process = state.active_process.take();
            if let Some(p) = &process {
                if p.has_unretrieved_output() {
                    state.completed_processes.push_front(p.clone());
                }
            }
            (process, state.active_callbacks.take())
        };

        info!(session_id = self.id, exit_code = ?exit_details.exit_code, "Shell execution complete");

        if let Some(process) = &process {
            process.mark_completed(exit_details.clone());
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_shell_execution_complete(&exit_details);
            let output = process.as_ref().map(|p| p.full_output()).unwrap_or_default();
            callbacks.on_completed(&output);
        }
    }

    /// Completion reported by a provider for a specific process. If the
    /// session has moved on (released or reused), only the process itself is
    /// marked finished.
    pub(crate) fn process_exited(&self, process: &Arc<TerminalProcess>, details: ExitCodeDetails) {
        let is_active = lock(&self.state)
            .active_process
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, process));
        if is_active {
            self.shell_execution_complete(details);
        } else {
            debug!(session_id = self.id, command = %process.command(), "Detached process exited");
            process.mark_completed(details);
        }
    }

    /// Output not yet handed out, oldest first, followed by the active
    /// process's output.
    pub fn get_unretrieved_output(&self) -> String {
        let mut state = lock(&self.state);
        let mut output = String::new();
        for process in state.completed_processes.iter().rev() {
            output.push_str(&process.take_unretrieved_output());
        }
        if let Some(active) = &state.active_process {
            output.push_str(&active.take_unretrieved_output());
        }
        state.completed_processes.retain(|p| p.has_unretrieved_output());
        output
    }

    /// Drops the task affiliation and the active process reference. The
    /// underlying process is not signalled.
    pub(crate) fn release(&self) {
        let mut state = lock(&self.state);
        state.busy = false;
        state.running = false;
        state.task_id = None;
        state.active_process = None;
        state.active_callbacks = None;
        state.compound.cancel();
        state.compound_generation += 1;
    }

    /// Cancels every timer and watcher owned by this session and tears down
    /// the provider.
    pub fn dispose(&self) {
        let active = {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.reservation = None;
            state.compound.cancel();
            state.compound_generation += 1;
            for task in state.stream_tasks.drain(..) {
                task.abort();
            }
            state.busy = false;
            state.running = false;
            state.active_callbacks = None;
            state.active_process.take()
        };
        if let Some(process) = active {
            process.abort();
        }
        self.runner.dispose();
        debug!(session_id = self.id, "Session disposed");
    }
}

/// A session claimed by one caller. The claim ends when the lease runs a
/// command or is dropped.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<Session>,
    token: u64,
}

impl SessionLease {
    pub fn run_command(&self, command: &str, callbacks: Arc<dyn RunCallbacks>) -> Result<ProcessHandle, AppError> {
        self.session.start(command, callbacks, Some(self.token))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Gives up the claim and keeps a plain handle to the session.
    pub fn into_session(self) -> Arc<Session> {
        self.session.clone()
    }
}

impl Deref for SessionLease {
    type Target = Arc<Session>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.release_reservation(self.token);
    }
}
