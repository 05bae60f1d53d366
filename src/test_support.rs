//! In-memory fakes for the host terminal API, the process spawner and the
//! health probe, shared by unit tests across modules.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

use crate::error::AppError;
use crate::services::health::HealthProbe;
use crate::terminal::host::{
    ExecutionEnded, ExecutionStarted, ExecutionStream, HostTerminal, HostTerminalId, TerminalHost,
};
use crate::terminal::process::{lock, ExitCodeDetails, TerminalProcess};
use crate::terminal::runner::{CommandRunner, SpawnedRunner};
use crate::terminal::session::{RunCallbacks, Session, TerminalProvider};
use crate::terminal::spawner::{ProcessSpawner, SpawnRequest, SpawnedProcess};

#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    lines: StdMutex<Vec<String>>,
    pub started: AtomicUsize,
    pub completions: AtomicUsize,
}

impl RecordingCallbacks {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl RunCallbacks for RecordingCallbacks {
    fn on_line(&self, line: &str) {
        lock(&self.lines).push(line.to_string());
    }

    fn on_shell_execution_started(&self, _pid: Option<u32>) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shell_execution_complete(&self, _details: &ExitCodeDetails) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runner that accepts (or rejects) every command and leaves completion to
/// the test.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    fail: bool,
}

impl ScriptedRunner {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl CommandRunner for ScriptedRunner {
    fn start(
        &self,
        _session: &Arc<Session>,
        _process: &Arc<TerminalProcess>,
        command: &str,
        _callbacks: Arc<dyn RunCallbacks>,
    ) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::HostError(format!("refusing to run '{}'", command)));
        }
        Ok(())
    }

    fn dispose(&self) {}
}

struct FakeChild {
    pid: u32,
    command: String,
    lines: Option<mpsc::UnboundedSender<String>>,
    exit: Option<oneshot::Sender<ExitCodeDetails>>,
}

type Children = Arc<StdMutex<Vec<FakeChild>>>;

fn finish_child(children: &Children, alive: &StdMutex<HashSet<u32>>, index: usize, details: ExitCodeDetails) {
    let mut children = lock(children);
    let Some(child) = children.get_mut(index) else {
        return;
    };
    child.lines.take();
    if let Some(exit) = child.exit.take() {
        let _ = exit.send(details);
    }
    lock(alive).remove(&child.pid);
}

/// Spawner whose children live until the test finishes them or a terminate
/// request arrives (unless terminate is being ignored).
#[derive(Default)]
pub struct FakeSpawner {
    children: Children,
    alive: Arc<StdMutex<HashSet<u32>>>,
    next_pid: AtomicU32,
    ignore_terminate: Arc<AtomicBool>,
    fail: AtomicBool,
}

impl FakeSpawner {
    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawned_count(&self) -> usize {
        lock(&self.children).len()
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.children).iter().map(|c| c.command.clone()).collect()
    }

    pub fn pid(&self, index: usize) -> Option<u32> {
        lock(&self.children).get(index).map(|c| c.pid)
    }

    pub fn emit(&self, index: usize, line: &str) {
        if let Some(tx) = lock(&self.children).get(index).and_then(|c| c.lines.as_ref()) {
            let _ = tx.send(line.to_string());
        }
    }

    pub fn finish(&self, index: usize, code: i32) {
        finish_child(&self.children, &self.alive, index, ExitCodeDetails::from_raw(Some(code)));
    }

    /// Forgets the pid as if the process vanished without reporting an exit.
    pub fn kill_silently(&self, index: usize) {
        if let Some(pid) = self.pid(index) {
            lock(&self.alive).remove(&pid);
        }
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::CommandExecutionError(format!(
                "Failed to spawn command '{}'",
                request.command
            )));
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminate = Arc::new(Notify::new());

        let index = {
            let mut children = lock(&self.children);
            children.push(FakeChild {
                pid,
                command: request.command.clone(),
                lines: Some(line_tx),
                exit: Some(exit_tx),
            });
            children.len() - 1
        };
        lock(&self.alive).insert(pid);

        let signal = terminate.clone();
        let children = self.children.clone();
        let alive = self.alive.clone();
        let ignore = self.ignore_terminate.clone();
        tokio::spawn(async move {
            signal.notified().await;
            if !ignore.load(Ordering::SeqCst) {
                finish_child(&children, &alive, index, ExitCodeDetails::from_raw(Some(143)));
            }
        });

        Ok(SpawnedProcess {
            pid: Some(pid),
            lines: line_rx,
            exit: exit_rx,
            terminate,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.alive).contains(&pid)
    }
}

pub fn spawned_session(id: u64) -> (Arc<Session>, Arc<FakeSpawner>) {
    let spawner = Arc::new(FakeSpawner::default());
    let runner = SpawnedRunner::new(spawner.clone(), std::env::temp_dir());
    let session = Session::new(
        id,
        TerminalProvider::Spawned,
        std::env::temp_dir(),
        Duration::from_secs(10),
        Box::new(runner),
    );
    (session, spawner)
}

#[derive(Debug)]
pub struct FakeHostTerminal {
    id: HostTerminalId,
    supports_events: bool,
    output: StdMutex<String>,
    sent: StdMutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeHostTerminal {
    pub fn new(id: HostTerminalId, supports_events: bool) -> Self {
        Self {
            id,
            supports_events,
            output: StdMutex::new(String::new()),
            sent: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push_output(&self, text: &str) {
        lock(&self.output).push_str(text);
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Plays what a POSIX shell prints for a marker-wrapped line: the echo,
    /// the start marker, `content`, then the end marker with `exit_code`.
    /// Returns false if `wrapped` does not carry both marker printfs.
    pub fn simulate_marker_run(&self, wrapped: &str, content: &str, exit_code: i32) -> bool {
        let printf = Regex::new(r"printf '[^']*' '([^']*)' '([^']*)'").expect("valid regex");
        let tokens: Vec<String> = printf
            .captures_iter(wrapped)
            .map(|caps| format!("{}{}", &caps[1], &caps[2]))
            .collect();
        let [start, end] = tokens.as_slice() else {
            return false;
        };
        self.push_output(&format!(
            "{}\n{}\n{}\n{} EXIT_CODE={}\nuser@host:~$ ",
            wrapped, start, content, end, exit_code
        ));
        true
    }
}

impl HostTerminal for FakeHostTerminal {
    fn id(&self) -> HostTerminalId {
        self.id
    }

    fn send_text(&self, text: &str) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(AppError::HostError(format!("terminal {} is closed", self.id)));
        }
        lock(&self.sent).push(text.to_string());
        Ok(())
    }

    fn supports_execution_events(&self) -> bool {
        self.supports_events
    }

    fn read_output(&self) -> String {
        lock(&self.output).clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.close();
    }
}

/// Host with shell integration: every terminal it creates reports
/// execution events, which tests emit by hand.
pub struct FakeHost {
    terminals: StdMutex<Vec<Arc<FakeHostTerminal>>>,
    created_in: StdMutex<Vec<PathBuf>>,
    next_id: AtomicU64,
    start_tx: broadcast::Sender<ExecutionStarted>,
    end_tx: broadcast::Sender<ExecutionEnded>,
}

impl Default for FakeHost {
    fn default() -> Self {
        let (start_tx, _) = broadcast::channel(64);
        let (end_tx, _) = broadcast::channel(64);
        Self {
            terminals: StdMutex::new(Vec::new()),
            created_in: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            start_tx,
            end_tx,
        }
    }
}

impl FakeHost {
    pub fn terminal(&self, id: HostTerminalId) -> Option<Arc<FakeHostTerminal>> {
        lock(&self.terminals).iter().find(|t| t.id == id).cloned()
    }

    pub fn created_in(&self) -> Vec<PathBuf> {
        lock(&self.created_in).clone()
    }

    /// Emits an execution start and returns the sender feeding its stream.
    pub fn start_execution(&self, terminal_id: HostTerminalId, command: &str) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.start_tx.send(ExecutionStarted {
            terminal_id,
            command_line: Some(command.to_string()),
            stream: ExecutionStream::new(rx),
        });
        tx
    }

    pub fn end_execution(&self, terminal_id: HostTerminalId, command: &str, exit_code: Option<i32>) {
        let _ = self.end_tx.send(ExecutionEnded {
            terminal_id,
            command_line: Some(command.to_string()),
            exit_code,
        });
    }
}

impl TerminalHost for FakeHost {
    fn create_terminal(&self, cwd: &Path, _name: &str) -> Result<Arc<dyn HostTerminal>, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let terminal = Arc::new(FakeHostTerminal::new(id, true));
        lock(&self.terminals).push(terminal.clone());
        lock(&self.created_in).push(cwd.to_path_buf());
        Ok(terminal)
    }

    fn subscribe_execution_start(&self) -> broadcast::Receiver<ExecutionStarted> {
        self.start_tx.subscribe()
    }

    fn subscribe_execution_end(&self) -> broadcast::Receiver<ExecutionEnded> {
        self.end_tx.subscribe()
    }
}

/// Health probe whose answer is flipped by the test.
#[derive(Debug, Default)]
pub struct FakeHealthProbe {
    healthy: AtomicBool,
    pub checks: AtomicUsize,
}

impl FakeHealthProbe {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for FakeHealthProbe {
    async fn check(&self, _url: &str) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}
