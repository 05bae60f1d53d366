use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Exit status of one shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitCodeDetails {
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
}

impl ExitCodeDetails {
    /// Interprets a raw shell exit code. Codes above 128 are the shell's
    /// encoding of "killed by signal (code - 128)".
    pub fn from_raw(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(code) if code > 128 && code < 128 + 65 => {
                let signal = code - 128;
                ExitCodeDetails {
                    exit_code: Some(code),
                    signal: Some(signal),
                    signal_name: signal_name(signal).map(String::from),
                }
            }
            other => ExitCodeDetails {
                exit_code: other,
                signal: None,
                signal_name: None,
            },
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitCodeDetails {
                    exit_code: Some(128 + signal),
                    signal: Some(signal),
                    signal_name: signal_name(signal).map(String::from),
                };
            }
        }
        Self::from_raw(status.code())
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(name)
}

#[derive(Debug, Default)]
struct OutputState {
    full_output: String,
    last_retrieved_index: usize,
}

/// One sub-invocation running inside a session.
///
/// Output is appended by whichever provider drives the invocation and read
/// incrementally through [`TerminalProcess::take_unretrieved_output`].
#[derive(Debug)]
pub struct TerminalProcess {
    command: String,
    pid: StdMutex<Option<u32>>,
    output: StdMutex<OutputState>,
    exit_tx: watch::Sender<Option<ExitCodeDetails>>,
    abort: StdMutex<Option<Arc<Notify>>>,
}

impl TerminalProcess {
    pub fn new(command: impl Into<String>) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            command: command.into(),
            pid: StdMutex::new(None),
            output: StdMutex::new(OutputState::default()),
            exit_tx,
            abort: StdMutex::new(None),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *lock(&self.pid) = pid;
    }

    pub(crate) fn set_abort_handle(&self, handle: Arc<Notify>) {
        *lock(&self.abort) = Some(handle);
    }

    pub fn append_output(&self, chunk: &str) {
        lock(&self.output).full_output.push_str(chunk);
    }

    pub fn has_unretrieved_output(&self) -> bool {
        let state = lock(&self.output);
        state.last_retrieved_index < state.full_output.len()
    }

    pub fn take_unretrieved_output(&self) -> String {
        let mut state = lock(&self.output);
        let start = state.last_retrieved_index;
        let unretrieved = state.full_output[start..].to_string();
        state.last_retrieved_index = state.full_output.len();
        unretrieved
    }

    pub fn full_output(&self) -> String {
        lock(&self.output).full_output.clone()
    }

    pub fn exit_details(&self) -> Option<ExitCodeDetails> {
        self.exit_tx.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }

    /// Records the exit. Later calls are ignored so waiters see one result.
    pub(crate) fn mark_completed(&self, details: ExitCodeDetails) -> bool {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(details);
            true
        })
    }

    /// Requests termination. Providers that cannot kill (a host terminal the
    /// user owns) leave no handle and this is a no-op.
    pub fn abort(&self) {
        match lock(&self.abort).as_ref() {
            Some(handle) => handle.notify_one(),
            None => debug!(command = %self.command, "No abort handle registered for process"),
        }
    }

    pub async fn wait(&self) -> ExitCodeDetails {
        let mut rx = self.exit_tx.subscribe();
        let details = match rx.wait_for(|details| details.is_some()).await {
            Ok(details) => details.clone().unwrap_or_default(),
            // Sender lives as long as self, so this is unreachable in practice.
            Err(_) => ExitCodeDetails::default(),
        };
        details
    }
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Caller-facing view of a running command.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    session_id: u64,
    process: Arc<TerminalProcess>,
}

impl ProcessHandle {
    pub(crate) fn new(session_id: u64, process: Arc<TerminalProcess>) -> Self {
        Self { session_id, process }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn abort(&self) {
        self.process.abort()
    }

    pub fn is_completed(&self) -> bool {
        self.process.is_completed()
    }

    pub fn exit_details(&self) -> Option<ExitCodeDetails> {
        self.process.exit_details()
    }

    pub async fn wait(&self) -> ExitCodeDetails {
        self.process.wait().await
    }

    pub(crate) fn process(&self) -> &Arc<TerminalProcess> {
        &self.process
    }
}
