//! Boundary to the editor/IDE that owns visible terminals.
//!
//! The host is an external collaborator. It creates terminals, accepts text,
//! exposes the terminal's buffer and, when it has shell integration, reports
//! execution start/end events.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc};

use crate::error::AppError;
use crate::terminal::process::lock;

pub type HostTerminalId = u64;

pub trait HostTerminal: Send + Sync {
    fn id(&self) -> HostTerminalId;

    /// Sends `text` followed by a newline.
    fn send_text(&self, text: &str) -> Result<(), AppError>;

    /// Whether the host reports execution start/end for this terminal.
    fn supports_execution_events(&self) -> bool;

    /// Snapshot of everything the terminal has printed so far.
    fn read_output(&self) -> String;

    fn is_closed(&self) -> bool;

    fn dispose(&self);
}

pub trait TerminalHost: Send + Sync {
    fn create_terminal(&self, cwd: &Path, name: &str) -> Result<Arc<dyn HostTerminal>, AppError>;

    fn subscribe_execution_start(&self) -> broadcast::Receiver<ExecutionStarted>;

    fn subscribe_execution_end(&self) -> broadcast::Receiver<ExecutionEnded>;
}

/// Output of one execution, handed out once to whoever attaches first.
#[derive(Debug, Clone)]
pub struct ExecutionStream {
    inner: Arc<StdMutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

impl ExecutionStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Some(receiver))),
        }
    }

    pub fn take(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.inner).take()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionStarted {
    pub terminal_id: HostTerminalId,
    pub command_line: Option<String>,
    pub stream: ExecutionStream,
}

#[derive(Debug, Clone)]
pub struct ExecutionEnded {
    pub terminal_id: HostTerminalId,
    pub command_line: Option<String>,
    pub exit_code: Option<i32>,
}
