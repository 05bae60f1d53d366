use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use std::sync::{Arc, Mutex as StdMutex};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::error::AppError;
use crate::terminal::process::{lock, ExitCodeDetails};

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// A spawned shell command. Lines from stdout and stderr arrive merged on
/// `lines`; the channel closes once both streams end, before `exit` resolves.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub lines: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<ExitCodeDetails>,
    /// Notified to request termination.
    pub terminate: Arc<Notify>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, AppError>;

    /// Non-destructive liveness probe (signal 0 semantics).
    fn is_alive(&self, pid: u32) -> bool;
}

/// Spawns commands through the configured shell with `tokio::process`.
#[derive(Debug)]
pub struct TokioProcessSpawner {
    default_shell: Option<String>,
    system: StdMutex<System>, // sysinfo is sync
}

impl TokioProcessSpawner {
    pub fn new(default_shell: Option<String>) -> Self {
        Self {
            default_shell,
            system: StdMutex::new(System::new()),
        }
    }

    fn build_command(&self, command: &str) -> TokioCommand {
        match self.default_shell.as_deref() {
            Some(shell_path) => {
                let mut cmd = TokioCommand::new(shell_path);
                if shell_path.contains("powershell") || shell_path.contains("pwsh") {
                    cmd.arg("-Command");
                } else if shell_path.contains("cmd.exe") {
                    cmd.arg("/C");
                } else {
                    cmd.arg("-c");
                }
                cmd.arg(command);
                cmd
            }
            None if cfg!(windows) => {
                let mut cmd = TokioCommand::new("cmd");
                cmd.arg("/C").arg(command);
                cmd
            }
            None => {
                let mut cmd = TokioCommand::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

impl ProcessSpawner for TokioProcessSpawner {
    #[instrument(skip(self, request), fields(command = %request.command, cwd = %request.cwd.display()))]
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, AppError> {
        let mut command_process = self.build_command(&request.command);
        command_process
            .current_dir(&request.cwd)
            .envs(&request.env)
            .stdin(StdProcessStdio::null())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped())
            .kill_on_drop(true);

        debug!(shell = ?self.default_shell, "Spawning command");
        let mut child = command_process.spawn().map_err(|e| {
            error!(error = %e, command = %request.command, "Failed to spawn command");
            AppError::CommandExecutionError(format!("Failed to spawn command '{}': {}", request.command, e))
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ProcessError("Failed to capture stdout from child".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::ProcessError("Failed to capture stderr from child".to_string()))?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, line_tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, line_tx));

        let terminate = Arc::new(Notify::new());
        let terminate_signal = terminate.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        let command_label = request.command.clone();

        tokio::spawn(async move {
            let status_result = tokio::select! {
                status = child.wait() => status,
                _ = terminate_signal.notified() => {
                    info!(pid = ?pid, command = %command_label, "Termination requested");
                    if let Err(e) = child.start_kill() {
                        warn!(pid = ?pid, error = %e, "Failed to send kill signal");
                    }
                    child.wait().await
                }
            };

            let _ = tokio::join!(stdout_task, stderr_task); // Wait for I/O tasks to finish

            let details = match status_result {
                Ok(status) => {
                    let details = ExitCodeDetails::from_status(status);
                    info!(pid = ?pid, command = %command_label, exit_code = ?details.exit_code, "Command finished");
                    details
                }
                Err(e) => {
                    warn!(pid = ?pid, command = %command_label, error = %e, "Failed to wait for command");
                    ExitCodeDetails::from_raw(Some(-1))
                }
            };
            let _ = exit_tx.send(details);
        });

        Ok(SpawnedProcess {
            pid,
            lines: line_rx,
            exit: exit_rx,
            terminate,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = lock(&self.system);
        system.refresh_process(Pid::from_u32(pid))
    }
}
