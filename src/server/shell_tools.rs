use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::context::ShellContext;
use crate::error::AppError;
use crate::services::{ServiceInfo, ServiceOptions};
use crate::terminal::command_parser::{self, ParsedCommand};
use crate::terminal::output::compress_output;
use crate::terminal::session::NoopCallbacks;
use crate::terminal::{SessionInfo, TerminalProvider};
use crate::utils::path_utils::resolve_cwd;

#[derive(Debug, Deserialize)]
pub struct ParseCommandParams {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct ParseCommandResult {
    #[serde(flatten)]
    pub parsed: ParsedCommand,
    pub has_background_operator: bool,
    pub estimated_process_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct RunCommandParams {
    pub command: String,
    pub cwd: Option<String>,
    pub task_id: Option<String>,
    pub provider: Option<TerminalProvider>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunCommandResult {
    pub session_id: u64,
    pub pid: Option<u32>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal_name: Option<String>,
    pub timed_out: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReadOutputParams {
    pub session_id: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadOutputResult {
    pub session_id: u64,
    pub output: String,
    pub busy: bool,
    pub running: bool,
    pub last_command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseTaskParams {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseTaskResult {
    pub task_id: String,
    pub released: usize,
}

#[derive(Debug, Deserialize)]
pub struct StartServiceParams {
    pub command: String,
    pub cwd: Option<String>,
    pub ready_pattern: Option<String>,
    pub health_check_url: Option<String>,
    pub health_check_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceIdParams {
    pub service_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ServiceLogsParams {
    pub service_id: String,
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ServiceLogsResult {
    pub service_id: String,
    pub lines: Vec<String>,
}

/// Tool operations over the shared context.
pub struct ShellTools {
    ctx: Arc<ShellContext>,
}

impl ShellTools {
    pub fn new(ctx: Arc<ShellContext>) -> Self {
        Self { ctx }
    }

    fn compress(&self, raw: &str) -> String {
        let config = self.ctx.config();
        compress_output(
            raw,
            config.output_line_limit,
            Some(config.output_character_limit),
            config.compress_progress_bar,
        )
    }

    pub async fn parse_command(&self, params: &ParseCommandParams) -> Result<ParseCommandResult, AppError> {
        Ok(ParseCommandResult {
            parsed: command_parser::parse(&params.command),
            has_background_operator: command_parser::has_background_operator(&params.command),
            estimated_process_count: command_parser::estimate_process_count(&params.command),
        })
    }

    /// Runs a command in a pooled session and waits up to the timeout. A
    /// command still running after the timeout keeps its session busy; its
    /// output is available through `read_output`.
    #[instrument(skip(self, params), fields(command = %params.command))]
    pub async fn run_command(&self, params: &RunCommandParams) -> Result<RunCommandResult, AppError> {
        if params.command.trim().is_empty() {
            return Err(AppError::InvalidInputArgument("command must not be empty".to_string()));
        }
        let config = self.ctx.config();
        let cwd = resolve_cwd(params.cwd.as_deref(), &config.default_cwd)?;
        let provider = params.provider.unwrap_or(if self.ctx.has_host() {
            TerminalProvider::Integrated
        } else {
            TerminalProvider::Spawned
        });

        let session = self
            .ctx
            .pool()
            .get_or_create_terminal(&cwd, params.task_id.as_deref(), provider)?;
        let handle = session.run_command(&params.command, Arc::new(NoopCallbacks))?;
        let session = session.into_session();
        self.ctx
            .audit_logger()
            .log_command(session.id(), &cwd, &params.command)
            .await;
        let wait = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(config.command_timeout);
        let details = timeout(wait, handle.wait()).await.ok();
        if details.is_none() {
            info!(session_id = session.id(), "Command still running after timeout");
        }

        let output = self.compress(&session.get_unretrieved_output());
        Ok(RunCommandResult {
            session_id: session.id(),
            pid: handle.pid(),
            output,
            exit_code: details.as_ref().and_then(|d| d.exit_code),
            signal_name: details.as_ref().and_then(|d| d.signal_name.clone()),
            timed_out: details.is_none(),
        })
    }

    pub async fn read_output(&self, params: &ReadOutputParams) -> Result<ReadOutputResult, AppError> {
        let session = self
            .ctx
            .pool()
            .get_session(params.session_id)
            .ok_or_else(|| AppError::SessionNotFound(params.session_id.to_string()))?;
        let output = self.compress(&session.get_unretrieved_output());
        debug!(session_id = params.session_id, bytes = output.len(), "Read session output");
        Ok(ReadOutputResult {
            session_id: params.session_id,
            output,
            busy: session.is_busy(),
            running: session.is_running(),
            last_command: session.last_command(),
        })
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, AppError> {
        Ok(self.ctx.pool().list_sessions())
    }

    pub async fn release_task(&self, params: &ReleaseTaskParams) -> Result<ReleaseTaskResult, AppError> {
        let released = self.ctx.pool().release_terminals_for_task(&params.task_id);
        Ok(ReleaseTaskResult {
            task_id: params.task_id.clone(),
            released,
        })
    }

    pub async fn start_service(&self, params: &StartServiceParams) -> Result<ServiceInfo, AppError> {
        let cwd = resolve_cwd(params.cwd.as_deref(), &self.ctx.config().default_cwd)?;
        self.ctx.supervisor().start_service(
            &params.command,
            &cwd,
            ServiceOptions {
                ready_pattern: params.ready_pattern.clone(),
                health_check_url: params.health_check_url.clone(),
                health_check_interval: params.health_check_interval_ms.map(Duration::from_millis),
            },
        )
    }

    pub async fn stop_service(&self, params: &ServiceIdParams) -> Result<ServiceInfo, AppError> {
        self.ctx.supervisor().stop_service(&params.service_id).await
    }

    pub async fn get_service(&self, params: &ServiceIdParams) -> Result<ServiceInfo, AppError> {
        self.ctx
            .supervisor()
            .get_service(&params.service_id)
            .ok_or_else(|| AppError::ServiceNotFound(params.service_id.clone()))
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>, AppError> {
        Ok(self.ctx.supervisor().list_services())
    }

    pub async fn get_service_logs(&self, params: &ServiceLogsParams) -> Result<ServiceLogsResult, AppError> {
        let lines = self
            .ctx
            .supervisor()
            .get_service_logs(&params.service_id, params.lines)?;
        Ok(ServiceLogsResult {
            service_id: params.service_id.clone(),
            lines,
        })
    }
}
