//! Provider strategies: how a session actually gets a command running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::terminal::completion::{CompletionMarkers, PromptDetector};
use crate::terminal::host::{HostTerminal, HostTerminalId};
use crate::terminal::process::{lock, ExitCodeDetails, TerminalProcess};
use crate::terminal::session::{RunCallbacks, Session};
use crate::terminal::spawner::{ProcessSpawner, SpawnRequest, SpawnedProcess};

pub trait CommandRunner: Send + Sync {
    fn start(
        &self,
        session: &Arc<Session>,
        process: &Arc<TerminalProcess>,
        command: &str,
        callbacks: Arc<dyn RunCallbacks>,
    ) -> Result<(), AppError>;

    fn host_terminal_id(&self) -> Option<HostTerminalId> {
        None
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn dispose(&self);
}

fn track(tasks: &StdMutex<Vec<JoinHandle<()>>>, task: JoinHandle<()>) {
    let mut tasks = lock(tasks);
    tasks.retain(|t| !t.is_finished());
    tasks.push(task);
}

/// Runs commands as directly spawned child processes.
pub struct SpawnedRunner {
    spawner: Arc<dyn ProcessSpawner>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SpawnedRunner {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, cwd: PathBuf) -> Self {
        Self {
            spawner,
            cwd,
            env: HashMap::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }
}

impl CommandRunner for SpawnedRunner {
    fn start(
        &self,
        session: &Arc<Session>,
        process: &Arc<TerminalProcess>,
        command: &str,
        callbacks: Arc<dyn RunCallbacks>,
    ) -> Result<(), AppError> {
        let spawned = self.spawner.spawn(&SpawnRequest {
            command: command.to_string(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        })?;

        process.set_pid(spawned.pid);
        process.set_abort_handle(spawned.terminate.clone());
        callbacks.on_shell_execution_started(spawned.pid);

        let session = Arc::downgrade(session);
        let process = process.clone();
        let task = tokio::spawn(async move {
            let SpawnedProcess { mut lines, exit, .. } = spawned;
            while let Some(line) = lines.recv().await {
                process.append_output(&line);
                process.append_output("\n");
                callbacks.on_line(&line);
            }
            let details = exit.await.unwrap_or_default();
            match session.upgrade() {
                Some(session) => session.process_exited(&process, details),
                None => {
                    process.mark_completed(details);
                }
            }
        });
        track(&self.tasks, task);
        Ok(())
    }

    fn dispose(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Runs commands in a host-owned terminal. Completion comes from host
/// execution events when available, otherwise from injected markers or the
/// prompt heuristic.
pub struct IntegratedRunner {
    terminal: Arc<dyn HostTerminal>,
    markers: StdMutex<CompletionMarkers>,
    prompt: Arc<PromptDetector>,
    detection_timeout: Duration,
    poll_interval: Duration,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl IntegratedRunner {
    pub fn new(
        terminal: Arc<dyn HostTerminal>,
        markers: CompletionMarkers,
        prompt: Arc<PromptDetector>,
        detection_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            terminal,
            markers: StdMutex::new(markers),
            prompt,
            detection_timeout,
            poll_interval,
            watcher: StdMutex::new(None),
        }
    }

    fn set_watcher(&self, task: JoinHandle<()>) {
        if let Some(previous) = lock(&self.watcher).replace(task) {
            previous.abort();
        }
    }
}

impl CommandRunner for IntegratedRunner {
    fn start(
        &self,
        session: &Arc<Session>,
        process: &Arc<TerminalProcess>,
        command: &str,
        callbacks: Arc<dyn RunCallbacks>,
    ) -> Result<(), AppError> {
        if self.terminal.is_closed() {
            return Err(AppError::HostError(format!(
                "Host terminal {} is closed",
                self.terminal.id()
            )));
        }

        if self.terminal.supports_execution_events() {
            session.detect_compound_command(command);
            return self.terminal.send_text(command);
        }

        let baseline = self.terminal.read_output().len();
        let weak = Arc::downgrade(session);
        let marker_snapshot = {
            let mut markers = lock(&self.markers);
            if markers.config().enabled {
                let wrapped = markers.wrap_command(command);
                Some((wrapped, markers.clone()))
            } else {
                None
            }
        };

        let task = match marker_snapshot {
            Some((wrapped, markers)) => {
                self.terminal.send_text(&wrapped)?;
                callbacks.on_shell_execution_started(None);
                tokio::spawn(watch_markers(
                    self.terminal.clone(),
                    markers,
                    baseline,
                    weak,
                    process.clone(),
                    callbacks,
                    self.detection_timeout,
                    self.poll_interval,
                ))
            }
            None => {
                self.terminal.send_text(command)?;
                callbacks.on_shell_execution_started(None);
                tokio::spawn(watch_prompt(
                    self.terminal.clone(),
                    self.prompt.clone(),
                    baseline,
                    weak,
                    process.clone(),
                    callbacks,
                    self.detection_timeout,
                    self.poll_interval,
                ))
            }
        };
        self.set_watcher(task);
        Ok(())
    }

    fn host_terminal_id(&self) -> Option<HostTerminalId> {
        Some(self.terminal.id())
    }

    fn is_closed(&self) -> bool {
        self.terminal.is_closed()
    }

    fn dispose(&self) {
        if let Some(task) = lock(&self.watcher).take() {
            task.abort();
        }
        self.terminal.dispose();
    }
}

fn output_since(terminal: &dyn HostTerminal, baseline: usize) -> String {
    let output = terminal.read_output();
    match output.get(baseline..) {
        Some(fresh) => fresh.to_string(),
        // Buffer was trimmed or rewritten; fall back to all of it.
        None => output,
    }
}

fn deliver(process: &TerminalProcess, callbacks: &dyn RunCallbacks, content: &str) {
    if content.is_empty() {
        return;
    }
    process.append_output(content);
    process.append_output("\n");
    for line in content.lines() {
        callbacks.on_line(line);
    }
}

fn finish(session: &Weak<Session>, process: &Arc<TerminalProcess>, details: ExitCodeDetails) {
    match session.upgrade() {
        Some(session) => session.process_exited(process, details),
        None => {
            process.mark_completed(details);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_markers(
    terminal: Arc<dyn HostTerminal>,
    markers: CompletionMarkers,
    baseline: usize,
    session: Weak<Session>,
    process: Arc<TerminalProcess>,
    callbacks: Arc<dyn RunCallbacks>,
    timeout: Duration,
    interval: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        sleep(interval).await;
        let fresh = output_since(terminal.as_ref(), baseline);
        if let Some(extracted) = markers.extract_content_between_markers(&fresh) {
            debug!(exit_code = ?extracted.exit_code, "End marker observed");
            deliver(&process, callbacks.as_ref(), &extracted.content);
            finish(&session, &process, ExitCodeDetails::from_raw(extracted.exit_code));
            return;
        }
        if Instant::now() >= deadline {
            warn!(command = %process.command(), "No end marker before detection timeout");
            finish(&session, &process, ExitCodeDetails::default());
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_prompt(
    terminal: Arc<dyn HostTerminal>,
    prompt: Arc<PromptDetector>,
    baseline: usize,
    session: Weak<Session>,
    process: Arc<TerminalProcess>,
    callbacks: Arc<dyn RunCallbacks>,
    timeout: Duration,
    interval: Duration,
) {
    // Let the shell echo the command before looking for the next prompt.
    sleep(interval).await;
    let poll_terminal = terminal.clone();
    let seen = prompt
        .wait_for_prompt(
            move || output_since(poll_terminal.as_ref(), baseline),
            timeout,
            interval,
        )
        .await;
    if !seen {
        warn!(command = %process.command(), "No prompt before detection timeout");
    }

    let fresh = output_since(terminal.as_ref(), baseline);
    let mut lines: Vec<&str> = fresh.lines().collect();
    if seen {
        // Trailing line is the prompt itself.
        lines.pop();
    }
    deliver(&process, callbacks.as_ref(), lines.join("\n").trim());
    finish(&session, &process, ExitCodeDetails::default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::completion::CompletionMarkerConfig;
    use crate::terminal::session::{NoopCallbacks, TerminalProvider};
    use crate::test_support::{FakeHostTerminal, RecordingCallbacks};

    fn integrated_session(terminal: Arc<FakeHostTerminal>, markers_enabled: bool) -> Arc<Session> {
        let runner = IntegratedRunner::new(
            terminal,
            CompletionMarkers::new(CompletionMarkerConfig {
                enabled: markers_enabled,
                ..CompletionMarkerConfig::default()
            }),
            Arc::new(PromptDetector::default()),
            Duration::from_secs(30),
            Duration::from_millis(100),
        );
        Session::new(
            9,
            TerminalProvider::Integrated,
            PathBuf::from("/tmp"),
            Duration::from_secs(10),
            Box::new(runner),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn marker_mode_completes_with_exit_code() {
        let terminal = Arc::new(FakeHostTerminal::new(1, false));
        terminal.push_output("user@host:~$ ");
        let session = integrated_session(terminal.clone(), true);
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = session.run_command("make test", callbacks.clone()).unwrap();
        let sent = terminal.sent().pop().unwrap();
        assert!(sent.contains("make test"));

        // Simulate the shell running the wrapped line.
        let echo_only = terminal.simulate_marker_run(&sent, "ok 1\nok 2", 2);
        assert!(echo_only);

        let details = handle.wait().await;
        assert_eq!(details.exit_code, Some(2));
        assert_eq!(session.get_unretrieved_output(), "ok 1\nok 2\n");
        assert_eq!(callbacks.lines(), vec!["ok 1".to_string(), "ok 2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_mode_times_out_without_end_marker() {
        let terminal = Arc::new(FakeHostTerminal::new(1, false));
        let session = integrated_session(terminal.clone(), true);
        let handle = session.run_command("hang", Arc::new(NoopCallbacks)).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_completed());
        assert_eq!(handle.exit_details().unwrap().exit_code, None);
        assert!(!session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_mode_completes_when_prompt_returns() {
        let terminal = Arc::new(FakeHostTerminal::new(1, false));
        terminal.push_output("user@host:~$ ");
        let session = integrated_session(terminal.clone(), false);
        let handle = session.run_command("ls", Arc::new(NoopCallbacks)).unwrap();
        assert_eq!(terminal.sent(), vec!["ls".to_string()]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!handle.is_completed());
        terminal.push_output("ls\nCargo.toml\nsrc\nuser@host:~$ ");

        let details = handle.wait().await;
        assert_eq!(details.exit_code, None);
        assert_eq!(session.get_unretrieved_output(), "ls\nCargo.toml\nsrc\n");
    }

    #[tokio::test(start_paused = true)]
    async fn native_events_mode_only_sends_text() {
        let terminal = Arc::new(FakeHostTerminal::new(4, true));
        let session = integrated_session(terminal.clone(), true);
        session.run_command("a && b", Arc::new(NoopCallbacks)).unwrap();
        assert_eq!(terminal.sent(), vec!["a && b".to_string()]);
        assert!(session.is_tracking_compound());
        assert_eq!(session.host_terminal_id(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_watcher_and_terminal() {
        let terminal = Arc::new(FakeHostTerminal::new(1, false));
        let session = integrated_session(terminal.clone(), true);
        let handle = session.run_command("hang", Arc::new(NoopCallbacks)).unwrap();
        session.dispose();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_completed());
        assert!(terminal.is_closed());
    }
}
