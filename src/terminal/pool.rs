use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::terminal::completion::{CompletionMarkerConfig, CompletionMarkers, PromptDetector};
use crate::terminal::host::{ExecutionEnded, ExecutionStarted, HostTerminalId, TerminalHost};
use crate::terminal::process::{lock, ExitCodeDetails};
use crate::terminal::runner::{CommandRunner, IntegratedRunner, SpawnedRunner};
use crate::terminal::session::{Session, SessionInfo, SessionLease, TerminalProvider};
use crate::terminal::spawner::ProcessSpawner;
use crate::utils::path_utils::normalize_cwd;

const STREAM_FLUSH_BOUND: Duration = Duration::from_millis(250);

/// Registry of live sessions and the bridge from host execution events to
/// them. Must be constructed inside a tokio runtime when a host is given.
pub struct SessionPool {
    config: Arc<Config>,
    host: Option<Arc<dyn TerminalHost>>,
    spawner: Arc<dyn ProcessSpawner>,
    prompt: Arc<PromptDetector>,
    next_id: AtomicU64,
    sessions: StdMutex<Vec<Arc<Session>>>,
    subscriptions: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionPool {
    pub fn new(
        config: Arc<Config>,
        host: Option<Arc<dyn TerminalHost>>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Arc<Self> {
        let prompt = Arc::new(PromptDetector::from_pattern_strings(&config.custom_prompt_patterns));
        let pool = Arc::new(Self {
            config,
            host,
            spawner,
            prompt,
            next_id: AtomicU64::new(0),
            sessions: StdMutex::new(Vec::new()),
            subscriptions: StdMutex::new(Vec::new()),
        });
        pool.register_host_handlers();
        pool
    }

    /// Returns an idle session for `cwd`, preferring in order: one already
    /// affiliated with `task_id`; for task-scoped requests, an unaffiliated
    /// one; for unscoped requests, any idle one. Otherwise a new session is
    /// created. The result is affiliated with `task_id` (or with nothing) and
    /// leased to the caller, so concurrent requests never receive the same
    /// session.
    #[instrument(skip(self, cwd), fields(cwd = %cwd.display()))]
    pub fn get_or_create_terminal(
        &self,
        cwd: &Path,
        task_id: Option<&str>,
        provider: TerminalProvider,
    ) -> Result<SessionLease, AppError> {
        let cwd = normalize_cwd(cwd);
        let mut sessions = lock(&self.sessions);

        sessions.retain(|s| {
            let closed = s.is_closed();
            if closed {
                debug!(session_id = s.id(), "Pruning closed session");
                s.dispose();
            }
            !closed
        });

        let eligible = |s: &Arc<Session>| !s.is_busy() && s.provider() == provider && s.cwd() == cwd;

        let mut selected = sessions
            .iter()
            .filter(|s| eligible(*s) && s.task_id().as_deref() == task_id)
            .find_map(|s| s.try_reserve());

        if selected.is_none() {
            selected = if task_id.is_some() {
                // Never take a session that belongs to another task.
                sessions
                    .iter()
                    .filter(|s| eligible(*s) && s.task_id().is_none())
                    .find_map(|s| s.try_reserve())
            } else {
                sessions.iter().filter(|s| eligible(*s)).find_map(|s| s.try_reserve())
            };
        }

        let lease = match selected {
            Some(lease) => {
                debug!(session_id = lease.id(), "Reusing session");
                lease
            }
            None => {
                let session = self.create_session(&cwd, provider)?;
                info!(session_id = session.id(), provider = ?provider, "Created session");
                sessions.push(session.clone());
                session.try_reserve().ok_or(AppError::SessionBusy(session.id()))?
            }
        };

        lease.set_task_id(task_id.map(String::from));
        Ok(lease)
    }

    fn create_session(&self, cwd: &Path, provider: TerminalProvider) -> Result<Arc<Session>, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let runner: Box<dyn CommandRunner> = match provider {
            TerminalProvider::Spawned => Box::new(SpawnedRunner::new(self.spawner.clone(), cwd.to_path_buf())),
            TerminalProvider::Integrated => {
                let host = self.host.as_ref().ok_or_else(|| {
                    AppError::ProviderUnavailable("no host terminal API is attached".to_string())
                })?;
                let terminal = host.create_terminal(cwd, &format!("agent-shell ({})", id))?;
                Box::new(IntegratedRunner::new(
                    terminal,
                    CompletionMarkers::new(CompletionMarkerConfig {
                        enabled: self.config.completion_markers_enabled,
                        use_nonce: self.config.completion_markers_use_nonce,
                        ..CompletionMarkerConfig::default()
                    }),
                    self.prompt.clone(),
                    self.config.completion_detection_timeout,
                    self.config.completion_poll_interval,
                ))
            }
        };
        Ok(Session::new(
            id,
            provider,
            cwd.to_path_buf(),
            self.config.compound_wait,
            runner,
        ))
    }

    /// Frees every session affiliated with `task_id`. Running processes are
    /// left alone; only the session's reference to them is dropped.
    #[instrument(skip(self))]
    pub fn release_terminals_for_task(&self, task_id: &str) -> usize {
        let sessions = lock(&self.sessions);
        let mut released = 0;
        for session in sessions.iter() {
            if session.task_id().as_deref() == Some(task_id) {
                session.release();
                released += 1;
            }
        }
        debug!(released, "Released task sessions");
        released
    }

    pub fn get_session(&self, id: u64) -> Option<Arc<Session>> {
        lock(&self.sessions).iter().find(|s| s.id() == id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        lock(&self.sessions).iter().map(|s| s.info()).collect()
    }

    fn find_by_host_terminal(&self, terminal_id: HostTerminalId) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .iter()
            .find(|s| s.host_terminal_id() == Some(terminal_id))
            .cloned()
    }

    fn register_host_handlers(self: &Arc<Self>) {
        let Some(host) = self.host.clone() else {
            return;
        };

        let mut start_rx = host.subscribe_execution_start();
        let weak = Arc::downgrade(self);
        let start_listener = tokio::spawn(async move {
            loop {
                match start_rx.recv().await {
                    Ok(event) => {
                        let Some(pool) = weak.upgrade() else { break };
                        // One task per event.
                        tokio::spawn(async move {
                            if let Err(e) = pool.handle_execution_start(event) {
                                error!(error = %e, "Execution start handler failed");
                            }
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped execution start events")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut end_rx = host.subscribe_execution_end();
        let weak = Arc::downgrade(self);
        let end_listener = tokio::spawn(async move {
            loop {
                match end_rx.recv().await {
                    Ok(event) => {
                        let Some(pool) = weak.upgrade() else { break };
                        tokio::spawn(async move {
                            if let Err(e) = pool.handle_execution_end(event).await {
                                error!(error = %e, "Execution end handler failed");
                            }
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped execution end events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.push(start_listener);
        subscriptions.push(end_listener);
    }

    fn handle_execution_start(&self, event: ExecutionStarted) -> Result<(), AppError> {
        let Some(session) = self.find_by_host_terminal(event.terminal_id) else {
            debug!(terminal_id = event.terminal_id, "Execution started in a terminal we do not own");
            return Ok(());
        };
        if session.is_closed() {
            return Err(AppError::HostError(format!(
                "Execution started in closed session {}",
                session.id()
            )));
        }
        session.set_active_stream(event.stream);
        Ok(())
    }

    async fn handle_execution_end(&self, event: ExecutionEnded) -> Result<(), AppError> {
        let Some(session) = self.find_by_host_terminal(event.terminal_id) else {
            debug!(terminal_id = event.terminal_id, "Execution ended in a terminal we do not own");
            return Ok(());
        };
        if session.is_closed() {
            return Err(AppError::HostError(format!(
                "Execution ended in closed session {}",
                session.id()
            )));
        }

        session.flush_streams(STREAM_FLUSH_BOUND).await;
        let details = ExitCodeDetails::from_raw(event.exit_code);
        if session.is_tracking_compound() {
            let command = event.command_line.unwrap_or_default();
            session.add_compound_process_completion(details, &command);
        } else {
            session.shell_execution_complete(details);
        }
        Ok(())
    }

    /// Drops host subscriptions and disposes every session.
    pub fn cleanup(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.abort();
        }
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain(..).collect();
        for session in sessions {
            session.dispose();
        }
        info!("Session pool cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::host::HostTerminal;
    use crate::terminal::session::NoopCallbacks;
    use crate::test_support::{FakeHost, FakeSpawner};
    use std::path::PathBuf;

    fn pool_with_host() -> (Arc<SessionPool>, Arc<FakeHost>, PathBuf) {
        let host = Arc::new(FakeHost::default());
        let pool = SessionPool::new(
            Arc::new(Config::default()),
            Some(host.clone()),
            Arc::new(FakeSpawner::default()),
        );
        (pool, host, std::env::temp_dir())
    }

    fn spawned_pool() -> (Arc<SessionPool>, Arc<FakeSpawner>, PathBuf) {
        let spawner = Arc::new(FakeSpawner::default());
        let pool = SessionPool::new(Arc::new(Config::default()), None, spawner.clone());
        (pool, spawner, std::env::temp_dir())
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let (pool, _spawner, cwd) = spawned_pool();
        let a = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        let b = pool.get_or_create_terminal(&cwd, Some("t2"), TerminalProvider::Spawned).unwrap().into_session();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }

    #[tokio::test]
    async fn different_tasks_never_share_a_session() {
        let (pool, _spawner, cwd) = spawned_pool();
        let first = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        // Idle but affiliated with t1.
        let second = pool.get_or_create_terminal(&cwd, Some("t2"), TerminalProvider::Spawned).unwrap().into_session();
        assert!(!Arc::ptr_eq(&first, &second));

        // Busy with t1's work.
        first.run_command("sleep 5", Arc::new(NoopCallbacks)).unwrap();
        let third = pool.get_or_create_terminal(&cwd, Some("t2"), TerminalProvider::Spawned).unwrap().into_session();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn same_task_reuses_its_idle_session() {
        let (pool, _spawner, cwd) = spawned_pool();
        let first = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        let again = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn task_request_adopts_unaffiliated_session() {
        let (pool, _spawner, cwd) = spawned_pool();
        let free = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap().into_session();
        assert_eq!(free.task_id(), None);
        let adopted = pool.get_or_create_terminal(&cwd, Some("t9"), TerminalProvider::Spawned).unwrap().into_session();
        assert!(Arc::ptr_eq(&free, &adopted));
        assert_eq!(adopted.task_id().as_deref(), Some("t9"));
    }

    #[tokio::test]
    async fn unscoped_request_takes_any_idle_session_and_clears_affiliation() {
        let (pool, _spawner, cwd) = spawned_pool();
        let owned = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        let any = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap().into_session();
        assert!(Arc::ptr_eq(&owned, &any));
        assert_eq!(any.task_id(), None);
    }

    #[tokio::test]
    async fn release_makes_session_available_to_unscoped_requests() {
        let (pool, _spawner, cwd) = spawned_pool();
        let session = pool.get_or_create_terminal(&cwd, Some("t1"), TerminalProvider::Spawned).unwrap().into_session();
        session.run_command("npm test", Arc::new(NoopCallbacks)).unwrap();
        assert!(session.is_busy());

        assert_eq!(pool.release_terminals_for_task("t1"), 1);
        assert!(!session.is_busy());
        assert_eq!(session.task_id(), None);

        let reused = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap().into_session();
        assert!(Arc::ptr_eq(&session, &reused));
    }

    #[tokio::test]
    async fn cwd_and_provider_must_match() {
        let (pool, _host, cwd) = pool_with_host();
        let spawned = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap().into_session();
        let integrated = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        assert!(!Arc::ptr_eq(&spawned, &integrated));

        let other_dir = tempfile::tempdir().unwrap();
        let elsewhere = pool
            .get_or_create_terminal(other_dir.path(), None, TerminalProvider::Spawned)
            .unwrap()
            .into_session();
        assert!(!Arc::ptr_eq(&spawned, &elsewhere));
    }

    #[tokio::test]
    async fn integrated_provider_requires_host() {
        let (pool, _spawner, cwd) = spawned_pool();
        let err = pool
            .get_or_create_terminal(&cwd, None, TerminalProvider::Integrated)
            .unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn closed_sessions_are_pruned() {
        let (pool, host, cwd) = pool_with_host();
        let first = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        host.terminal(first.host_terminal_id().unwrap()).unwrap().close();
        let second = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn host_events_drive_session_completion() {
        let (pool, host, cwd) = pool_with_host();
        let session = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        let terminal_id = session.host_terminal_id().unwrap();
        let handle = session.run_command("cargo build", Arc::new(NoopCallbacks)).unwrap();

        let output = host.start_execution(terminal_id, "cargo build");
        output.send("Compiling\n".to_string()).unwrap();
        output.send("Finished\n".to_string()).unwrap();
        drop(output);
        host.end_execution(terminal_id, "cargo build", Some(0));

        let details = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(details.exit_code, Some(0));
        assert!(!session.is_busy());
        assert_eq!(session.get_unretrieved_output(), "Compiling\nFinished\n");
    }

    #[tokio::test]
    async fn host_events_for_compound_commands_finalize_once() {
        let (pool, host, cwd) = pool_with_host();
        let session = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        let terminal_id = session.host_terminal_id().unwrap();
        let handle = session.run_command("make && make test", Arc::new(NoopCallbacks)).unwrap();
        assert_eq!(session.expected_compound_count(), 2);

        drop(host.start_execution(terminal_id, "make"));
        host.end_execution(terminal_id, "make", Some(0));
        // Let the first stage's handlers settle so stages are recorded in order.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_busy());
        drop(host.start_execution(terminal_id, "make test"));
        host.end_execution(terminal_id, "make test", Some(2));

        let details = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(details.exit_code, Some(2));
        assert!(!session.is_tracking_compound());
    }

    #[tokio::test]
    async fn events_from_foreign_terminals_are_ignored() {
        let (pool, host, cwd) = pool_with_host();
        let session = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        session.run_command("ls", Arc::new(NoopCallbacks)).unwrap();
        drop(host.start_execution(999, "vim"));
        host.end_execution(999, "vim", Some(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_busy());
    }

    #[tokio::test]
    async fn cleanup_disposes_sessions_and_subscriptions() {
        let (pool, host, cwd) = pool_with_host();
        let session = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Integrated).unwrap().into_session();
        let terminal_id = session.host_terminal_id().unwrap();
        pool.cleanup();
        assert!(pool.list_sessions().is_empty());
        assert!(session.is_closed());
        assert!(host.terminal(terminal_id).unwrap().is_closed());
    }

    #[tokio::test]
    async fn leased_session_is_not_handed_out_twice() {
        let (pool, _spawner, cwd) = spawned_pool();
        let first = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap();
        let second = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap();
        assert_ne!(first.id(), second.id());
        assert!(first.is_busy());

        let first_id = first.id();
        drop(first);
        let again = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap();
        assert_eq!(again.id(), first_id);

        // Running through the lease consumes the claim; the session stays busy.
        again.run_command("sleep 5", Arc::new(NoopCallbacks)).unwrap();
        drop(again);
        let third = pool.get_or_create_terminal(&cwd, None, TerminalProvider::Spawned).unwrap();
        assert_ne!(third.id(), first_id);
        assert_eq!(pool.list_sessions().len(), 3);
    }
}
