use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::AppError;
use crate::services::{HealthProbe, HttpHealthProbe, ServiceSupervisor};
use crate::terminal::host::TerminalHost;
use crate::terminal::spawner::{ProcessSpawner, TokioProcessSpawner};
use crate::terminal::SessionPool;
use crate::utils::audit_logger::AuditLogger;

/// Owns the session pool and the service supervisor for the lifetime of the
/// process. Build one in `main`, pass it by reference, dispose it on exit.
pub struct ShellContext {
    config: Arc<Config>,
    pool: Arc<SessionPool>,
    supervisor: Arc<ServiceSupervisor>,
    audit_logger: AuditLogger,
    has_host: bool,
}

impl ShellContext {
    /// Production wiring: `tokio::process` spawner and an HTTP health probe.
    pub fn new(config: Config, host: Option<Arc<dyn TerminalHost>>) -> Result<Self, AppError> {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(TokioProcessSpawner::new(config.default_shell.clone()));
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new()?);
        Ok(Self::with_parts(config, host, spawner, probe))
    }

    pub fn with_parts(
        config: Config,
        host: Option<Arc<dyn TerminalHost>>,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let config = Arc::new(config);
        let has_host = host.is_some();
        let pool = SessionPool::new(config.clone(), host, spawner.clone());
        let supervisor = ServiceSupervisor::new(&config, pool.clone(), spawner, probe);
        let audit_logger = AuditLogger::new(&config);
        info!(has_host, cwd = %config.default_cwd.display(), "Shell context ready");
        Self {
            config,
            pool,
            supervisor,
            audit_logger,
            has_host,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit_logger
    }

    pub fn has_host(&self) -> bool {
        self.has_host
    }

    /// Cancels supervisor timers, then disposes every session.
    pub fn dispose(&self) {
        self.supervisor.dispose();
        self.pool.cleanup();
        info!("Shell context disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceOptions;
    use crate::terminal::TerminalProvider;
    use crate::test_support::{FakeHealthProbe, FakeSpawner};

    #[tokio::test]
    async fn dispose_tears_down_sessions_and_services() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.audit_log_file = dir.path().join("commands.log");
        let ctx = ShellContext::with_parts(
            config,
            None,
            Arc::new(FakeSpawner::default()),
            Arc::new(FakeHealthProbe::default()),
        );
        assert!(!ctx.has_host());

        let session = ctx
            .pool()
            .get_or_create_terminal(dir.path(), Some("t1"), TerminalProvider::Spawned)
            .unwrap();
        ctx.supervisor()
            .start_service("serve", dir.path(), ServiceOptions::default())
            .unwrap();

        ctx.dispose();
        assert!(session.is_closed());
        assert!(ctx.pool().list_sessions().is_empty());
        assert!(ctx.supervisor().list_services().is_empty());
    }
}
