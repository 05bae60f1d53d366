//! Lifecycle management for long-running background commands.
//!
//! A service runs in a spawned-process session and moves forward through
//! `pending → starting → ready|running → stopping → stopped|failed`. Failed
//! handles stay visible until a deferred cleanup removes them.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::services::health::HealthProbe;
use crate::terminal::process::{lock, ExitCodeDetails, ProcessHandle};
use crate::terminal::session::{RunCallbacks, Session, TerminalProvider};
use crate::terminal::spawner::ProcessSpawner;
use crate::terminal::SessionPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn is_final(self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ServiceStatus::Pending => 0,
            ServiceStatus::Starting => 1,
            ServiceStatus::Ready | ServiceStatus::Running => 2,
            ServiceStatus::Stopping => 3,
            ServiceStatus::Stopped | ServiceStatus::Failed => 4,
        }
    }

    /// Transitions only move forward, and final states never change.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        !self.is_final() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Regex tested against each output line while starting.
    pub ready_pattern: Option<String>,
    pub health_check_url: Option<String>,
    pub health_check_interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub session_id: u64,
    pub ready_pattern: Option<String>,
    pub health_check_url: Option<String>,
    pub health_check_interval_ms: u64,
    pub started_at: DateTime<Utc>,
    pub log_lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusChange {
    pub service_id: String,
    pub previous: ServiceStatus,
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
}

struct ServiceHandle {
    service_id: String,
    command: String,
    cwd: PathBuf,
    status: ServiceStatus,
    pid: Option<u32>,
    session: Arc<Session>,
    process: Option<ProcessHandle>,
    logs: VecDeque<String>,
    ready_pattern: Option<Regex>,
    health_check_url: Option<String>,
    health_check_interval: Duration,
    started_at: DateTime<Utc>,
    health_task: Option<JoinHandle<()>>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            service_id: self.service_id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            pid: self.pid,
            session_id: self.session.id(),
            ready_pattern: self.ready_pattern.as_ref().map(|r| r.as_str().to_string()),
            health_check_url: self.health_check_url.clone(),
            health_check_interval_ms: self.health_check_interval.as_millis() as u64,
            started_at: self.started_at,
            log_lines: self.logs.len(),
        }
    }

    fn cancel_health_check(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }

    fn cancel_cleanup(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
    }
}

/// Feeds a service's process events back into the supervisor.
struct ServiceCallbacks {
    supervisor: Weak<ServiceSupervisor>,
    service_id: String,
}

impl RunCallbacks for ServiceCallbacks {
    fn on_line(&self, line: &str) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.record_line(&self.service_id, line);
        }
    }

    fn on_shell_execution_complete(&self, details: &ExitCodeDetails) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.process_completed(&self.service_id, details);
        }
    }
}

pub struct ServiceSupervisor {
    pool: Arc<SessionPool>,
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn HealthProbe>,
    log_capacity: usize,
    health_check_interval: Duration,
    stop_timeout: Duration,
    stop_poll_interval: Duration,
    cleanup_delay: Duration,
    services: StdMutex<HashMap<String, ServiceHandle>>,
    status_tx: broadcast::Sender<ServiceStatusChange>,
}

impl ServiceSupervisor {
    pub fn new(
        config: &Config,
        pool: Arc<SessionPool>,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            pool,
            spawner,
            probe,
            log_capacity: config.service_log_capacity,
            health_check_interval: config.health_check_interval,
            stop_timeout: config.service_stop_timeout,
            stop_poll_interval: config.service_stop_poll_interval,
            cleanup_delay: config.failed_service_cleanup_delay,
            services: StdMutex::new(HashMap::new()),
            status_tx,
        })
    }

    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<ServiceStatusChange> {
        self.status_tx.subscribe()
    }

    fn transition(&self, handle: &mut ServiceHandle, next: ServiceStatus) -> bool {
        let previous = handle.status;
        if !previous.can_transition_to(next) {
            debug!(service_id = %handle.service_id, from = ?previous, to = ?next, "Ignoring status transition");
            return false;
        }
        handle.status = next;
        info!(service_id = %handle.service_id, from = ?previous, to = ?next, "Service status changed");
        let _ = self.status_tx.send(ServiceStatusChange {
            service_id: handle.service_id.clone(),
            previous,
            status: next,
            timestamp: Utc::now(),
        });
        true
    }

    #[instrument(skip(self, cwd, options), fields(cwd = %cwd.display()))]
    pub fn start_service(
        self: &Arc<Self>,
        command: &str,
        cwd: &Path,
        options: ServiceOptions,
    ) -> Result<ServiceInfo, AppError> {
        let ready_pattern = options.ready_pattern.as_deref().map(Regex::new).transpose()?;
        let session = self
            .pool
            .get_or_create_terminal(cwd, None, TerminalProvider::Spawned)?;
        let service_id = Uuid::new_v4().to_string();
        let health_check_interval = options
            .health_check_interval
            .unwrap_or(self.health_check_interval);

        {
            let mut services = lock(&self.services);
            let mut handle = ServiceHandle {
                service_id: service_id.clone(),
                command: command.to_string(),
                cwd: session.cwd().to_path_buf(),
                status: ServiceStatus::Pending,
                pid: None,
                session: session.session().clone(),
                process: None,
                logs: VecDeque::new(),
                ready_pattern,
                health_check_url: options.health_check_url.clone(),
                health_check_interval,
                started_at: Utc::now(),
                health_task: None,
                cleanup_task: None,
            };
            self.transition(&mut handle, ServiceStatus::Starting);
            services.insert(service_id.clone(), handle);
        }

        let callbacks = Arc::new(ServiceCallbacks {
            supervisor: Arc::downgrade(self),
            service_id: service_id.clone(),
        });
        let process = match session.run_command(command, callbacks) {
            Ok(process) => process,
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Service failed to start");
                let mut services = lock(&self.services);
                if let Some(mut handle) = services.remove(&service_id) {
                    self.transition(&mut handle, ServiceStatus::Failed);
                }
                return Err(e);
            }
        };

        let mut services = lock(&self.services);
        let handle = services
            .get_mut(&service_id)
            .ok_or_else(|| AppError::ServiceNotFound(service_id.clone()))?;
        handle.pid = process.pid();
        handle.process = Some(process);
        if handle.ready_pattern.is_none() && handle.health_check_url.is_none() {
            self.transition(handle, ServiceStatus::Running);
        }
        if let Some(url) = handle.health_check_url.clone() {
            handle.health_task = Some(self.spawn_health_check(&service_id, url, health_check_interval));
        }
        info!(service_id = %service_id, pid = ?handle.pid, "Service started");
        Ok(handle.info())
    }

    fn spawn_health_check(self: &Arc<Self>, service_id: &str, url: String, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let probe = self.probe.clone();
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            loop {
                let healthy = probe.check(&url).await;
                let Some(supervisor) = weak.upgrade() else { return };
                if supervisor.health_check_result(&service_id, healthy) {
                    return;
                }
                drop(supervisor);
                sleep(interval).await;
            }
        })
    }

    /// Applies one probe result. Returns true when polling should stop.
    fn health_check_result(&self, service_id: &str, healthy: bool) -> bool {
        let mut services = lock(&self.services);
        let Some(handle) = services.get_mut(service_id) else {
            return true;
        };
        if handle.status != ServiceStatus::Starting {
            handle.health_task = None;
            return true;
        }
        if !healthy {
            debug!(service_id = %service_id, "Health check not passing yet");
            return false;
        }
        self.transition(handle, ServiceStatus::Ready);
        // This runs on the health task itself; dropping the handle detaches it.
        handle.health_task = None;
        true
    }

    fn record_line(&self, service_id: &str, line: &str) {
        let mut services = lock(&self.services);
        let Some(handle) = services.get_mut(service_id) else {
            return;
        };
        handle.logs.push_back(line.to_string());
        while handle.logs.len() > self.log_capacity {
            handle.logs.pop_front();
        }
        let matched = handle.status == ServiceStatus::Starting
            && handle.ready_pattern.as_ref().map_or(false, |r| r.is_match(line));
        if matched {
            debug!(service_id = %service_id, line = %line, "Ready pattern matched");
            self.transition(handle, ServiceStatus::Ready);
        }
    }

    fn process_completed(self: &Arc<Self>, service_id: &str, details: &ExitCodeDetails) {
        let mut services = lock(&self.services);
        let Some(handle) = services.get_mut(service_id) else {
            return;
        };
        handle.cancel_health_check();

        let next = if handle.status == ServiceStatus::Stopping || details.success() {
            ServiceStatus::Stopped
        } else {
            ServiceStatus::Failed
        };
        if next == ServiceStatus::Failed {
            warn!(service_id = %service_id, exit_code = ?details.exit_code, signal = ?details.signal_name, "Service exited unexpectedly");
        }
        let was_stopping = handle.status == ServiceStatus::Stopping;
        if self.transition(handle, next) && !was_stopping {
            self.schedule_cleanup(handle);
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, handle: &mut ServiceHandle) {
        handle.cancel_cleanup();
        let weak = Arc::downgrade(self);
        let service_id = handle.service_id.clone();
        let delay = self.cleanup_delay;
        handle.cleanup_task = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(supervisor) = weak.upgrade() {
                let mut services = lock(&supervisor.services);
                let finished = services.get(&service_id).map_or(false, |h| h.status.is_final());
                if finished {
                    services.remove(&service_id);
                    info!(service_id = %service_id, "Removed finished service");
                }
            }
        }));
    }

    /// Stops a service, waiting a bounded time for its process to exit and
    /// falling back to a liveness probe.
    #[instrument(skip(self))]
    pub async fn stop_service(self: &Arc<Self>, service_id: &str) -> Result<ServiceInfo, AppError> {
        let (process, pid, already_final) = {
            let mut services = lock(&self.services);
            let handle = services
                .get_mut(service_id)
                .ok_or_else(|| AppError::ServiceNotFound(service_id.to_string()))?;
            handle.cancel_cleanup();
            handle.cancel_health_check();
            let already_final = handle.status.is_final();
            if !already_final {
                self.transition(handle, ServiceStatus::Stopping);
            }
            (handle.process.clone(), handle.pid, already_final)
        };

        if let Some(process) = &process {
            process.abort();
        }

        if !already_final {
            let deadline = Instant::now() + self.stop_timeout;
            loop {
                let status = lock(&self.services).get(service_id).map(|h| h.status);
                match status {
                    Some(status) if !status.is_final() => {}
                    _ => break,
                }
                if Instant::now() >= deadline {
                    warn!(service_id = %service_id, "Service did not stop before the wait expired");
                    break;
                }
                sleep(self.stop_poll_interval).await;
            }
        }

        let mut services = lock(&self.services);
        let handle = services
            .get_mut(service_id)
            .ok_or_else(|| AppError::ServiceNotFound(service_id.to_string()))?;

        let mut remove = handle.status == ServiceStatus::Stopped;
        if handle.status == ServiceStatus::Stopping || (already_final && !remove) {
            let alive = pid.map_or(false, |pid| self.spawner.is_alive(pid));
            if alive {
                warn!(service_id = %service_id, pid = ?pid, "Service process still alive; marking failed");
                self.transition(handle, ServiceStatus::Failed);
                self.schedule_cleanup(handle);
            } else {
                self.transition(handle, ServiceStatus::Stopped);
                remove = true;
            }
        }

        let info = handle.info();
        if remove {
            handle.cancel_cleanup();
            services.remove(service_id);
            info!(service_id = %service_id, "Service stopped");
        }
        Ok(info)
    }

    pub fn get_service(&self, service_id: &str) -> Option<ServiceInfo> {
        lock(&self.services).get(service_id).map(|h| h.info())
    }

    /// Every known service except those that stopped cleanly.
    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = lock(&self.services)
            .values()
            .filter(|h| h.status != ServiceStatus::Stopped)
            .map(|h| h.info())
            .collect();
        services.sort_by_key(|s| s.started_at);
        services
    }

    /// The most recent `lines` log lines (all retained lines when `None`).
    pub fn get_service_logs(&self, service_id: &str, lines: Option<usize>) -> Result<Vec<String>, AppError> {
        let services = lock(&self.services);
        let handle = services
            .get(service_id)
            .ok_or_else(|| AppError::ServiceNotFound(service_id.to_string()))?;
        let take = lines.unwrap_or(handle.logs.len()).min(handle.logs.len());
        Ok(handle.logs.iter().skip(handle.logs.len() - take).cloned().collect())
    }

    /// Cancels every timer armed by the supervisor and forgets all services.
    pub fn dispose(&self) {
        let mut services = lock(&self.services);
        for handle in services.values_mut() {
            handle.cancel_health_check();
            handle.cancel_cleanup();
        }
        services.clear();
        debug!("Service supervisor disposed");
    }
}
