use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_COMMAND_CHARS: usize = 4096;

/// Append-only record of every command submitted through the dispatcher.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        let metadata = match fs::metadata(&self.log_file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let backup_file_name = match self.log_file_path.extension() {
                Some(extension) => format!("{}_{}.{}", file_stem, timestamp, extension.to_string_lossy()),
                None => format!("{}_{}", file_stem, timestamp),
            };
            let backup_path = self.log_file_path.with_file_name(backup_file_name);
            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Records one command. Write failures are logged, never returned.
    pub async fn log_command(&self, session_id: u64, cwd: &Path, command: &str) {
        if let Err(e) = self.try_log_command(session_id, cwd, command).await {
            error!(session_id, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_command(&self, session_id: u64, cwd: &Path, command: &str) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        // One entry per line.
        let mut flattened = command.replace('\n', "\\n");
        if flattened.chars().count() > MAX_LOGGED_COMMAND_CHARS {
            flattened = flattened.chars().take(MAX_LOGGED_COMMAND_CHARS).collect();
            flattened.push_str("<truncated>");
        }
        let log_entry = format!(
            "{} | session {:<4} | {} | {}\n",
            timestamp,
            session_id,
            cwd.display(),
            flattened
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(log_entry.as_bytes()).await?;
        // The write completes on a blocking thread; wait for it before the
        // next size check can rename the file.
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger_in(dir: &Path, max_size_bytes: u64) -> AuditLogger {
        let mut config = Config::default();
        config.audit_log_file = dir.join("logs").join("commands.log");
        config.audit_log_max_size_bytes = max_size_bytes;
        AuditLogger::new(&config)
    }

    #[tokio::test]
    async fn appends_one_line_per_command() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(dir.path(), 1024 * 1024);
        logger.log_command(1, Path::new("/srv/app"), "cargo build").await;
        logger.log_command(2, Path::new("/srv/app"), "echo a\necho b").await;

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("| /srv/app | cargo build"));
        assert!(lines[0].contains("session 1"));
        assert!(lines[1].ends_with("echo a\\necho b"));
    }

    #[tokio::test]
    async fn rotates_when_size_limit_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(dir.path(), 10);
        logger.log_command(1, Path::new("/tmp"), "first command").await;
        logger.log_command(1, Path::new("/tmp"), "second command").await;

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("second command"));
        assert!(!contents.contains("first command"));

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("commands_"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn entry_is_on_disk_when_log_command_returns() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(dir.path(), 10);
        for i in 0..20 {
            let command = format!("command number {}", i);
            logger.log_command(1, Path::new("/tmp"), &command).await;
            let contents = std::fs::read_to_string(logger.path()).unwrap();
            assert!(contents.ends_with(&format!("{}\n", command)), "entry {} missing", i);
        }
    }

    #[tokio::test]
    async fn unwritable_location_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let mut config = Config::default();
        config.audit_log_file = blocker.join("commands.log");
        let logger = AuditLogger::new(&config);
        logger.log_command(1, Path::new("/tmp"), "ls").await;
        assert!(!logger.path().exists());
    }
}
