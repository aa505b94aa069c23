//! nginx reconciliation
//!
//! nginx on the same host usually listens on `[::]:80`, which collides with
//! the proxy's own bind. Before serving, every matching `listen` directive in
//! the nginx config directory is commented out, nginx is restarted, and
//! startup blocks until systemd reports the unit active again.

use crate::error::ReconcileError;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Prefix that marks a line as disabled.
pub const COMMENT_MARKER: &str = "#";

/// Suffix appended to every line this tool disables.
pub const ATTRIBUTION: &str = " # by cjdproxy";

/// Reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Directory scanned for config files.
    pub conf_dir: PathBuf,
    /// File name suffix of config files.
    pub suffix: String,
    /// Exact directive text that conflicts with the proxy.
    pub directive: String,
    /// Service name handed to the service manager.
    pub service: String,
    /// Delay between status checks.
    pub poll_interval: Duration,
    /// Upper bound on the wait. `None` waits until the service is active.
    pub timeout: Option<Duration>,
}

impl ReconcileConfig {
    /// Settings for an nginx that conflicts on `[::]:<port>`.
    pub fn for_port(port: u16) -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            suffix: ".conf".to_string(),
            directive: format!("listen [::]:{}", port),
            service: "nginx".to_string(),
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Process-manager seam used to restart and query the external service.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Restart the service.
    async fn restart(&self, service: &str) -> Result<(), ReconcileError>;

    /// Current status string (e.g. `active`, `activating`).
    async fn status(&self, service: &str) -> Result<String, ReconcileError>;
}

/// `systemctl` backed service manager.
#[derive(Debug, Default, Clone)]
pub struct Systemctl;

#[async_trait]
impl ServiceManager for Systemctl {
    async fn restart(&self, service: &str) -> Result<(), ReconcileError> {
        let command = format!("systemctl restart {}", service);
        let status = Command::new("systemctl")
            .args(["restart", service])
            .status()
            .await
            .map_err(|source| ReconcileError::Command {
                command: command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ReconcileError::CommandStatus {
                command,
                status: status.to_string(),
            });
        }
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<String, ReconcileError> {
        // is-active exits non-zero while the unit is not active; stdout is still the state.
        let output = Command::new("systemctl")
            .args(["is-active", service])
            .output()
            .await
            .map_err(|source| ReconcileError::Command {
                command: format!("systemctl is-active {}", service),
                source,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Comment out every line containing `directive` that is not already disabled.
///
/// Returns the new contents and how many lines changed.
pub fn disable_directive(contents: &str, directive: &str) -> (String, usize) {
    let mut changed = 0;
    let mut out = String::with_capacity(contents.len());

    for line in contents.lines() {
        if !line.starts_with(COMMENT_MARKER) && line.contains(directive) {
            out.push_str(COMMENT_MARKER);
            out.push_str(line);
            out.push_str(ATTRIBUTION);
            changed += 1;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    (out, changed)
}

/// Rewrite one file in place. Untouched files are not written.
pub fn comment_out_file(path: &Path, directive: &str) -> Result<usize, ReconcileError> {
    let io_err = |source| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    };

    let contents = fs::read_to_string(path).map_err(io_err)?;
    let (rewritten, changed) = disable_directive(&contents, directive);
    if changed > 0 {
        fs::write(path, rewritten).map_err(io_err)?;
        info!("Disabled {} `{}` line(s) in {}", changed, directive, path.display());
    }
    Ok(changed)
}

/// Regular files in `dir` whose name ends with `suffix`, sorted.
pub fn find_config_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, ReconcileError> {
    let io_err = |source| ReconcileError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let is_file = entry.file_type().map_err(io_err)?.is_file();
        if is_file && entry.file_name().to_string_lossy().ends_with(suffix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Frees the listening address held by the external web server.
pub struct Reconciler<M> {
    config: ReconcileConfig,
    manager: M,
}

impl<M: ServiceManager> Reconciler<M> {
    pub fn new(config: ReconcileConfig, manager: M) -> Self {
        Self { config, manager }
    }

    /// Disable conflicting directives in every config file.
    pub fn disable_conflicts(&self) -> Result<usize, ReconcileError> {
        let files = find_config_files(&self.config.conf_dir, &self.config.suffix)?;
        debug!("Scanning {} config file(s) in {}", files.len(), self.config.conf_dir.display());

        let mut total = 0;
        for file in &files {
            total += comment_out_file(file, &self.config.directive)?;
        }
        Ok(total)
    }

    /// Disable conflicts, restart the service and wait for it to come back.
    pub async fn run(&self) -> Result<(), ReconcileError> {
        info!("Modifying {} configuration", self.config.service);
        self.disable_conflicts()?;

        info!("Restarting {}...", self.config.service);
        self.manager.restart(&self.config.service).await?;
        self.wait_until_active().await?;

        info!("{} restarted", self.config.service);
        Ok(())
    }

    /// Poll the service status until it reports `active`.
    pub async fn wait_until_active(&self) -> Result<(), ReconcileError> {
        let started = Instant::now();

        loop {
            let status = self.manager.status(&self.config.service).await?;
            if status == "active" {
                return Ok(());
            }
            debug!("{} is {:?}, waiting", self.config.service, status);

            if let Some(limit) = self.config.timeout {
                if started.elapsed() >= limit {
                    return Err(ReconcileError::Timeout {
                        service: self.config.service.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    const DIRECTIVE: &str = "listen [::]:80";

    /// Reports `activating` for the first `pending` polls, then `active`.
    #[derive(Default)]
    struct FakeManager {
        pending: usize,
        restarts: Arc<AtomicUsize>,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceManager for FakeManager {
        async fn restart(&self, _service: &str) -> Result<(), ReconcileError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self, _service: &str) -> Result<String, ReconcileError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < self.pending { "activating" } else { "active" }.to_string())
        }
    }

    fn test_config(dir: &Path) -> ReconcileConfig {
        ReconcileConfig {
            conf_dir: dir.to_path_buf(),
            poll_interval: Duration::from_millis(5),
            ..ReconcileConfig::for_port(80)
        }
    }

    const SITE: &str = "server {\n    listen 80;\n    listen [::]:80 default_server;\n    server_name _;\n}\n";

    #[test]
    fn test_disable_directive() {
        let (out, changed) = disable_directive(SITE, DIRECTIVE);
        assert_eq!(changed, 1);
        assert!(out.contains("#    listen [::]:80 default_server; # by cjdproxy\n"));
        assert!(out.contains("\n    listen 80;\n"));
    }

    #[test]
    fn test_disable_directive_is_idempotent() {
        let (first, _) = disable_directive(SITE, DIRECTIVE);
        let (second, changed) = disable_directive(&first, DIRECTIVE);
        assert_eq!(changed, 0);
        assert_eq!(first, second);
        assert_eq!(second.matches("# by cjdproxy").count(), 1);
    }

    #[test]
    fn test_already_commented_lines_untouched() {
        let input = "#listen [::]:80;\n";
        let (out, changed) = disable_directive(input, DIRECTIVE);
        assert_eq!(changed, 0);
        assert_eq!(out, input);
    }

    #[test]
    fn test_other_ports_untouched() {
        let input = "listen [::]:443 ssl;\nlisten [::]:8080;\n";
        let (_, changed) = disable_directive(input, DIRECTIVE);
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_find_config_files_filters_suffix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.conf"), "").unwrap();
        fs::write(dir.path().join("a.conf"), "").unwrap();
        fs::write(dir.path().join("readme.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub.conf")).unwrap();

        let files = find_config_files(dir.path(), ".conf").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.conf", "b.conf"]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let reconciler = Reconciler::new(test_config(&dir.path().join("absent")), FakeManager::default());
        assert!(matches!(reconciler.disable_conflicts(), Err(ReconcileError::Io { .. })));
    }

    #[test]
    fn test_directory_pass_twice_is_stable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("site.conf"), SITE).unwrap();
        fs::write(dir.path().join("notes.txt"), "listen [::]:80;\n").unwrap();

        let reconciler = Reconciler::new(test_config(dir.path()), FakeManager::default());
        assert_eq!(reconciler.disable_conflicts().unwrap(), 1);
        let after_first = fs::read_to_string(dir.path().join("site.conf")).unwrap();

        assert_eq!(reconciler.disable_conflicts().unwrap(), 0);
        let after_second = fs::read_to_string(dir.path().join("site.conf")).unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "listen [::]:80;\n"
        );
    }

    #[tokio::test]
    async fn test_run_restarts_and_waits() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("site.conf"), SITE).unwrap();

        let manager = FakeManager {
            pending: 3,
            ..Default::default()
        };
        let restarts = manager.restarts.clone();
        let polls = manager.polls.clone();

        Reconciler::new(test_config(dir.path()), manager).run().await.unwrap();

        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_respects_timeout() {
        let dir = tempdir().unwrap();
        let config = ReconcileConfig {
            timeout: Some(Duration::from_millis(30)),
            ..test_config(dir.path())
        };
        let manager = FakeManager {
            pending: usize::MAX,
            ..Default::default()
        };

        let result = Reconciler::new(config, manager).wait_until_active().await;
        assert!(matches!(result, Err(ReconcileError::Timeout { .. })));
    }
}
