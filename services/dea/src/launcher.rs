//! Launching and probing instance processes.
//!
//! The launcher abstracts the OS-level side of an instance:
//! - Starting the instance's `startup` script with its environment
//! - Checking whether a pid is still alive
//! - Stopping a process group
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dea_id::InstanceId;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from launching or stopping an instance.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("startup script not found: {0}")]
    MissingStartup(PathBuf),

    #[error("failed to spawn instance: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("spawned process has no pid")]
    NoPid,

    #[error("launch rejected: {0}")]
    Rejected(String),
}

/// What the launcher needs to start one instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance_id: InstanceId,
    /// Instance directory containing the `startup` script.
    pub dir: PathBuf,
    pub environment: Vec<(String, String)>,
    pub fds_quota: u64,
    /// Apply `fds_quota` as the open-files limit.
    pub enforce_ulimit: bool,
}

/// Process lifecycle interface.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Start the instance and return its pid.
    async fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError>;

    /// Check whether `pid` is present in the process table.
    fn is_alive(&self, pid: u32) -> bool;

    /// Stop the process (and its group) started as `pid`.
    async fn stop(&self, pid: u32) -> Result<(), LaunchError>;
}

// =============================================================================
// Process Launcher
// =============================================================================

/// Runs `<dir>/startup` under `sh` in its own process group.
pub struct ProcessLauncher {
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl InstanceLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError> {
        let startup = request.dir.join("startup");
        if !startup.is_file() {
            return Err(LaunchError::MissingStartup(startup));
        }

        let logs = request.dir.join("logs");
        std::fs::create_dir_all(&logs)?;
        let stdout = std::fs::File::create(logs.join("stdout.log"))?;
        let stderr = std::fs::File::create(logs.join("stderr.log"))?;

        let script = if request.enforce_ulimit {
            format!("ulimit -n {}; exec sh ./startup", request.fds_quota)
        } else {
            "exec sh ./startup".to_string()
        };

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .current_dir(&request.dir)
            .env_clear()
            .envs(request.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()?;

        let pid = child.id().ok_or(LaunchError::NoPid)?;

        // Reap the child so a dead instance does not linger as a zombie.
        let instance_id = request.instance_id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(instance_id = %instance_id, pid, %status, "Instance process exited"),
                Err(e) => warn!(instance_id = %instance_id, pid, error = %e, "Failed to wait for instance"),
            }
        });

        info!(instance_id = %request.instance_id, pid, "Instance launched");
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_exists(pid)
    }

    async fn stop(&self, pid: u32) -> Result<(), LaunchError> {
        signal_group(pid, libc::SIGTERM);

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if !process_exists(pid) {
                debug!(pid, "Process exited after SIGTERM");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);
        Ok(())
    }
}

/// `kill(pid, 0)`: the process exists if the call succeeds or is denied.
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // The instance leads its own group; fall back to the pid alone.
    if unsafe { libc::kill(-pid, signal) } != 0 {
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

// =============================================================================
// Mock Launcher
// =============================================================================

/// Mock launcher for testing and development.
pub struct MockLauncher {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    launches: Mutex<Vec<LaunchRequest>>,
    fail_launches: bool,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            alive: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            fail_launches: false,
        }
    }

    /// A launcher that rejects every launch.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new()
        }
    }

    /// Register a live fake process without a launch.
    pub fn spawn_fake(&self) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().insert(pid);
        pid
    }

    /// Simulate the process dying on its own.
    pub fn kill(&self, pid: u32) {
        self.alive.lock().remove(&pid);
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().clone()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().len()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceLauncher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError> {
        if self.fail_launches {
            return Err(LaunchError::Rejected(
                "mock launcher configured to fail".to_string(),
            ));
        }

        let pid = self.spawn_fake();
        self.launches.lock().push(request.clone());
        info!(instance_id = %request.instance_id, pid, "[MOCK] Instance launched");
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }

    async fn stop(&self, pid: u32) -> Result<(), LaunchError> {
        debug!(pid, "[MOCK] Stopping instance");
        self.kill(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: PathBuf) -> LaunchRequest {
        LaunchRequest {
            instance_id: InstanceId::new(),
            dir,
            environment: vec![("GREETING".to_string(), "hello".to_string())],
            fds_quota: 256,
            enforce_ulimit: true,
        }
    }

    #[tokio::test]
    async fn test_mock_launch_and_stop() {
        let launcher = MockLauncher::new();
        let pid = launcher.launch(&request(PathBuf::from("/tmp"))).await.unwrap();
        assert!(launcher.is_alive(pid));
        assert_eq!(launcher.launches().len(), 1);

        launcher.stop(pid).await.unwrap();
        assert!(!launcher.is_alive(pid));
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let launcher = MockLauncher::failing();
        let result = launcher.launch(&request(PathBuf::from("/tmp"))).await;
        assert!(matches!(result, Err(LaunchError::Rejected(_))));
    }

    #[test]
    fn test_own_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(0));
    }

    #[tokio::test]
    async fn test_process_launcher_requires_startup() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::default();
        let result = launcher.launch(&request(dir.path().to_path_buf())).await;
        assert!(matches!(result, Err(LaunchError::MissingStartup(_))));
    }

    #[tokio::test]
    async fn test_process_launcher_runs_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("startup"),
            "echo \"$GREETING\" > greeting.txt\nsleep 30\n",
        )
        .unwrap();

        let launcher = ProcessLauncher::new(Duration::from_secs(2));
        let pid = launcher.launch(&request(dir.path().to_path_buf())).await.unwrap();
        assert!(launcher.is_alive(pid));

        let greeting = dir.path().join("greeting.txt");
        for _ in 0..50 {
            if greeting.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&greeting).unwrap().trim(), "hello");

        launcher.stop(pid).await.unwrap();
        for _ in 0..50 {
            if !launcher.is_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!launcher.is_alive(pid));
    }
}
