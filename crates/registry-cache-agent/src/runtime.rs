//! Container runtime restarts

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("restart timed out after {0} seconds")]
    Timeout(u64),

    #[error("restart failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("failed to run restart command: {0}")]
    Io(#[from] std::io::Error),
}

/// Restarts the node's container runtime so it reloads its configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeRestarter: Send + Sync {
    async fn restart(&self) -> Result<(), RestartError>;
}

/// Runs a fixed command line and waits for it within a bound
pub struct CommandRestarter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRestarter {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// `chroot <host_root> systemctl restart <service>`
    pub fn systemd(host_root: &Path, service: &str, timeout: Duration) -> Self {
        Self::new(
            "chroot",
            vec![
                host_root.display().to_string(),
                "systemctl".to_string(),
                "restart".to_string(),
                service.to_string(),
            ],
            timeout,
        )
    }
}

#[async_trait]
impl RuntimeRestarter for CommandRestarter {
    async fn restart(&self) -> Result<(), RestartError> {
        info!(program = %self.program, args = ?self.args, "Restarting container runtime");

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                info!("Container runtime restarted");
                Ok(())
            }
            Ok(Ok(output)) => {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(code, stderr = %stderr, "Container runtime restart failed");
                Err(RestartError::Failed { code, stderr })
            }
            Ok(Err(e)) => Err(RestartError::Io(e)),
            Err(_) => {
                // Dropping the future kills the child
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Container runtime restart timed out"
                );
                Err(RestartError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
