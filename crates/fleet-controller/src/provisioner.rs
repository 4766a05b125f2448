//! Compute provisioning.
//!
//! The reconciler only needs one capability from the platform: start a
//! task for a named runner and report the address it got. Platforms plug
//! in by implementing [`Provisioner`].

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};

/// Boxed future returned by [`Provisioner::provision`].
pub type ProvisionFuture<'a> = Pin<Box<dyn Future<Output = ControllerResult<String>> + Send + 'a>>;

/// Starts compute tasks for runners.
pub trait Provisioner: Send + Sync {
    /// Start a task registered as `runner_name` and resolve to its private
    /// IPv4 address once the task is running.
    fn provision<'a>(&'a self, runner_name: &'a str) -> ProvisionFuture<'a>;
}

/// Provisions by running an operator-supplied shell command.
///
/// The command sees the runner name in `RUNNER_NAME` and must print the
/// task's private address as the last line of stdout. A non-zero exit or
/// an empty last line is a failure.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, runner_name: &str) -> ControllerResult<String> {
        let fail = |reason: String| ControllerError::Provision {
            runner: runner_name.to_string(),
            reason,
        };

        debug!(runner = %runner_name, command = %self.command, "running provision command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RUNNER_NAME", runner_name)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("{}: {}", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let address = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| fail("command printed no address".to_string()))?;

        info!(runner = %runner_name, %address, "runner task started");
        Ok(address.to_string())
    }
}

impl Provisioner for CommandProvisioner {
    fn provision<'a>(&'a self, runner_name: &'a str) -> ProvisionFuture<'a> {
        Box::pin(self.run(runner_name))
    }
}

/// Provisioner for platforms without a provisioning backend. Every call
/// fails with [`ControllerError::NotImplemented`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedProvisioner;

impl Provisioner for UnsupportedProvisioner {
    fn provision<'a>(&'a self, runner_name: &'a str) -> ProvisionFuture<'a> {
        Box::pin(async move {
            Err(ControllerError::NotImplemented(format!(
                "no provisioner configured for runner {runner_name}"
            )))
        })
    }
}
