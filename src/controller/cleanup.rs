// src/controller/cleanup.rs

//! What happens after the last step: artifact publishing and workspace
//! teardown.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::exec::process::{shell_command, terminate};
use crate::exec::Masker;
use crate::workspace::Workspace;

/// Where and what to publish.
pub struct PublishRequest<'a> {
    /// Directory whose contents are published.
    pub dir: &'a Path,
    /// Destination descriptor from the definition (e.g. a branch name).
    pub destination: &'a str,
    /// Authentication token from the trigger.
    pub token: Option<&'a str>,
    /// Run-scoped environment.
    pub env: &'a BTreeMap<String, String>,
}

/// Publishes build artifacts after a successful run.
pub trait ArtifactPublisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        request: PublishRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

/// Default publisher: runs a shell command in the publish directory with
/// `PUBLISH_DIR`, `PUBLISH_DESTINATION` and `PUBLISH_TOKEN` set.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    cmd: String,
    timeout: Duration,
    kill_grace: Duration,
    masker: Masker,
}

impl CommandPublisher {
    pub fn new(cmd: impl Into<String>, timeout: Duration, kill_grace: Duration, masker: Masker) -> Self {
        Self {
            cmd: cmd.into(),
            timeout,
            kill_grace,
            masker,
        }
    }

    fn log_output(&self, stream: &str, bytes: &[u8]) {
        for line in String::from_utf8_lossy(bytes).lines() {
            info!(stream, "publish: {}", self.masker.mask(line));
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut bytes).await {
            debug!(error = %err, "error reading publish command output");
        }
    }
    bytes
}

impl ArtifactPublisher for CommandPublisher {
    fn publish<'a>(
        &'a self,
        request: PublishRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !request.dir.is_dir() {
                bail!("publish directory {} does not exist", request.dir.display());
            }

            let mut env = request.env.clone();
            env.insert("PUBLISH_DIR".to_string(), request.dir.to_string_lossy().into_owned());
            env.insert("PUBLISH_DESTINATION".to_string(), request.destination.to_string());
            env.insert(
                "PUBLISH_TOKEN".to_string(),
                request.token.unwrap_or_default().to_string(),
            );

            info!(dir = %request.dir.display(), destination = %request.destination, "running publish command");
            let mut child = shell_command(&self.cmd, &env, request.dir)
                .spawn()
                .context("spawning publish command")?;
            let stdout = tokio::spawn(read_all(child.stdout.take()));
            let stderr = tokio::spawn(read_all(child.stderr.take()));

            let status = tokio::select! {
                status = child.wait() => status.context("waiting for publish command")?,
                _ = tokio::time::sleep(self.timeout) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "publish command timed out; terminating");
                    if let Err(err) = terminate(&mut child, self.kill_grace).await {
                        warn!(error = %err, "failed to terminate publish command");
                    }
                    stdout.abort();
                    stderr.abort();
                    bail!("publish command timed out after {:?}", self.timeout);
                }
            };

            for (stream, reader) in [("stdout", stdout), ("stderr", stderr)] {
                match tokio::time::timeout(self.kill_grace, reader).await {
                    Ok(Ok(bytes)) => self.log_output(stream, &bytes),
                    Ok(Err(err)) => debug!(stream, error = %err, "publish output reader failed"),
                    Err(_) => debug!(stream, "publish output pipe still open after exit"),
                }
            }

            if !status.success() {
                bail!("publish command exited with {:?}", status.code());
            }
            Ok(())
        })
    }
}

/// Releases a run's scratch space. Called exactly once per run, whatever
/// its outcome.
pub trait WorkspaceTeardown: Send + Sync {
    fn teardown(&self, workspace: &Workspace) -> anyhow::Result<()>;
}

/// Default teardown: remove job workspaces and step directories, keeping
/// the event log.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveWorkspace {
    pub keep: bool,
}

impl WorkspaceTeardown for RemoveWorkspace {
    fn teardown(&self, workspace: &Workspace) -> anyhow::Result<()> {
        if self.keep {
            info!(dir = %workspace.run_dir().display(), "keeping run workspace");
            return Ok(());
        }
        workspace
            .remove_scratch()
            .with_context(|| format!("removing workspace under {}", workspace.run_dir().display()))
    }
}

/// Teardown that only logs; used when nothing was ever created.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTeardown;

impl WorkspaceTeardown for NoTeardown {
    fn teardown(&self, workspace: &Workspace) -> anyhow::Result<()> {
        warn!(dir = %workspace.run_dir().display(), "workspace teardown skipped");
        Ok(())
    }
}
