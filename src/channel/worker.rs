//! Worker subprocess.
//!
//! Spawns the bundler binary in service mode with piped stdin/stdout and
//! connects a [`Channel`] to those pipes. The worker is killed when this
//! handle is dropped.

use std::process::Stdio;

use tokio::process::{Child, Command};

use super::{Channel, ChannelConfig};
use crate::config::WorkerConfig;
use crate::error::{PackwireError, Result};

/// A running worker process and the channel connected to it.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    channel: Channel,
}

impl WorkerProcess {
    /// Spawn the worker described by `config`.
    pub fn spawn(config: &WorkerConfig) -> Result<Self> {
        let mut command = Command::new(&config.binary_path);
        command
            .arg(format!("--service={}", config.expected_version))
            .arg("--ping")
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PackwireError::ServiceStopped(format!(
                "The service was stopped: failed to spawn {}: {}",
                config.binary_path.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PackwireError::ServiceStopped("The service was stopped: worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PackwireError::ServiceStopped("The service was stopped: worker stdout unavailable".into()))?;

        tracing::info!(
            binary = %config.binary_path.display(),
            pid = child.id().unwrap_or_default(),
            "worker started"
        );

        let channel_config = ChannelConfig {
            expected_version: config.expected_version.clone(),
            max_frame_bytes: config.max_frame_bytes,
            max_outbound_frame_bytes: crate::protocol::codec::MAX_OUTBOUND_FRAME_LENGTH,
            request_timeout: config.request_timeout(),
        };
        let channel = Channel::connect(stdout, stdin, channel_config);
        Ok(Self { child, channel })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close the channel, then kill the worker and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.channel.close(Some("worker shut down".to_string()));
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = WorkerConfig {
            binary_path: PathBuf::from("/nonexistent/packwire-worker"),
            ..Default::default()
        };
        let err = WorkerProcess::spawn(&config).unwrap_err();
        assert!(matches!(err, PackwireError::ServiceStopped(_)));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exit_stops_channel() {
        // `true` exits immediately without a handshake
        let config = WorkerConfig {
            binary_path: PathBuf::from("true"),
            ..Default::default()
        };
        let worker = WorkerProcess::spawn(&config).unwrap();
        // the worker may already be gone by the time the request is queued
        let result = match worker.channel().send_request(crate::protocol::Map::new()) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        assert!(matches!(result, Err(PackwireError::ServiceStopped(_))));
    }
}
