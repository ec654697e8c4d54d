//! Mod subprocess lifecycle.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_core::{Capsule, CapsuleRequest, Error, Mod, Result};

use crate::client::{ModClient, ModOptions};
use crate::protocol::{MAGIC_COOKIE_KEY, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Where a mod lives and how to launch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModInfo {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Container image shipping the mod, when built for in-cluster use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ModInfo {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into(), args: Vec::new(), image: None }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// A running mod subprocess, driven over its stdin/stdout.
///
/// The child is killed when the executor is dropped, so abandoning a pipeline
/// never leaks processes; `stop` additionally reaps it.
pub struct ModExecutor {
    name: String,
    child: Child,
    client: ModClient<ChildStdout, ChildStdin>,
    stderr: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ModExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModExecutor").field("name", &self.name).field("pid", &self.child.id()).finish()
    }
}

impl ModExecutor {
    /// Spawn the mod and wait for its handshake.
    pub async fn start(info: &ModInfo, opts: ModOptions) -> Result<Self> {
        let mut cmd = Command::new(&info.path);
        cmd.args(&info.args)
            .env(MAGIC_COOKIE_KEY, &info.name)
            .env(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Unavailable(format!("starting mod {} from {}: {e}", info.name, info.path.display()))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| Error::Internal("mod stdin was not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Internal("mod stdout was not captured".into()))?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(forward_stderr(info.name.clone(), s)));

        match ModClient::connect(&info.name, stdout, stdin, opts).await {
            Ok(client) => {
                info!(module = %info.name, pid = ?child.id(), path = %info.path.display(), "mod started");
                Ok(Self { name: info.name.clone(), child, client, stderr })
            }
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                if let Some(task) = stderr {
                    task.abort();
                }
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> Option<u32> { self.child.id() }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(module = %self.name, error = %e, "mod already exited");
        }
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(module = %self.name, %status, "mod stopped"),
            Ok(Err(e)) => warn!(module = %self.name, error = %e, "waiting for mod failed"),
            Err(_) => warn!(module = %self.name, "mod did not exit after kill"),
        }
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(module = %name, "{line}");
    }
}

#[async_trait]
impl Mod for ModExecutor {
    fn name(&self) -> &str { &self.name }

    async fn initialize(&mut self, config: &str, tag: &str) -> Result<()> { self.client.initialize(config, tag).await }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        self.client.run_capsule(capsule, req).await
    }

    async fn stop(&mut self) { self.kill().await }
}
