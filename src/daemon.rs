//! The local daemon lifecycle collaborator.
//!
//! Agents never shell out directly. Everything touching the host's daemon goes through the
//! `DaemonLifecycle` trait, whose production implementation drives systemd and the daemon's
//! control CLI.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::models::ConfigSnapshot;

/// Hardware facts of the local host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareFacts {
    pub cpus: u32,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    /// Real memory in megabytes.
    pub real_memory: u64,
    pub gpus: Option<u32>,
}

/// Lifecycle operations on the local daemon.
#[async_trait]
pub trait DaemonLifecycle: Send + Sync + 'static {
    /// Ensure the daemon is installed and enabled.
    async fn install(&self) -> Result<()>;
    /// Render the given snapshot as the daemon's configuration.
    async fn render_config(&self, snapshot: &ConfigSnapshot) -> Result<()>;
    /// Restart the daemon.
    async fn restart(&self) -> Result<()>;
    /// Check if the daemon is running.
    async fn is_active(&self) -> Result<bool>;
    /// Return the given nodes to service.
    async fn resume_nodes(&self, names: &BTreeSet<String>) -> Result<()>;
    /// Take the given node out of service.
    async fn drain_node(&self, name: &str, reason: &str) -> Result<()>;
    /// Probe the hardware facts of the local host.
    async fn probe_hardware(&self) -> Result<HardwareFacts>;
}

/// A daemon managed by systemd and controlled with `scontrol`.
pub struct SystemdDaemon {
    service: String,
    config_path: PathBuf,
}

impl SystemdDaemon {
    pub fn new(service: String, config_path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            config_path: config_path.into(),
        }
    }

    /// Run the given command to completion, returning its stdout.
    async fn run(program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("error spawning {}", program))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DaemonLifecycle for SystemdDaemon {
    #[tracing::instrument(level = "debug", skip(self), fields(service = %self.service))]
    async fn install(&self) -> Result<()> {
        Self::run("systemctl", &["enable", self.service.as_str()])
            .await
            .context("error enabling daemon service")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(path = ?self.config_path))]
    async fn render_config(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("error creating daemon config dir")?;
        }
        let rendered = serde_json::to_vec_pretty(snapshot).context("error rendering daemon config")?;
        // Write then rename, so the daemon never reads a partial config.
        let tmp = self.config_path.with_extension("tmp");
        tokio::fs::write(&tmp, rendered).await.context("error writing daemon config")?;
        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .context("error moving daemon config into place")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(service = %self.service))]
    async fn restart(&self) -> Result<()> {
        Self::run("systemctl", &["restart", self.service.as_str()])
            .await
            .context("error restarting daemon service")?;
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        let status = Command::new("systemctl")
            .args(&["is-active", "--quiet", self.service.as_str()])
            .status()
            .await
            .context("error spawning systemctl")?;
        Ok(status.success())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resume_nodes(&self, names: &BTreeSet<String>) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let nodes = format!("nodename={}", names.iter().cloned().collect::<Vec<_>>().join(","));
        Self::run("scontrol", &["update", nodes.as_str(), "state=resume"])
            .await
            .context("error resuming nodes")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn drain_node(&self, name: &str, reason: &str) -> Result<()> {
        let node = format!("nodename={}", name);
        let reason = format!("reason={}", reason);
        Self::run("scontrol", &["update", node.as_str(), "state=drain", reason.as_str()])
            .await
            .context("error draining node")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn probe_hardware(&self) -> Result<HardwareFacts> {
        let lscpu = Self::run("lscpu", &[]).await?;
        let free = Self::run("free", &["-m"]).await?;
        let mut facts = parse_lscpu(&lscpu)?;
        facts.real_memory = parse_free_m(&free)?;
        facts.gpus = count_gpus().await?;
        Ok(facts)
    }
}

/// Parse the CPU topology out of `lscpu` output.
pub fn parse_lscpu(output: &str) -> Result<HardwareFacts> {
    let field = |name: &str| -> Result<u32> {
        output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .with_context(|| format!("lscpu output is missing {}", name))?
            .1
            .trim()
            .parse::<u32>()
            .with_context(|| format!("error parsing lscpu field {}", name))
    };
    Ok(HardwareFacts {
        cpus: field("CPU(s)")?,
        sockets: field("Socket(s)")?,
        cores_per_socket: field("Core(s) per socket")?,
        threads_per_core: field("Thread(s) per core")?,
        real_memory: 0,
        gpus: None,
    })
}

/// Parse total memory out of `free -m` output.
pub fn parse_free_m(output: &str) -> Result<u64> {
    output
        .lines()
        .find(|line| line.starts_with("Mem:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .context("free output is missing total memory")?
        .parse()
        .context("error parsing total memory")
}

/// Count accelerator device nodes, e.g. `/dev/nvidia0`.
async fn count_gpus() -> Result<Option<u32>> {
    let mut entries = tokio::fs::read_dir("/dev").await.context("error listing /dev")?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await.context("error listing /dev")? {
        if is_gpu_device(&entry.file_name().to_string_lossy()) {
            count += 1;
        }
    }
    Ok(Some(count).filter(|count| *count > 0))
}

pub(crate) fn is_gpu_device(name: &str) -> bool {
    name.strip_prefix("nvidia")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}
