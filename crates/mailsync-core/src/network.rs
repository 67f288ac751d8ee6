//! Network reachability probes and the canary that restarts the session
//! when connectivity drops.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::log::log_debug;
use crate::status::{self, Tone};

pub const CANARY_INTERVAL: Duration = Duration::from_secs(10);
pub const CANARY_GRACE: Duration = Duration::from_secs(2);
pub const REACHABILITY_POLL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Used when no network-state provider is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl Reachability for AlwaysReachable {
    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Asks NetworkManager, through `nmcli`, for the active connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkManager;

#[async_trait]
impl Reachability for NetworkManager {
    async fn is_reachable(&self) -> bool {
        let output = tokio::process::Command::new("nmcli")
            .args(["-t", "-f", "DEVICE,TYPE,STATE", "connection", "show", "--active"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                has_active_uplink(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                log_debug(&format!("nmcli exited with {}", output.status));
                false
            }
            Err(err) => {
                log_debug(&format!("nmcli failed: {}", err));
                false
            }
        }
    }
}

impl NetworkManager {
    pub async fn available() -> bool {
        tokio::process::Command::new("nmcli")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Picks the NetworkManager probe when `nmcli` works, the no-op otherwise.
pub async fn detect() -> Arc<dyn Reachability> {
    if NetworkManager::available().await {
        log_debug("reachability provider=nmcli");
        Arc::new(NetworkManager)
    } else {
        log_debug("reachability provider=none");
        Arc::new(AlwaysReachable)
    }
}

/// Parses `nmcli -t -f DEVICE,TYPE,STATE` output. Bridges and loopback do
/// not count as a way out.
fn has_active_uplink(terse: &str) -> bool {
    terse.lines().any(|line| {
        let mut fields = line.rsplitn(3, ':');
        let (Some(state), Some(kind), Some(device)) = (fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        let virtual_device = kind == "bridge"
            || kind == "loopback"
            || device.starts_with("virbr")
            || device.starts_with("docker");
        state == "activated" && !virtual_device
    })
}

/// Polls until the network is reachable. Returns false on shutdown.
pub async fn wait_until_reachable(
    probe: &dyn Reachability,
    poll: Duration,
    shutdown: &CancellationToken,
) -> bool {
    let mut announced = false;
    loop {
        if shutdown.is_cancelled() {
            return false;
        }
        if probe.is_reachable().await {
            return true;
        }
        if !announced {
            status::line(Tone::Notice, "waiting for network connection");
            announced = true;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanaryOutcome {
    ConnectivityLost,
    Stopped,
}

/// Watches reachability and returns once it goes from up to down (after a
/// grace period), leaving the restart to the caller.
pub async fn run_canary(
    probe: &dyn Reachability,
    interval: Duration,
    grace: Duration,
    shutdown: &CancellationToken,
) -> CanaryOutcome {
    let mut was_reachable = probe.is_reachable().await;
    log_debug(&format!("canary start reachable={}", was_reachable));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return CanaryOutcome::Stopped,
            _ = tokio::time::sleep(interval) => {}
        }
        let reachable = probe.is_reachable().await;
        if was_reachable && !reachable {
            status::line(Tone::Notice, "network connection lost, restarting watchers");
            tokio::select! {
                _ = shutdown.cancelled() => return CanaryOutcome::Stopped,
                _ = tokio::time::sleep(grace) => {}
            }
            return CanaryOutcome::ConnectivityLost;
        }
        was_reachable = reachable;
    }
}
