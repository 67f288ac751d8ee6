use std::process::Stdio;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;

use mailsync_core::log_debug;

use crate::{Key, Multiplexer};

/// Drives the `tmux` binary.
#[derive(Debug, Clone)]
pub struct Tmux {
    program: String,
}

impl Default for Tmux {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this process already runs inside a tmux client.
    pub fn inside() -> bool {
        std::env::var_os("TMUX").is_some_and(|v| !v.is_empty())
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        log_debug(&format!("tmux {}", shell_words::join(args)));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("unable to run {}: {}", self.program, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ids(&self, args: &[&str]) -> Result<Vec<String>> {
        let out = self.output(args).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix.
fn exact(session: &str) -> String {
    format!("={}", session)
}

#[async_trait]
impl Multiplexer for Tmux {
    async fn has_session(&self, name: &str) -> Result<bool> {
        let status = Command::new(&self.program)
            .args(["has-session", "-t", &exact(name)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| anyhow!("unable to run {}: {}", self.program, e))?;
        Ok(status.success())
    }

    async fn new_session(&self, name: &str) -> Result<()> {
        self.output(&["new-session", "-d", "-s", name]).await?;
        Ok(())
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<String>> {
        self.ids(&["list-windows", "-t", &exact(session), "-F", "#{window_id}"])
            .await
    }

    async fn list_panes(&self, window: &str) -> Result<Vec<String>> {
        self.ids(&["list-panes", "-t", window, "-F", "#{pane_id}"])
            .await
    }

    async fn split_window(&self, window: &str) -> Result<String> {
        let ids = self
            .ids(&["split-window", "-t", window, "-P", "-F", "#{pane_id}"])
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| anyhow!("tmux split-window printed no pane id"))
    }

    async fn select_layout(&self, window: &str, layout: &str) -> Result<()> {
        self.output(&["select-layout", "-t", window, layout]).await?;
        Ok(())
    }

    async fn send_line(&self, pane: &str, line: &str) -> Result<()> {
        self.output(&["send-keys", "-t", pane, "-l", line]).await?;
        self.output(&["send-keys", "-t", pane, "Enter"]).await?;
        Ok(())
    }

    async fn send_key(&self, pane: &str, key: Key) -> Result<()> {
        self.output(&["send-keys", "-t", pane, key.tmux_name()])
            .await?;
        Ok(())
    }

    async fn clear(&self, pane: &str) -> Result<()> {
        self.send_line(pane, "clear").await?;
        self.output(&["clear-history", "-t", pane]).await?;
        Ok(())
    }

    async fn attach(&self, session: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(["attach-session", "-t", &exact(session)])
            .status()
            .await
            .map_err(|e| anyhow!("unable to run {}: {}", self.program, e))?;
        if !status.success() {
            return Err(anyhow!("tmux attach-session exited with {}", status));
        }
        Ok(())
    }

    fn current_pane(&self) -> Option<String> {
        std::env::var("TMUX_PANE").ok().filter(|pane| !pane.is_empty())
    }
}
