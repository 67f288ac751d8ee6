//! Runs the external sync command and the post-sync hooks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::config::{Config, render_template};
use crate::log::log_debug;
use crate::status::{self, Tone};

/// Exit code of coreutils `timeout` when the wrapped command ran too long.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub host: String,
    pub mailbox: String,
}

impl SyncTarget {
    pub fn new(host: impl Into<String>, mailbox: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            mailbox: mailbox.into(),
        }
    }
}

/// `host:box`, or the bare channel when no mailbox is given.
impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mailbox.is_empty() {
            f.write_str(&self.host)
        } else {
            write!(f, "{}:{}", self.host, self.mailbox)
        }
    }
}

/// One fully rendered sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub target: Option<SyncTarget>,
    pub command: Vec<String>,
    pub post_sync: Vec<Vec<String>>,
    /// Whether `command` is wrapped in `timeout`, making exit code 124 retryable.
    pub timed: bool,
}

impl SyncJob {
    pub fn build(config: &Config, target: Option<SyncTarget>) -> Result<Self> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self::build_with_home(config, target, home)
    }

    fn build_with_home(
        config: &Config,
        target: Option<SyncTarget>,
        home: Option<PathBuf>,
    ) -> Result<Self> {
        let mut command = Vec::new();
        if let Some(timeout) = config.sync_timeout {
            command.push("timeout".to_string());
            command.push(timeout.as_secs().to_string());
        }
        command.extend(config.sync_command.iter().cloned());
        match &target {
            Some(target) => command.push(target.to_string()),
            None => command.push("-a".to_string()),
        }

        let (host, mailbox) = target
            .as_ref()
            .map(|t| (t.host.as_str(), t.mailbox.as_str()))
            .unwrap_or(("", ""));
        let mut post_sync = Vec::with_capacity(config.post_sync.len());
        for template in &config.post_sync {
            let rendered = render_template(template, host, mailbox);
            let argv = shell_words::split(&rendered)
                .map_err(|e| anyhow!("post_sync `{}`: {}", rendered, e))?
                .into_iter()
                .map(|arg| expand_home(&arg, home.as_deref()))
                .collect();
            post_sync.push(argv);
        }

        Ok(SyncJob {
            target,
            command,
            post_sync,
            timed: config.sync_timeout.is_some(),
        })
    }

    fn label(&self) -> String {
        match &self.target {
            Some(target) => target.to_string(),
            None => "all accounts".to_string(),
        }
    }
}

fn expand_home(arg: &str, home: Option<&std::path::Path>) -> String {
    let Some(home) = home else {
        return arg.to_string();
    };
    if arg == "~" {
        return home.display().to_string();
    }
    match arg.strip_prefix("~/") {
        Some(rest) => home.join(rest).display().to_string(),
        None => arg.to_string(),
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` to completion. `None` means the child died from a signal.
    async fn run(&self, argv: &[String]) -> Result<Option<i32>>;
}

/// Spawns real child processes sharing this process's terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<Option<i32>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;
        log_debug(&format!("spawn argv={:?}", argv));
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| anyhow!("unable to run `{}`: {}", program, e))?;
        Ok(status.code())
    }
}

/// What a watcher calls when its mailbox changed.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, target: Option<&SyncTarget>);
}

pub struct SyncInvoker<R = ProcessRunner> {
    config: Arc<Config>,
    runner: R,
}

impl SyncInvoker<ProcessRunner> {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_runner(config, ProcessRunner)
    }
}

impl<R: CommandRunner> SyncInvoker<R> {
    pub fn with_runner(config: Arc<Config>, runner: R) -> Self {
        Self { config, runner }
    }

    async fn run_job(&self, job: &SyncJob) {
        let label = job.label();
        match &job.target {
            Some(_) => status::line(Tone::Sync, &format!("syncing: {}", label)),
            None => status::line(Tone::Sync, "full sync of all accounts"),
        }

        let mut attempt = 1u32;
        loop {
            match self.runner.run(&job.command).await {
                Ok(Some(TIMEOUT_EXIT_CODE)) if job.timed => {
                    status::line(
                        Tone::Notice,
                        &format!("sync of {} timed out (attempt {}), retrying", label, attempt),
                    );
                    attempt += 1;
                }
                Ok(Some(0)) => break,
                Ok(Some(code)) => {
                    status::line(
                        Tone::Error,
                        &format!("sync of {} exited with code {}", label, code),
                    );
                    break;
                }
                Ok(None) => {
                    status::line(
                        Tone::Error,
                        &format!("sync of {} was killed by a signal", label),
                    );
                    break;
                }
                Err(err) => {
                    status::line(Tone::Error, &format!("sync of {} failed: {}", label, err));
                    break;
                }
            }
        }
        if job.target.is_some() {
            status::line(Tone::Sync, &format!("done syncing {}", label));
        }

        for argv in &job.post_sync {
            let shown = shell_words::join(argv);
            status::line(Tone::PostSync, &format!("post-sync: {}", shown));
            match self.runner.run(argv).await {
                Ok(Some(0)) => {}
                Ok(Some(code)) => status::line(
                    Tone::Error,
                    &format!("post-sync `{}` exited with code {}", shown, code),
                ),
                Ok(None) => status::line(
                    Tone::Error,
                    &format!("post-sync `{}` was killed by a signal", shown),
                ),
                Err(err) => {
                    status::line(Tone::Error, &format!("post-sync `{}`: {}", shown, err))
                }
            }
        }

        status::line(
            Tone::Finished,
            &format!(
                "last sync of {} at {}",
                label,
                chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
            ),
        );
    }
}

#[async_trait]
impl<R: CommandRunner> SyncHandler for SyncInvoker<R> {
    async fn sync(&self, target: Option<&SyncTarget>) {
        match SyncJob::build(&self.config, target.cloned()) {
            Ok(job) => self.run_job(&job).await,
            Err(err) => status::line(Tone::Error, &format!("unable to prepare sync: {}", err)),
        }
    }
}
