//! The per-mailbox IDLE watcher.
//!
//! A watcher connects, selects its mailbox and then polls the server in
//! IDLE mode, syncing the mailbox whenever a poll returned a real change.
//! It reconnects forever: after errors (with the retry policy's delay),
//! when a forced reconnect is requested, and every `renew_after` polls.
//! Only a folder-selection failure or shutdown ends it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{AccountConfig, Config};
use crate::log::log_debug;
use crate::network::{REACHABILITY_POLL, Reachability, wait_until_reachable};
use crate::retry::{RetryPolicy, backoff};
use crate::status::{self, Tone};
use crate::sync::{SyncHandler, SyncTarget};

pub const IDLE_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// An unsolicited server response seen while idling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `* OK Still here`
    KeepAlive,
    Changed(String),
}

impl ServerEvent {
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ServerEvent::KeepAlive)
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("unable to select folder {mailbox}: {reason}")]
    FolderSelect { mailbox: String, reason: String },
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

/// An authenticated connection with the watched mailbox selected.
pub trait IdleSession: Send {
    /// Enters IDLE, waits up to `timeout` for unsolicited responses and
    /// leaves IDLE again. An empty batch means the wait timed out.
    fn idle_check(&mut self, timeout: Duration) -> anyhow::Result<Vec<ServerEvent>>;
    fn logout(&mut self) -> anyhow::Result<()>;
}

pub trait Connector: Send + Sync {
    /// Connects, logs in and selects `mailbox`. Selection problems must be
    /// reported as [`WatchError::FolderSelect`].
    fn open(
        &self,
        account: &AccountConfig,
        password: &str,
        mailbox: &str,
    ) -> Result<Box<dyn IdleSession>, WatchError>;
}

/// Set from outside (a signal handler) to make a watcher drop its
/// connection and reconnect at the next poll boundary.
#[derive(Debug, Clone, Default)]
pub struct ReconnectFlag(Arc<AtomicBool>);

impl ReconnectFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns whether a reconnect was requested and clears the request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Shutdown,
    FolderUnavailable,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    pub connects: u64,
    pub polls: u64,
    pub syncs: u64,
    pub failures: u64,
    pub forced_reconnects: u64,
    pub renewals: u64,
}

enum CycleEnd {
    Renewal,
    Forced,
    Shutdown,
}

/// Owns the open session; logs it out when closed, or on drop if an
/// early return skipped `close`.
struct LiveSession {
    inner: Option<Box<dyn IdleSession>>,
    label: String,
}

/// Holds a session inside a blocking poll. Logs it out if the poll panics
/// or nobody is left to take the session back.
struct PollGuard {
    session: Option<Box<dyn IdleSession>>,
    label: String,
}

impl PollGuard {
    fn idle_check(&mut self, timeout: Duration) -> anyhow::Result<Vec<ServerEvent>> {
        match self.session.as_mut() {
            Some(session) => session.idle_check(timeout),
            None => Err(anyhow!("session already closed")),
        }
    }

    fn release(mut self) -> Option<Box<dyn IdleSession>> {
        self.session.take()
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let outcome = match session.logout() {
            Ok(()) => "ok".to_string(),
            Err(err) => err.to_string(),
        };
        log_debug(&format!("{} logout after abandoned poll: {}", self.label, outcome));
    }
}

impl LiveSession {
    fn new(session: Box<dyn IdleSession>, label: String) -> Self {
        Self {
            inner: Some(session),
            label,
        }
    }

    async fn idle_check(&mut self, timeout: Duration) -> anyhow::Result<Vec<ServerEvent>> {
        let session = self
            .inner
            .take()
            .ok_or_else(|| anyhow!("session already closed"))?;
        let label = self.label.clone();
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let mut poll = PollGuard {
                session: Some(session),
                label: label.clone(),
            };
            let result = poll.idle_check(timeout);
            // The receiver is gone once the watcher was dropped mid-poll.
            if let Err((session, _)) = tx.send((poll.release(), result)) {
                drop(PollGuard { session, label });
            }
        });
        let (session, result) = rx
            .await
            .map_err(|_| anyhow!("idle check task failed"))?;
        self.inner = session;
        result
    }

    async fn close(&mut self) {
        let Some(mut session) = self.inner.take() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || session.logout()).await;
        match result {
            Ok(Ok(())) => log_debug(&format!("{} logout ok", self.label)),
            Ok(Err(err)) => log_debug(&format!("{} logout failed: {}", self.label, err)),
            Err(err) => log_debug(&format!("{} logout task failed: {}", self.label, err)),
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let Some(mut session) = self.inner.take() else {
            return;
        };
        log_debug(&format!("{} logout on drop", self.label));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(move || {
                    let _ = session.logout();
                });
            }
            Err(_) => {
                let _ = session.logout();
            }
        }
    }
}

pub struct MailboxWatcher {
    account: AccountConfig,
    mailbox: String,
    target: SyncTarget,
    connector: Arc<dyn Connector>,
    sync: Arc<dyn SyncHandler>,
    reachability: Option<Arc<dyn Reachability>>,
    reconnect: ReconnectFlag,
    shutdown: CancellationToken,
    retry: RetryPolicy,
    renew_after: u32,
    idle_timeout: Duration,
    stats: WatchStats,
}

impl MailboxWatcher {
    pub fn new(
        config: &Config,
        account: AccountConfig,
        mailbox: impl Into<String>,
        connector: Arc<dyn Connector>,
        sync: Arc<dyn SyncHandler>,
    ) -> Self {
        let mailbox = mailbox.into();
        let target = SyncTarget::new(account.local.clone(), mailbox.clone());
        Self {
            account,
            mailbox,
            target,
            connector,
            sync,
            reachability: None,
            reconnect: ReconnectFlag::new(),
            shutdown: CancellationToken::new(),
            retry: config.retry,
            renew_after: config.renew_after,
            idle_timeout: IDLE_CHECK_TIMEOUT,
            stats: WatchStats::default(),
        }
    }

    pub fn with_reachability(mut self, probe: Arc<dyn Reachability>) -> Self {
        self.reachability = Some(probe);
        self
    }

    pub fn with_reconnect(mut self, flag: ReconnectFlag) -> Self {
        self.reconnect = flag;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_renew_after(mut self, polls: u32) -> Self {
        self.renew_after = polls.max(1);
        self
    }

    pub fn stats(&self) -> WatchStats {
        self.stats
    }

    fn label(&self) -> String {
        format!("{}:{}", self.account.name, self.mailbox)
    }

    pub async fn run(&mut self) -> WatchExit {
        let label = self.label();
        let mut consecutive_failures = 0u32;
        let exit = loop {
            if self.shutdown.is_cancelled() {
                break WatchExit::Shutdown;
            }
            if let Some(probe) = self.reachability.clone() {
                if !wait_until_reachable(probe.as_ref(), REACHABILITY_POLL, &self.shutdown).await {
                    break WatchExit::Shutdown;
                }
            }
            status::line(Tone::Connect, &format!("connecting to {}", label));
            match self.session_cycle(&label, &mut consecutive_failures).await {
                Ok(CycleEnd::Renewal) => {
                    self.stats.renewals += 1;
                    status::line(Tone::Notice, &format!("renewing idle session for {}", label));
                }
                Ok(CycleEnd::Forced) => {
                    self.stats.forced_reconnects += 1;
                    status::line(Tone::Notice, &format!("forced reconnection of {}", label));
                }
                Ok(CycleEnd::Shutdown) => break WatchExit::Shutdown,
                Err(WatchError::FolderSelect { mailbox, reason }) => {
                    status::line(
                        Tone::Error,
                        &format!("unable to select folder {}: {}", mailbox, reason),
                    );
                    break WatchExit::FolderUnavailable;
                }
                Err(WatchError::Transient(err)) => {
                    self.stats.failures += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    status::line(
                        Tone::Error,
                        &format!("error {:#} in {} connection, restarting", err, label),
                    );
                    let delay = self.retry.delay(consecutive_failures);
                    if !backoff(delay, &self.shutdown).await {
                        break WatchExit::Shutdown;
                    }
                }
            }
        };
        log_debug(&format!("{} exit={:?} stats={:?}", label, exit, self.stats));
        exit
    }

    async fn session_cycle(
        &mut self,
        label: &str,
        consecutive_failures: &mut u32,
    ) -> Result<CycleEnd, WatchError> {
        // A fresh connection satisfies any reconnect requested meanwhile.
        self.reconnect.take();
        let password = self.account.credentials.resolve().await?;
        let connector = self.connector.clone();
        let account = self.account.clone();
        let mailbox = self.mailbox.clone();
        let session = tokio::task::spawn_blocking(move || {
            connector.open(&account, &password, &mailbox)
        })
        .await
        .map_err(|e| anyhow!("connect task failed: {}", e))??;

        let mut live = LiveSession::new(session, label.to_string());
        self.stats.connects += 1;
        *consecutive_failures = 0;
        status::line(Tone::Connect, &format!("connected, {}", label));

        let mut renewal_left = self.renew_after;
        let end = loop {
            if self.shutdown.is_cancelled() {
                break CycleEnd::Shutdown;
            }
            if self.reconnect.take() {
                break CycleEnd::Forced;
            }
            if renewal_left == 0 {
                break CycleEnd::Renewal;
            }
            let events = match live.idle_check(self.idle_timeout).await {
                Ok(events) => events,
                Err(err) => {
                    live.close().await;
                    return Err(err.into());
                }
            };
            self.stats.polls += 1;
            renewal_left -= 1;

            let changes: Vec<&ServerEvent> = events.iter().filter(|e| !e.is_keepalive()).collect();
            if changes.is_empty() {
                continue;
            }
            let shown = changes
                .iter()
                .map(|e| match e {
                    ServerEvent::Changed(detail) => detail.as_str(),
                    ServerEvent::KeepAlive => "keep-alive",
                })
                .collect::<Vec<_>>()
                .join(", ");
            status::line(Tone::Event, &format!("event: {}, {}", label, shown));
            self.stats.syncs += 1;
            self.sync.sync(Some(&self.target)).await;
        };
        live.close().await;
        Ok(end)
    }
}
