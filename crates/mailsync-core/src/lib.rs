//! Configuration, sync invocation and the per-mailbox IDLE watcher.

pub mod config;
pub mod log;
pub mod network;
pub mod retry;
pub mod status;
pub mod sync;
pub mod watcher;

pub use config::{AccountConfig, Config, ConfigError, Credentials};
pub use log::{log_debug, xdg_config_dir, xdg_state_dir};
pub use network::{AlwaysReachable, CanaryOutcome, NetworkManager, Reachability, run_canary};
pub use retry::RetryPolicy;
pub use sync::{CommandRunner, ProcessRunner, SyncHandler, SyncInvoker, SyncJob, SyncTarget};
pub use watcher::{
    Connector, IdleSession, MailboxWatcher, ReconnectFlag, ServerEvent, WatchError, WatchExit,
    WatchStats,
};
