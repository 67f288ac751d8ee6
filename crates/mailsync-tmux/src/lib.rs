//! Terminal multiplexer plumbing: a small `Multiplexer` seam, the tmux CLI
//! backend and the supervisor that lays watcher panes out in a session.

mod supervisor;
mod tmux;

use anyhow::Result;
use async_trait::async_trait;

pub use supervisor::{STOP_GRACE, Supervisor, WATCHER_LAYOUT};
pub use tmux::Tmux;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    CtrlC,
    CtrlD,
}

impl Key {
    pub fn tmux_name(self) -> &'static str {
        match self {
            Key::CtrlC => "C-c",
            Key::CtrlD => "C-d",
        }
    }
}

/// The operations the supervisor needs from a multiplexer. Windows and panes
/// are addressed by the ids the multiplexer hands out.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn has_session(&self, name: &str) -> Result<bool>;
    async fn new_session(&self, name: &str) -> Result<()>;
    async fn list_windows(&self, session: &str) -> Result<Vec<String>>;
    async fn list_panes(&self, window: &str) -> Result<Vec<String>>;
    /// Splits `window` and returns the new pane.
    async fn split_window(&self, window: &str) -> Result<String>;
    async fn select_layout(&self, window: &str, layout: &str) -> Result<()>;
    /// Types `line` into the pane and presses Enter.
    async fn send_line(&self, pane: &str, line: &str) -> Result<()>;
    async fn send_key(&self, pane: &str, key: Key) -> Result<()>;
    async fn clear(&self, pane: &str) -> Result<()>;
    async fn attach(&self, session: &str) -> Result<()>;
    /// The pane this process runs in, if any.
    fn current_pane(&self) -> Option<String>;
}
