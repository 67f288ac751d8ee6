use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mailsync",
    version,
    about = "Keep local mailboxes in sync with IMAP IDLE watchers in tmux"
)]
pub(crate) struct Cli {
    /// Configuration file (default: ./mailsync.toml, then the XDG config dir)
    #[arg(long, global = true)]
    pub(crate) conf: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Start the sync session in tmux and attach to it
    Run,
    /// Sync everything, spawn the watcher panes and watch connectivity
    Idle(IdleCmd),
    /// Watch one mailbox in the foreground
    Client(ClientCmd),
    /// Sync all accounts, or one account or mailbox, once or periodically
    Fullsync(FullsyncCmd),
    /// Print the folders of an account
    List(ListCmd),
    /// Print server capabilities
    Debug(DebugCmd),
    /// Stop every pane of the session
    Stop,
    /// Stop the watchers, keeping the session's first pane
    Suspend,
    /// Restart the whole session
    Resume,
}

#[derive(Args, Debug)]
pub(crate) struct IdleCmd {
    /// Skip the initial full sync
    #[arg(long = "no-sync")]
    pub(crate) no_sync: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ClientCmd {
    pub(crate) account: String,
    #[arg(value_name = "BOX")]
    pub(crate) mailbox: String,
}

#[derive(Args, Debug)]
pub(crate) struct FullsyncCmd {
    pub(crate) account: Option<String>,
    #[arg(value_name = "BOX", requires = "account")]
    pub(crate) mailbox: Option<String>,
    /// Repeat every N seconds
    #[arg(short = 't', value_name = "SECONDS", default_value_t = 0)]
    pub(crate) every: u64,
}

#[derive(Args, Debug)]
pub(crate) struct ListCmd {
    pub(crate) account: String,
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Args, Debug)]
pub(crate) struct DebugCmd {
    pub(crate) account: Option<String>,
    #[arg(long)]
    pub(crate) json: bool,
}
