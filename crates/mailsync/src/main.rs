use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use mailsync_core::status::{self, Tone};
use mailsync_core::{Config, log_debug};

mod cli;
mod commands;

use cli::Cli;

/// Blocking IMAP calls still in flight at exit are abandoned after this.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match Config::load(cli.conf.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            status::line(Tone::Error, &err.to_string());
            std::process::exit(2);
        }
    };
    log_debug(&format!("command={:?}", cli.command));

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(commands::run_command(config, cli.command));
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    if let Err(err) = result {
        status::line(Tone::Error, &format!("{:#}", err));
        std::process::exit(1);
    }
    Ok(())
}
