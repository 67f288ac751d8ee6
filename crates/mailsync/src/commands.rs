use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value as JsonValue, json};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use mailsync_core::network;
use mailsync_core::retry::backoff;
use mailsync_core::status::{self, Tone};
use mailsync_core::{
    AccountConfig, Config, MailboxWatcher, ReconnectFlag, SyncHandler, SyncInvoker,
    SyncTarget, WatchExit, log_debug,
};
use mailsync_mail::{ImapConnector, capabilities, list_folders};
use mailsync_tmux::{Session, Supervisor, Tmux};

use crate::cli::{ClientCmd, CliCommand, DebugCmd, FullsyncCmd, IdleCmd, ListCmd};

pub(crate) const CLI_SCHEMA_VERSION: u32 = 1;

pub(crate) async fn run_command(config: Arc<Config>, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Run => run(&config).await,
        CliCommand::Idle(cmd) => idle(config, cmd).await,
        CliCommand::Client(cmd) => client(config, cmd).await,
        CliCommand::Fullsync(cmd) => fullsync(config, cmd).await,
        CliCommand::List(cmd) => list(&config, cmd).await,
        CliCommand::Debug(cmd) => debug(&config, cmd).await,
        CliCommand::Stop => {
            let supervisor = supervisor(&config);
            let session = supervisor.get_or_create_session().await?;
            supervisor.stop_all(&session).await
        }
        CliCommand::Suspend => {
            let supervisor = supervisor(&config);
            let session = supervisor.get_or_create_session().await?;
            supervisor.stop_watchers(&session).await
        }
        CliCommand::Resume => {
            let supervisor = supervisor(&config);
            let session = supervisor.get_or_create_session().await?;
            supervisor.stop_all(&session).await?;
            supervisor.launch(&session).await
        }
    }
}

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

fn program() -> String {
    std::env::current_exe()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| "mailsync".to_string())
}

fn supervisor(config: &Config) -> Supervisor<Tmux> {
    Supervisor::new(Tmux::new(), config, program())
}

async fn attach_unless_inside(supervisor: &Supervisor<Tmux>, session: &Session) -> Result<()> {
    if Tmux::inside() {
        log_debug(&format!("inside tmux, not attaching to {}", session.name));
        return Ok(());
    }
    supervisor.attach(session).await
}

/// Cancelled by the first Ctrl-C; a second one exits right away.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        status::line(Tone::Notice, "shutting down");
        trigger.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    token
}

fn reconnect_on_sigusr1(flag: ReconnectFlag) -> Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            log_debug("SIGUSR1 received");
            flag.request();
        }
    });
    Ok(())
}

fn find_account<'a>(config: &'a Config, name: &str) -> Result<&'a AccountConfig> {
    config
        .account(name)
        .ok_or_else(|| anyhow!("unknown account `{}`", name))
}

async fn run(config: &Config) -> Result<()> {
    let supervisor = supervisor(config);
    let session = supervisor.get_or_create_session().await?;
    supervisor.launch(&session).await?;
    attach_unless_inside(&supervisor, &session).await
}

async fn idle(config: Arc<Config>, cmd: IdleCmd) -> Result<()> {
    let shutdown = shutdown_on_ctrl_c();
    if !cmd.no_sync {
        SyncInvoker::new(config.clone()).sync(None).await;
    }
    let supervisor = Arc::new(supervisor(&config));
    let session = supervisor.get_or_create_session().await?;
    supervisor.spawn_watchers(&session).await?;

    let probe = network::detect().await;
    let canary = {
        let supervisor = supervisor.clone();
        let session = session.clone();
        tokio::spawn(async move {
            supervisor
                .watch_connectivity(&session, probe.as_ref(), &shutdown)
                .await
        })
    };
    if !Tmux::inside() {
        if let Err(err) = supervisor.attach(&session).await {
            status::line(Tone::Error, &format!("attach failed: {:#}", err));
        }
        if !canary.is_finished() {
            status::line(
                Tone::Notice,
                "detached, still watching the network (Ctrl-C to stop)",
            );
        }
    }
    let outcome = canary.await??;
    log_debug(&format!("canary finished: {:?}", outcome));
    Ok(())
}

async fn client(config: Arc<Config>, cmd: ClientCmd) -> Result<()> {
    let account = find_account(&config, &cmd.account)?.clone();
    let shutdown = shutdown_on_ctrl_c();
    let reconnect = ReconnectFlag::new();
    reconnect_on_sigusr1(reconnect.clone())?;

    let probe = network::detect().await;
    let sync: Arc<dyn SyncHandler> = Arc::new(SyncInvoker::new(config.clone()));
    let mut watcher = MailboxWatcher::new(
        &config,
        account,
        cmd.mailbox.as_str(),
        Arc::new(ImapConnector),
        sync,
    )
    .with_reachability(probe)
    .with_reconnect(reconnect)
    .with_shutdown(shutdown);

    // An interrupted client still waits for the poll in flight, then logs out.
    match watcher.run().await {
        WatchExit::Shutdown => Ok(()),
        WatchExit::FolderUnavailable => Err(anyhow!(
            "watcher for {}:{} stopped, fix the configuration and restart",
            cmd.account,
            cmd.mailbox
        )),
    }
}

async fn fullsync(config: Arc<Config>, cmd: FullsyncCmd) -> Result<()> {
    let target = cmd.account.as_deref().map(|account| {
        SyncTarget::new(
            config.sync_host_for(account),
            cmd.mailbox.clone().unwrap_or_default(),
        )
    });
    let invoker = SyncInvoker::new(config.clone());
    if cmd.every == 0 {
        invoker.sync(target.as_ref()).await;
        return Ok(());
    }

    let shutdown = shutdown_on_ctrl_c();
    let period = Duration::from_secs(cmd.every);
    while backoff(period, &shutdown).await {
        invoker.sync(target.as_ref()).await;
    }
    Ok(())
}

async fn list(config: &Config, cmd: ListCmd) -> Result<()> {
    let account = find_account(config, &cmd.account)?.clone();
    let password = account.credentials.resolve().await?;
    let folders =
        tokio::task::spawn_blocking(move || list_folders(&account, &password)).await??;
    if cmd.json {
        return output_ok(json!({ "account": cmd.account, "folders": folders }));
    }
    for folder in folders {
        println!("{}", folder);
    }
    Ok(())
}

async fn account_capabilities(account: &AccountConfig) -> Result<Vec<String>> {
    let password = account.credentials.resolve().await?;
    let account = account.clone();
    tokio::task::spawn_blocking(move || capabilities(&account, &password)).await?
}

async fn debug(config: &Config, cmd: DebugCmd) -> Result<()> {
    let accounts: Vec<&AccountConfig> = match cmd.account.as_deref() {
        Some(name) => vec![find_account(config, name)?],
        None => config.accounts.iter().collect(),
    };
    let mut out = Vec::with_capacity(accounts.len());
    let mut failed = 0usize;
    for account in accounts {
        match account_capabilities(account).await {
            Ok(caps) => {
                if !cmd.json {
                    println!("{} ({}): {}", account.name, account.host, caps.join(" "));
                }
                out.push(json!({ "account": account.name, "host": account.host, "capabilities": caps }));
            }
            Err(err) => {
                failed += 1;
                if !cmd.json {
                    status::line(Tone::Error, &format!("{}: {:#}", account.name, err));
                }
                out.push(json!({ "account": account.name, "host": account.host, "error": format!("{:#}", err) }));
            }
        }
    }
    if cmd.json {
        output_ok(JsonValue::Array(out))?;
    }
    if failed > 0 && cmd.account.is_some() {
        return Err(anyhow!("unable to query {}", cmd.account.unwrap_or_default()));
    }
    Ok(())
}
