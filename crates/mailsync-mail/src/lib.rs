//! IMAP side of mailsync: connections for the watchers plus the folder and
//! capability listings behind `mailsync list` / `mailsync debug`.

use std::time::Duration;

use anyhow::{Result, anyhow};
use imap::types::UnsolicitedResponse;
use imap::{ClientBuilder, ConnectionMode};

use mailsync_core::{AccountConfig, Connector, IdleSession, ServerEvent, WatchError, log_debug};

/// Text of the untagged `OK` some servers send periodically while idling.
const KEEPALIVE_TEXT: &str = "Still here";

type ImapSession = imap::Session<imap::Connection>;

pub fn imap_connect(account: &AccountConfig, password: &str) -> Result<ImapSession> {
    log_debug(&format!(
        "imap_connect start account={} host={} port={} ssl={}",
        account.name, account.host, account.port, account.ssl
    ));
    let mode = if account.ssl {
        ConnectionMode::Tls
    } else {
        ConnectionMode::Plaintext
    };
    let client = ClientBuilder::new(account.host.as_str(), account.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(mode)
        .connect()?;
    log_debug("imap_connect tcp connected");
    let session = client
        .login(&account.user, password)
        .map_err(|e| e.0)?;
    log_debug("imap_connect login ok");
    Ok(session)
}

/// Opens IDLE-ready sessions for the watchers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn open(
        &self,
        account: &AccountConfig,
        password: &str,
        mailbox: &str,
    ) -> Result<Box<dyn IdleSession>, WatchError> {
        let mut session = imap_connect(account, password)?;
        match session.select(mailbox) {
            Ok(selected) => {
                log_debug(&format!(
                    "imap_select ok account={} mailbox={} exists={}",
                    account.name, mailbox, selected.exists
                ));
                Ok(Box::new(ImapIdleSession { session }))
            }
            Err(err @ (imap::Error::No(_) | imap::Error::Bad(_))) => {
                let _ = session.logout();
                Err(WatchError::FolderSelect {
                    mailbox: mailbox.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                let _ = session.logout();
                Err(anyhow!("select {}: {}", mailbox, err).into())
            }
        }
    }
}

pub struct ImapIdleSession {
    session: ImapSession,
}

impl IdleSession for ImapIdleSession {
    /// One poll is one IDLE ... DONE exchange. The idle handle borrows the
    /// session mutably, so it cannot outlive the poll; the watcher checks
    /// shutdown, forced reconnects and renewal between polls. This costs an
    /// IDLE/DONE round trip per heartbeat (every 30 s by default).
    fn idle_check(&mut self, timeout: Duration) -> Result<Vec<ServerEvent>> {
        let mut events = Vec::new();
        // Stops at the first real change; the handle sends DONE when dropped.
        self.session
            .idle()
            .timeout(timeout)
            .keepalive(false)
            .wait_while(|response| {
                let event = server_event(&response);
                let keep_waiting = event.is_keepalive();
                events.push(event);
                keep_waiting
            })?;
        Ok(events)
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout()?;
        Ok(())
    }
}

fn server_event(response: &UnsolicitedResponse) -> ServerEvent {
    match response {
        UnsolicitedResponse::Ok { information, .. }
            if information.as_deref().map(str::trim) == Some(KEEPALIVE_TEXT) =>
        {
            ServerEvent::KeepAlive
        }
        other => ServerEvent::Changed(format!("{:?}", other)),
    }
}

/// Selectable folders on the server, in server order.
pub fn list_folders(account: &AccountConfig, password: &str) -> Result<Vec<String>> {
    let mut session = imap_connect(account, password)?;
    let names = session.list(None, Some("*"))?;
    log_debug(&format!("imap_list raw_count={}", names.len()));
    let folders = names
        .iter()
        .filter(|name| {
            !name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect))
        })
        .map(|name| name.name().to_string())
        .collect();
    let _ = session.logout();
    Ok(folders)
}

pub fn capabilities(account: &AccountConfig, password: &str) -> Result<Vec<String>> {
    let mut session = imap_connect(account, password)?;
    let caps = session.capabilities()?;
    let mut out: Vec<String> = caps.iter().map(capability_name).collect();
    let _ = session.logout();
    out.sort();
    Ok(out)
}

fn capability_name(cap: &imap_proto::Capability<'_>) -> String {
    match cap {
        imap_proto::Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        imap_proto::Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
        imap_proto::Capability::Atom(atom) => atom.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}
