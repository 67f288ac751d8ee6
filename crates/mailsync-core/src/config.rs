//! Typed configuration, validated once at startup and shared read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use thiserror::Error;

use crate::log::{log_debug, xdg_config_dir};
use crate::retry::RetryPolicy;

pub const DEFAULT_SESSION_NAME: &str = "mailsync";
pub const DEFAULT_RENEW_AFTER: u32 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (tried {tried})")]
    NotFound { tried: String },
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {origin}: {source}")]
    Syntax {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    sync_command: String,
    #[serde(default)]
    post_sync: Vec<String>,
    accounts: BTreeMap<String, RawAccount>,
    fullsync_interval: Option<u64>,
    sync_timeout: Option<u64>,
    retry_delay: Option<u64>,
    retry_max_delay: Option<u64>,
    retry_jitter: Option<u64>,
    renew_after: Option<u32>,
    session_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccount {
    host: String,
    port: Option<u16>,
    user: String,
    pass: Option<String>,
    pass_cmd: Option<String>,
    #[serde(default = "default_ssl")]
    ssl: bool,
    local: String,
    boxes: Vec<String>,
}

fn default_ssl() -> bool {
    true
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    /// Shell command printing the password on stdout.
    Command(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
        }
    }
}

impl Credentials {
    /// Returns the current password. Lookup commands run on every call since
    /// the secret behind them may have rotated.
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Credentials::Password(pass) => Ok(pass.clone()),
            Credentials::Command(cmd) => {
                log_debug(&format!("credentials lookup cmd={}", cmd));
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .stdin(std::process::Stdio::null())
                    .stderr(std::process::Stdio::inherit())
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(anyhow!(
                        "password command `{}` failed with {}",
                        cmd,
                        output.status
                    ));
                }
                let pass = String::from_utf8(output.stdout)
                    .map_err(|_| anyhow!("password command `{}` printed invalid UTF-8", cmd))?;
                Ok(pass.trim().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    pub ssl: bool,
    /// Identifier the sync command knows this account by (`local:box`).
    pub local: String,
    pub boxes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sync_command: Vec<String>,
    pub post_sync: Vec<String>,
    pub accounts: Vec<AccountConfig>,
    pub fullsync_interval: Option<Duration>,
    pub sync_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub renew_after: u32,
    pub session_name: String,
    /// File the configuration was read from, handed on to spawned panes.
    pub source: Option<PathBuf>,
}

pub fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailsync.toml"),
        xdg_config_dir().join("mailsync").join("mailsync.toml"),
    ]
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates = match path {
            Some(path) => vec![path.to_path_buf()],
            None => config_path_candidates(),
        };
        let Some(found) = candidates.iter().find(|p| path.is_some() || p.is_file()) else {
            let tried = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::NotFound { tried });
        };
        let text = std::fs::read_to_string(found).map_err(|source| ConfigError::Read {
            path: found.clone(),
            source,
        })?;
        let source = std::fs::canonicalize(found).unwrap_or_else(|_| found.clone());
        log_debug(&format!("config load path={}", source.display()));
        let mut config = Self::parse(&text, &source.display().to_string())?;
        config.source = Some(source);
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<inline>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Syntax {
            origin: origin.to_string(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let sync_command = split_command("sync_command", &raw.sync_command)?;
        if sync_command.is_empty() {
            return Err(ConfigError::Invalid("sync_command is empty".to_string()));
        }
        for template in &raw.post_sync {
            let rendered = render_template(template, "host", "box");
            if split_command("post_sync", &rendered)?.is_empty() {
                return Err(ConfigError::Invalid(
                    "post_sync contains an empty command".to_string(),
                ));
            }
        }
        if raw.accounts.is_empty() {
            return Err(ConfigError::Invalid("no accounts configured".to_string()));
        }
        let mut accounts = Vec::with_capacity(raw.accounts.len());
        for (name, acct) in raw.accounts {
            accounts.push(validate_account(name, acct)?);
        }

        let base = Duration::from_secs(raw.retry_delay.unwrap_or(5));
        let max = raw
            .retry_max_delay
            .map(Duration::from_secs)
            .unwrap_or(base)
            .max(base);
        let retry = RetryPolicy {
            base,
            max,
            jitter: Duration::from_secs(raw.retry_jitter.unwrap_or(0)),
        };
        let renew_after = raw.renew_after.unwrap_or(DEFAULT_RENEW_AFTER);
        if renew_after == 0 {
            return Err(ConfigError::Invalid(
                "renew_after must be at least 1".to_string(),
            ));
        }
        let session_name = raw
            .session_name
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string());
        if session_name.trim().is_empty() {
            return Err(ConfigError::Invalid("session_name is empty".to_string()));
        }

        Ok(Config {
            sync_command,
            post_sync: raw.post_sync,
            accounts,
            fullsync_interval: raw
                .fullsync_interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            sync_timeout: raw
                .sync_timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            retry,
            renew_after,
            session_name,
            source: None,
        })
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|acct| acct.name == name)
    }

    /// Every (account, box) pair that gets a watcher, in pane order.
    pub fn watch_targets(&self) -> Vec<(&AccountConfig, &str)> {
        self.accounts
            .iter()
            .flat_map(|acct| acct.boxes.iter().map(move |b| (acct, b.as_str())))
            .collect()
    }

    /// Maps an account name to the identifier the sync command expects;
    /// anything else is passed through untouched.
    pub fn sync_host_for(&self, account_or_host: &str) -> String {
        self.account(account_or_host)
            .map(|acct| acct.local.clone())
            .unwrap_or_else(|| account_or_host.to_string())
    }
}

fn validate_account(name: String, acct: RawAccount) -> Result<AccountConfig, ConfigError> {
    let invalid = |what: &str| ConfigError::Invalid(format!("account `{}`: {}", name, what));
    if acct.host.trim().is_empty() {
        return Err(invalid("host is empty"));
    }
    if acct.user.trim().is_empty() {
        return Err(invalid("user is empty"));
    }
    if acct.local.trim().is_empty() {
        return Err(invalid("local is empty"));
    }
    if acct.boxes.is_empty() {
        return Err(invalid("boxes is empty"));
    }
    if acct.boxes.iter().any(|b| b.trim().is_empty()) {
        return Err(invalid("boxes contains an empty name"));
    }
    let credentials = match (acct.pass, acct.pass_cmd) {
        (Some(pass), None) => Credentials::Password(pass),
        (None, Some(cmd)) if !cmd.trim().is_empty() => Credentials::Command(cmd),
        (None, Some(_)) => return Err(invalid("pass_cmd is empty")),
        (Some(_), Some(_)) => return Err(invalid("set either pass or pass_cmd, not both")),
        (None, None) => return Err(invalid("one of pass or pass_cmd is required")),
    };
    let port = acct.port.unwrap_or(if acct.ssl { 993 } else { 143 });
    Ok(AccountConfig {
        name,
        host: acct.host,
        port,
        user: acct.user,
        credentials,
        ssl: acct.ssl,
        local: acct.local,
        boxes: acct.boxes,
    })
}

fn split_command(key: &str, raw: &str) -> Result<Vec<String>, ConfigError> {
    shell_words::split(raw)
        .map_err(|e| ConfigError::Invalid(format!("{} `{}`: {}", key, raw, e)))
}

/// Substitutes `{host}` and `{box}` in a post-sync template.
pub fn render_template(template: &str, host: &str, mailbox: &str) -> String {
    template.replace("{host}", host).replace("{box}", mailbox)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Config, ConfigError, Credentials, render_template};

    const SAMPLE: &str = r#"
sync_command = "mbsync -c '~/.mbsyncrc'"
post_sync = ["notmuch new", "notify-send mail '{host}:{box}'"]
fullsync_interval = 900
sync_timeout = 120

[accounts.work]
host = "imap.work.example"
user = "me@work.example"
pass_cmd = "pass show mail/work"
local = "work"
boxes = ["INBOX", "Sent"]

[accounts.home]
host = "imap.home.example"
user = "me"
pass = "hunter2"
ssl = false
local = "home"
boxes = ["INBOX"]
"#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.sync_command, vec!["mbsync", "-c", "~/.mbsyncrc"]);
        assert_eq!(config.post_sync.len(), 2);
        assert_eq!(config.fullsync_interval, Some(Duration::from_secs(900)));
        assert_eq!(config.sync_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.renew_after, 600);
        assert_eq!(config.session_name, "mailsync");

        let work = config.account("work").unwrap();
        assert_eq!(work.port, 993);
        assert!(work.ssl);
        assert_eq!(
            work.credentials,
            Credentials::Command("pass show mail/work".to_string())
        );
        let home = config.account("home").unwrap();
        assert_eq!(home.port, 143);
        assert_eq!(home.credentials, Credentials::Password("hunter2".to_string()));
    }

    #[test]
    fn watch_targets_cover_every_box() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let targets: Vec<(String, String)> = config
            .watch_targets()
            .into_iter()
            .map(|(acct, b)| (acct.name.clone(), b.to_string()))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("home".to_string(), "INBOX".to_string()),
                ("work".to_string(), "INBOX".to_string()),
                ("work".to_string(), "Sent".to_string()),
            ]
        );
    }

    #[test]
    fn zero_intervals_are_treated_as_unset() {
        let doc = SAMPLE
            .replace("fullsync_interval = 900", "fullsync_interval = 0")
            .replace("sync_timeout = 120", "sync_timeout = 0");
        let config = Config::from_toml(&doc).unwrap();
        assert_eq!(config.fullsync_interval, None);
        assert_eq!(config.sync_timeout, None);
    }

    #[test]
    fn rejects_both_password_sources() {
        let doc = SAMPLE.replace("pass = \"hunter2\"", "pass = \"x\"\npass_cmd = \"y\"");
        let err = Config::from_toml(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("home"));
    }

    #[test]
    fn rejects_missing_password() {
        let doc = SAMPLE.replace("pass = \"hunter2\"\n", "");
        let err = Config::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("pass or pass_cmd"));
    }

    #[test]
    fn rejects_account_without_boxes() {
        let doc = SAMPLE.replace("boxes = [\"INBOX\"]\n", "boxes = []\n");
        let err = Config::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("boxes is empty"));
    }

    #[test]
    fn rejects_missing_sync_command_and_unknown_keys() {
        let doc = SAMPLE.replace("sync_command = \"mbsync -c '~/.mbsyncrc'\"", "");
        assert!(matches!(
            Config::from_toml(&doc).unwrap_err(),
            ConfigError::Syntax { .. }
        ));
        let doc = format!("bogus = 1\n{}", SAMPLE);
        assert!(matches!(
            Config::from_toml(&doc).unwrap_err(),
            ConfigError::Syntax { .. }
        ));
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        let doc = SAMPLE.replace("\"notmuch new\"", "\"notmuch 'new\"");
        let err = Config::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("post_sync"));
    }

    #[test]
    fn retry_defaults_to_fixed_five_seconds() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.retry.base, Duration::from_secs(5));
        assert_eq!(config.retry.max, Duration::from_secs(5));
        assert_eq!(config.retry.jitter, Duration::ZERO);
    }

    #[test]
    fn sync_host_maps_account_names_to_local_ids() {
        let doc = SAMPLE.replace("local = \"work\"", "local = \"work-channel\"");
        let config = Config::from_toml(&doc).unwrap();
        assert_eq!(config.sync_host_for("work"), "work-channel");
        assert_eq!(config.sync_host_for("other"), "other");
    }

    #[test]
    fn render_template_substitutes_placeholders() {
        assert_eq!(
            render_template("notify {host}:{box} {box}", "work", "INBOX"),
            "notify work:INBOX INBOX"
        );
        assert_eq!(render_template("notmuch new", "", ""), "notmuch new");
    }

    #[test]
    fn debug_output_hides_literal_password() {
        let shown = format!("{:?}", Credentials::Password("hunter2".to_string()));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn password_command_output_is_trimmed() {
        let creds = Credentials::Command("printf '  s3cret\\n'".to_string());
        assert_eq!(creds.resolve().await.unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn failing_password_command_is_an_error() {
        let creds = Credentials::Command("exit 3".to_string());
        assert!(creds.resolve().await.is_err());
    }

    #[test]
    fn load_reads_explicit_path_and_records_it() {
        let dir = std::env::temp_dir().join(format!("mailsync-conf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mailsync.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(config.accounts.len(), 2);
        let source = config.source.unwrap();
        assert!(source.is_absolute());
        assert!(source.ends_with("mailsync.toml"));
    }

    #[test]
    fn load_of_missing_explicit_path_is_a_read_error() {
        let err = Config::load(Some(std::path::Path::new("/nonexistent/mailsync.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
