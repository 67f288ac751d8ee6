use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;

use mailsync_core::network::{CANARY_GRACE, CANARY_INTERVAL};
use mailsync_core::{CanaryOutcome, Config, Reachability, log_debug, run_canary};

use crate::{Key, Multiplexer, Session};

pub const WATCHER_LAYOUT: &str = "even-vertical";
/// Pause between interrupting the panes and closing their shells.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Lays out and tears down the mailsync panes of one multiplexer session.
pub struct Supervisor<M> {
    mux: M,
    session_name: String,
    program: String,
    conf: Option<PathBuf>,
    targets: Vec<(String, String)>,
    fullsync_interval: Option<Duration>,
}

impl<M: Multiplexer> Supervisor<M> {
    /// `program` is what the panes type to re-enter mailsync, normally
    /// `argv[0]`.
    pub fn new(mux: M, config: &Config, program: impl Into<String>) -> Self {
        Self {
            mux,
            session_name: config.session_name.clone(),
            program: program.into(),
            conf: config.source.clone(),
            targets: config
                .watch_targets()
                .into_iter()
                .map(|(account, mailbox)| (account.name.clone(), mailbox.to_string()))
                .collect(),
            fullsync_interval: config.fullsync_interval,
        }
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    fn command(&self, args: &[&str]) -> String {
        let mut argv = vec![self.program.clone()];
        if let Some(conf) = &self.conf {
            argv.push("--conf".to_string());
            argv.push(conf.display().to_string());
        }
        argv.extend(args.iter().map(|arg| arg.to_string()));
        shell_words::join(argv)
    }

    pub fn client_command(&self, account: &str, mailbox: &str) -> String {
        self.command(&["client", account, mailbox])
    }

    pub fn fullsync_command(&self, interval: Duration) -> String {
        self.command(&["fullsync", "-t", &interval.as_secs().to_string()])
    }

    pub fn launch_command(&self) -> String {
        // The full sync already ran, so the launcher skips its own.
        format!(
            "{}; {}",
            self.command(&["fullsync"]),
            self.command(&["idle", "--no-sync"])
        )
    }

    pub async fn get_or_create_session(&self) -> Result<Session> {
        if !self.mux.has_session(&self.session_name).await? {
            log_debug(&format!("creating session {}", self.session_name));
            self.mux.new_session(&self.session_name).await?;
        }
        Ok(Session {
            name: self.session_name.clone(),
        })
    }

    async fn first_window(&self, session: &Session) -> Result<String> {
        self.mux
            .list_windows(&session.name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("session {} has no window", session.name))
    }

    async fn first_pane(&self, window: &str) -> Result<String> {
        self.mux
            .list_panes(window)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("window {} has no pane", window))
    }

    async fn start_in(&self, window: &str, pane: &str, line: &str) -> Result<()> {
        self.mux.select_layout(window, WATCHER_LAYOUT).await?;
        self.mux.clear(pane).await?;
        self.mux.send_line(pane, line).await
    }

    /// Starts one watcher pane per configured mailbox in the first window,
    /// plus the periodic full-sync pane. The first watcher reuses the first
    /// pane unless that is where the caller itself runs.
    pub async fn spawn_watchers(&self, session: &Session) -> Result<()> {
        let window = self.first_window(session).await?;
        let first = self.first_pane(&window).await?;
        let own_pane = self.mux.current_pane();
        let mut reusable = (own_pane.as_deref() != Some(first.as_str())).then_some(first);
        for (account, mailbox) in &self.targets {
            let pane = match reusable.take() {
                Some(pane) => pane,
                None => self.mux.split_window(&window).await?,
            };
            log_debug(&format!("watcher pane={} {}:{}", pane, account, mailbox));
            self.start_in(&window, &pane, &self.client_command(account, mailbox))
                .await?;
        }
        if let Some(interval) = self.fullsync_interval {
            let pane = self.mux.split_window(&window).await?;
            log_debug(&format!("fullsync pane={} every {:?}", pane, interval));
            self.start_in(&window, &pane, &self.fullsync_command(interval))
                .await?;
        }
        Ok(())
    }

    /// Interrupts and closes every pane except each window's first one.
    /// Returns the last window seen.
    async fn stop_secondary_panes(&self, session: &Session) -> Result<Option<String>> {
        let windows = self.mux.list_windows(&session.name).await?;
        for window in &windows {
            for pane in self.mux.list_panes(window).await?.iter().skip(1) {
                self.mux.send_key(pane, Key::CtrlC).await?;
            }
            tokio::time::sleep(STOP_GRACE).await;
            for pane in self.mux.list_panes(window).await?.iter().skip(1) {
                self.mux.send_key(pane, Key::CtrlD).await?;
            }
        }
        Ok(windows.last().cloned())
    }

    /// Stops the watchers and interrupts whatever runs in the first pane.
    pub async fn stop_all(&self, session: &Session) -> Result<()> {
        if let Some(window) = self.stop_secondary_panes(session).await? {
            let pane = self.first_pane(&window).await?;
            self.mux.send_key(&pane, Key::CtrlC).await?;
        }
        Ok(())
    }

    /// Stops the watchers, leaving the first pane alone.
    pub async fn stop_watchers(&self, session: &Session) -> Result<()> {
        self.stop_secondary_panes(session).await?;
        Ok(())
    }

    /// Starts the full sync followed by the idle launcher in the first pane.
    pub async fn launch(&self, session: &Session) -> Result<()> {
        let window = self.first_window(session).await?;
        let pane = self.first_pane(&window).await?;
        self.mux.send_line(&pane, &self.launch_command()).await
    }

    /// Stops everything and relaunches from the first pane. When the caller
    /// runs in the first pane it is left alone and only the watchers go.
    pub async fn restart(&self, session: &Session) -> Result<()> {
        let window = self.first_window(session).await?;
        let first = self.first_pane(&window).await?;
        self.stop_secondary_panes(session).await?;
        if self.mux.current_pane().as_deref() != Some(first.as_str()) {
            // A watcher sits in the first pane; the launch line would queue behind it.
            self.mux.send_key(&first, Key::CtrlC).await?;
        }
        self.launch(session).await
    }

    /// Runs the connectivity canary until shutdown or until the network
    /// drops, in which case the whole session is restarted.
    pub async fn watch_connectivity(
        &self,
        session: &Session,
        probe: &dyn Reachability,
        shutdown: &CancellationToken,
    ) -> Result<CanaryOutcome> {
        let outcome = run_canary(probe, CANARY_INTERVAL, CANARY_GRACE, shutdown).await;
        if outcome == CanaryOutcome::ConnectivityLost {
            log_debug(&format!("restarting session {}", session.name));
            self.restart(session).await?;
        }
        Ok(outcome)
    }

    pub async fn attach(&self, session: &Session) -> Result<()> {
        self.mux.attach(&session.name).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use mailsync_core::{CanaryOutcome, Config, Reachability};
    use tokio_util::sync::CancellationToken;

    use super::{STOP_GRACE, Supervisor};
    use crate::{Key, Multiplexer};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        NewSession(String),
        Split(String),
        Layout(String),
        Clear(String),
        Line(String, String),
        Key(String, Key),
        Attach(String),
    }

    /// In-memory multiplexer: session name -> windows -> pane ids.
    #[derive(Default)]
    struct FakeMux {
        sessions: Mutex<BTreeMap<String, Vec<(String, Vec<String>)>>>,
        next_id: Mutex<usize>,
        calls: Mutex<Vec<Call>>,
        own_pane: Option<String>,
    }

    impl FakeMux {
        fn id(&self, prefix: char) -> String {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("{}{}", prefix, next)
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn lines(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Line(pane, line) => Some((pane, line)),
                    _ => None,
                })
                .collect()
        }

        fn with_window(&self, session: &str, panes: usize) {
            let window = self.id('@');
            let panes = (0..panes).map(|_| self.id('%')).collect();
            self.sessions
                .lock()
                .unwrap()
                .entry(session.to_string())
                .or_default()
                .push((window, panes));
        }
    }

    #[async_trait]
    impl Multiplexer for FakeMux {
        async fn has_session(&self, name: &str) -> Result<bool> {
            Ok(self.sessions.lock().unwrap().contains_key(name))
        }

        async fn new_session(&self, name: &str) -> Result<()> {
            self.record(Call::NewSession(name.to_string()));
            self.with_window(name, 1);
            Ok(())
        }

        async fn list_windows(&self, session: &str) -> Result<Vec<String>> {
            let sessions = self.sessions.lock().unwrap();
            let windows = sessions
                .get(session)
                .ok_or_else(|| anyhow!("no session {}", session))?;
            Ok(windows.iter().map(|(id, _)| id.clone()).collect())
        }

        async fn list_panes(&self, window: &str) -> Result<Vec<String>> {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .flatten()
                .find(|(id, _)| id == window)
                .map(|(_, panes)| panes.clone())
                .ok_or_else(|| anyhow!("no window {}", window))
        }

        async fn split_window(&self, window: &str) -> Result<String> {
            let pane = self.id('%');
            let mut sessions = self.sessions.lock().unwrap();
            let (_, panes) = sessions
                .values_mut()
                .flatten()
                .find(|(id, _)| id == window)
                .ok_or_else(|| anyhow!("no window {}", window))?;
            panes.push(pane.clone());
            drop(sessions);
            self.record(Call::Split(window.to_string()));
            Ok(pane)
        }

        async fn select_layout(&self, window: &str, layout: &str) -> Result<()> {
            assert_eq!(layout, "even-vertical");
            self.record(Call::Layout(window.to_string()));
            Ok(())
        }

        async fn send_line(&self, pane: &str, line: &str) -> Result<()> {
            self.record(Call::Line(pane.to_string(), line.to_string()));
            Ok(())
        }

        async fn send_key(&self, pane: &str, key: Key) -> Result<()> {
            self.record(Call::Key(pane.to_string(), key));
            Ok(())
        }

        async fn clear(&self, pane: &str) -> Result<()> {
            self.record(Call::Clear(pane.to_string()));
            Ok(())
        }

        async fn attach(&self, session: &str) -> Result<()> {
            self.record(Call::Attach(session.to_string()));
            Ok(())
        }

        fn current_pane(&self) -> Option<String> {
            self.own_pane.clone()
        }
    }

    /// Replays reachability readings, repeating the last one.
    struct ScriptedNetwork(Mutex<VecDeque<bool>>);

    impl ScriptedNetwork {
        fn new(states: &[bool]) -> Self {
            Self(Mutex::new(states.iter().copied().collect()))
        }
    }

    #[async_trait]
    impl Reachability for ScriptedNetwork {
        async fn is_reachable(&self) -> bool {
            let mut states = self.0.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().unwrap_or(true)
            } else {
                states.front().copied().unwrap_or(true)
            }
        }
    }

    fn config(extra: &str) -> Config {
        let doc = format!(
            r#"
sync_command = "mbsync"
{}

[accounts.work]
host = "imap.work.example"
user = "me"
pass = "x"
local = "work"
boxes = ["INBOX", "Sent"]

[accounts.home]
host = "imap.home.example"
user = "me"
pass = "y"
local = "home"
boxes = ["INBOX"]
"#,
            extra
        );
        let mut config = Config::from_toml(&doc).unwrap();
        config.source = Some(PathBuf::from("/etc/mail sync.toml"));
        config
    }

    #[tokio::test]
    async fn session_is_created_once() {
        let supervisor = Supervisor::new(FakeMux::default(), &config(""), "mailsync");
        let first = supervisor.get_or_create_session().await.unwrap();
        let second = supervisor.get_or_create_session().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "mailsync");
        let created = supervisor
            .multiplexer()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::NewSession(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn spawns_one_pane_per_mailbox_plus_fullsync() {
        let supervisor = Supervisor::new(
            FakeMux::default(),
            &config("fullsync_interval = 900\nsession_name = \"mail\""),
            "mailsync",
        );
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();

        let mux = supervisor.multiplexer();
        let window = mux.list_windows("mail").await.unwrap().remove(0);
        let panes = mux.list_panes(&window).await.unwrap();
        assert_eq!(panes.len(), 4);

        let lines = mux.lines();
        let conf = "'/etc/mail sync.toml'";
        assert_eq!(
            lines,
            vec![
                (panes[0].clone(), format!("mailsync --conf {} client home INBOX", conf)),
                (panes[1].clone(), format!("mailsync --conf {} client work INBOX", conf)),
                (panes[2].clone(), format!("mailsync --conf {} client work Sent", conf)),
                (panes[3].clone(), format!("mailsync --conf {} fullsync -t 900", conf)),
            ]
        );
        let calls = mux.calls();
        let splits = calls.iter().filter(|c| matches!(c, Call::Split(_))).count();
        let layouts = calls.iter().filter(|c| matches!(c, Call::Layout(_))).count();
        let clears = calls.iter().filter(|c| matches!(c, Call::Clear(_))).count();
        assert_eq!((splits, layouts, clears), (3, 4, 4));
    }

    #[tokio::test]
    async fn no_fullsync_pane_without_interval() {
        let supervisor = Supervisor::new(FakeMux::default(), &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();

        let lines = supervisor.multiplexer().lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|(_, line)| line.contains(" client ")));
    }

    #[tokio::test]
    async fn launcher_pane_is_not_reused() {
        let mut mux = FakeMux::default();
        mux.with_window("mailsync", 1);
        mux.own_pane = Some("%2".to_string());
        let supervisor = Supervisor::new(mux, &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();

        let lines = supervisor.multiplexer().lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|(pane, _)| pane != "%2"));
        let splits = supervisor
            .multiplexer()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Split(_)))
            .count();
        assert_eq!(splits, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_interrupts_then_closes_then_stops_first_pane() {
        let mux = FakeMux::default();
        mux.with_window("mailsync", 3);
        let supervisor = Supervisor::new(mux, &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        let window = supervisor.first_window(&session).await.unwrap();
        let panes = supervisor.multiplexer().list_panes(&window).await.unwrap();

        let started = tokio::time::Instant::now();
        supervisor.stop_all(&session).await.unwrap();
        assert_eq!(started.elapsed(), STOP_GRACE);

        assert_eq!(
            supervisor.multiplexer().calls(),
            vec![
                Call::Key(panes[1].clone(), Key::CtrlC),
                Call::Key(panes[2].clone(), Key::CtrlC),
                Call::Key(panes[1].clone(), Key::CtrlD),
                Call::Key(panes[2].clone(), Key::CtrlD),
                Call::Key(panes[0].clone(), Key::CtrlC),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watchers_leaves_first_pane_running() {
        let mux = FakeMux::default();
        mux.with_window("mailsync", 2);
        mux.with_window("mailsync", 2);
        let supervisor = Supervisor::new(mux, &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();

        let started = tokio::time::Instant::now();
        supervisor.stop_watchers(&session).await.unwrap();
        assert_eq!(started.elapsed(), STOP_GRACE * 2);

        let calls = supervisor.multiplexer().calls();
        assert_eq!(calls.len(), 4);
        let windows = supervisor.multiplexer().list_windows("mailsync").await.unwrap();
        for window in windows {
            let first = supervisor.first_pane(&window).await.unwrap();
            assert!(!calls.iter().any(|c| matches!(c, Call::Key(p, _) if *p == first)));
        }
    }

    #[tokio::test]
    async fn launch_types_fullsync_then_idle_in_first_pane() {
        let supervisor = Supervisor::new(FakeMux::default(), &config(""), "/usr/bin/mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.launch(&session).await.unwrap();
        supervisor.attach(&session).await.unwrap();

        let calls = supervisor.multiplexer().calls();
        let conf = "'/etc/mail sync.toml'";
        assert_eq!(
            calls[1..],
            [
                Call::Line(
                    "%2".to_string(),
                    format!(
                        "/usr/bin/mailsync --conf {0} fullsync; /usr/bin/mailsync --conf {0} idle --no-sync",
                        conf
                    )
                ),
                Call::Attach("mailsync".to_string()),
            ]
        );
    }

    #[test]
    fn commands_omit_conf_when_config_has_no_file() {
        let mut config = config("");
        config.source = None;
        let supervisor = Supervisor::new(FakeMux::default(), &config, "mailsync");
        assert_eq!(supervisor.client_command("work", "My Box"), "mailsync client work 'My Box'");
        assert_eq!(
            supervisor.fullsync_command(Duration::from_secs(60)),
            "mailsync fullsync -t 60"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restart_interrupts_watcher_in_first_pane_before_launching() {
        let supervisor = Supervisor::new(FakeMux::default(), &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();
        let before = supervisor.multiplexer().calls().len();

        supervisor.restart(&session).await.unwrap();

        let calls = supervisor.multiplexer().calls()[before..].to_vec();
        let first = "%2".to_string();
        assert!(matches!(&calls[0], Call::Key(pane, Key::CtrlC) if *pane != first));
        let interrupt = calls
            .iter()
            .position(|c| *c == Call::Key(first.clone(), Key::CtrlC))
            .expect("first pane interrupted");
        let relaunch = calls
            .iter()
            .position(|c| matches!(c, Call::Line(pane, line) if *pane == first && line.ends_with("idle --no-sync")))
            .expect("first pane relaunched");
        assert!(interrupt < relaunch);
        assert_eq!(relaunch, calls.len() - 1);
        let closed = calls
            .iter()
            .filter(|c| matches!(c, Call::Key(_, Key::CtrlD)))
            .count();
        assert_eq!(closed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_first_pane_leaves_it_running() {
        let mut mux = FakeMux::default();
        mux.with_window("mailsync", 1);
        mux.own_pane = Some("%2".to_string());
        let supervisor = Supervisor::new(mux, &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();
        let before = supervisor.multiplexer().calls().len();

        supervisor.restart(&session).await.unwrap();

        let calls = supervisor.multiplexer().calls()[before..].to_vec();
        assert!(!calls.iter().any(|c| matches!(c, Call::Key(pane, _) if pane == "%2")));
        let keys = calls.iter().filter(|c| matches!(c, Call::Key(_, _))).count();
        assert_eq!(keys, 6);
        assert!(matches!(calls.last(), Some(Call::Line(pane, _)) if pane == "%2"));
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_watch_outlives_attach_and_restarts() {
        let supervisor = Arc::new(Supervisor::new(FakeMux::default(), &config(""), "mailsync"));
        let session = supervisor.get_or_create_session().await.unwrap();
        supervisor.spawn_watchers(&session).await.unwrap();
        let shutdown = CancellationToken::new();

        let canary = {
            let supervisor = supervisor.clone();
            let session = session.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let network = ScriptedNetwork::new(&[true, true, false]);
                supervisor
                    .watch_connectivity(&session, &network, &shutdown)
                    .await
            })
        };
        supervisor.attach(&session).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = canary.await.unwrap().unwrap();
        assert_eq!(outcome, CanaryOutcome::ConnectivityLost);
        assert!(started.elapsed() >= Duration::from_secs(22));

        let calls = supervisor.multiplexer().calls();
        let attach = calls
            .iter()
            .position(|c| matches!(c, Call::Attach(_)))
            .unwrap();
        assert!(matches!(
            calls.last(),
            Some(Call::Line(pane, line)) if pane == "%2" && line.ends_with("idle --no-sync")
        ));
        assert!(attach < calls.len() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_watch_stops_on_shutdown() {
        let supervisor = Supervisor::new(FakeMux::default(), &config(""), "mailsync");
        let session = supervisor.get_or_create_session().await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let network = ScriptedNetwork::new(&[false]);
        let outcome = supervisor
            .watch_connectivity(&session, &network, &shutdown)
            .await
            .unwrap();
        assert_eq!(outcome, CanaryOutcome::Stopped);
        assert!(supervisor.multiplexer().lines().is_empty());
    }
}
