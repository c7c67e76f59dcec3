//! Session state machine
//!
//! The session actor is the sole owner and mutator of the one permitted
//! session. All requests (connect, disconnect, reset) and all internal
//! notifications (attempt outcomes, tunnel crashes, grant renewal
//! failures) are serialized through its command loop, so transitions
//! can never race. Every transition is published exactly once to the
//! status hub.
//!
//! A connect attempt (rank, grant acquisition, process start) runs as a
//! spawned task holding a `CancellationToken`, which keeps the actor
//! responsive: a disconnect arriving mid-attempt cancels the token and
//! the attempt confirms cleanup of whatever it had acquired before the
//! session settles at Disconnected. The process-start step itself is
//! never cancelled mid-flight (dropping it could orphan an elevated
//! process); cancellation during that step is honored immediately
//! after, by tearing the fresh tunnel back down.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tw_core::error::{EngineError, GrantError, SessionError};
use tw_core::ipc::StatusMessage;
use tw_core::types::{Credentials, Host, SessionSnapshot, SessionState, TargetSpec};

use crate::broker::CredentialBroker;
use crate::directory::HostDirectory;
use crate::hub::StatusHub;
use crate::supervisor::{Supervisor, TunnelHandle};

/// How long shutdown waits for an in-flight attempt to confirm cleanup
const SHUTDOWN_ATTEMPT_GRACE: Duration = Duration::from_secs(60);

/// Requests accepted by the session actor
enum Command {
    Connect {
        target: TargetSpec,
        credentials: Option<Credentials>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of one connect attempt
enum AttemptOutcome {
    /// Tunnel is up
    Ready { host: Host, handle: TunnelHandle },
    /// Attempt failed; partial resources already released
    Failed(EngineError),
    /// Attempt was cancelled; partial resources already released
    Cancelled,
}

struct CrashNotice {
    pid: u32,
    code: Option<i32>,
}

/// Cloneable handle for talking to the session actor
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Request a tunnel to the given target. `Ok` means the request was
    /// accepted and the attempt is in flight; the outcome is observed
    /// through the status hub.
    pub async fn connect(
        &self,
        target: TargetSpec,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect {
            target,
            credentials,
            reply,
        })
        .await?
    }

    /// Tear down the active tunnel, or cancel an in-flight connect.
    /// Resolves once the session has settled at Disconnected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Acknowledge a terminal error, returning to Disconnected
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    /// Current session state
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Run the ordered shutdown sequence and stop the actor
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::EngineStopped)?;
        reply_rx.await.map_err(|_| SessionError::EngineStopped)
    }
}

/// Factory for the session actor
pub struct SessionManager;

impl SessionManager {
    /// Spawn the actor and return a handle to it.
    ///
    /// `grant_failures` is the receiver paired with `broker`; renewal
    /// failures arriving on it become Error transitions.
    pub fn spawn(
        directory: Arc<HostDirectory>,
        broker: Arc<CredentialBroker>,
        grant_failures: mpsc::Receiver<GrantError>,
        supervisor: Arc<dyn Supervisor>,
        hub: Arc<StatusHub>,
        fallback_credentials: Option<Credentials>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let (crash_tx, crash_rx) = mpsc::channel(4);

        let actor = SessionActor {
            state: SessionState::Disconnected,
            host: None,
            started_at: None,
            last_error: None,
            tunnel: None,
            attempt_token: None,
            pending_disconnect: None,
            pending_grant_failure: None,
            directory,
            broker,
            supervisor,
            hub,
            fallback_credentials,
            outcome_tx,
            crash_tx,
        };

        let task = tokio::spawn(actor.run(cmd_rx, outcome_rx, grant_failures, crash_rx));
        (SessionHandle { tx: cmd_tx }, task)
    }
}

struct SessionActor {
    state: SessionState,
    host: Option<Host>,
    started_at: Option<SystemTime>,
    last_error: Option<String>,
    tunnel: Option<TunnelHandle>,
    attempt_token: Option<CancellationToken>,
    pending_disconnect: Option<oneshot::Sender<Result<(), SessionError>>>,
    /// Renewal failure that arrived while an attempt was in flight
    pending_grant_failure: Option<String>,

    directory: Arc<HostDirectory>,
    broker: Arc<CredentialBroker>,
    supervisor: Arc<dyn Supervisor>,
    hub: Arc<StatusHub>,
    fallback_credentials: Option<Credentials>,

    // senders kept alive here so the receivers below never yield a
    // spurious close
    outcome_tx: mpsc::Sender<AttemptOutcome>,
    crash_tx: mpsc::Sender<CrashNotice>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut outcome_rx: mpsc::Receiver<AttemptOutcome>,
        mut grant_rx: mpsc::Receiver<GrantError>,
        mut crash_rx: mpsc::Receiver<CrashNotice>,
    ) {
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown(&mut outcome_rx).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown(&mut outcome_rx).await;
                        break;
                    }
                },
                Some(outcome) = outcome_rx.recv() => self.handle_outcome(outcome).await,
                Some(err) = grant_rx.recv() => self.handle_grant_failure(err).await,
                Some(notice) = crash_rx.recv() => self.handle_crash(notice).await,
            }
        }
        tracing::debug!("session actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                target,
                credentials,
                reply,
            } => {
                let _ = reply.send(self.handle_connect(target, credentials));
            }
            Command::Disconnect { reply } => self.handle_disconnect(reply).await,
            Command::Reset { reply } => {
                let _ = reply.send(self.handle_reset());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    state: self.state,
                    host: self.host.clone(),
                    started_at: self.started_at,
                    last_error: self.last_error.clone(),
                });
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn handle_connect(
        &mut self,
        target: TargetSpec,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        // connect is valid from Disconnected, and from Error as an
        // implicit reset
        if !matches!(self.state, SessionState::Disconnected | SessionState::Error) {
            return Err(SessionError::AlreadyActive);
        }

        let Some(credentials) = credentials.or_else(|| self.fallback_credentials.clone()) else {
            return Err(SessionError::MissingCredentials);
        };

        tracing::info!(%target, "connect requested");
        self.last_error = None;
        self.host = None;
        self.state = SessionState::Connecting;
        self.hub.publish(connecting_message(&target));

        let token = CancellationToken::new();
        self.attempt_token = Some(token.clone());
        tokio::spawn(run_attempt(
            Arc::clone(&self.directory),
            Arc::clone(&self.broker),
            Arc::clone(&self.supervisor),
            target,
            credentials,
            token,
            self.outcome_tx.clone(),
        ));
        Ok(())
    }

    async fn handle_disconnect(&mut self, reply: oneshot::Sender<Result<(), SessionError>>) {
        match self.state {
            SessionState::Connected => {
                tracing::info!("disconnect requested");
                self.state = SessionState::Disconnecting;
                self.hub.publish(StatusMessage::Disconnecting);
                if let Some(handle) = self.tunnel.take() {
                    if let Err(e) = self.supervisor.stop(handle).await {
                        tracing::warn!(error = %e, "tunnel stop failed");
                    }
                }
                self.broker.release().await;
                self.settle_disconnected();
                let _ = reply.send(Ok(()));
            }
            SessionState::Connecting if self.pending_disconnect.is_none() => {
                tracing::info!("disconnect requested, cancelling in-flight connect");
                self.state = SessionState::Disconnecting;
                self.hub.publish(StatusMessage::Disconnecting);
                if let Some(token) = &self.attempt_token {
                    token.cancel();
                }
                // replied once the attempt confirms cleanup
                self.pending_disconnect = Some(reply);
            }
            _ => {
                let _ = reply.send(Err(SessionError::AlreadyActive));
            }
        }
    }

    fn handle_reset(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Error {
            return Err(SessionError::AlreadyActive);
        }
        tracing::info!("error acknowledged, resetting");
        self.last_error = None;
        self.settle_disconnected();
        Ok(())
    }

    async fn handle_outcome(&mut self, outcome: AttemptOutcome) {
        self.attempt_token = None;

        // a grant renewal failure that raced the attempt wins: whatever
        // the attempt produced must come down again
        if let Some(message) = self.pending_grant_failure.take() {
            if let AttemptOutcome::Ready { handle, .. } = outcome {
                if let Err(e) = self.supervisor.stop(handle).await {
                    tracing::warn!(error = %e, "tunnel stop failed");
                }
            }
            self.broker.release().await;
            if self.pending_disconnect.is_some() {
                self.settle_disconnected();
            } else {
                self.enter_error(message);
            }
            return;
        }

        match outcome {
            AttemptOutcome::Ready { host, handle } => {
                if self.pending_disconnect.is_some() {
                    // the attempt won the race against cancellation;
                    // honor the disconnect anyway
                    if let Err(e) = self.supervisor.stop(handle).await {
                        tracing::warn!(error = %e, "tunnel stop failed");
                    }
                    self.broker.release().await;
                    self.settle_disconnected();
                } else {
                    self.watch_for_crash(&handle);
                    tracing::info!(host = %host.id, pid = handle.pid(), "session connected");
                    self.tunnel = Some(handle);
                    self.state = SessionState::Connected;
                    self.started_at = Some(SystemTime::now());
                    let message = StatusMessage::Connected {
                        host: host.id.clone(),
                        address: host.address.clone(),
                    };
                    self.host = Some(host);
                    self.hub.publish(message);
                }
            }
            AttemptOutcome::Failed(err) => {
                if self.pending_disconnect.is_some() {
                    self.settle_disconnected();
                } else {
                    tracing::error!(error = %err, "connect attempt failed");
                    self.enter_error(err.to_string());
                }
            }
            AttemptOutcome::Cancelled => self.settle_disconnected(),
        }
    }

    async fn handle_grant_failure(&mut self, err: GrantError) {
        match self.state {
            SessionState::Connected => {
                tracing::error!(error = %err, "grant lost while connected, stopping tunnel");
                if let Some(handle) = self.tunnel.take() {
                    if let Err(e) = self.supervisor.stop(handle).await {
                        tracing::warn!(error = %e, "tunnel stop failed");
                    }
                }
                self.broker.release().await;
                self.enter_error(err.to_string());
            }
            SessionState::Connecting => {
                // let the in-flight attempt finish its cleanup first
                self.pending_grant_failure = Some(err.to_string());
                if let Some(token) = &self.attempt_token {
                    token.cancel();
                }
            }
            _ => tracing::debug!(error = %err, "stale grant failure ignored"),
        }
    }

    async fn handle_crash(&mut self, notice: CrashNotice) {
        let current_pid = self.tunnel.as_ref().map(TunnelHandle::pid);
        if self.state != SessionState::Connected || current_pid != Some(notice.pid) {
            // exit of a process we already stopped
            return;
        }
        tracing::error!(pid = notice.pid, code = ?notice.code, "tunnel process died");
        self.tunnel = None;
        self.broker.release().await;
        let message = match notice.code {
            Some(code) => format!("tunnel process exited unexpectedly (exit code {code})"),
            None => "tunnel process exited unexpectedly".to_string(),
        };
        self.enter_error(message);
    }

    /// Ordered teardown: cancel any in-flight connect, stop the tunnel,
    /// release the grant, and only then stop.
    async fn shutdown(&mut self, outcome_rx: &mut mpsc::Receiver<AttemptOutcome>) {
        tracing::info!("session shutting down");
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
            match timeout(SHUTDOWN_ATTEMPT_GRACE, outcome_rx.recv()).await {
                Ok(Some(AttemptOutcome::Ready { handle, .. })) => {
                    if let Err(e) = self.supervisor.stop(handle).await {
                        tracing::warn!(error = %e, "tunnel stop failed");
                    }
                }
                Ok(_) => {}
                Err(_) => tracing::warn!("in-flight connect did not confirm cleanup in time"),
            }
        }
        if let Some(handle) = self.tunnel.take() {
            if let Err(e) = self.supervisor.stop(handle).await {
                tracing::warn!(error = %e, "tunnel stop failed");
            }
        }
        self.broker.release().await;
        if self.state != SessionState::Disconnected {
            self.settle_disconnected();
        }
    }

    fn settle_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.host = None;
        self.started_at = None;
        self.hub.publish(StatusMessage::Disconnected);
        if let Some(reply) = self.pending_disconnect.take() {
            let _ = reply.send(Ok(()));
        }
    }

    fn enter_error(&mut self, message: String) {
        self.state = SessionState::Error;
        self.host = None;
        self.started_at = None;
        self.last_error = Some(message.clone());
        self.hub.publish(StatusMessage::Error { message });
    }

    fn watch_for_crash(&self, handle: &TunnelHandle) {
        let mut exit = handle.exit_watch();
        let pid = handle.pid();
        let tx = self.crash_tx.clone();
        tokio::spawn(async move {
            let code = match exit.wait_for(|c| c.is_some()).await {
                Ok(code) => *code,
                Err(_) => None,
            };
            let _ = tx.send(CrashNotice { pid, code }).await;
        });
    }
}

fn connecting_message(target: &TargetSpec) -> StatusMessage {
    match target {
        TargetSpec::Country(cc) => StatusMessage::Connecting {
            country: Some(cc.clone()),
            host: None,
        },
        TargetSpec::Host(id) => StatusMessage::Connecting {
            country: None,
            host: Some(id.clone()),
        },
    }
}

/// One connect attempt: rank, acquire the grant, start the process.
/// Every early exit releases whatever was acquired before it.
async fn run_attempt(
    directory: Arc<HostDirectory>,
    broker: Arc<CredentialBroker>,
    supervisor: Arc<dyn Supervisor>,
    target: TargetSpec,
    credentials: Credentials,
    token: CancellationToken,
    outcome_tx: mpsc::Sender<AttemptOutcome>,
) {
    let outcome = attempt(&directory, &broker, &supervisor, &target, &credentials, &token).await;
    let _ = outcome_tx.send(outcome).await;
}

async fn attempt(
    directory: &HostDirectory,
    broker: &CredentialBroker,
    supervisor: &Arc<dyn Supervisor>,
    target: &TargetSpec,
    credentials: &Credentials,
    token: &CancellationToken,
) -> AttemptOutcome {
    let host = tokio::select! {
        _ = token.cancelled() => return AttemptOutcome::Cancelled,
        ranked = directory.rank(target) => match ranked {
            Ok(host) => host,
            Err(err) => return AttemptOutcome::Failed(err.into()),
        }
    };
    tracing::debug!(host = %host.id, load = host.load, "selected endpoint");

    let acquired = tokio::select! {
        _ = token.cancelled() => {
            // an aborted elevation prompt may still have validated
            broker.release().await;
            return AttemptOutcome::Cancelled;
        }
        result = broker.acquire() => result,
    };
    if let Err(err) = acquired {
        return AttemptOutcome::Failed(err.into());
    }

    // the start step runs to completion: dropping it mid-flight could
    // orphan an elevated process
    match supervisor.start(&host, credentials).await {
        Ok(handle) => {
            if token.is_cancelled() {
                if let Err(e) = supervisor.stop(handle).await {
                    tracing::warn!(error = %e, "tunnel stop failed");
                }
                broker.release().await;
                AttemptOutcome::Cancelled
            } else {
                AttemptOutcome::Ready { host, handle }
            }
        }
        Err(err) => {
            broker.release().await;
            AttemptOutcome::Failed(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use tw_core::config::DirectoryConfig;
    use tw_core::error::{DirectoryError, SupervisorError};
    use tw_core::types::{CountryCode, HostId};

    use crate::broker::Elevator;
    use crate::directory::DirectoryApi;

    struct StubApi {
        hosts: Vec<Host>,
    }

    #[async_trait]
    impl DirectoryApi for StubApi {
        async fn fetch_hosts(&self) -> Result<Vec<Host>, DirectoryError> {
            Ok(self.hosts.clone())
        }

        async fn current_ip(&self) -> Result<String, DirectoryError> {
            Ok("198.51.100.7".to_string())
        }
    }

    struct StubElevator {
        fail_renew: AtomicBool,
    }

    #[async_trait]
    impl Elevator for StubElevator {
        async fn acquire(&self) -> Result<(), GrantError> {
            Ok(())
        }

        async fn renew(&self) -> Result<(), GrantError> {
            if self.fail_renew.load(Ordering::SeqCst) {
                Err(GrantError::RenewalFailed("stub expiry".to_string()))
            } else {
                Ok(())
            }
        }

        async fn drop_grant(&self) {}
    }

    struct StubSupervisor {
        start_delay: Duration,
        fail_start: AtomicBool,
        running: Mutex<Option<watch::Sender<Option<i32>>>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl StubSupervisor {
        fn new(start_delay: Duration) -> Self {
            Self {
                start_delay,
                fail_start: AtomicBool::new(false),
                running: Mutex::new(None),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        fn is_running(&self) -> bool {
            self.running.lock().unwrap().is_some()
        }

        fn crash(&self, code: i32) {
            if let Some(tx) = self.running.lock().unwrap().take() {
                let _ = tx.send(Some(code));
            }
        }
    }

    #[async_trait]
    impl Supervisor for StubSupervisor {
        async fn start(
            &self,
            _host: &Host,
            _credentials: &Credentials,
        ) -> Result<TunnelHandle, SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SupervisorError::Spawn("stub refused".to_string()));
            }
            let (tx, rx) = watch::channel(None);
            *self.running.lock().unwrap() = Some(tx);
            Ok(TunnelHandle::new(4242, rx))
        }

        async fn stop(&self, _handle: TunnelHandle) -> Result<(), SupervisorError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = self.running.lock().unwrap().take() {
                let _ = tx.send(Some(0));
            }
            Ok(())
        }
    }

    struct Harness {
        handle: SessionHandle,
        hub: Arc<StatusHub>,
        supervisor: Arc<StubSupervisor>,
        elevator: Arc<StubElevator>,
        broker: Arc<CredentialBroker>,
    }

    fn host(id: &str, cc: &str, load: u8) -> Host {
        Host {
            id: HostId::new(id),
            country: CountryCode::parse(cc).unwrap(),
            country_name: cc.to_string(),
            address: format!("{id}.example.net"),
            load,
            refreshed_at: SystemTime::now(),
        }
    }

    fn us_hosts() -> Vec<Host> {
        vec![host("us1", "US", 5), host("us2", "US", 2)]
    }

    fn spawn_harness(hosts: Vec<Host>, start_delay: Duration, renew_period: Duration) -> Harness {
        let directory = Arc::new(HostDirectory::new(
            Arc::new(StubApi { hosts }),
            DirectoryConfig {
                fetch_attempts: 1,
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let elevator = Arc::new(StubElevator {
            fail_renew: AtomicBool::new(false),
        });
        let (broker, failures) =
            CredentialBroker::new(Arc::clone(&elevator) as Arc<dyn Elevator>, renew_period);
        let broker = Arc::new(broker);
        let supervisor = Arc::new(StubSupervisor::new(start_delay));
        let hub = Arc::new(StatusHub::new(32));

        let (handle, _task) = SessionManager::spawn(
            directory,
            Arc::clone(&broker),
            failures,
            Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            Arc::clone(&hub),
            Some(Credentials::new("user", "pass")),
        );

        Harness {
            handle,
            hub,
            supervisor,
            elevator,
            broker,
        }
    }

    async fn wait_for_state(handle: &SessionHandle, want: SessionState) -> SessionSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snap = handle.snapshot().await.expect("actor gone");
            if snap.state == want {
                return snap;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {want}, stuck at {}",
                snap.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn target_us() -> TargetSpec {
        TargetSpec::parse("US").unwrap()
    }

    #[tokio::test]
    async fn connect_selects_best_host_and_emits_ordered_transitions() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        let mut observer = h.hub.subscribe();
        assert_eq!(observer.recv().await, Some(StatusMessage::Disconnected));

        h.handle.connect(target_us(), None).await.unwrap();
        let snap = wait_for_state(&h.handle, SessionState::Connected).await;
        assert_eq!(snap.host.as_ref().unwrap().id.as_str(), "us2");
        assert!(snap.started_at.is_some());
        assert!(h.broker.held().await);

        assert_eq!(
            observer.recv().await,
            Some(StatusMessage::Connecting {
                country: Some(CountryCode::parse("US").unwrap()),
                host: None,
            })
        );
        assert_eq!(
            observer.recv().await,
            Some(StatusMessage::Connected {
                host: HostId::new("us2"),
                address: "us2.example.net".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn connect_while_active_is_rejected_without_side_effects() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connected).await;

        let err = h.handle.connect(target_us(), None).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));

        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Connected);
        assert_eq!(snap.host.unwrap().id.as_str(), "us2");
        assert_eq!(h.supervisor.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_cancels_inflight_connect_and_releases_everything() {
        let h = spawn_harness(us_hosts(), Duration::from_millis(300), Duration::from_secs(60));
        let mut observer = h.hub.subscribe();
        assert_eq!(observer.recv().await, Some(StatusMessage::Disconnected));

        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connecting).await;
        h.handle.disconnect().await.unwrap();

        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Disconnected);
        assert!(!h.supervisor.is_running());
        assert!(!h.broker.held().await);

        // connecting, disconnecting, disconnected: never connected
        assert!(matches!(
            observer.recv().await,
            Some(StatusMessage::Connecting { .. })
        ));
        assert_eq!(observer.recv().await, Some(StatusMessage::Disconnecting));
        assert_eq!(observer.recv().await, Some(StatusMessage::Disconnected));
    }

    #[tokio::test]
    async fn spawn_failure_enters_error_and_next_connect_succeeds() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        h.supervisor.fail_start.store(true, Ordering::SeqCst);

        h.handle.connect(target_us(), None).await.unwrap();
        let snap = wait_for_state(&h.handle, SessionState::Error).await;
        assert!(snap.last_error.unwrap().contains("spawn"));
        assert!(!h.broker.held().await);

        // Error is not sticky for connect
        h.supervisor.fail_start.store(false, Ordering::SeqCst);
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn renewal_failure_tears_the_session_down() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_millis(10));
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connected).await;

        // grant starts failing; no client disconnect is ever issued
        h.elevator.fail_renew.store(true, Ordering::SeqCst);
        let snap = wait_for_state(&h.handle, SessionState::Error).await;
        assert!(snap.last_error.unwrap().contains("renewal"));
        assert!(!h.supervisor.is_running());
        assert!(!h.broker.held().await);
    }

    #[tokio::test]
    async fn crash_while_connected_enters_error() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connected).await;

        h.supervisor.crash(9);
        let snap = wait_for_state(&h.handle, SessionState::Error).await;
        assert!(snap.last_error.unwrap().contains("exited unexpectedly"));
        assert!(!h.broker.held().await);
    }

    #[tokio::test]
    async fn reset_clears_error_and_is_rejected_otherwise() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        assert!(matches!(
            h.handle.reset().await,
            Err(SessionError::AlreadyActive)
        ));

        h.supervisor.fail_start.store(true, Ordering::SeqCst);
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Error).await;

        h.handle.reset().await.unwrap();
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Disconnected);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_rejected() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        assert!(matches!(
            h.handle.disconnect().await,
            Err(SessionError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let directory = Arc::new(HostDirectory::new(
            Arc::new(StubApi { hosts: us_hosts() }),
            DirectoryConfig::default(),
        ));
        let elevator = Arc::new(StubElevator {
            fail_renew: AtomicBool::new(false),
        });
        let (broker, failures) =
            CredentialBroker::new(elevator, Duration::from_secs(60));
        let supervisor = Arc::new(StubSupervisor::new(Duration::ZERO));
        let hub = Arc::new(StatusHub::new(8));
        let (handle, _task) = SessionManager::spawn(
            directory,
            Arc::new(broker),
            failures,
            supervisor,
            hub,
            None, // no configured fallback
        );

        let err = handle.connect(target_us(), None).await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredentials));
    }

    #[tokio::test]
    async fn shutdown_stops_tunnel_and_releases_grant() {
        let h = spawn_harness(us_hosts(), Duration::ZERO, Duration::from_secs(60));
        h.handle.connect(target_us(), None).await.unwrap();
        wait_for_state(&h.handle, SessionState::Connected).await;

        h.handle.shutdown().await;
        assert!(!h.supervisor.is_running());
        assert!(!h.broker.held().await);

        // the actor is gone; new requests fail cleanly
        assert!(matches!(
            h.handle.connect(target_us(), None).await,
            Err(SessionError::EngineStopped)
        ));
    }
}
