//! Credential broker: the elevated-privilege grant lifecycle
//!
//! The tunnel process can only be started and stopped under an elevated
//! grant (the sudo timestamp on POSIX systems). The broker acquires the
//! grant, keeps it alive with a periodic non-interactive renewal while
//! a tunnel may legally be running, and relinquishes it on release.
//!
//! A renewal failure is fatal for the session: the broker reports it on
//! the failure channel and stops renewing; the session actor tears the
//! tunnel down in response.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tw_core::error::GrantError;

/// Platform privilege-elevation primitive
#[async_trait]
pub trait Elevator: Send + Sync {
    /// Obtain the grant. May prompt the operator interactively.
    async fn acquire(&self) -> Result<(), GrantError>;

    /// Refresh the grant without interaction
    async fn renew(&self) -> Result<(), GrantError>;

    /// Relinquish the grant. Best effort.
    async fn drop_grant(&self);
}

/// `sudo`-based elevator: `sudo -v` to acquire (prompting if needed),
/// `sudo -n -v` to renew, `sudo -k` to drop the timestamp.
pub struct SudoElevator {
    sudo: String,
}

impl Default for SudoElevator {
    fn default() -> Self {
        Self {
            sudo: "sudo".to_string(),
        }
    }
}

impl SudoElevator {
    async fn run(&self, args: &[&str], interactive: bool) -> std::io::Result<bool> {
        let mut cmd = tokio::process::Command::new(&self.sudo);
        cmd.args(args);
        if interactive {
            // prompt goes to the controlling terminal
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        // a dropped future must not leave a sudo prompt hanging
        cmd.kill_on_drop(true);
        let status = cmd.status().await?;
        Ok(status.success())
    }
}

#[async_trait]
impl Elevator for SudoElevator {
    async fn acquire(&self) -> Result<(), GrantError> {
        match self.run(&["-v"], true).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(GrantError::ElevationDenied(
                "sudo rejected the authorization".to_string(),
            )),
            Err(e) => Err(GrantError::ElevationDenied(e.to_string())),
        }
    }

    async fn renew(&self) -> Result<(), GrantError> {
        match self.run(&["-n", "-v"], false).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(GrantError::RenewalFailed(
                "sudo timestamp could not be refreshed".to_string(),
            )),
            Err(e) => Err(GrantError::RenewalFailed(e.to_string())),
        }
    }

    async fn drop_grant(&self) {
        if let Err(e) = self.run(&["-k"], false).await {
            tracing::debug!(error = %e, "failed to drop sudo timestamp");
        }
    }
}

struct ActiveGrant {
    token: CancellationToken,
    renewer: JoinHandle<()>,
}

/// Owns the grant and its renewal timer
pub struct CredentialBroker {
    elevator: Arc<dyn Elevator>,
    renew_period: Duration,
    failure_tx: mpsc::Sender<GrantError>,
    active: Mutex<Option<ActiveGrant>>,
}

impl CredentialBroker {
    /// Create a broker. The returned receiver yields at most one fatal
    /// renewal failure per acquired grant.
    pub fn new(
        elevator: Arc<dyn Elevator>,
        renew_period: Duration,
    ) -> (Self, mpsc::Receiver<GrantError>) {
        let (failure_tx, failure_rx) = mpsc::channel(4);
        (
            Self {
                elevator,
                renew_period,
                failure_tx,
                active: Mutex::new(None),
            },
            failure_rx,
        )
    }

    /// Acquire the grant and start the renewal timer. Idempotent while
    /// a grant is already held.
    pub async fn acquire(&self) -> Result<(), GrantError> {
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.elevator.acquire().await?;
        tracing::debug!("privilege grant acquired");

        let token = CancellationToken::new();
        let renewer = tokio::spawn(renewal_loop(
            Arc::clone(&self.elevator),
            self.renew_period,
            token.clone(),
            self.failure_tx.clone(),
        ));
        *slot = Some(ActiveGrant { token, renewer });
        Ok(())
    }

    /// Cancel the renewal timer and relinquish the grant. Idempotent.
    ///
    /// Waits for the renewal task to exit, so no renewal can race a
    /// subsequent [`acquire`](Self::acquire).
    pub async fn release(&self) {
        let grant = self.active.lock().await.take();
        if let Some(grant) = grant {
            grant.token.cancel();
            if let Err(e) = grant.renewer.await {
                tracing::debug!(error = %e, "renewal task join failed");
            }
            self.elevator.drop_grant().await;
            tracing::debug!("privilege grant released");
        }
    }

    /// Whether a grant is currently held
    pub async fn held(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn renewal_loop(
    elevator: Arc<dyn Elevator>,
    period: Duration,
    token: CancellationToken,
    failure_tx: mpsc::Sender<GrantError>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        match elevator.renew().await {
            Ok(()) => tracing::trace!("privilege grant renewed"),
            Err(err) => {
                tracing::warn!(error = %err, "privilege grant renewal failed");
                let _ = failure_tx.send(err).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    struct FakeElevator {
        renews: AtomicUsize,
        fail_renew_after: Option<usize>,
    }

    impl FakeElevator {
        fn new(fail_renew_after: Option<usize>) -> Self {
            Self {
                renews: AtomicUsize::new(0),
                fail_renew_after,
            }
        }
    }

    #[async_trait]
    impl Elevator for FakeElevator {
        async fn acquire(&self) -> Result<(), GrantError> {
            Ok(())
        }

        async fn renew(&self) -> Result<(), GrantError> {
            let n = self.renews.fetch_add(1, Ordering::SeqCst);
            match self.fail_renew_after {
                Some(limit) if n >= limit => {
                    Err(GrantError::RenewalFailed("fake expiry".to_string()))
                }
                _ => Ok(()),
            }
        }

        async fn drop_grant(&self) {}
    }

    #[tokio::test]
    async fn renewal_failure_is_reported() {
        let elevator = Arc::new(FakeElevator::new(Some(0)));
        let (broker, mut failures) = CredentialBroker::new(elevator, Duration::from_millis(5));
        broker.acquire().await.unwrap();

        let err = timeout(Duration::from_secs(2), failures.recv())
            .await
            .expect("renewal failure not reported in time")
            .expect("failure channel closed");
        assert!(matches!(err, GrantError::RenewalFailed(_)));
    }

    #[tokio::test]
    async fn release_stops_renewals() {
        let elevator = Arc::new(FakeElevator::new(None));
        let (broker, _failures) =
            CredentialBroker::new(Arc::clone(&elevator) as Arc<dyn Elevator>, Duration::from_millis(5));
        broker.acquire().await.unwrap();
        assert!(broker.held().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.release().await;
        assert!(!broker.held().await);

        let renews_at_release = elevator.renews.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(elevator.renews.load(Ordering::SeqCst), renews_at_release);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let elevator = Arc::new(FakeElevator::new(None));
        let (broker, _failures) = CredentialBroker::new(elevator, Duration::from_millis(5));
        broker.release().await;
        broker.acquire().await.unwrap();
        broker.release().await;
        broker.release().await;
        assert!(!broker.held().await);
    }

    #[tokio::test]
    async fn acquire_is_idempotent_while_held() {
        let elevator = Arc::new(FakeElevator::new(None));
        let (broker, _failures) = CredentialBroker::new(elevator, Duration::from_secs(60));
        broker.acquire().await.unwrap();
        broker.acquire().await.unwrap();
        assert!(broker.held().await);
        broker.release().await;
    }
}
