//! tunwarden engine
//!
//! Owns the one VPN session: endpoint selection, privilege grants,
//! tunnel process supervision, the serialized session state machine,
//! and the observer fan-out. The observer server exposes all of it over
//! newline-delimited JSON on localhost TCP.

pub mod broker;
pub mod directory;
pub mod hub;
pub mod server;
pub mod session;
pub mod supervisor;

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tw_core::config::EngineConfig;
use tw_core::error::EngineError;
use tw_core::types::Credentials;

use crate::broker::{CredentialBroker, SudoElevator};
use crate::directory::{HostDirectory, HttpDirectory};
use crate::hub::StatusHub;
use crate::server::ObserverServer;
use crate::session::{SessionHandle, SessionManager};
use crate::supervisor::TunnelSupervisor;

/// A fully wired engine: session actor running, observer server not yet
/// serving. Drive it with [`serve`](Engine::serve) and stop it with
/// [`shutdown`](Engine::shutdown).
pub struct Engine {
    session: SessionHandle,
    hub: Arc<StatusHub>,
    observer_address: String,
    shutdown: CancellationToken,
    actor: JoinHandle<()>,
}

impl Engine {
    /// Wire up the production components and spawn the session actor
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        let api = HttpDirectory::new(&config.directory)?;
        let directory = Arc::new(HostDirectory::new(Arc::new(api), config.directory));

        let (broker, grant_failures) = CredentialBroker::new(
            Arc::new(SudoElevator::default()),
            config.grant.renew_period,
        );

        let fallback_credentials = match (&config.tunnel.username, &config.tunnel.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };
        let supervisor = Arc::new(TunnelSupervisor::new(config.tunnel));

        let hub = Arc::new(StatusHub::new(config.observer.channel_capacity));
        let (session, actor) = SessionManager::spawn(
            directory,
            Arc::new(broker),
            grant_failures,
            supervisor,
            Arc::clone(&hub),
            fallback_credentials,
        );

        Ok(Self {
            session,
            hub,
            observer_address: config.observer.bind_address,
            shutdown: CancellationToken::new(),
            actor,
        })
    }

    /// Handle to the session actor
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// The status fan-out hub
    pub fn hub(&self) -> Arc<StatusHub> {
        Arc::clone(&self.hub)
    }

    /// Token that stops the observer server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the observer server until shutdown
    pub async fn serve(&self) -> Result<()> {
        ObserverServer::new(
            self.observer_address.clone(),
            self.session.clone(),
            Arc::clone(&self.hub),
            self.shutdown.clone(),
        )
        .run()
        .await
    }

    /// Ordered shutdown: stop accepting observers, tear down any active
    /// tunnel, release the grant, and stop the actor.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.session.shutdown().await;
        if let Err(e) = self.actor.await {
            tracing::debug!(error = %e, "session actor join failed");
        }
    }
}
