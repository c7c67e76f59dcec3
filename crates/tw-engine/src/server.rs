//! Observer server
//!
//! Listens on localhost TCP for observer connections. Uses TCP on
//! 127.0.0.1 for cross-platform compatibility (works on Unix, macOS,
//! Windows).
//!
//! Each connection is an observer: it is attached to the status hub on
//! accept (receiving the current state as its first frame) and gets one
//! newline-delimited JSON frame per session transition from then on.
//! Lines arriving from the client are parsed as [`Intent`]s; malformed
//! lines are logged and skipped without dropping the connection, and a
//! synchronously refused intent is answered with a [`Rejection`] frame
//! on this connection only.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tw_core::ipc::{Intent, Rejection};
use tw_core::types::{Credentials, TargetSpec};

use crate::hub::StatusHub;
use crate::session::SessionHandle;

/// Observer-facing server
///
/// Listens on localhost (127.0.0.1) only, never on the network.
pub struct ObserverServer {
    /// Address to bind (127.0.0.1:port)
    address: String,
    session: SessionHandle,
    hub: Arc<StatusHub>,
    shutdown: CancellationToken,
}

impl ObserverServer {
    /// Create a server for the given session and hub
    pub fn new(
        address: String,
        session: SessionHandle,
        hub: Arc<StatusHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            address,
            session,
            hub,
            shutdown,
        }
    }

    /// Accept observers until the shutdown token fires
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("failed to bind observer server to {}", self.address))?;

        tracing::info!("observer server listening on {}", self.address);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("observer server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("rejected non-localhost connection from {peer_addr}");
                            continue;
                        }

                        let session = self.session.clone();
                        let hub = Arc::clone(&self.hub);
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_observer(stream, session, hub, shutdown).await {
                                tracing::warn!(error = %e, "observer connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept observer connection");
                    }
                }
            }
        }
    }
}

async fn handle_observer(
    stream: TcpStream,
    session: SessionHandle,
    hub: Arc<StatusHub>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let mut observer = hub.subscribe();
    let id = observer.id();

    let result = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                read = reader.read_line(&mut line) => {
                    match read {
                        Ok(0) => return Ok(()), // EOF
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                match serde_json::from_str::<Intent>(trimmed) {
                                    Ok(intent) => {
                                        if let Some(rejection) =
                                            dispatch_intent(intent, &session).await
                                        {
                                            tracing::debug!(
                                                observer = id,
                                                reason = %rejection.rejected,
                                                "intent rejected"
                                            );
                                            write_frame(&mut writer, &rejection).await?;
                                        }
                                    }
                                    Err(e) => {
                                        // bad input never tears the observer down
                                        tracing::warn!(
                                            observer = id,
                                            error = %e,
                                            "ignoring malformed intent line"
                                        );
                                    }
                                }
                            }
                            line.clear();
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                pushed = observer.recv() => match pushed {
                    Some(message) => write_frame(&mut writer, &message).await?,
                    // the hub dropped us for lagging, or the engine is gone
                    None => return Ok(()),
                }
            }
        }
    }
    .await;

    hub.unsubscribe(id);
    result
}

async fn write_frame<T: Serialize>(writer: &mut OwnedWriteHalf, frame: &T) -> Result<()> {
    let mut json = serde_json::to_string(frame)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

/// Apply one intent to the session. A `Some` return is the per-observer
/// rejection to send back; `None` means the intent was accepted and its
/// effects will arrive as broadcast status frames.
async fn dispatch_intent(intent: Intent, session: &SessionHandle) -> Option<Rejection> {
    let outcome = match intent {
        Intent::Connect {
            country,
            host,
            username,
            password,
        } => {
            let target = match TargetSpec::from_parts(country, host) {
                Ok(target) => target,
                Err(e) => return Some(Rejection {
                    rejected: e.to_string(),
                }),
            };
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials::new(username, password)),
                (None, None) => None,
                _ => {
                    return Some(Rejection {
                        rejected: "username and password must be supplied together".to_string(),
                    })
                }
            };
            session.connect(target, credentials).await
        }
        Intent::Disconnect => session.disconnect().await,
    };

    outcome.err().map(|e| Rejection {
        rejected: e.to_string(),
    })
}
