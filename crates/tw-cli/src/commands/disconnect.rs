//! `tunwarden disconnect` - tear down the active tunnel

use anyhow::{bail, Result};

use tw_core::ipc::{Intent, ObserverFrame, StatusMessage};

use crate::ipc::EngineClient;
use crate::output::{print_info, print_success};

/// Disconnect the active session (or cancel an in-flight connect) and
/// block until the engine has settled at disconnected.
pub async fn disconnect_command(address: &str) -> Result<()> {
    let mut client = EngineClient::connect(address).await?;
    let _resync = client.next_frame().await?;

    client.send(&Intent::Disconnect).await?;

    loop {
        match client.next_frame().await? {
            ObserverFrame::Rejection(rejection) => {
                bail!("disconnect refused: {}", rejection.rejected)
            }
            ObserverFrame::Status(StatusMessage::Disconnected) => {
                print_success("disconnected");
                return Ok(());
            }
            ObserverFrame::Status(StatusMessage::Error { message }) => {
                bail!("disconnect failed: {message}")
            }
            ObserverFrame::Status(StatusMessage::Disconnecting) => {
                print_info("disconnecting...");
            }
            ObserverFrame::Status(_) => {}
        }
    }
}
