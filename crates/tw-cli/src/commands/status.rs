//! `tunwarden status` - show the engine's current session state

use anyhow::{bail, Result};

use tw_core::ipc::ObserverFrame;

use crate::ipc::EngineClient;
use crate::output::describe_status;

/// Print the current session state. The resync frame an observer gets
/// on attach is exactly that state, so one read suffices.
pub async fn status_command(address: &str) -> Result<()> {
    let mut client = EngineClient::connect(address).await?;
    match client.next_frame().await? {
        ObserverFrame::Status(status) => {
            println!("{}", describe_status(&status));
            Ok(())
        }
        ObserverFrame::Rejection(rejection) => {
            bail!("unexpected rejection from the engine: {}", rejection.rejected)
        }
    }
}
