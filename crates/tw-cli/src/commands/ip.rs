//! `tunwarden ip` - show our public IP as seen by the directory service

use anyhow::Result;

use tw_core::config::DirectoryConfig;
use tw_engine::directory::{DirectoryApi, HttpDirectory};

/// Query the directory service for our apparent public address. Useful
/// for checking whether traffic is actually leaving through the tunnel.
pub async fn ip_command(config: &DirectoryConfig) -> Result<()> {
    let api = HttpDirectory::new(config)?;
    let ip = api.current_ip().await?;
    println!("{ip}");
    Ok(())
}
