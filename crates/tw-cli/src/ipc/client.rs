//! Observer client for communicating with the engine
//!
//! Connects over localhost TCP and speaks the newline-delimited JSON
//! observer protocol: intents go out, status and rejection frames come
//! back. The first frame after connecting is always the engine's
//! current state.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use tw_core::ipc::{Intent, ObserverFrame};

/// How long to wait for the next frame before assuming the engine hung.
/// Generous because a connect may sit behind an interactive sudo prompt
/// on the engine side.
const FRAME_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for one observer connection to the engine
pub struct EngineClient {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl EngineClient {
    /// Connect to the engine's observer port
    pub async fn connect(address: &str) -> Result<Self> {
        tracing::debug!("connecting to engine at {address}");
        let stream = TcpStream::connect(address).await.with_context(|| {
            format!("failed to reach the engine at {address}. Is it running? (tunwarden serve)")
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            address: address.to_string(),
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    /// Engine address this client is attached to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one intent
    pub async fn send(&mut self, intent: &Intent) -> Result<()> {
        let mut json = serde_json::to_string(intent).context("failed to serialize intent")?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next frame from the engine, skipping blank lines
    pub async fn next_frame(&mut self) -> Result<ObserverFrame> {
        loop {
            let mut line = String::new();
            let read = timeout(FRAME_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .context("timed out waiting for the engine")??;
            if read == 0 {
                bail!("the engine closed the connection");
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .with_context(|| format!("unrecognized frame from the engine: {trimmed}"));
        }
    }
}
