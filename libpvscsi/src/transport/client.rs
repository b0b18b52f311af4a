//! Client side of the driver socket, used by tests and tooling.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_BYTES;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// Sends [`CsiMessage`] requests to a driver listening on a Unix socket.
/// Every request uses a fresh connection.
#[derive(Debug, Clone)]
pub struct CsiClient {
    socket: PathBuf,
}

impl CsiClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// An [`CsiMessage::Error`] reply is returned as a message, not as `Err`;
    /// `Err` means the exchange itself failed.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`request`](Self::request), with error replies as `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(msg).await?.into_result()
    }
}
