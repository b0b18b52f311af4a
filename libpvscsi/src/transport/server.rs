//! Unix socket server that dispatches incoming CSI requests to the
//! identity, controller and node trait implementations.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_BYTES;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts connections on a Unix socket and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    socket: PathBuf,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind `socket`, replacing a stale socket file left by a previous run.
    pub fn bind(socket: impl Into<PathBuf>, handler: Arc<T>) -> Result<Self, CsiError> {
        let socket = socket.into();
        match std::fs::remove_file(&socket) {
            Ok(()) => debug!(socket = %socket.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::TransportError(format!(
                    "cannot remove stale socket {}: {e}",
                    socket.display()
                )));
            }
        }
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent).map_err(CsiError::transport)?;
        }
        let listener = UnixListener::bind(&socket).map_err(CsiError::transport)?;
        info!(socket = %socket.display(), "CSI server listening");
        Ok(Self {
            listener,
            socket,
            handler,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    ///
    /// Each accepted connection is handled on its own Tokio task.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("CSI server shutting down");
                    break Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, &handler).await {
                                warn!(error = %e, "CSI connection error");
                            }
                        });
                    }
                    Err(e) => break Err(CsiError::transport(e)),
                },
            }
        };
        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != ErrorKind::NotFound {
                warn!(socket = %self.socket.display(), error = %e, "failed to remove socket");
            }
        }
        result
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> Result<(), CsiError> {
        self.serve_until(std::future::pending()).await
    }

    /// Process one connection: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_connection(mut stream: UnixStream, handler: &T) -> Result<(), CsiError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                let verb = request.to_string();
                let response = Self::dispatch(handler, request).await;
                if let CsiMessage::Error(e) = &response {
                    error!(request = %verb, code = ?e.code(), error = %e, "CSI call failed");
                }
                response
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let result = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => handler
                .create_volume(req)
                .await
                .map(CsiMessage::VolumeCreated),
            CsiMessage::DeleteVolume(id) => {
                handler.delete_volume(&id).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::ControllerPublishVolume(req) => {
                CsiController::publish_volume(handler, req)
                    .await
                    .map(CsiMessage::PublishContext)
            }
            CsiMessage::ControllerUnpublishVolume(req) => {
                CsiController::unpublish_volume(handler, req)
                    .await
                    .map(|()| CsiMessage::Ok)
            }
            CsiMessage::ControllerExpandVolume(req) => CsiController::expand_volume(handler, req)
                .await
                .map(CsiMessage::ControllerExpanded),
            CsiMessage::ListVolumes(req) => {
                handler.list_volumes(req).await.map(CsiMessage::VolumeList)
            }
            CsiMessage::GetCapacity(req) => {
                handler.get_capacity(req).await.map(CsiMessage::Capacity)
            }
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
                .map(CsiMessage::CapabilitiesValidated),
            CsiMessage::ControllerGetCapabilities => CsiController::get_capabilities(handler)
                .await
                .map(CsiMessage::ControllerCapabilities),

            // --- Node -------------------------------------------------------
            CsiMessage::NodeStageVolume(req) => {
                handler.stage_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::NodeUnstageVolume {
                volume_id,
                staging_target_path,
            } => handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::NodePublishVolume(req) => CsiNode::publish_volume(handler, req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::NodeUnpublishVolume {
                volume_id,
                target_path,
            } => CsiNode::unpublish_volume(handler, &volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::NodeExpandVolume(req) => CsiNode::expand_volume(handler, req)
                .await
                .map(CsiMessage::NodeExpanded),
            CsiMessage::NodeGetVolumeStats {
                volume_id,
                volume_path,
            } => handler
                .get_volume_stats(&volume_id, &volume_path)
                .await
                .map(CsiMessage::VolumeStatsResponse),
            CsiMessage::NodeGetCapabilities => CsiNode::get_capabilities(handler)
                .await
                .map(CsiMessage::NodeCapabilities),
            CsiMessage::NodeGetInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };
        result.unwrap_or_else(CsiMessage::Error)
    }
}
