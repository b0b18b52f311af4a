//! Identity service trait, served in every driver mode.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and build version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Readiness check used by the orchestrator's liveness probe.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Which optional services and features this process offers.  Depends on
    /// the driver mode.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
