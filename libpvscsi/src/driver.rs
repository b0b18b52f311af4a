//! Driver shell: which services this process serves, and the identity
//! verbs every mode answers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::info;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::service::{ControllerService, NodeService};
use crate::types::*;
use crate::util::{GIB, parse_endpoint};

pub const DRIVER_NAME: &str = "powervs.csi.ibm.com";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Topology segment carrying the disk tier a node's image uses.
pub const DISK_TYPE_KEY: &str = "topology.powervs.csi.ibm.com/disk-type";
/// Publish-context key for the disk's WWN.
pub const WWN_KEY: &str = "wwn";
/// Volume-context and storage-class key for the filesystem type.
pub const FS_TYPE_KEY: &str = "csi.storage.k8s.io/fstype";
/// Storage-class key for the disk tier.
pub const DISK_TYPE_PARAM: &str = "type";

pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_VOLUME_SIZE: u64 = GIB;
pub const DEFAULT_MAX_VOLUMES: u64 = 127;
pub const DEFAULT_ENDPOINT: &str = "unix:///tmp/csi.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Controller,
    Node,
    #[default]
    All,
}

impl Mode {
    pub fn serves_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn serves_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

impl FromStr for Mode {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "all" => Ok(Self::All),
            other => Err(CsiError::InvalidArgument(format!("unknown mode: {other}"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Node => "node",
            Self::All => "all",
        })
    }
}

/// Process-level settings, validated before any service is built.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub endpoint: String,
    pub mode: Mode,
    /// PowerVS workspace the disks live in.
    pub cloud_instance_id: String,
    /// PowerVS instance this node runs on.  Required in node modes.
    pub instance_id: Option<String>,
    /// Zero keeps [`DEFAULT_MAX_VOLUMES`].
    pub volume_attach_limit: u64,
    pub debug: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            mode: Mode::All,
            cloud_instance_id: String::new(),
            instance_id: None,
            volume_attach_limit: 0,
            debug: false,
        }
    }
}

impl DriverOptions {
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.endpoint.is_empty() {
            return Err(CsiError::InvalidArgument("endpoint is empty".into()));
        }
        parse_endpoint(&self.endpoint)?;
        if self.cloud_instance_id.is_empty() {
            return Err(CsiError::InvalidArgument(
                "PowerVS cloud instance ID is required".into(),
            ));
        }
        if self.mode.serves_node() && self.instance_id.as_deref().is_none_or(str::is_empty) {
            return Err(CsiError::InvalidArgument(format!(
                "mode {} requires the node's PowerVS instance ID",
                self.mode
            )));
        }
        Ok(())
    }
}

/// Identity plus whichever of the controller and node services were
/// registered.  Verbs of a missing service fail with `Unimplemented`.
pub struct Driver {
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl Driver {
    pub fn new(
        controller: Option<ControllerService>,
        node: Option<NodeService>,
    ) -> Result<Self, CsiError> {
        if controller.is_none() && node.is_none() {
            return Err(CsiError::InvalidArgument(
                "driver needs a controller or a node service".into(),
            ));
        }
        let driver = Self { controller, node };
        info!(name = DRIVER_NAME, version = DRIVER_VERSION, mode = %driver.mode(), "driver created");
        Ok(driver)
    }

    pub fn mode(&self) -> Mode {
        match (&self.controller, &self.node) {
            (Some(_), None) => Mode::Controller,
            (None, Some(_)) => Mode::Node,
            _ => Mode::All,
        }
    }

    fn controller(&self, verb: &str) -> Result<&ControllerService, CsiError> {
        self.controller
            .as_ref()
            .ok_or_else(|| CsiError::Unimplemented(verb.to_owned()))
    }

    fn node(&self, verb: &str) -> Result<&NodeService, CsiError> {
        self.node
            .as_ref()
            .ok_or_else(|| CsiError::Unimplemented(verb.to_owned()))
    }
}

#[async_trait]
impl CsiIdentity for Driver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: DRIVER_NAME.to_owned(),
            vendor_version: DRIVER_VERSION.to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::with_capacity(2);
        if self.controller.is_some() {
            caps.push(PluginCapability::ControllerService);
        }
        caps.push(PluginCapability::VolumeAccessibilityConstraints);
        Ok(caps)
    }
}

#[async_trait]
impl CsiController for Driver {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller("CreateVolume")?.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller("DeleteVolume")?
            .delete_volume(volume_id)
            .await
    }

    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        CsiController::publish_volume(self.controller("ControllerPublishVolume")?, req).await
    }

    async fn unpublish_volume(&self, req: ControllerUnpublishVolumeRequest) -> Result<(), CsiError> {
        CsiController::unpublish_volume(self.controller("ControllerUnpublishVolume")?, req).await
    }

    async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        CsiController::expand_volume(self.controller("ControllerExpandVolume")?, req).await
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        self.controller("ValidateVolumeCapabilities")?
            .validate_volume_capabilities(volume_id, capabilities)
            .await
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        self.controller("ListVolumes")?.list_volumes(req).await
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError> {
        self.controller("GetCapacity")?.get_capacity(req).await
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        CsiController::get_capabilities(self.controller("ControllerGetCapabilities")?).await
    }
}

#[async_trait]
impl CsiNode for Driver {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node("NodeStageVolume")?.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node("NodeUnstageVolume")?
            .unstage_volume(volume_id, staging_target_path)
            .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        CsiNode::publish_volume(self.node("NodePublishVolume")?, req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        CsiNode::unpublish_volume(self.node("NodeUnpublishVolume")?, volume_id, target_path).await
    }

    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        CsiNode::expand_volume(self.node("NodeExpandVolume")?, req).await
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        self.node("NodeGetVolumeStats")?
            .get_volume_stats(volume_id, volume_path)
            .await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        CsiNode::get_capabilities(self.node("NodeGetCapabilities")?).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        self.node("NodeGetInfo")?.get_info().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::error::Code;
    use crate::mounter::fake::FakeMounter;

    fn controller_only() -> Driver {
        let cloud = Arc::new(FakeCloud::new());
        Driver::new(Some(ControllerService::new(cloud)), None).unwrap()
    }

    fn node_only() -> Driver {
        let node = NodeService::new(Arc::new(FakeMounter::new()), "pvm-a");
        Driver::new(None, Some(node)).unwrap()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("controller".parse::<Mode>().unwrap(), Mode::Controller);
        assert_eq!("node".parse::<Mode>().unwrap(), Mode::Node);
        assert_eq!("all".parse::<Mode>().unwrap(), Mode::All);
        assert!("both".parse::<Mode>().is_err());
        assert_eq!(Mode::Node.to_string(), "node");
        assert!(Mode::All.serves_controller() && Mode::All.serves_node());
        assert!(!Mode::Controller.serves_node());
    }

    #[test]
    fn options_validation() {
        let mut opts = DriverOptions {
            cloud_instance_id: "ws-1".into(),
            instance_id: Some("pvm-a".into()),
            ..Default::default()
        };
        opts.validate().unwrap();

        opts.instance_id = None;
        assert!(opts.validate().is_err());
        opts.mode = Mode::Controller;
        opts.validate().unwrap();

        opts.endpoint = "tcp://127.0.0.1:10000".into();
        assert!(opts.validate().is_err());
        opts.endpoint = DEFAULT_ENDPOINT.into();

        opts.cloud_instance_id.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn driver_needs_a_service() {
        assert!(Driver::new(None, None).is_err());
        assert_eq!(controller_only().mode(), Mode::Controller);
        assert_eq!(node_only().mode(), Mode::Node);
    }

    #[tokio::test]
    async fn identity_follows_registered_services() {
        let driver = controller_only();
        let info = driver.get_plugin_info().await.unwrap();
        assert_eq!(info.name, DRIVER_NAME);
        assert!(driver.probe().await.unwrap());
        assert_eq!(
            driver.get_plugin_capabilities().await.unwrap(),
            vec![
                PluginCapability::ControllerService,
                PluginCapability::VolumeAccessibilityConstraints,
            ]
        );

        let caps = node_only().get_plugin_capabilities().await.unwrap();
        assert_eq!(caps, vec![PluginCapability::VolumeAccessibilityConstraints]);
    }

    #[tokio::test]
    async fn missing_service_is_unimplemented() {
        let err = node_only()
            .create_volume(CreateVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        assert_eq!(err.to_string(), "CreateVolume is not served in this driver mode");

        let err = controller_only().get_info().await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
