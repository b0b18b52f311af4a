//! Whole-driver scenarios driven through the socket transport, with the
//! in-memory cloud and mounter behind a driver serving both services.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;

use crate::cloud::fake::FakeCloud;
use crate::driver::{Driver, WWN_KEY};
use crate::error::Code;
use crate::locks::VolumeLocks;
use crate::message::CsiMessage;
use crate::mounter::fake::FakeMounter;
use crate::service::{ControllerService, DeviceScanPolicy, NodeService};
use crate::transport::{CsiClient, CsiServer};
use crate::types::*;
use crate::util::GIB;

const NODE: &str = "pvm-a";
const DEVICE: &str = "/dev/sdb";
const STAGING: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-1/globalmount";
const TARGET: &str = "/mnt/p1";

struct Harness {
    client: CsiClient,
    cloud: Arc<FakeCloud>,
    mounter: Arc<FakeMounter>,
    locks: Arc<VolumeLocks>,
    _dir: tempfile::TempDir,
    _stop: oneshot::Sender<()>,
}

fn start() -> Harness {
    let cloud = Arc::new(FakeCloud::new().with_instance(NODE));
    let mounter = Arc::new(FakeMounter::new());
    let locks = Arc::new(VolumeLocks::new());

    let controller = ControllerService::with_locks(cloud.clone(), locks.clone());
    let node = NodeService::new(mounter.clone(), NODE)
        .with_cloud(cloud.clone())
        .with_device_scan(DeviceScanPolicy {
            attempts: 2,
            interval: std::time::Duration::from_millis(1),
        });
    let driver = Driver::new(Some(controller), Some(node)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    let server = CsiServer::bind(&socket, Arc::new(driver)).unwrap();
    let (stop, rx) = oneshot::channel();
    tokio::spawn(server.serve_until(async {
        let _ = rx.await;
    }));

    Harness {
        client: CsiClient::new(socket),
        cloud,
        mounter,
        locks,
        _dir: dir,
        _stop: stop,
    }
}

impl Harness {
    async fn create(&self, name: &str, bytes: u64) -> Volume {
        let reply = self
            .client
            .call(&CsiMessage::CreateVolume(CreateVolumeRequest {
                name: name.into(),
                capacity_range: Some(CapacityRange {
                    required_bytes: bytes,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![VolumeCapability::mount("ext4", Vec::new())],
                ..Default::default()
            }))
            .await
            .unwrap();
        let CsiMessage::VolumeCreated(volume) = reply else {
            panic!("unexpected reply {reply}");
        };
        volume
    }

    /// Attach, then make the device show up on the node like the SCSI layer
    /// would.
    async fn attach(&self, volume_id: &VolumeId) -> HashMap<String, String> {
        let reply = self
            .client
            .call(&CsiMessage::ControllerPublishVolume(
                ControllerPublishVolumeRequest {
                    volume_id: volume_id.clone(),
                    node_id: NODE.into(),
                    volume_capability: Some(VolumeCapability::mount("ext4", Vec::new())),
                    readonly: false,
                    volume_context: HashMap::new(),
                },
            ))
            .await
            .unwrap();
        let CsiMessage::PublishContext(context) = reply else {
            panic!("unexpected reply {reply}");
        };
        self.mounter.add_device(&context[WWN_KEY], DEVICE, GIB);
        context
    }

    async fn stage_and_publish(&self, volume_id: &VolumeId, context: &HashMap<String, String>) {
        self.client
            .call(&CsiMessage::NodeStageVolume(NodeStageVolumeRequest {
                volume_id: volume_id.clone(),
                staging_target_path: STAGING.into(),
                volume_capability: Some(VolumeCapability::mount("ext4", Vec::new())),
                publish_context: context.clone(),
                volume_context: HashMap::new(),
            }))
            .await
            .unwrap();
        self.client
            .call(&CsiMessage::NodePublishVolume(self.publish_request(volume_id)))
            .await
            .unwrap();
    }

    fn publish_request(&self, volume_id: &VolumeId) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume_id.clone(),
            staging_target_path: STAGING.into(),
            target_path: TARGET.into(),
            volume_capability: Some(VolumeCapability::mount("ext4", Vec::new())),
            read_only: false,
            publish_context: HashMap::new(),
        }
    }
}

#[tokio::test]
async fn full_lifecycle_leaves_nothing_behind() {
    let h = start();

    let volume = h.create("pvc-1", 1).await;
    assert_eq!(volume.capacity_bytes, GIB);
    let again = h.create("pvc-1", 1).await;
    assert_eq!(again.volume_id, volume.volume_id);

    let context = h.attach(&volume.volume_id).await;
    h.stage_and_publish(&volume.volume_id, &context).await;

    assert_eq!(h.mounter.format_of(DEVICE).as_deref(), Some("ext4"));
    assert_eq!(h.mounter.mounts().len(), 2);

    let reply = h
        .client
        .call(&CsiMessage::NodeGetVolumeStats {
            volume_id: volume.volume_id.clone(),
            volume_path: TARGET.into(),
        })
        .await
        .unwrap();
    assert!(matches!(reply, CsiMessage::VolumeStatsResponse(ref s) if s.usage.len() == 2));

    h.client
        .call(&CsiMessage::NodeUnpublishVolume {
            volume_id: volume.volume_id.clone(),
            target_path: TARGET.into(),
        })
        .await
        .unwrap();
    h.client
        .call(&CsiMessage::NodeUnstageVolume {
            volume_id: volume.volume_id.clone(),
            staging_target_path: STAGING.into(),
        })
        .await
        .unwrap();
    h.client
        .call(&CsiMessage::ControllerUnpublishVolume(
            ControllerUnpublishVolumeRequest {
                volume_id: volume.volume_id.clone(),
                node_id: NODE.into(),
            },
        ))
        .await
        .unwrap();
    h.client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap();
    // Deleting a missing volume succeeds.
    h.client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap();

    assert_eq!(h.cloud.disk_count(), 0);
    assert!(h.mounter.mounts().is_empty());
    assert!(!h.mounter.exists(TARGET));
}

#[tokio::test]
async fn publish_over_corrupted_mount_recovers() {
    let h = start();
    let volume = h.create("pvc-2", 2 * GIB).await;
    let context = h.attach(&volume.volume_id).await;
    h.stage_and_publish(&volume.volume_id, &context).await;

    h.mounter.corrupt(TARGET);
    h.client
        .call(&CsiMessage::NodePublishVolume(
            h.publish_request(&volume.volume_id),
        ))
        .await
        .unwrap();

    assert_eq!(h.mounter.force_unmount_calls.load(Ordering::SeqCst), 1);
    let published = h
        .mounter
        .mounts()
        .into_iter()
        .filter(|m| m.path == std::path::Path::new(TARGET))
        .count();
    assert_eq!(published, 1);
}

#[tokio::test]
async fn busy_volume_is_aborted_until_released() {
    let h = start();
    let volume = h.create("pvc-3", GIB).await;

    let guard = h.locks.lock(volume.volume_id.as_str()).unwrap();
    let err = h
        .client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    assert!(err.is_retryable());

    drop(guard);
    h.client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap();
    assert_eq!(h.cloud.disk_count(), 0);
}

#[tokio::test]
async fn node_reports_image_tier() {
    let h = start();
    let reply = h.client.call(&CsiMessage::NodeGetInfo).await.unwrap();
    let CsiMessage::NodeInfoResponse(info) = reply else {
        panic!("unexpected reply {reply}");
    };
    assert_eq!(info.node_id, NODE);
    assert!(info.accessible_topology.is_some());
}
