//! In-memory [`Cloud`] used by the service tests.
//!
//! Disks are keyed by name like the real backend's name lookup.  Mutations
//! apply immediately unless a lag is configured, in which case the new state
//! becomes visible only after that many further disk queries.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Cloud, CloudError, Disk, DiskOptions, DiskState, PollPolicy, PvmImage, PvmInstance};
use crate::util::bytes_to_gib;

#[derive(Default)]
struct State {
    disks: HashMap<String, Disk>,
    instances: HashSet<String>,
    /// Attachments issued but not yet visible: (volume, instance, attach?, polls left).
    pending: Vec<(String, String, bool, usize)>,
}

pub(crate) struct FakeCloud {
    state: Mutex<State>,
    /// Queries an attach/detach stays invisible for; `usize::MAX` never settles.
    pub(crate) attach_lag: AtomicUsize,
    pub(crate) create_calls: AtomicUsize,
    pub(crate) resize_calls: AtomicUsize,
    pub(crate) attach_calls: AtomicUsize,
}

impl FakeCloud {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            attach_lag: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            resize_calls: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
        }
    }

    /// Register a PowerVS instance so attach and node info can find it.
    pub(crate) fn with_instance(self, instance_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance_id.to_owned());
        self
    }

    pub(crate) fn disk_count(&self) -> usize {
        self.state.lock().unwrap().disks.len()
    }

    pub(crate) fn disk(&self, volume_id: &str) -> Option<Disk> {
        self.state
            .lock()
            .unwrap()
            .disks
            .values()
            .find(|d| d.volume_id == volume_id)
            .cloned()
    }

    fn settle(state: &mut State) {
        let mut settled = Vec::new();
        state.pending.retain_mut(|(vol, inst, attach, left)| {
            if *left == 0 {
                settled.push((vol.clone(), inst.clone(), *attach));
                false
            } else {
                if *left != usize::MAX {
                    *left -= 1;
                }
                true
            }
        });
        for (vol, inst, attach) in settled {
            if let Some(disk) = state.disks.values_mut().find(|d| d.volume_id == vol) {
                apply_attachment(disk, &inst, attach);
            }
        }
    }
}

fn apply_attachment(disk: &mut Disk, instance_id: &str, attach: bool) {
    if attach {
        if !disk.attached_instances.iter().any(|i| i == instance_id) {
            disk.attached_instances.push(instance_id.to_owned());
        }
    } else {
        disk.attached_instances.retain(|i| i != instance_id);
    }
    disk.state = if disk.attached_instances.is_empty() {
        DiskState::Available
    } else {
        DiskState::InUse
    };
}

fn volume_not_found(volume_id: &str) -> CloudError {
    CloudError::NotFound {
        resource: "volume",
        id: volume_id.to_owned(),
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.disks.contains_key(name) {
            return Err(CloudError::AlreadyExists {
                resource: "volume",
                id: name.to_owned(),
            });
        }
        let disk = Disk {
            volume_id: format!("vol-{}", uuid::Uuid::new_v4()),
            name: name.to_owned(),
            capacity_gib: bytes_to_gib(options.capacity_bytes),
            wwn: format!("6005076810830{:019X}", state.disks.len() + 1),
            disk_type: options.disk_type.clone().unwrap_or_else(|| "tier3".into()),
            state: DiskState::Available,
            shareable: options.shareable,
            attached_instances: Vec::new(),
        };
        state.disks.insert(name.to_owned(), disk.clone());
        Ok(disk)
    }

    async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        let before = state.disks.len();
        state.disks.retain(|_, d| d.volume_id != volume_id);
        if state.disks.len() == before {
            return Err(volume_not_found(volume_id));
        }
        Ok(())
    }

    async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let lag = self.attach_lag.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.instances.contains(instance_id) {
            return Err(CloudError::NotFound {
                resource: "instance",
                id: instance_id.to_owned(),
            });
        }
        let disk = state
            .disks
            .values_mut()
            .find(|d| d.volume_id == volume_id)
            .ok_or_else(|| volume_not_found(volume_id))?;
        if lag == 0 {
            apply_attachment(disk, instance_id, true);
        } else {
            state
                .pending
                .push((volume_id.to_owned(), instance_id.to_owned(), true, lag));
        }
        Ok(())
    }

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
        let lag = self.attach_lag.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let disk = state
            .disks
            .values_mut()
            .find(|d| d.volume_id == volume_id)
            .ok_or_else(|| volume_not_found(volume_id))?;
        if lag == 0 {
            apply_attachment(disk, instance_id, false);
        } else {
            state
                .pending
                .push((volume_id.to_owned(), instance_id.to_owned(), false, lag));
        }
        Ok(())
    }

    async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let disk = state
            .disks
            .values_mut()
            .find(|d| d.volume_id == volume_id)
            .ok_or_else(|| volume_not_found(volume_id))?;
        let new_gib = bytes_to_gib(new_size_bytes);
        if new_gib > disk.capacity_gib {
            disk.capacity_gib = new_gib;
        }
        Ok(disk.capacity_gib)
    }

    async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
        let mut state = self.state.lock().unwrap();
        Self::settle(&mut state);
        state
            .disks
            .values()
            .find(|d| d.volume_id == volume_id)
            .cloned()
            .ok_or_else(|| volume_not_found(volume_id))
    }

    async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError> {
        self.state
            .lock()
            .unwrap()
            .disks
            .get(name)
            .cloned()
            .ok_or_else(|| volume_not_found(name))
    }

    async fn list_disks(&self) -> Result<Vec<Disk>, CloudError> {
        Ok(self.state.lock().unwrap().disks.values().cloned().collect())
    }

    async fn get_pvm_instance_by_id(&self, instance_id: &str) -> Result<PvmInstance, CloudError> {
        if !self.state.lock().unwrap().instances.contains(instance_id) {
            return Err(CloudError::NotFound {
                resource: "instance",
                id: instance_id.to_owned(),
            });
        }
        Ok(PvmInstance {
            id: instance_id.to_owned(),
            name: format!("{instance_id}-name"),
            image_id: format!("{instance_id}-image"),
        })
    }

    async fn get_pvm_instance_by_name(&self, name: &str) -> Result<PvmInstance, CloudError> {
        let id = name.trim_end_matches("-name");
        self.get_pvm_instance_by_id(id).await
    }

    async fn get_image_by_id(&self, image_id: &str) -> Result<PvmImage, CloudError> {
        Ok(PvmImage {
            id: image_id.to_owned(),
            name: format!("{image_id}-name"),
            disk_type: "tier3".to_owned(),
        })
    }

    async fn available_capacity_gib(&self, disk_type: Option<&str>) -> Result<u64, CloudError> {
        Ok(match disk_type {
            Some("tier1") => 1024,
            _ => 4096,
        })
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        }
    }
}
