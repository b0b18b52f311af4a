//! IBM Power Virtual Server implementation of [`Cloud`].
//!
//! Talks to the `pcloud/v1` REST API of one cloud instance (workspace).
//! Every request except volume creation goes through [`with_backoff`], so
//! throttling, 5xx responses and connection failures are retried; all other
//! statuses are mapped to a [`CloudError`] and returned at once.  A create
//! is sent once: if its outcome is unknown the volume is looked up by name.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::poll::with_backoff;
use super::{
    Cloud, CloudError, Disk, DiskOptions, DiskState, PollPolicy, PvmImage, PvmInstance,
    RetryPolicy,
};
use crate::util::bytes_to_gib;

/// Connection settings for one PowerVS workspace.
#[derive(Debug, Clone)]
pub struct PowerVsConfig {
    /// API base URL, e.g. `https://us-south.power-iaas.cloud.ibm.com`.
    pub endpoint: String,
    /// GUID of the PowerVS workspace.
    pub cloud_instance_id: String,
    /// IAM bearer token.
    pub token: String,
    /// Workspace CRN, sent as the `CRN` header when set.
    pub crn: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl PowerVsConfig {
    pub fn new(
        endpoint: impl Into<String>,
        cloud_instance_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            cloud_instance_id: cloud_instance_id.into(),
            token: token.into(),
            crn: None,
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
        }
    }

    /// Public API endpoint of a PowerVS region.
    pub fn endpoint_for_region(region: &str) -> String {
        format!("https://{region}.power-iaas.cloud.ibm.com")
    }
}

/// HTTP client for the PowerVS disk and instance APIs.
#[derive(Debug, Clone)]
pub struct PowerVsCloud {
    client: reqwest::Client,
    config: PowerVsConfig,
}

/// What a request is about, used to build not-found / conflict errors.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    resource: &'static str,
    id: &'a str,
}

impl<'a> Target<'a> {
    fn volume(id: &'a str) -> Self {
        Self {
            resource: "volume",
            id,
        }
    }

    fn instance(id: &'a str) -> Self {
        Self {
            resource: "instance",
            id,
        }
    }

    fn image(id: &'a str) -> Self {
        Self {
            resource: "image",
            id,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeReference {
    #[serde(rename = "volumeID")]
    volume_id: String,
    name: String,
    size: f64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    disk_type: String,
    #[serde(default)]
    wwn: String,
    #[serde(default)]
    shareable: bool,
    #[serde(default, rename = "pvmInstanceIDs")]
    pvm_instance_ids: Vec<String>,
}

impl From<VolumeReference> for Disk {
    fn from(v: VolumeReference) -> Self {
        Self {
            volume_id: v.volume_id,
            name: v.name,
            capacity_gib: v.size.ceil() as u64,
            wwn: v.wwn,
            disk_type: v.disk_type,
            state: DiskState::from(v.state.as_str()),
            shareable: v.shareable,
            attached_instances: v.pvm_instance_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<VolumeReference>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_type: Option<&'a str>,
    shareable: bool,
}

#[derive(Debug, Serialize)]
struct UpdateVolumeBody {
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PvmInstanceReference {
    #[serde(rename = "pvmInstanceID")]
    pvm_instance_id: String,
    server_name: String,
    #[serde(default, rename = "imageID")]
    image_id: String,
}

impl From<PvmInstanceReference> for PvmInstance {
    fn from(p: PvmInstanceReference) -> Self {
        Self {
            id: p.pvm_instance_id,
            name: p.server_name,
            image_id: p.image_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PvmInstanceList {
    #[serde(default)]
    pvm_instances: Vec<PvmInstanceReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageReference {
    #[serde(rename = "imageID")]
    image_id: String,
    name: String,
    #[serde(default)]
    storage_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaximumStorageAllocation {
    max_allocation_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageCapacity {
    maximum_storage_allocation: MaximumStorageAllocation,
}

/// Error body returned by the API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    description: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

fn request_error(e: reqwest::Error) -> CloudError {
    if e.is_timeout() || e.is_connect() {
        CloudError::Transient(e.to_string())
    } else {
        CloudError::Http(e.to_string())
    }
}

fn mentions_limit(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["quota", "exceed", "insufficient", "capacity"]
        .iter()
        .any(|k| message.contains(k))
}

fn classify(status: StatusCode, body: &str, target: Target<'_>) -> CloudError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|e| e.description.or(e.message).or(e.error))
        .unwrap_or_else(|| body.trim().to_owned());

    match status {
        StatusCode::NOT_FOUND => CloudError::NotFound {
            resource: target.resource,
            id: target.id.to_owned(),
        },
        StatusCode::CONFLICT => CloudError::AlreadyExists {
            resource: target.resource,
            id: target.id.to_owned(),
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            CloudError::Transient(format!("{status}: {message}"))
        }
        s if s.is_server_error() => CloudError::Transient(format!("{status}: {message}")),
        s if s.is_client_error() && mentions_limit(&message) => CloudError::ExceedsLimits(message),
        s => CloudError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, CloudError> {
    serde_json::from_str(body).map_err(|e| CloudError::Decode(e.to_string()))
}

impl PowerVsCloud {
    pub fn new(config: PowerVsConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CloudError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create a client with a custom reqwest client.
    pub fn with_client(client: reqwest::Client, config: PowerVsConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &PowerVsConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/pcloud/v1/cloud-instances/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.cloud_instance_id,
            path
        )
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        target: Target<'_>,
    ) -> Result<String, CloudError> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(crn) = &self.config.crn {
            request = request.header("CRN", crn);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let text = response.text().await.map_err(request_error)?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, &text, target))
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        target: Target<'_>,
    ) -> Result<String, CloudError> {
        let what = format!("{method} {path}");
        with_backoff(&what, self.config.retry, || {
            self.send_once(method.clone(), path, body.as_ref(), target)
        })
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, target: Target<'_>) -> Result<T, CloudError> {
        let body = self.send(Method::GET, path, None, target).await?;
        decode(&body)
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<serde_json::Value, CloudError> {
    serde_json::to_value(value).map_err(|e| CloudError::Decode(e.to_string()))
}

#[async_trait]
impl Cloud for PowerVsCloud {
    #[instrument(skip(self, options), fields(size_bytes = options.capacity_bytes))]
    async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError> {
        let body = to_body(&CreateVolumeBody {
            name,
            size: bytes_to_gib(options.capacity_bytes),
            disk_type: options.disk_type.as_deref(),
            shareable: options.shareable,
        })?;
        let response = match self
            .send_once(Method::POST, "volumes", Some(&body), Target::volume(name))
            .await
        {
            Ok(response) => response,
            // The backend may have accepted the request; resending it could
            // create a second disk with the same name.
            Err(e) if e.is_transient() => {
                warn!(name, error = %e, "create outcome unknown, looking volume up by name");
                return match self.get_disk_by_name(name).await {
                    Ok(disk) => Ok(disk),
                    Err(lookup) if lookup.is_not_found() => Err(e),
                    Err(lookup) => Err(lookup),
                };
            }
            Err(e) => return Err(e),
        };
        let disk: Disk = decode::<VolumeReference>(&response)?.into();
        info!(volume_id = %disk.volume_id, size_gib = disk.capacity_gib, "PowerVS volume created");
        Ok(disk)
    }

    async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
        self.send(
            Method::DELETE,
            &format!("volumes/{volume_id}"),
            None,
            Target::volume(volume_id),
        )
        .await?;
        info!(volume_id, "PowerVS volume deleted");
        Ok(())
    }

    async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
        self.send(
            Method::POST,
            &format!("pvm-instances/{instance_id}/volumes/{volume_id}"),
            None,
            Target::volume(volume_id),
        )
        .await?;
        debug!(volume_id, instance_id, "attach requested");
        Ok(())
    }

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
        self.send(
            Method::DELETE,
            &format!("pvm-instances/{instance_id}/volumes/{volume_id}"),
            None,
            Target::volume(volume_id),
        )
        .await?;
        debug!(volume_id, instance_id, "detach requested");
        Ok(())
    }

    async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError> {
        let disk = self.get_disk_by_id(volume_id).await?;
        let new_gib = bytes_to_gib(new_size_bytes);
        if disk.capacity_gib >= new_gib {
            debug!(volume_id, current_gib = disk.capacity_gib, "volume already large enough");
            return Ok(disk.capacity_gib);
        }
        let body = to_body(&UpdateVolumeBody { size: new_gib })?;
        self.send(
            Method::PUT,
            &format!("volumes/{volume_id}"),
            Some(body),
            Target::volume(volume_id),
        )
        .await?;
        info!(volume_id, from_gib = disk.capacity_gib, to_gib = new_gib, "resize requested");
        Ok(new_gib)
    }

    async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
        let volume: VolumeReference = self
            .get(&format!("volumes/{volume_id}"), Target::volume(volume_id))
            .await?;
        Ok(volume.into())
    }

    async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError> {
        let mut matches = self
            .list_disks()
            .await?
            .into_iter()
            .filter(|d| d.name == name);
        match (matches.next(), matches.next()) {
            (Some(disk), None) => Ok(disk),
            (None, _) => Err(CloudError::NotFound {
                resource: "volume",
                id: name.to_owned(),
            }),
            (Some(_), Some(_)) => Err(CloudError::AlreadyExists {
                resource: "volume",
                id: name.to_owned(),
            }),
        }
    }

    async fn list_disks(&self) -> Result<Vec<Disk>, CloudError> {
        let list: VolumeList = self.get("volumes", Target::volume("*")).await?;
        Ok(list.volumes.into_iter().map(Disk::from).collect())
    }

    async fn get_pvm_instance_by_id(&self, instance_id: &str) -> Result<PvmInstance, CloudError> {
        let instance: PvmInstanceReference = self
            .get(
                &format!("pvm-instances/{instance_id}"),
                Target::instance(instance_id),
            )
            .await?;
        Ok(instance.into())
    }

    async fn get_pvm_instance_by_name(&self, name: &str) -> Result<PvmInstance, CloudError> {
        let list: PvmInstanceList = self.get("pvm-instances", Target::instance(name)).await?;
        list.pvm_instances
            .into_iter()
            .find(|p| p.server_name == name)
            .map(PvmInstance::from)
            .ok_or_else(|| CloudError::NotFound {
                resource: "instance",
                id: name.to_owned(),
            })
    }

    async fn get_image_by_id(&self, image_id: &str) -> Result<PvmImage, CloudError> {
        let image: ImageReference = self
            .get(&format!("images/{image_id}"), Target::image(image_id))
            .await?;
        Ok(PvmImage {
            id: image.image_id,
            name: image.name,
            disk_type: image.storage_type,
        })
    }

    async fn available_capacity_gib(&self, disk_type: Option<&str>) -> Result<u64, CloudError> {
        let path = match disk_type {
            Some(t) => format!("storage-capacity/storage-types/{t}"),
            None => "storage-capacity".to_owned(),
        };
        let capacity: StorageCapacity = self
            .get(&path, Target::volume(disk_type.unwrap_or("*")))
            .await?;
        Ok(capacity.maximum_storage_allocation.max_allocation_size)
    }

    fn poll_policy(&self) -> PollPolicy {
        self.config.poll
    }

    async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError> {
        let list: VolumeList = self
            .get(
                &format!("pvm-instances/{instance_id}/volumes"),
                Target::instance(instance_id),
            )
            .await?;
        Ok(list.volumes.iter().any(|v| v.volume_id == volume_id))
    }
}
