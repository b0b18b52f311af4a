//! Command-line and environment configuration.
//!
//! Every flag falls back to an environment variable so the driver can be
//! configured from a DaemonSet or Deployment spec:
//! - `CSI_ENDPOINT`: socket to serve, `unix:///...`.
//! - `POWERVS_CLOUD_INSTANCE_ID`: PowerVS workspace holding the disks.
//! - `POWERVS_INSTANCE_ID`: PowerVS instance this node runs on.
//! - `POWERVS_REGION` / `POWERVS_ZONE`: API region; derived from the zone
//!   (`dal12` -> `dal`) when only the zone is set.
//! - `IBMCLOUD_API_TOKEN`: bearer token for the PowerVS API.
//! - `POWERVS_CRN`: workspace CRN sent with every request.

use anyhow::{Context, bail};
use clap::Parser;
use libpvscsi::cloud::powervs::PowerVsConfig;
use libpvscsi::driver::{DEFAULT_ENDPOINT, DriverOptions, Mode};

#[derive(Debug, Parser)]
#[command(name = "pvscsi", version, about = "PowerVS block storage CSI driver")]
pub struct Args {
    /// CSI endpoint to listen on.
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Which services to serve: controller, node or all.
    #[arg(long, default_value = "all")]
    pub mode: Mode,

    #[arg(long, env = "POWERVS_CLOUD_INSTANCE_ID")]
    pub cloud_instance_id: String,

    /// PowerVS instance ID of this node.
    #[arg(long, env = "POWERVS_INSTANCE_ID")]
    pub instance_id: Option<String>,

    #[arg(long, env = "POWERVS_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "POWERVS_ZONE")]
    pub zone: Option<String>,

    /// Override the PowerVS API base URL.
    #[arg(long, env = "POWERVS_API_ENDPOINT")]
    pub api_endpoint: Option<String>,

    #[arg(long, env = "IBMCLOUD_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "POWERVS_CRN")]
    pub crn: Option<String>,

    /// Maximum number of volumes attachable to this node; 0 keeps the default.
    #[arg(long, default_value_t = 0)]
    pub volume_attach_limit: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    pub fn driver_options(&self) -> anyhow::Result<DriverOptions> {
        let options = DriverOptions {
            endpoint: self.endpoint.clone(),
            mode: self.mode,
            cloud_instance_id: self.cloud_instance_id.clone(),
            instance_id: self.instance_id.clone(),
            volume_attach_limit: self.volume_attach_limit,
            debug: self.debug,
        };
        options.validate().context("invalid driver options")?;
        Ok(options)
    }

    /// API client settings.  Needed in every mode: the node asks the API for
    /// its own disk tier.
    pub fn powervs_config(&self) -> anyhow::Result<PowerVsConfig> {
        let endpoint = match (&self.api_endpoint, self.region()) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(region)) => PowerVsConfig::endpoint_for_region(&region),
            (None, None) => bail!("one of --api-endpoint, --region or --zone is required"),
        };
        let token = self
            .api_token
            .clone()
            .filter(|t| !t.is_empty())
            .context("an API token is required (--api-token or IBMCLOUD_API_TOKEN)")?;

        let mut config = PowerVsConfig::new(endpoint, self.cloud_instance_id.clone(), token);
        config.crn = self.crn.clone().filter(|c| !c.is_empty());
        Ok(config)
    }

    fn region(&self) -> Option<String> {
        if let Some(region) = self.region.as_ref().filter(|r| !r.is_empty()) {
            return Some(region.clone());
        }
        let zone = self.zone.as_ref()?;
        let region = zone.trim_end_matches(|c: char| c.is_ascii_digit());
        (!region.is_empty()).then(|| region.to_owned())
    }
}
