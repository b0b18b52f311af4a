//! `pvscsi`: PowerVS block storage CSI driver.
//!
//! ```bash
//! # controller Deployment
//! pvscsi --mode controller --cloud-instance-id <ws> --zone dal12
//!
//! # node DaemonSet
//! pvscsi --mode node --cloud-instance-id <ws> --instance-id <pvm> --zone dal12
//! ```

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libpvscsi::cloud::Cloud;
use libpvscsi::cloud::powervs::PowerVsCloud;
use libpvscsi::mounter::LinuxMounter;
use libpvscsi::transport::CsiServer;
use libpvscsi::util::parse_endpoint;
use libpvscsi::{ControllerService, Driver, NodeService};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Args;

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() {
    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::error!("cannot install signal handlers, serving until killed");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let options = args.driver_options()?;
    init_tracing(options.debug);

    let cloud: Arc<dyn Cloud> = Arc::new(
        PowerVsCloud::new(args.powervs_config()?).context("failed to build PowerVS client")?,
    );

    let controller = options
        .mode
        .serves_controller()
        .then(|| ControllerService::new(cloud.clone()));
    let node = match (options.mode.serves_node(), &options.instance_id) {
        (true, Some(instance_id)) => Some(
            NodeService::new(Arc::new(LinuxMounter::new()), instance_id.clone())
                .with_cloud(cloud.clone())
                .with_max_volumes(options.volume_attach_limit),
        ),
        _ => None,
    };
    let driver = Arc::new(Driver::new(controller, node)?);

    let socket = parse_endpoint(&options.endpoint)?;
    let server = CsiServer::bind(socket, driver)?;
    info!(mode = %options.mode, endpoint = %options.endpoint, "serving CSI requests");
    server.serve_until(shutdown_signal()).await?;
    Ok(())
}
