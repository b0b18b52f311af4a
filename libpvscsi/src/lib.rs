//! # libpvscsi: CSI block volumes on IBM Power Virtual Server
//!
//! `libpvscsi` implements the volume lifecycle of a [Container Storage
//! Interface][csi] driver for PowerVS disks.  The controller side creates,
//! attaches, grows and deletes disks through the PowerVS REST API; the node
//! side finds the attached device by WWN, formats and mounts it, and binds it
//! into workloads.  Requests arrive as JSON over a Unix socket.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its status [`Code`]s. |
//! | [`message`] | [`CsiMessage`] protocol envelope for the socket transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery and health. |
//! | [`controller`] | [`CsiController`] trait: create, attach, expand, delete. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`service`] | [`ControllerService`] and [`NodeService`], the lifecycle engine. |
//! | [`cloud`] | [`Cloud`] trait and the PowerVS REST client. |
//! | [`mounter`] | [`Mounter`] trait and the Linux implementation. |
//! | [`locks`] | [`VolumeLocks`], one in-flight operation per volume. |
//! | [`driver`] | [`Driver`] shell, [`Mode`] and [`DriverOptions`]. |
//! | [`transport`] | Unix socket client and server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod cloud;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod locks;
pub mod message;
pub mod mounter;
pub mod node;
pub mod service;
pub mod transport;
pub mod types;
pub mod util;

#[cfg(test)]
mod sanity;

pub use cloud::{Cloud, CloudError};
pub use controller::CsiController;
pub use driver::{Driver, DriverOptions, Mode};
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use locks::VolumeLocks;
pub use message::CsiMessage;
pub use mounter::{MountError, Mounter};
pub use node::CsiNode;
pub use service::{ControllerService, NodeService};
pub use types::*;
