//! VAST CSI Driver Library
//!
//! Kubernetes CSI driver that implements the Container Storage Interface
//! against VAST Data's VMS, presenting NFS-backed exports as CSI volumes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - A VMS REST session (with a file-backed test double for `mock_vast`)
//! - Volume provisioning strategies and client-side mount/unmount helpers

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod builders;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod quantity;
pub mod vms;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
