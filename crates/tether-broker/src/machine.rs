//! Machine launching for services that want a fresh machine per instance.
//!
//! A service whose bootstrap says `when: on-new-instance` gets a machine
//! booted from its `ami` image every time one of its instances is created.
//! The broker has no cloud client of its own: deployments plug one in as a
//! [`MachineProvisioner`] and the broker records the returned machine id
//! on the instance.

use std::future::Future;
use std::pin::Pin;

use tether_core::manifest::ON_NEW_INSTANCE;
use tether_state::Service;
use thiserror::Error;

/// Bootstrap key naming the image to boot.
pub const IMAGE_KEY: &str = "ami";

/// Identifier the cloud assigned to a started machine (e.g. `i-0a1b2c`).
pub type MachineId = String;

pub type MachineFuture<'a> =
    Pin<Box<dyn Future<Output = Result<MachineId, MachineError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to start a {image} machine for instance {instance}: {reason}")]
    Launch {
        image: String,
        instance: String,
        reason: String,
    },
}

/// Starts one machine per instance.
pub trait MachineProvisioner: Send + Sync {
    /// Boot a machine from `image` for `instance` and return its id.
    fn start_machine<'a>(&'a self, image: &'a str, instance: &'a str) -> MachineFuture<'a>;
}

/// What a service asks for when one of its instances is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePlan<'a> {
    /// The remote API owns the resource; no machine is started.
    None,
    /// Boot a machine from this image.
    Boot(&'a str),
    /// `on-new-instance` without an image to boot.
    MissingImage,
}

pub fn machine_plan(service: &Service) -> MachinePlan<'_> {
    if service.bootstrap.get("when").map(String::as_str) != Some(ON_NEW_INSTANCE) {
        return MachinePlan::None;
    }
    match service.bootstrap.get(IMAGE_KEY).map(|image| image.trim()) {
        Some(image) if !image.is_empty() => MachinePlan::Boot(image),
        _ => MachinePlan::MissingImage,
    }
}
