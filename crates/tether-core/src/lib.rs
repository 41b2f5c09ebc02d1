//! tether-core — configuration file, duration strings, and service manifests.

pub mod config;
pub mod duration;
pub mod manifest;

pub use config::{BrokerSettings, TetherConfig};
pub use duration::parse_duration;
pub use manifest::{ManifestError, ServiceManifest};
