//! tether-broker — service catalog, provisioning, and binding engine.
//!
//! Lets platform users register backing services, provision named
//! instances of them, and bind instances to applications so the apps
//! receive connection credentials as private environment variables.
//! Every operation is guarded by team ACLs.
//!
//! # Architecture
//!
//! ```text
//! Broker
//!   ├── StateStore (services, instances, apps, teams)
//!   ├── catalog: create/delete service, grant/revoke team access
//!   ├── provision: create instance → Provisioner task
//!   │     ├── boot a machine first when the service asks for one
//!   │     ├── poll instance until `running` (bounded by poll_timeout)
//!   │     └── GET {endpoint}/resources/{instance}/ → instance env
//!   ├── binding: bind/unbind apps, merge/strip tagged env vars
//!   │     ├── POST {endpoint}/resources/{instance}/        (sync)
//!   │     └── DELETE .../hostname/{unit}/                  (background)
//!   ├── listing: instances grouped by accessible service
//!   └── TaskPool (supervised background tasks)
//! ```
//!
//! Coordination between the request path and background tasks happens
//! only through the persisted `ServiceInstance` record.

pub mod access;
pub mod binding;
pub mod broker;
pub mod catalog;
pub mod error;
pub mod listing;
pub mod machine;
pub mod provision;
pub mod remote;
pub mod tasks;

#[cfg(test)]
mod testutil;

pub use access::has_access;
pub use broker::Broker;
pub use error::{BrokerError, BrokerResult};
pub use listing::ServiceListing;
pub use machine::{MachineError, MachineFuture, MachineId, MachineProvisioner};
pub use provision::{Provisioner, WatchOutcome};
pub use remote::{Credentials, RemoteError, ServiceApiClient};
pub use tasks::TaskPool;
