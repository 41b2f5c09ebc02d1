//! redb table definitions for the Tether state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized documents).

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type DocumentTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Catalog entries keyed by service name.
pub const SERVICES: DocumentTable = TableDefinition::new("services");

/// Provisioned instances keyed by instance name.
pub const SERVICE_INSTANCES: DocumentTable = TableDefinition::new("service_instances");

/// Application records keyed by app name.
pub const APPS: DocumentTable = TableDefinition::new("apps");

/// Teams keyed by team name.
pub const TEAMS: DocumentTable = TableDefinition::new("teams");

/// Users keyed by email.
pub const USERS: DocumentTable = TableDefinition::new("users");
