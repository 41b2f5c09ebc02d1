//! Document types for the Tether state store.
//!
//! `Service` and `ServiceInstance` are owned by the broker. `App`, `Team`,
//! and `User` belong to other parts of the platform; only the fields the
//! broker reads or writes are modelled here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Unique name of a catalog entry.
pub type ServiceName = String;

/// Unique name of a provisioned instance.
pub type InstanceName = String;

/// Unique name of a team.
pub type TeamName = String;

/// Unique name of an application.
pub type AppName = String;

// ── Service ───────────────────────────────────────────────────────

/// A catalog entry describing a provisionable backing resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub name: ServiceName,
    /// Environment tag ("production", "test") → base URL of the remote API.
    #[serde(default)]
    pub endpoint: HashMap<String, String>,
    /// Free-form configuration consumed by the remote API.
    #[serde(default)]
    pub bootstrap: HashMap<String, String>,
    /// Teams allowed to manage this catalog entry.
    #[serde(default)]
    pub teams: Vec<TeamName>,
}

impl Service {
    /// Base URL of the remote API for `environment`, if declared.
    pub fn endpoint_for(&self, environment: &str) -> Option<&str> {
        self.endpoint
            .get(environment)
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }

    /// Whether the service talks to a remote API in any environment.
    pub fn has_endpoint(&self) -> bool {
        self.endpoint.values().any(|url| !url.is_empty())
    }
}

// ── Service instance ──────────────────────────────────────────────

/// Readiness of a provisioned instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created, backing resource not reachable yet.
    #[default]
    Unset,
    Running,
    /// Gave up waiting for the backing resource.
    Error,
}

/// A named, provisioned unit of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub name: InstanceName,
    /// The catalog entry this instance was created from. Not an ownership
    /// link: the service may be deleted while the instance lives on.
    pub service_name: ServiceName,
    /// Address of the backing resource, set once it is reachable.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub state: InstanceState,
    /// Credentials returned by the remote API.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub teams: Vec<TeamName>,
    #[serde(default)]
    pub apps: Vec<AppName>,
    /// Machine started for this instance, when its service boots one per
    /// instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
}

impl ServiceInstance {
    /// A fresh, not-yet-ready instance.
    pub fn pending(name: &str, service_name: &str, teams: Vec<TeamName>) -> Self {
        Self {
            name: name.to_string(),
            service_name: service_name.to_string(),
            teams,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn is_bound_to(&self, app: &str) -> bool {
        self.apps.iter().any(|a| a == app)
    }
}

// ── App ───────────────────────────────────────────────────────────

/// One environment variable on an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    /// Visible to operators when true; credentials are always private.
    #[serde(default)]
    pub public: bool,
    /// Set when the variable was injected by binding to this instance.
    #[serde(default)]
    pub instance_name: Option<InstanceName>,
}

impl EnvVar {
    /// A private variable contributed by `instance`.
    pub fn from_instance(name: &str, value: &str, instance: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            public: false,
            instance_name: Some(instance.to_string()),
        }
    }
}

/// A deployed unit of an app.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Unit {
    pub name: String,
    /// Network address; empty until the unit is placed.
    #[serde(default)]
    pub ip: String,
}

/// The slice of an application record the broker works with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub name: AppName,
    #[serde(default)]
    pub teams: Vec<TeamName>,
    #[serde(default)]
    pub units: Vec<Unit>,
    #[serde(default)]
    pub env: BTreeMap<String, EnvVar>,
}

impl App {
    /// Addresses of units that already have one.
    pub fn unit_ips(&self) -> impl Iterator<Item = &str> {
        self.units
            .iter()
            .map(|u| u.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// Merge variables into the environment, overwriting colliding names.
    pub fn set_envs(&mut self, vars: impl IntoIterator<Item = EnvVar>) {
        for var in vars {
            self.env.insert(var.name.clone(), var);
        }
    }

    /// Drop every variable contributed by `instance`. Returns how many went.
    pub fn unset_instance_envs(&mut self, instance: &str) -> usize {
        let before = self.env.len();
        self.env
            .retain(|_, var| var.instance_name.as_deref() != Some(instance));
        before - self.env.len()
    }
}

// ── Team / User ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub name: TeamName,
    /// Member emails.
    #[serde(default)]
    pub users: Vec<String>,
}

impl Team {
    pub fn contains(&self, email: &str) -> bool {
        self.users.iter().any(|u| u == email)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub email: String,
}
