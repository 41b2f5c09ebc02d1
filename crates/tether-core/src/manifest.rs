//! Service manifest parsing.
//!
//! A manifest is the YAML document a service author submits to register a
//! catalog entry:
//!
//! ```yaml
//! id: mysqlapi
//! endpoint:
//!   production: mysqlapi.com
//!   test: localhost:8000
//! bootstrap:
//!   ami: ami-00000007
//!   when: on-new-instance
//! ```
//!
//! `endpoint` and `bootstrap` stay untyped string maps: the remote APIs
//! interpret them, not the broker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Bootstrap trigger asking the remote API for a fresh resource per instance.
pub const ON_NEW_INSTANCE: &str = "on-new-instance";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub id: String,
    #[serde(default)]
    pub endpoint: HashMap<String, String>,
    #[serde(default)]
    pub bootstrap: HashMap<String, String>,
}

impl ServiceManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        let manifest: ServiceManifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::Invalid("id must not be empty".to_string()));
        }
        if self.id.contains('/') || self.id.chars().any(char::is_whitespace) {
            return Err(ManifestError::Invalid(format!(
                "id {:?} must not contain '/' or whitespace",
                self.id
            )));
        }
        if let Some((tag, _)) = self.endpoint.iter().find(|(_, url)| url.trim().is_empty()) {
            return Err(ManifestError::Invalid(format!(
                "endpoint for {tag:?} must not be empty"
            )));
        }
        if self.provisions_on_new_instance()
            && self.bootstrap.get("ami").is_none_or(|ami| ami.trim().is_empty())
        {
            return Err(ManifestError::Invalid(format!(
                "bootstrap.when is {ON_NEW_INSTANCE:?} but no bootstrap.ami is given"
            )));
        }
        Ok(())
    }

    /// Whether the remote API should create a fresh resource per instance.
    pub fn provisions_on_new_instance(&self) -> bool {
        self.bootstrap.get("when").map(String::as_str) == Some(ON_NEW_INSTANCE)
    }
}
