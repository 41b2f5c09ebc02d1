//! The broker handle shared by every operation.
//!
//! Operations live next to the rules they enforce (`catalog`,
//! `provision`, `binding`, `listing`) as `impl Broker` blocks.

use std::sync::Arc;
use std::time::Duration;

use tether_core::BrokerSettings;
use tether_state::{StateStore, TeamName, User};
use tracing::info;

use crate::error::BrokerResult;
use crate::machine::MachineProvisioner;
use crate::provision::Provisioner;
use crate::remote::ServiceApiClient;
use crate::tasks::TaskPool;

pub struct Broker {
    pub(crate) store: StateStore,
    pub(crate) settings: BrokerSettings,
    pub(crate) client: ServiceApiClient,
    pub(crate) provisioner: Arc<Provisioner>,
    pub(crate) tasks: TaskPool,
    pub(crate) machines: Option<Arc<dyn MachineProvisioner>>,
}

impl Broker {
    pub fn new(store: StateStore, settings: BrokerSettings) -> Self {
        let client = ServiceApiClient::new(settings.remote_timeout);
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            client.clone(),
            settings.clone(),
        ));
        info!(environment = %settings.environment, "broker ready");
        Self {
            store,
            settings,
            client,
            provisioner,
            tasks: TaskPool::new(),
            machines: None,
        }
    }

    /// Start machines through `machines` for services that boot one per
    /// instance.
    pub fn with_machine_provisioner(mut self, machines: Arc<dyn MachineProvisioner>) -> Self {
        self.machines = Some(machines);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Stop background work; see [`TaskPool::shutdown`].
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tasks.shutdown(grace).await
    }

    /// Names of every team the user belongs to.
    pub fn user_teams(&self, user: &User) -> BrokerResult<Vec<TeamName>> {
        let teams = self.store.teams_for_user(&user.email)?;
        Ok(teams.into_iter().map(|team| team.name).collect())
    }
}
