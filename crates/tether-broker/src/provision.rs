//! Provisioning engine.
//!
//! Creating an instance only persists it in the `unset` state. A
//! background watch then polls the stored record until an external agent
//! marks it `running`, and fetches the instance credentials from the
//! service API. The watch gives up after `poll_timeout`, flagging the
//! instance as `error`.
//!
//! Services bootstrapped `on-new-instance` also get a machine booted
//! before the watch starts; its id is stored on the instance.

use std::time::Duration;

use tether_core::BrokerSettings;
use tether_state::*;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::access::has_access;
use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::machine::{MachineId, MachinePlan, machine_plan};
use crate::remote::{Credentials, ServiceApiClient};

/// How a readiness watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Instance reached `running`; credentials were fetched if possible.
    Ready,
    /// Instance stayed `unset` past the deadline and was marked `error`.
    TimedOut,
    /// Something else marked the instance `error`.
    Failed,
    /// The instance record was deleted.
    Vanished,
    /// The broker is shutting down.
    Cancelled,
}

pub struct Provisioner {
    store: StateStore,
    client: ServiceApiClient,
    settings: BrokerSettings,
}

impl Provisioner {
    pub fn new(store: StateStore, client: ServiceApiClient, settings: BrokerSettings) -> Self {
        Self {
            store,
            client,
            settings,
        }
    }

    /// Pull credentials for `instance` from its service API and merge them
    /// into the stored instance env.
    ///
    /// Returns `None` when the service has no endpoint for the configured
    /// environment; nothing is fetched then.
    pub async fn fetch_credentials(
        &self,
        service: &Service,
        instance: &ServiceInstance,
    ) -> BrokerResult<Option<Credentials>> {
        let Some(endpoint) = service.endpoint_for(&self.settings.environment) else {
            debug!(
                instance = %instance.name,
                service = %service.name,
                environment = %self.settings.environment,
                "no endpoint, skipping credential fetch"
            );
            return Ok(None);
        };

        let credentials = self.client.fetch_credentials(endpoint, &instance.name).await?;
        if !self.store.merge_instance_env(&instance.name, credentials.clone())? {
            return Err(BrokerError::not_found(crate::error::INSTANCE_NOT_FOUND));
        }
        info!(instance = %instance.name, keys = credentials.len(), "instance credentials stored");
        Ok(Some(credentials))
    }

    /// Poll `name` until it is running, then fetch its credentials.
    pub async fn watch_instance(
        &self,
        name: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> WatchOutcome {
        let deadline = Instant::now() + self.settings.poll_timeout;
        debug!(instance = %name, timeout = ?self.settings.poll_timeout, "watching instance readiness");

        loop {
            match self.store.get_instance(name) {
                Ok(None) => {
                    debug!(instance = %name, "instance removed, watch stopped");
                    return WatchOutcome::Vanished;
                }
                Ok(Some(instance)) => match instance.state {
                    InstanceState::Running => {
                        self.on_ready(&instance).await;
                        return WatchOutcome::Ready;
                    }
                    InstanceState::Error => {
                        warn!(instance = %name, "instance failed, watch stopped");
                        return WatchOutcome::Failed;
                    }
                    InstanceState::Unset => {}
                },
                Err(e) => warn!(instance = %name, error = %e, "failed to read instance state"),
            }

            if Instant::now() >= deadline {
                self.mark_timed_out(name);
                return WatchOutcome::TimedOut;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_delay(deadline)) => {}
                _ = shutdown.changed() => {
                    debug!(instance = %name, "readiness watch cancelled");
                    return WatchOutcome::Cancelled;
                }
            }
        }
    }

    fn poll_delay(&self, deadline: Instant) -> Duration {
        self.settings
            .poll_interval
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    async fn on_ready(&self, instance: &ServiceInstance) {
        info!(instance = %instance.name, host = ?instance.host, "instance is running");
        let service = match self.store.get_service(&instance.service_name) {
            Ok(Some(service)) => service,
            Ok(None) => {
                warn!(instance = %instance.name, service = %instance.service_name, "service gone, credentials not fetched");
                return;
            }
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "failed to load service");
                return;
            }
        };
        if let Err(e) = self.fetch_credentials(&service, instance).await {
            warn!(instance = %instance.name, error = %e, "credential fetch failed");
        }
    }

    fn mark_timed_out(&self, name: &str) {
        let flagged = self.store.update_instance(name, |si| {
            if si.state == InstanceState::Unset {
                si.state = InstanceState::Error;
                true
            } else {
                false
            }
        });
        match flagged {
            Ok(Some(true)) => {
                warn!(instance = %name, timeout = ?self.settings.poll_timeout, "instance never became ready, marked error")
            }
            Ok(_) => debug!(instance = %name, "instance changed state at the deadline"),
            Err(e) => warn!(instance = %name, error = %e, "failed to mark instance error"),
        }
    }
}

impl Broker {
    /// Persist a new `unset` instance of `service_name` and start watching
    /// it in the background. Does not wait for readiness.
    pub async fn create_instance(
        &self,
        name: &str,
        service_name: &str,
        user: &User,
    ) -> BrokerResult<ServiceInstance> {
        if name.trim().is_empty() {
            return Err(BrokerError::InvalidArgument(
                "instance name must not be empty".to_string(),
            ));
        }

        let service = self
            .store
            .get_service(service_name)?
            .ok_or_else(|| BrokerError::not_found(format!("Service {service_name} does not exists.")))?;
        let teams = self.user_teams(user)?;
        if !has_access(&teams, &service.teams) {
            return Err(BrokerError::forbidden(format!(
                "You don't have access to service {service_name}"
            )));
        }

        let plan = machine_plan(&service);
        if plan == MachinePlan::MissingImage {
            return Err(BrokerError::InvalidArgument(format!(
                "Service {service_name} boots a machine per instance but declares no ami."
            )));
        }

        let acl = teams
            .into_iter()
            .filter(|team| service.teams.contains(team))
            .collect();
        let mut instance = ServiceInstance::pending(name, service_name, acl);
        if !self.store.create_instance(&instance)? {
            return Err(BrokerError::conflict(format!(
                "Service instance with name {name} already exists."
            )));
        }
        info!(instance = %name, service = %service_name, user = %user.email, "instance created");

        if let MachinePlan::Boot(image) = plan {
            instance.machine = self.boot_machine(image, name).await?;
        }

        let provisioner = self.provisioner.clone();
        let watched = name.to_string();
        self.tasks
            .spawn(format!("provision:{name}"), move |shutdown| async move {
                provisioner.watch_instance(&watched, shutdown).await;
            })
            .await;

        Ok(instance)
    }

    /// Start the instance's machine and record its id. A failed launch
    /// removes the just-created instance again.
    async fn boot_machine(&self, image: &str, instance: &str) -> BrokerResult<Option<MachineId>> {
        let Some(machines) = &self.machines else {
            warn!(%instance, %image, "no machine provisioner configured, machine not started");
            return Ok(None);
        };

        match machines.start_machine(image, instance).await {
            Ok(id) => {
                let recorded = id.clone();
                self.store
                    .update_instance(instance, |si| si.machine = Some(recorded))?;
                info!(%instance, %image, machine = %id, "machine started");
                Ok(Some(id))
            }
            Err(e) => {
                warn!(%instance, %image, error = %e, "machine launch failed");
                if let Err(undo) = self.store.delete_instance(instance) {
                    warn!(%instance, error = %undo, "failed to remove instance after launch failure");
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn with_timeout(timeout: Duration) -> Fixture {
        Fixture::with_settings(BrokerSettings {
            poll_timeout: timeout,
            ..fast_settings()
        })
    }

    #[tokio::test]
    async fn create_instance_returns_before_readiness() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);

        let instance = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();
        assert_eq!(instance.state, InstanceState::Unset);

        let stored = fx.instance("my_mysql");
        assert_eq!(stored.service_name, "mysql");
        assert_eq!(stored.state, InstanceState::Unset);
        assert!(stored.env.is_empty());
        assert!(stored.apps.is_empty());
        assert_eq!(fx.broker.tasks().active().await, vec!["provision:my_mysql"]);

        fx.broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn new_instance_bootstrap_boots_a_machine() {
        let api = fake_service_api(StatusCode::OK, "{}").await;
        let machines = Arc::new(FakeMachines::default());
        let fx = Fixture::new().with_machines(machines.clone());
        fx.add_service("mysql", Some(&api.url), &[TEAM]);
        fx.boot_on_new_instance("mysql", "ami-0000007");

        let instance = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();

        assert_eq!(instance.machine.as_deref(), Some("i-0"));
        assert_eq!(fx.instance("my_mysql").machine.as_deref(), Some("i-0"));
        assert_eq!(
            machines.started(),
            vec![("ami-0000007".to_string(), "my_mysql".to_string())]
        );
        fx.broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn other_services_boot_nothing() {
        let machines = Arc::new(FakeMachines::default());
        let fx = Fixture::new().with_machines(machines.clone());
        fx.add_service("mysql", None, &[TEAM]);

        let instance = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();

        assert!(instance.machine.is_none());
        assert!(machines.started().is_empty());
        fx.broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_machine_launch_removes_the_instance() {
        let machines = Arc::new(FakeMachines {
            failing: true,
            ..FakeMachines::default()
        });
        let fx = Fixture::new().with_machines(machines);
        fx.add_service("mysql", None, &[TEAM]);
        fx.boot_on_new_instance("mysql", "ami-0000007");

        let err = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap_err();

        assert!(matches!(err, BrokerError::Machine(_)), "{err}");
        assert!(fx.store.get_instance("my_mysql").unwrap().is_none());
        assert!(fx.broker.tasks().is_empty().await);
    }

    #[tokio::test]
    async fn new_instance_bootstrap_without_image_is_rejected() {
        let fx = Fixture::new().with_machines(Arc::new(FakeMachines::default()));
        fx.add_service("mysql", None, &[TEAM]);
        fx.store
            .update_service("mysql", |s| {
                s.bootstrap.insert("when".to_string(), "on-new-instance".to_string());
            })
            .unwrap();

        let err = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap_err();

        assert!(matches!(err, BrokerError::InvalidArgument(_)));
        assert!(fx.store.get_instance("my_mysql").unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_machine_provisioner_still_creates_the_instance() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        fx.boot_on_new_instance("mysql", "ami-0000007");

        let instance = fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();

        assert!(instance.machine.is_none());
        assert_eq!(fx.instance("my_mysql").state, InstanceState::Unset);
        fx.broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn create_instance_fetches_credentials_once_running() {
        let api = fake_service_api(StatusCode::OK, r#"{"DATABASE_HOST":"localhost"}"#).await;
        let fx = Fixture::new();
        fx.add_service("mysql", Some(&api.url), &[TEAM]);

        fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();
        fx.mark_running("my_mysql", "10.0.0.9");

        let ready = eventually(Duration::from_secs(3), || {
            fx.instance("my_mysql").env.get("DATABASE_HOST").map(String::as_str) == Some("localhost")
        })
        .await;
        assert!(ready);
        assert!(fx.broker.tasks().wait_idle(Duration::from_secs(2)).await);

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[0].path, "/resources/my_mysql/");
    }

    #[tokio::test]
    async fn running_instance_without_endpoint_keeps_empty_env() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        fx.add_instance("my_mysql", "mysql", InstanceState::Running, &[], &[]);

        let outcome = fx
            .broker
            .provisioner
            .watch_instance("my_mysql", fx.broker.tasks.shutdown_rx())
            .await;
        assert_eq!(outcome, WatchOutcome::Ready);
        assert!(fx.instance("my_mysql").env.is_empty());
    }

    #[tokio::test]
    async fn credential_fetch_failure_is_not_fatal() {
        let api = fake_service_api(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let fx = Fixture::new();
        fx.add_service("mysql", Some(&api.url), &[TEAM]);
        fx.add_instance("my_mysql", "mysql", InstanceState::Running, &[], &[]);

        let outcome = fx
            .broker
            .provisioner
            .watch_instance("my_mysql", fx.broker.tasks.shutdown_rx())
            .await;
        assert_eq!(outcome, WatchOutcome::Ready);
        assert_eq!(fx.instance("my_mysql").state, InstanceState::Running);
        assert!(fx.instance("my_mysql").env.is_empty());
    }

    #[tokio::test]
    async fn readiness_timeout_marks_instance_error() {
        let fx = with_timeout(Duration::from_millis(50));
        fx.add_service("mysql", None, &[TEAM]);

        fx.broker.create_instance("slow", "mysql", &fx.user).await.unwrap();

        let failed = eventually(Duration::from_secs(3), || {
            fx.instance("slow").state == InstanceState::Error
        })
        .await;
        assert!(failed);
        assert!(fx.broker.tasks().wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn watch_stops_when_instance_is_deleted() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        fx.add_instance("gone", "mysql", InstanceState::Unset, &[], &[]);

        let provisioner = fx.broker.provisioner.clone();
        let shutdown = fx.broker.tasks.shutdown_rx();
        let watch = tokio::spawn(async move { provisioner.watch_instance("gone", shutdown).await });
        fx.store.delete_instance("gone").unwrap();

        assert_eq!(watch.await.unwrap(), WatchOutcome::Vanished);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_watch() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        fx.broker.create_instance("pending", "mysql", &fx.user).await.unwrap();

        assert_eq!(fx.broker.shutdown(Duration::from_secs(2)).await, 0);
        assert_eq!(fx.instance("pending").state, InstanceState::Unset);
    }

    #[tokio::test]
    async fn instance_acl_is_requester_teams_with_service_access() {
        let fx = Fixture::new();
        fx.add_team("ops", &[USER_EMAIL]);
        fx.add_team("qa", &[USER_EMAIL]);
        fx.add_service("mysql", None, &[TEAM, "ops"]);

        fx.broker.create_instance("my_mysql", "mysql", &fx.user).await.unwrap();

        let mut teams = fx.instance("my_mysql").teams;
        teams.sort();
        assert_eq!(teams, vec!["ops", TEAM]);
        fx.broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn create_instance_of_unknown_service() {
        let fx = Fixture::new();
        let err = fx
            .broker
            .create_instance("my_mysql", "mysql", &fx.user)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        assert_eq!(err.to_string(), "Service mysql does not exists.");
    }

    #[tokio::test]
    async fn create_instance_without_service_access() {
        let fx = Fixture::new();
        fx.add_team("other", &["someone@else.com"]);
        fx.add_service("mysql", None, &["other"]);

        let err = fx
            .broker
            .create_instance("my_mysql", "mysql", &fx.user)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
        assert_eq!(err.to_string(), "You don't have access to service mysql");
        assert!(fx.store.get_instance("my_mysql").unwrap().is_none());
    }

    #[tokio::test]
    async fn create_instance_with_taken_name() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        fx.add_instance("my_mysql", "mysql", InstanceState::Running, &[], &[]);

        let err = fx
            .broker
            .create_instance("my_mysql", "mysql", &fx.user)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(fx.instance("my_mysql").state, InstanceState::Running);
    }

    #[tokio::test]
    async fn create_instance_rejects_blank_name() {
        let fx = Fixture::new();
        fx.add_service("mysql", None, &[TEAM]);
        let err = fx.broker.create_instance("  ", "mysql", &fx.user).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }
}
