//! Binding engine: attaching service instances to apps.
//!
//! Binding copies the instance credentials (plus whatever the service API
//! returns for the app's first unit) into the app env as private variables
//! tagged with the instance name. Unbinding strips exactly the variables
//! carrying that tag and notifies the service API in the background.
//!
//! Membership of `ServiceInstance::apps` is only ever changed through the
//! store's atomic set updates, so concurrent binds cannot lose each other.
//! The bind variables are written in the same transaction that checks the
//! app is still bound; a bind that lost a race with an unbind writes
//! nothing and retracts its service API bind.

use std::any::Any;

use tether_state::*;
use tracing::{debug, info, warn};

use crate::access::{Revocation, has_access, revoke_team};
use crate::broker::Broker;
use crate::error::*;

impl Broker {
    /// Bind `app_name` to `instance_name`. Returns the variables written
    /// to the app.
    pub async fn bind(
        &self,
        instance_name: &str,
        app_name: &str,
        user: &User,
    ) -> BrokerResult<Vec<EnvVar>> {
        let teams = self.user_teams(user)?;
        let instance = self.accessible_instance(instance_name, &teams)?;
        if !instance.is_running() {
            return Err(BrokerError::precondition(
                "This service instance is not ready yet.",
            ));
        }
        let app = self.accessible_app(app_name, &teams)?;

        let service = self.store.get_service(&instance.service_name)?;
        let unit_ip = app.unit_ips().next().map(str::to_string);
        if service.as_ref().is_some_and(Service::has_endpoint) && unit_ip.is_none() {
            return Err(BrokerError::precondition("This app does not have an IP yet."));
        }

        match self.store.add_instance_app(instance_name, app_name)? {
            SetChange::Applied => {}
            SetChange::Unchanged => {
                return Err(BrokerError::conflict(
                    "This app is already binded to this service instance.",
                ));
            }
            SetChange::Missing => return Err(BrokerError::not_found(INSTANCE_NOT_FOUND)),
        }

        match self.apply_binding(&instance, &app, service.as_ref(), unit_ip.as_deref()).await {
            Ok(vars) => {
                info!(instance = %instance_name, app = %app_name, vars = vars.len(), "app bound");
                Ok(vars)
            }
            Err(e) => {
                if let Err(undo) = self.store.remove_instance_app(instance_name, app_name) {
                    warn!(instance = %instance_name, app = %app_name, error = %undo, "failed to roll back binding");
                }
                warn!(instance = %instance_name, app = %app_name, error = %e, "bind failed");
                Err(e)
            }
        }
    }

    /// Merge the instance env and the service API's bind response into
    /// the app env.
    async fn apply_binding(
        &self,
        instance: &ServiceInstance,
        app: &App,
        service: Option<&Service>,
        unit_ip: Option<&str>,
    ) -> BrokerResult<Vec<EnvVar>> {
        let mut env = instance.env.clone();
        if env.is_empty() {
            if let Some(service) = service {
                match self.provisioner.fetch_credentials(service, instance).await {
                    Ok(Some(credentials)) => env = credentials,
                    Ok(None) => {}
                    Err(e) => warn!(instance = %instance.name, error = %e, "credential refresh failed"),
                }
            }
        }

        let mut vars: Vec<EnvVar> = sorted(env)
            .map(|(name, value)| EnvVar::from_instance(&name, &value, &instance.name))
            .collect();

        let endpoint = service.and_then(|s| s.endpoint_for(&self.settings.environment));
        let mut remote_bound = false;
        if let (Some(endpoint), Some(ip)) = (endpoint, unit_ip) {
            let extra = self.client.bind(endpoint, &instance.name, ip).await?;
            debug!(instance = %instance.name, app = %app.name, keys = extra.len(), "service API bind accepted");
            remote_bound = true;
            vars.extend(
                sorted(extra).map(|(name, value)| EnvVar::from_instance(&name, &value, &instance.name)),
            );
        }

        let written = vars.clone();
        let write = self.store.set_bound_app_envs(&instance.name, &app.name, vars);
        let outcome: BrokerResult<Vec<EnvVar>> = match write {
            Ok(BoundWrite::Written) => return Ok(written),
            Ok(BoundWrite::NotBound) => Err(BrokerError::conflict(
                "This app was unbound from this service instance while binding.",
            )),
            Ok(BoundWrite::AppMissing) => Err(BrokerError::not_found(APP_NOT_FOUND)),
            Err(e) => Err(e.into()),
        };
        if remote_bound {
            self.notify_unbind(instance, app).await;
        }
        outcome
    }

    /// Detach `app_name` from `instance_name`. Returns how many variables
    /// were removed from the app.
    pub async fn unbind(&self, instance_name: &str, app_name: &str, user: &User) -> BrokerResult<usize> {
        let teams = self.user_teams(user)?;
        let instance = self.accessible_instance(instance_name, &teams)?;
        let app = self.accessible_app(app_name, &teams)?;

        match self.store.remove_instance_app(instance_name, app_name)? {
            SetChange::Applied => {}
            SetChange::Unchanged => {
                return Err(BrokerError::precondition(
                    "This app is not binded to this service instance.",
                ));
            }
            SetChange::Missing => return Err(BrokerError::not_found(INSTANCE_NOT_FOUND)),
        }

        let removed = self.strip_instance_envs(&instance, &app.name)?;
        self.notify_unbind(&instance, &app).await;
        info!(instance = %instance_name, app = %app_name, removed, "app unbound");
        Ok(removed)
    }

    /// App teardown hook: forget `subject` in every instance it is bound
    /// to. No service API is contacted. Returns how many instances changed.
    pub fn unbind_service_instances_from_app(&self, subject: &dyn Any) -> BrokerResult<u32> {
        let Some(app) = subject.downcast_ref::<App>() else {
            return Err(BrokerError::InvalidArgument("app must have type App".to_string()));
        };
        let count = self.store.remove_app_from_instances(&app.name)?;
        info!(app = %app.name, instances = count, "app detached from all instances");
        Ok(count)
    }

    /// Remove an instance, unbinding every app bound to it first.
    pub async fn delete_instance(&self, name: &str, user: &User) -> BrokerResult<()> {
        let teams = self.user_teams(user)?;
        let instance = self.accessible_instance(name, &teams)?;

        for app_name in &instance.apps {
            let Some(app) = self.store.get_app(app_name)? else {
                debug!(instance = %name, app = %app_name, "bound app no longer exists");
                continue;
            };
            self.strip_instance_envs(&instance, app_name)?;
            self.notify_unbind(&instance, &app).await;
        }

        self.store.delete_instance(name)?;
        info!(instance = %name, apps = instance.apps.len(), user = %user.email, "instance deleted");
        Ok(())
    }

    pub fn grant_instance_access(&self, instance: &str, team: &str, user: &User) -> BrokerResult<()> {
        self.accessible_instance(instance, &self.user_teams(user)?)?;
        self.existing_team(team)?;

        match self.store.add_instance_team(instance, team)? {
            SetChange::Applied => {
                info!(%instance, %team, "team granted instance access");
                Ok(())
            }
            SetChange::Unchanged => Err(BrokerError::conflict(
                "This team already has access to this instance",
            )),
            SetChange::Missing => Err(BrokerError::not_found(INSTANCE_NOT_FOUND)),
        }
    }

    pub fn revoke_instance_access(&self, instance: &str, team: &str, user: &User) -> BrokerResult<()> {
        self.accessible_instance(instance, &self.user_teams(user)?)?;
        self.existing_team(team)?;

        let outcome = self
            .store
            .update_instance(instance, |si| revoke_team(&mut si.teams, team))?;
        match outcome {
            Some(Revocation::Revoked) => {
                info!(%instance, %team, "team instance access revoked");
                Ok(())
            }
            Some(Revocation::NotGranted) => Err(BrokerError::not_found(
                "This team does not have access to this instance",
            )),
            Some(Revocation::LastTeam) => Err(BrokerError::forbidden(
                "You can not revoke the access from this team, because it is the unique team \
                 with access to this instance, and an instance can not be orphaned",
            )),
            None => Err(BrokerError::not_found(INSTANCE_NOT_FOUND)),
        }
    }

    fn accessible_instance(&self, name: &str, teams: &[TeamName]) -> BrokerResult<ServiceInstance> {
        let instance = self
            .store
            .get_instance(name)?
            .ok_or_else(|| BrokerError::not_found(INSTANCE_NOT_FOUND))?;
        if !has_access(teams, &instance.teams) {
            return Err(BrokerError::forbidden(NO_INSTANCE_ACCESS));
        }
        Ok(instance)
    }

    fn accessible_app(&self, name: &str, teams: &[TeamName]) -> BrokerResult<App> {
        let app = self
            .store
            .get_app(name)?
            .ok_or_else(|| BrokerError::not_found(APP_NOT_FOUND))?;
        if !has_access(teams, &app.teams) {
            return Err(BrokerError::forbidden(NO_APP_ACCESS));
        }
        Ok(app)
    }

    fn strip_instance_envs(&self, instance: &ServiceInstance, app: &str) -> BrokerResult<usize> {
        let removed = self
            .store
            .update_app(app, |a| a.unset_instance_envs(&instance.name))?
            .unwrap_or(0);
        debug!(instance = %instance.name, %app, removed, "instance variables stripped");
        Ok(removed)
    }

    /// Tell the service API, in the background, that every unit of `app`
    /// is gone. Failures are only logged.
    async fn notify_unbind(&self, instance: &ServiceInstance, app: &App) {
        let service = match self.store.get_service(&instance.service_name) {
            Ok(Some(service)) => service,
            Ok(None) => return,
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "failed to load service, unbind not notified");
                return;
            }
        };
        let Some(endpoint) = service.endpoint_for(&self.settings.environment) else {
            return;
        };

        let endpoint = endpoint.to_string();
        let instance_name = instance.name.clone();
        let app_name = app.name.clone();
        let ips: Vec<String> = app.unit_ips().map(str::to_string).collect();
        let client = self.client.clone();

        self.tasks
            .spawn(format!("unbind:{instance_name}:{app_name}"), move |shutdown| async move {
                for ip in ips {
                    let cancelled = *shutdown.borrow();
                    if cancelled {
                        debug!(instance = %instance_name, app = %app_name, "unbind notification cancelled");
                        return;
                    }
                    match client.unbind(&endpoint, &instance_name, &ip).await {
                        Ok(()) => debug!(instance = %instance_name, unit = %ip, "service API unbind accepted"),
                        Err(e) => warn!(instance = %instance_name, unit = %ip, error = %e, "service API unbind failed"),
                    }
                }
            })
            .await;
    }
}

fn sorted(env: impl IntoIterator<Item = (String, String)>) -> impl Iterator<Item = (String, String)> {
    let mut pairs: Vec<_> = env.into_iter().collect();
    pairs.sort();
    pairs.into_iter()
}
