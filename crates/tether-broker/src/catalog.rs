//! Catalog lifecycle: registering services and managing their team ACL.

use tether_core::ServiceManifest;
use tether_state::*;
use tracing::{info, warn};

use crate::access::{Revocation, has_access, revoke_team};
use crate::broker::Broker;
use crate::error::*;

impl Broker {
    /// Register a service from a YAML manifest. Every team of the
    /// requester becomes an owner.
    pub fn create_service(&self, manifest_yaml: &str, user: &User) -> BrokerResult<Service> {
        let manifest = ServiceManifest::from_yaml(manifest_yaml)?;
        self.create_service_from_manifest(manifest, user)
    }

    pub fn create_service_from_manifest(
        &self,
        manifest: ServiceManifest,
        user: &User,
    ) -> BrokerResult<Service> {
        let teams = self.user_teams(user)?;
        if teams.is_empty() {
            return Err(BrokerError::forbidden(
                "In order to create a service, you should be member of at least one team",
            ));
        }

        let on_new_instance = manifest.provisions_on_new_instance();
        let service = Service {
            name: manifest.id,
            endpoint: manifest.endpoint,
            bootstrap: manifest.bootstrap,
            teams,
        };
        if !self.store.create_service(&service)? {
            return Err(BrokerError::conflict(format!(
                "Service with name {} already exists.",
                service.name
            )));
        }

        info!(
            service = %service.name,
            teams = ?service.teams,
            on_new_instance,
            "service registered"
        );
        Ok(service)
    }

    /// Remove a catalog entry. Instances created from it are left alone.
    pub fn delete_service(&self, name: &str, user: &User) -> BrokerResult<()> {
        let service = self.accessible_service(name, user)?;

        let orphans = self
            .store
            .count_instances(|si| si.service_name == service.name)?;
        self.store.delete_service(&service.name)?;

        if orphans > 0 {
            warn!(service = %name, orphans, "service deleted with live instances");
        }
        info!(service = %name, user = %user.email, "service deleted");
        Ok(())
    }

    pub fn grant_access_to_team(&self, service: &str, team: &str, user: &User) -> BrokerResult<()> {
        self.accessible_service(service, user)?;
        self.existing_team(team)?;

        match self.store.add_service_team(service, team)? {
            SetChange::Applied => {
                info!(%service, %team, "team granted service access");
                Ok(())
            }
            SetChange::Unchanged => Err(BrokerError::conflict(
                "This team already has access to this service",
            )),
            SetChange::Missing => Err(BrokerError::not_found(SERVICE_NOT_FOUND)),
        }
    }

    /// Drop a team from the service ACL. The last team cannot be removed.
    pub fn revoke_access_from_team(
        &self,
        service: &str,
        team: &str,
        user: &User,
    ) -> BrokerResult<()> {
        self.accessible_service(service, user)?;
        self.existing_team(team)?;

        let outcome = self
            .store
            .update_service(service, |svc| revoke_team(&mut svc.teams, team))?;
        match outcome {
            Some(Revocation::Revoked) => {
                info!(%service, %team, "team service access revoked");
                Ok(())
            }
            Some(Revocation::NotGranted) => Err(BrokerError::not_found(
                "This team does not have access to this service",
            )),
            Some(Revocation::LastTeam) => Err(BrokerError::forbidden(
                "You can not revoke the access from this team, because it is the unique team \
                 with access to this service, and a service can not be orphaned",
            )),
            None => Err(BrokerError::not_found(SERVICE_NOT_FOUND)),
        }
    }

    fn accessible_service(&self, name: &str, user: &User) -> BrokerResult<Service> {
        let service = self
            .store
            .get_service(name)?
            .ok_or_else(|| BrokerError::not_found(SERVICE_NOT_FOUND))?;
        if !has_access(&self.user_teams(user)?, &service.teams) {
            return Err(BrokerError::forbidden(NO_SERVICE_ACCESS));
        }
        Ok(service)
    }

    pub(crate) fn existing_team(&self, name: &str) -> BrokerResult<Team> {
        self.store
            .get_team(name)?
            .ok_or_else(|| BrokerError::not_found(TEAM_NOT_FOUND))
    }
}
