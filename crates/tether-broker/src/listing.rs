//! Instances grouped by the services a user can see.

use std::collections::BTreeMap;

use tether_state::{InstanceName, ServiceName, User};

use crate::access::has_access;
use crate::broker::Broker;
use crate::error::BrokerResult;

/// Service name → names of its instances, both sorted.
pub type ServiceListing = BTreeMap<ServiceName, Vec<InstanceName>>;

impl Broker {
    /// Every service the user's teams can access, with its instances.
    /// Accessible services without instances map to an empty list.
    pub fn list_services(&self, user: &User) -> BrokerResult<ServiceListing> {
        let teams = self.user_teams(user)?;
        let mut listing: ServiceListing = self
            .store
            .find_services(|service| has_access(&teams, &service.teams))?
            .into_iter()
            .map(|service| (service.name, Vec::new()))
            .collect();
        if listing.is_empty() {
            return Ok(listing);
        }

        let instances = self
            .store
            .find_instances(|si| listing.contains_key(&si.service_name))?;
        for instance in instances {
            if let Some(names) = listing.get_mut(&instance.service_name) {
                names.push(instance.name);
            }
        }
        for names in listing.values_mut() {
            names.sort();
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use tether_state::InstanceState;

    use crate::testutil::*;

    #[test]
    fn lists_instances_of_accessible_services() {
        let fx = Fixture::new();
        fx.add_service("redis", None, &[TEAM]);
        fx.add_service("mysql", None, &[TEAM]);
        fx.add_instance("redis-globo", "redis", InstanceState::Running, &[], &[]);
        fx.add_instance("mysql-globo", "mysql", InstanceState::Running, &[], &[]);
        fx.add_instance("redis-2", "redis", InstanceState::Unset, &[], &[]);

        let listing = fx.broker.list_services(&fx.user).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["mysql"], vec!["mysql-globo"]);
        assert_eq!(listing["redis"], vec!["redis-2", "redis-globo"]);
    }

    #[test]
    fn accessible_service_without_instances_is_listed_empty() {
        let fx = Fixture::new();
        fx.add_service("redis", None, &[TEAM]);
        fx.add_service("mysql", None, &[TEAM]);
        fx.add_instance("redis-globo", "redis", InstanceState::Running, &[], &[]);

        let listing = fx.broker.list_services(&fx.user).unwrap();
        assert_eq!(listing["redis"], vec!["redis-globo"]);
        assert!(listing["mysql"].is_empty());
    }

    #[test]
    fn inaccessible_services_are_hidden() {
        let fx = Fixture::new();
        fx.add_team("other", &["someone@else.com"]);
        fx.add_service("redis", None, &["other"]);
        fx.add_instance("redis-globo", "redis", InstanceState::Running, &[], &[]);

        assert!(fx.broker.list_services(&fx.user).unwrap().is_empty());
        let outsider = fx.outsider();
        assert!(fx.broker.list_services(&outsider).unwrap().is_empty());
    }
}
