//! StateStore — redb-backed document persistence for Tether.
//!
//! Provides typed CRUD over services, instances, apps, teams, and users,
//! plus atomic element-wise updates of set-valued fields. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of adding or removing one element of a set-valued field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetChange {
    /// The element was added or removed.
    Applied,
    /// The set already had (or already lacked) the element.
    Unchanged,
    /// The document does not exist.
    Missing,
}

/// Outcome of writing bind variables into an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundWrite {
    /// The instance still lists the app; its env was updated.
    Written,
    /// The instance is gone or no longer lists the app. Nothing was written.
    NotBound,
    /// The app does not exist. Nothing was written.
    AppMissing,
}

/// Thread-safe document store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [SERVICES, SERVICE_INSTANCES, APPS, TEAMS, USERS] {
            txn.open_table(table).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic document operations ────────────────────────────────

    fn put<T: Serialize>(&self, table: DocumentTable, key: &str, doc: &T) -> StateResult<()> {
        let value = encode(table, key, doc)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only if no document has this key. Returns false on collision.
    fn insert_new<T: Serialize>(
        &self,
        table: DocumentTable,
        key: &str,
        doc: &T,
    ) -> StateResult<bool> {
        let value = encode(table, key, doc)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            let exists = t.get(key).map_err(map_err!(Storage))?.is_some();
            if !exists {
                t.insert(key, value.as_slice()).map_err(map_err!(Storage))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    fn get<T: DeserializeOwned>(&self, table: DocumentTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Storage))?;
        match t.get(key).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode(table, key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn find<T: DeserializeOwned>(
        &self,
        table: DocumentTable,
        filter: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            let doc: T = decode(table, key.value(), value.value())?;
            if filter(&doc) {
                results.push(doc);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: DocumentTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            existed = t.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write one document inside a single write transaction.
    ///
    /// Returns `None` when the key is absent (nothing is written).
    fn update<T, R>(
        &self,
        table: DocumentTable,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> StateResult<Option<R>>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            let current = t
                .get(key)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value().to_vec());
            outcome = match current {
                Some(bytes) => {
                    let mut doc: T = decode(table, key, &bytes)?;
                    let result = f(&mut doc);
                    let value = encode(table, key, &doc)?;
                    if value != bytes {
                        t.insert(key, value.as_slice()).map_err(map_err!(Storage))?;
                    }
                    Some(result)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    /// Apply `f` to every document in one write transaction, writing back
    /// those for which it returns true. Returns how many were written.
    fn update_all<T>(&self, table: DocumentTable, mut f: impl FnMut(&mut T) -> bool) -> StateResult<u32>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            let entries: Vec<(String, Vec<u8>)> = t
                .iter()
                .map_err(map_err!(Storage))?
                .map(|entry| {
                    let (key, value) = entry.map_err(map_err!(Storage))?;
                    Ok((key.value().to_string(), value.value().to_vec()))
                })
                .collect::<StateResult<_>>()?;
            for (key, bytes) in entries {
                let mut doc: T = decode(table, &key, &bytes)?;
                if f(&mut doc) {
                    let value = encode(table, &key, &doc)?;
                    t.insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Storage))?;
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert a new service. Returns false if the name is taken.
    pub fn create_service(&self, service: &Service) -> StateResult<bool> {
        let created = self.insert_new(SERVICES, &service.name, service)?;
        debug!(name = %service.name, created, "service insert");
        Ok(created)
    }

    /// Insert or replace a service.
    pub fn put_service(&self, service: &Service) -> StateResult<()> {
        self.put(SERVICES, &service.name, service)
    }

    pub fn get_service(&self, name: &str) -> StateResult<Option<Service>> {
        self.get(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        self.find(SERVICES, |_: &Service| true)
    }

    pub fn find_services(&self, filter: impl Fn(&Service) -> bool) -> StateResult<Vec<Service>> {
        self.find(SERVICES, filter)
    }

    /// Delete a service by name. Returns true if it existed.
    pub fn delete_service(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(SERVICES, name)?;
        debug!(%name, existed, "service deleted");
        Ok(existed)
    }

    /// Atomically modify a service. `None` if it does not exist.
    pub fn update_service<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Service) -> R,
    ) -> StateResult<Option<R>> {
        self.update(SERVICES, name, f)
    }

    /// Atomically add a team to a service's ACL.
    pub fn add_service_team(&self, name: &str, team: &str) -> StateResult<SetChange> {
        let change = self.update_service(name, |svc| add_to_set(&mut svc.teams, team))?;
        Ok(change.unwrap_or(SetChange::Missing))
    }

    // ── Service instances ──────────────────────────────────────────

    /// Insert a new instance. Returns false if the name is taken.
    pub fn create_instance(&self, instance: &ServiceInstance) -> StateResult<bool> {
        let created = self.insert_new(SERVICE_INSTANCES, &instance.name, instance)?;
        debug!(name = %instance.name, service = %instance.service_name, created, "instance insert");
        Ok(created)
    }

    /// Insert or replace an instance.
    pub fn put_instance(&self, instance: &ServiceInstance) -> StateResult<()> {
        self.put(SERVICE_INSTANCES, &instance.name, instance)
    }

    pub fn get_instance(&self, name: &str) -> StateResult<Option<ServiceInstance>> {
        self.get(SERVICE_INSTANCES, name)
    }

    pub fn list_instances(&self) -> StateResult<Vec<ServiceInstance>> {
        self.find(SERVICE_INSTANCES, |_: &ServiceInstance| true)
    }

    pub fn find_instances(
        &self,
        filter: impl Fn(&ServiceInstance) -> bool,
    ) -> StateResult<Vec<ServiceInstance>> {
        self.find(SERVICE_INSTANCES, filter)
    }

    pub fn count_instances(&self, filter: impl Fn(&ServiceInstance) -> bool) -> StateResult<usize> {
        Ok(self.find(SERVICE_INSTANCES, filter)?.len())
    }

    /// Delete an instance by name. Returns true if it existed.
    pub fn delete_instance(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(SERVICE_INSTANCES, name)?;
        debug!(%name, existed, "instance deleted");
        Ok(existed)
    }

    /// Atomically modify an instance. `None` if it does not exist.
    pub fn update_instance<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ServiceInstance) -> R,
    ) -> StateResult<Option<R>> {
        self.update(SERVICE_INSTANCES, name, f)
    }

    /// Atomically add an app to an instance's bound set.
    pub fn add_instance_app(&self, name: &str, app: &str) -> StateResult<SetChange> {
        let change = self.update_instance(name, |si| add_to_set(&mut si.apps, app))?;
        Ok(change.unwrap_or(SetChange::Missing))
    }

    /// Atomically remove an app from an instance's bound set.
    pub fn remove_instance_app(&self, name: &str, app: &str) -> StateResult<SetChange> {
        let change = self.update_instance(name, |si| remove_from_set(&mut si.apps, app))?;
        Ok(change.unwrap_or(SetChange::Missing))
    }

    /// Atomically add a team to an instance's ACL.
    pub fn add_instance_team(&self, name: &str, team: &str) -> StateResult<SetChange> {
        let change = self.update_instance(name, |si| add_to_set(&mut si.teams, team))?;
        Ok(change.unwrap_or(SetChange::Missing))
    }

    /// Atomically merge credentials into an instance's env. Returns false
    /// if the instance no longer exists.
    pub fn merge_instance_env(
        &self,
        name: &str,
        env: HashMap<String, String>,
    ) -> StateResult<bool> {
        let merged = self.update_instance(name, |si| si.env.extend(env))?;
        Ok(merged.is_some())
    }

    /// Remove an app from every instance it is bound to, in one transaction.
    pub fn remove_app_from_instances(&self, app: &str) -> StateResult<u32> {
        let count = self.update_all(SERVICE_INSTANCES, |si: &mut ServiceInstance| {
            remove_from_set(&mut si.apps, app) == SetChange::Applied
        })?;
        debug!(%app, count, "app detached from instances");
        Ok(count)
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub fn put_app(&self, app: &App) -> StateResult<()> {
        self.put(APPS, &app.name, app)
    }

    pub fn get_app(&self, name: &str) -> StateResult<Option<App>> {
        self.get(APPS, name)
    }

    pub fn delete_app(&self, name: &str) -> StateResult<bool> {
        self.remove(APPS, name)
    }

    /// Atomically modify an app. `None` if it does not exist.
    pub fn update_app<R>(&self, name: &str, f: impl FnOnce(&mut App) -> R) -> StateResult<Option<R>> {
        self.update(APPS, name, f)
    }

    /// Write `vars` into `app`'s env, but only while `instance` still lists
    /// the app as bound. The membership check and the app write share one
    /// write transaction, so a concurrent unbind either happens entirely
    /// before (nothing written) or entirely after (its strip sees the vars).
    pub fn set_bound_app_envs(
        &self,
        instance: &str,
        app: &str,
        vars: Vec<EnvVar>,
    ) -> StateResult<BoundWrite> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let instances = txn.open_table(SERVICE_INSTANCES).map_err(map_err!(Storage))?;
            let bound = match instances.get(instance).map_err(map_err!(Storage))? {
                Some(guard) => {
                    let si: ServiceInstance = decode(SERVICE_INSTANCES, instance, guard.value())?;
                    si.is_bound_to(app)
                }
                None => false,
            };

            outcome = if !bound {
                BoundWrite::NotBound
            } else {
                let mut apps = txn.open_table(APPS).map_err(map_err!(Storage))?;
                let current = apps
                    .get(app)
                    .map_err(map_err!(Storage))?
                    .map(|guard| guard.value().to_vec());
                match current {
                    Some(bytes) => {
                        let mut doc: App = decode(APPS, app, &bytes)?;
                        doc.set_envs(vars);
                        let value = encode(APPS, app, &doc)?;
                        apps.insert(app, value.as_slice()).map_err(map_err!(Storage))?;
                        BoundWrite::Written
                    }
                    None => BoundWrite::AppMissing,
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%instance, %app, ?outcome, "bind variables write");
        Ok(outcome)
    }

    // ── Teams / users ──────────────────────────────────────────────

    pub fn put_team(&self, team: &Team) -> StateResult<()> {
        self.put(TEAMS, &team.name, team)
    }

    pub fn get_team(&self, name: &str) -> StateResult<Option<Team>> {
        self.get(TEAMS, name)
    }

    pub fn list_teams(&self) -> StateResult<Vec<Team>> {
        self.find(TEAMS, |_: &Team| true)
    }

    pub fn delete_team(&self, name: &str) -> StateResult<bool> {
        self.remove(TEAMS, name)
    }

    /// Every team listing `email` as a member.
    pub fn teams_for_user(&self, email: &str) -> StateResult<Vec<Team>> {
        self.find(TEAMS, |team: &Team| team.contains(email))
    }

    pub fn put_user(&self, user: &User) -> StateResult<()> {
        self.put(USERS, &user.email, user)
    }

    pub fn get_user(&self, email: &str) -> StateResult<Option<User>> {
        self.get(USERS, email)
    }
}

fn encode<T: Serialize>(table: DocumentTable, key: &str, doc: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(doc).map_err(|e| StateError::Encode {
        table: table.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(table: DocumentTable, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        table: table.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn add_to_set(set: &mut Vec<String>, item: &str) -> SetChange {
    if set.iter().any(|s| s == item) {
        SetChange::Unchanged
    } else {
        set.push(item.to_string());
        SetChange::Applied
    }
}

fn remove_from_set(set: &mut Vec<String>, item: &str) -> SetChange {
    let before = set.len();
    set.retain(|s| s != item);
    if set.len() == before {
        SetChange::Unchanged
    } else {
        SetChange::Applied
    }
}
