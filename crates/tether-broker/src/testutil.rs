//! Shared fixtures for broker tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use tether_core::BrokerSettings;
use tether_state::*;

use crate::broker::Broker;
use crate::machine::{MachineError, MachineFuture, MachineProvisioner};

/// One request received by a fake service API.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: String,
    pub path: String,
    pub body: String,
}

#[derive(Clone)]
struct FakeState {
    status: StatusCode,
    body: &'static str,
    delay: Duration,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

/// A local HTTP server standing in for a service's remote API. Answers
/// every request with the same status and body, and records it.
pub(crate) struct FakeServiceApi {
    pub url: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl FakeServiceApi {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until a recorded call matches, or give up after `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&RecordedCall) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.calls().iter().any(&pred) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn record(
    State(state): State<FakeState>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, &'static str) {
    state.calls.lock().unwrap().push(RecordedCall {
        method: method.to_string(),
        path: uri.path().to_string(),
        body,
    });
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    (state.status, state.body)
}

pub(crate) async fn fake_service_api(status: StatusCode, body: &'static str) -> FakeServiceApi {
    fake_service_api_with_delay(status, body, Duration::ZERO).await
}

/// Like [`fake_service_api`], but each answer is held back by `delay`
/// after the request has been recorded.
pub(crate) async fn fake_service_api_with_delay(
    status: StatusCode,
    body: &'static str,
    delay: Duration,
) -> FakeServiceApi {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let state = FakeState {
        status,
        body,
        delay,
        calls: calls.clone(),
    };
    let router = Router::new().fallback(record).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    FakeServiceApi {
        url: format!("http://{addr}"),
        calls,
    }
}

/// Hands out `i-0`, `i-1`, ... and remembers every (image, instance) it
/// was asked to boot. With `failing`, every launch is refused.
#[derive(Default)]
pub(crate) struct FakeMachines {
    pub failing: bool,
    pub(crate) started: Mutex<Vec<(String, String)>>,
}

impl FakeMachines {
    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().unwrap().clone()
    }
}

impl MachineProvisioner for FakeMachines {
    fn start_machine<'a>(&'a self, image: &'a str, instance: &'a str) -> MachineFuture<'a> {
        Box::pin(async move {
            if self.failing {
                return Err(MachineError::Launch {
                    image: image.to_string(),
                    instance: instance.to_string(),
                    reason: "instance limit exceeded".to_string(),
                });
            }
            let mut started = self.started.lock().unwrap();
            let id = format!("i-{}", started.len());
            started.push((image.to_string(), instance.to_string()));
            Ok(id)
        })
    }
}

pub(crate) const USER_EMAIL: &str = "whydidifall@thewho.com";
pub(crate) const TEAM: &str = "tsuruteam";

pub(crate) fn fast_settings() -> BrokerSettings {
    BrokerSettings {
        environment: "production".to_string(),
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_secs(5),
        remote_timeout: Duration::from_secs(2),
    }
}

/// A broker over an in-memory store holding one user in one team.
pub(crate) struct Fixture {
    pub broker: Broker,
    pub store: StateStore,
    pub user: User,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let user = User {
            email: USER_EMAIL.to_string(),
        };
        store.put_user(&user).unwrap();
        store
            .put_team(&Team {
                name: TEAM.to_string(),
                users: vec![USER_EMAIL.to_string()],
            })
            .unwrap();
        let broker = Broker::new(store.clone(), settings);
        Self {
            broker,
            store,
            user,
        }
    }

    /// Route machine launches through `machines`.
    pub fn with_machines(self, machines: Arc<dyn MachineProvisioner>) -> Self {
        Self {
            broker: self.broker.with_machine_provisioner(machines),
            ..self
        }
    }

    /// Mark `service` as booting an `image` machine per instance.
    pub fn boot_on_new_instance(&self, service: &str, image: &str) {
        self.store
            .update_service(service, |s| {
                s.bootstrap.insert("ami".to_string(), image.to_string());
                s.bootstrap.insert("when".to_string(), "on-new-instance".to_string());
            })
            .unwrap()
            .unwrap();
    }

    /// A user that belongs to no team.
    pub fn outsider(&self) -> User {
        let user = User {
            email: "me@globo.com".to_string(),
        };
        self.store.put_user(&user).unwrap();
        user
    }

    pub fn add_team(&self, name: &str, members: &[&str]) {
        self.store
            .put_team(&Team {
                name: name.to_string(),
                users: members.iter().map(|m| m.to_string()).collect(),
            })
            .unwrap();
    }

    pub fn add_service(&self, name: &str, endpoint: Option<&str>, teams: &[&str]) -> Service {
        let service = Service {
            name: name.to_string(),
            endpoint: endpoint
                .map(|url| [("production".to_string(), url.to_string())].into())
                .unwrap_or_default(),
            bootstrap: Default::default(),
            teams: teams.iter().map(|t| t.to_string()).collect(),
        };
        assert!(self.store.create_service(&service).unwrap());
        service
    }

    pub fn add_instance(
        &self,
        name: &str,
        service: &str,
        state: InstanceState,
        env: &[(&str, &str)],
        apps: &[&str],
    ) -> ServiceInstance {
        let instance = ServiceInstance {
            name: name.to_string(),
            service_name: service.to_string(),
            host: None,
            state,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            teams: vec![TEAM.to_string()],
            apps: apps.iter().map(|a| a.to_string()).collect(),
            machine: None,
        };
        assert!(self.store.create_instance(&instance).unwrap());
        instance
    }

    pub fn add_app(&self, name: &str, teams: &[&str], ips: &[&str]) -> App {
        let app = App {
            name: name.to_string(),
            teams: teams.iter().map(|t| t.to_string()).collect(),
            units: ips
                .iter()
                .enumerate()
                .map(|(i, ip)| Unit {
                    name: format!("{name}/{i}"),
                    ip: ip.to_string(),
                })
                .collect(),
            env: Default::default(),
        };
        self.store.put_app(&app).unwrap();
        app
    }

    /// Flip an instance to running the way an external agent would.
    pub fn mark_running(&self, name: &str, host: &str) {
        self.store
            .update_instance(name, |si| {
                si.state = InstanceState::Running;
                si.host = Some(host.to_string());
            })
            .unwrap()
            .unwrap();
    }

    pub fn instance(&self, name: &str) -> ServiceInstance {
        self.store.get_instance(name).unwrap().unwrap()
    }

    pub fn app(&self, name: &str) -> App {
        self.store.get_app(name).unwrap().unwrap()
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub(crate) async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
