//! tether-api — REST API for the Tether broker.
//!
//! Thin axum layer: every handler resolves the requesting user, calls one
//! broker operation, and maps the outcome to a status code. The caller is
//! identified by the `x-tether-user` header carrying their email;
//! authenticating that header is left to whatever sits in front.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/services` | Register a service (YAML manifest body) |
//! | DELETE | `/services/{service}` | Delete a service |
//! | PUT | `/services/{service}/{team}` | Grant a team access to a service |
//! | DELETE | `/services/{service}/{team}` | Revoke a team's service access |
//! | GET | `/services/instances` | List instances by accessible service |
//! | POST | `/services/instances` | Create an instance |
//! | DELETE | `/services/instances/{instance}` | Delete an instance |
//! | PUT | `/services/instances/{instance}/{app}` | Bind an app |
//! | DELETE | `/services/instances/{instance}/{app}` | Unbind an app |
//! | PUT | `/services/instances/{instance}/teams/{team}` | Grant instance access |
//! | DELETE | `/services/instances/{instance}/teams/{team}` | Revoke instance access |

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, post, put};
use tether_broker::Broker;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
}

/// Build the complete API router.
pub fn build_router(broker: Arc<Broker>) -> Router {
    let state = ApiState { broker };

    Router::new()
        .route("/services", post(handlers::create_service))
        .route("/services/{service}", delete(handlers::delete_service))
        .route(
            "/services/{service}/{team}",
            put(handlers::grant_service_access).delete(handlers::revoke_service_access),
        )
        .route(
            "/services/instances",
            post(handlers::create_instance).get(handlers::list_services),
        )
        .route("/services/instances/{instance}", delete(handlers::delete_instance))
        .route(
            "/services/instances/{instance}/{app}",
            put(handlers::bind).delete(handlers::unbind),
        )
        .route(
            "/services/instances/{instance}/teams/{team}",
            put(handlers::grant_instance_access).delete(handlers::revoke_instance_access),
        )
        .with_state(state)
}
