//! HTTP surface of the daemon.
//!
//! - `POST /events` - event intake (signature-verified when a secret is
//!   configured), returns 202 Accepted
//! - `POST /api/v1/promotions` - submits a promotion request
//! - `GET /api/v1/promotions/{owner}/{branch}` - promotion queue status
//! - `GET /api/v1/environments` - all environment records
//! - `GET /api/v1/environments/{id}` - one environment record
//! - `GET /health` - liveness probe

use std::sync::Arc;

pub mod events;
pub mod health;
pub mod state;

pub use events::events_handler;
pub use health::health_handler;
pub use state::{
    environment_handler, environments_handler, promotion_request_handler,
    promotion_status_handler,
};

use crate::events::DesiredStateSource;
use crate::promotion::PromotionCoordinator;
use crate::store::StateStore;

/// Shared application state, passed to handlers via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<StateStore>,
    source: Arc<DesiredStateSource>,
    promotions: Arc<PromotionCoordinator>,

    /// Intake signing secret; unsigned intake is accepted when `None`.
    event_secret: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(
        store: Arc<StateStore>,
        source: Arc<DesiredStateSource>,
        promotions: Arc<PromotionCoordinator>,
        event_secret: Option<Vec<u8>>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                source,
                promotions,
                event_secret,
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn source(&self) -> &DesiredStateSource {
        &self.inner.source
    }

    pub fn promotions(&self) -> &PromotionCoordinator {
        &self.inner.promotions
    }

    pub fn event_secret(&self) -> Option<&[u8]> {
        self.inner.event_secret.as_deref()
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/events", post(events_handler))
        .route("/api/v1/promotions", post(promotion_request_handler))
        .route(
            "/api/v1/promotions/{owner}/{branch}",
            get(promotion_status_handler),
        )
        .route("/api/v1/environments", get(environments_handler))
        .route("/api/v1/environments/{id}", get(environment_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{NamingConfig, PromotionConfig};
    use crate::identity::IdentityResolver;
    use crate::types::EnvironmentId;
    use tokio::sync::mpsc;

    pub(crate) fn app_state(
        secret: Option<&[u8]>,
    ) -> (AppState, mpsc::UnboundedReceiver<EnvironmentId>) {
        let store = Arc::new(StateStore::new());
        let (source, rx) = DesiredStateSource::new(
            Arc::clone(&store),
            IdentityResolver::new(NamingConfig::default()),
        );
        let source = Arc::new(source);
        let promotions = Arc::new(PromotionCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&source),
            PromotionConfig::default(),
        ));
        (
            AppState::new(store, source, promotions, secret.map(|s| s.to_vec())),
            rx,
        )
    }
}
