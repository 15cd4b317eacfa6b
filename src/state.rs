use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::engine::alerts::AlertPatterns;
use crate::engine::session::DriverSession;
use crate::error::AppError;
use crate::models::load::DriverId;
use crate::notify::{AlertEvent, BroadcastSink};
use crate::observability::metrics::Metrics;
use crate::routing::RoutingProvider;
use crate::store::memory::InMemoryStore;

pub struct AppState {
    pub store: Arc<InMemoryStore>,
    pub sessions: DashMap<DriverId, Arc<DriverSession>>,
    pub alert_events_tx: broadcast::Sender<AlertEvent>,
    pub router: Arc<dyn RoutingProvider>,
    pub alert_patterns: AlertPatterns,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        event_buffer_size: usize,
        alert_patterns: AlertPatterns,
        router: Arc<dyn RoutingProvider>,
    ) -> Self {
        let (alert_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            store: Arc::new(InMemoryStore::new()),
            sessions: DashMap::new(),
            alert_events_tx,
            router,
            alert_patterns,
            metrics: Metrics::new(),
        }
    }

    /// Returns the driver's session, creating an unsubscribed one if needed.
    pub fn session_for(&self, driver_id: &DriverId) -> Arc<DriverSession> {
        self.sessions
            .entry(driver_id.clone())
            .or_insert_with(|| {
                Arc::new(DriverSession::new(
                    self.store.clone(),
                    Arc::new(BroadcastSink::new(self.alert_events_tx.clone())),
                    self.router.clone(),
                    self.alert_patterns.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub fn session(&self, driver_id: &DriverId) -> Result<Arc<DriverSession>, AppError> {
        self.sessions
            .get(driver_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no session for driver {driver_id}")))
    }

    pub fn teardown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().teardown();
        }
    }
}
