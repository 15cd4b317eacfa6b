//! One device's live view of its driver's loads.
//!
//! The session pairs a [`Reconciler`] with an [`AlertDispatcher`] behind one
//! lock and feeds them from a single serial task per subscription. Every
//! apply checks the subscription generation under that lock, so tearing a
//! subscription down stops delivery the moment `teardown` returns, and a
//! resubscription never sees events meant for the previous driver.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::engine::alerts::{AlertDispatcher, AlertPatterns};
use crate::engine::lifecycle::{LifecycleEngine, Trigger};
use crate::engine::projection::ProjectionView;
use crate::engine::reconciler::Reconciler;
use crate::error::LoadError;
use crate::models::load::{DriverId, GeoPoint, Geofence, Load, LoadId, LoadStatus};
use crate::models::route::Route;
use crate::notify::{NotificationSink, OfferChoice};
use crate::observability::metrics::Metrics;
use crate::routing::{RoutingError, RoutingProvider};
use crate::store::{LoadStore, OpenLoadsQuery, StoreError, Subscription, SubscriptionHandle};

pub const DEFAULT_REFUSAL_REASON: &str = "Recusada pelo motorista";

struct ActiveSubscription {
    reconciler: Reconciler,
    alerts: AlertDispatcher,
    arrival_requested: Option<LoadId>,
}

struct SessionCore {
    generation: u64,
    active: Option<ActiveSubscription>,
}

struct Shared {
    core: Mutex<SessionCore>,
    projection_tx: watch::Sender<ProjectionView>,
    lifecycle: LifecycleEngine,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, core: &SessionCore) {
        let view = core
            .active
            .as_ref()
            .map(|active| active.reconciler.projection().view())
            .unwrap_or_else(ProjectionView::unsubscribed);

        self.projection_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    async fn start_trip(&self, generation: u64, load: Load) {
        let result = self
            .lifecycle
            .apply(&load.id, LoadStatus::Accepted, &Trigger::AutoStart)
            .await;

        if let Err(err) = result {
            error!(load_id = %load.id, error = %err, "auto-start write failed");
            let mut core = self.lock();
            if core.generation != generation {
                return;
            }
            if let Some(active) = core.active.as_mut() {
                active.reconciler.revert_trip_start(&load.id);
            }
            self.publish(&core);
        }
    }

    fn fail(&self, generation: u64, err: &StoreError) {
        let mut core = self.lock();
        if core.generation != generation {
            return;
        }
        if let Some(active) = core.active.as_mut() {
            active.reconciler.mark_stale();
        }
        self.publish(&core);
        error!(error = %err, "live query failed; projection is stale until resubscribed");
    }
}

struct Worker {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.handle.cancel();
        self.task.abort();
    }
}

async fn run_feed(shared: Arc<Shared>, generation: u64, mut subscription: Subscription) {
    let handle = subscription.handle();

    while let Some(item) = subscription.next().await {
        let snapshot = match item {
            Ok(snapshot) => snapshot,
            Err(err) => {
                shared.fail(generation, &err);
                return;
            }
        };

        let auto_starts = {
            let mut core = shared.lock();
            if core.generation != generation {
                return;
            }
            let Some(active) = core.active.as_mut() else {
                return;
            };

            let outcome = active.reconciler.apply(snapshot, &mut active.alerts);
            if outcome.projection_reset {
                active.arrival_requested = None;
            }
            shared.publish(&core);
            outcome.auto_starts
        };

        for load in auto_starts {
            shared.start_trip(generation, load).await;
        }
    }

    if !handle.is_cancelled() {
        shared.fail(
            generation,
            &StoreError::SubscriptionClosed("live query ended".to_string()),
        );
    }
}

pub struct DriverSession {
    shared: Arc<Shared>,
    store: Arc<dyn LoadStore>,
    sink: Arc<dyn NotificationSink>,
    router: Arc<dyn RoutingProvider>,
    patterns: AlertPatterns,
    metrics: Metrics,
    worker: Mutex<Option<Worker>>,
}

impl DriverSession {
    pub fn new(
        store: Arc<dyn LoadStore>,
        sink: Arc<dyn NotificationSink>,
        router: Arc<dyn RoutingProvider>,
        patterns: AlertPatterns,
        metrics: Metrics,
    ) -> Self {
        let (projection_tx, _) = watch::channel(ProjectionView::unsubscribed());

        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(SessionCore {
                    generation: 0,
                    active: None,
                }),
                projection_tx,
                lifecycle: LifecycleEngine::new(store.clone(), metrics.clone()),
            }),
            store,
            sink,
            router,
            patterns,
            metrics,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the open-loads query for `driver_id`, replacing any previous
    /// subscription.
    pub async fn subscribe(&self, driver_id: DriverId) -> Result<(), LoadError> {
        self.teardown();

        let subscription = self
            .store
            .subscribe(OpenLoadsQuery::for_driver(&driver_id))
            .await
            .map_err(LoadError::Subscription)?;
        let handle = subscription.handle();

        let generation = {
            let mut core = self.shared.lock();
            core.generation += 1;
            core.active = Some(ActiveSubscription {
                reconciler: Reconciler::new(driver_id.clone(), self.metrics.clone()),
                alerts: AlertDispatcher::new(
                    driver_id.clone(),
                    self.sink.clone(),
                    self.patterns.clone(),
                    self.metrics.clone(),
                ),
                arrival_requested: None,
            });
            self.shared.publish(&core);
            core.generation
        };

        let task = tokio::spawn(run_feed(self.shared.clone(), generation, subscription));
        if let Some(previous) = self.worker().replace(Worker { handle, task }) {
            previous.stop();
        }

        self.metrics.driver_sessions.inc();
        info!(driver_id = %driver_id, "driver session subscribed");
        Ok(())
    }

    /// Stops event delivery and any running offer alert. Safe to call when
    /// not subscribed.
    pub fn teardown(&self) {
        let worker = self.worker().take();

        let driver_id = {
            let mut core = self.shared.lock();
            core.generation += 1;
            let driver_id = core.active.take().map(|mut active| {
                active.alerts.cancel();
                active.reconciler.driver_id().clone()
            });
            self.shared.publish(&core);
            driver_id
        };

        if let Some(worker) = worker {
            worker.stop();
        }

        if let Some(driver_id) = driver_id {
            self.metrics.driver_sessions.dec();
            info!(driver_id = %driver_id, "driver session torn down");
        }
    }

    pub fn driver_id(&self) -> Option<DriverId> {
        self.shared
            .lock()
            .active
            .as_ref()
            .map(|active| active.reconciler.driver_id().clone())
    }

    pub fn projection(&self) -> ProjectionView {
        self.shared.projection_tx.borrow().clone()
    }

    pub fn watch_projection(&self) -> watch::Receiver<ProjectionView> {
        self.shared.projection_tx.subscribe()
    }

    /// Load whose offer alert is currently looping.
    pub fn alert_session(&self) -> Option<LoadId> {
        self.shared
            .lock()
            .active
            .as_ref()
            .and_then(|active| active.alerts.active_session().cloned())
    }

    pub async fn accept(&self, load_id: &LoadId) -> Result<(), LoadError> {
        self.drive(load_id, Trigger::Accept).await
    }

    pub async fn refuse(&self, load_id: &LoadId, reason: impl Into<String>) -> Result<(), LoadError> {
        self.drive(
            load_id,
            Trigger::Refuse {
                reason: reason.into(),
            },
        )
        .await
    }

    pub async fn respond_to_offer(
        &self,
        load_id: &LoadId,
        choice: OfferChoice,
        reason: Option<String>,
    ) -> Result<(), LoadError> {
        match choice {
            OfferChoice::Accept => self.accept(load_id).await,
            OfferChoice::Refuse => {
                let reason = reason.unwrap_or_else(|| DEFAULT_REFUSAL_REASON.to_string());
                self.refuse(load_id, reason).await
            }
        }
    }

    pub async fn confirm(&self, load_id: &LoadId) -> Result<(), LoadError> {
        self.drive(load_id, Trigger::Confirm).await
    }

    pub async fn mark_arrival(&self, load_id: &LoadId) -> Result<(), LoadError> {
        self.drive(load_id, Trigger::MarkArrival).await
    }

    /// Requests arrival confirmation when `point` falls inside the active
    /// trip's geofence. Returns whether a transition was written.
    pub async fn report_position(&self, point: GeoPoint) -> Result<bool, LoadError> {
        let (generation, load_id) = {
            let mut core = self.shared.lock();
            let generation = core.generation;
            let active = core.active.as_mut().ok_or(LoadError::NotSubscribed)?;

            let Some(load) = active.reconciler.projection().load() else {
                return Ok(false);
            };
            let confirmed_in_transit = active
                .reconciler
                .known(&load.id)
                .is_some_and(|known| known.status == LoadStatus::InTransit);
            let inside = load
                .geofence
                .as_ref()
                .is_some_and(|fence| fence.contains(&point));

            if !confirmed_in_transit
                || !inside
                || active.arrival_requested.as_ref() == Some(&load.id)
            {
                return Ok(false);
            }

            let load_id = load.id.clone();
            active.arrival_requested = Some(load_id.clone());
            (generation, load_id)
        };

        info!(load_id = %load_id, lat = point.lat, lng = point.lng, "geofence entered");
        let result = self
            .shared
            .lifecycle
            .apply(&load_id, LoadStatus::InTransit, &Trigger::MarkArrival)
            .await;

        if result.is_err() {
            let mut core = self.shared.lock();
            if core.generation == generation {
                if let Some(active) = core.active.as_mut() {
                    active.arrival_requested = None;
                }
            }
        }

        result.map(|_| true)
    }

    /// Routes from `origin` to the active load's destination geofence.
    pub async fn plan_route(&self, origin: GeoPoint) -> Result<Route, LoadError> {
        let destination = {
            let core = self.shared.lock();
            let active = core.active.as_ref().ok_or(LoadError::NotSubscribed)?;
            let load = active
                .reconciler
                .projection()
                .load()
                .ok_or_else(|| RoutingError::NoRoute("no active load".to_string()))?;
            load.geofence
                .as_ref()
                .and_then(Geofence::anchor)
                .ok_or_else(|| {
                    RoutingError::NoRoute(format!("load {} has no destination coordinate", load.id))
                })?
        };

        Ok(self.router.route(origin, destination).await?)
    }

    async fn drive(&self, load_id: &LoadId, trigger: Trigger) -> Result<(), LoadError> {
        let (generation, from) = {
            let core = self.shared.lock();
            let active = core.active.as_ref().ok_or(LoadError::NotSubscribed)?;
            let load = active
                .reconciler
                .known(load_id)
                .ok_or_else(|| LoadError::UnknownLoad(load_id.clone()))?;
            (core.generation, load.status)
        };

        self.shared.lifecycle.apply(load_id, from, &trigger).await?;

        if matches!(trigger, Trigger::Accept | Trigger::Refuse { .. }) {
            let mut core = self.shared.lock();
            if core.generation != generation {
                warn!(load_id = %load_id, "session changed while answering offer");
                return Ok(());
            }
            if let Some(active) = core.active.as_mut() {
                active.reconciler.answer_offer(load_id);
                active.alerts.resolve(load_id);
            }
        }

        Ok(())
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::DriverSession;
    use crate::engine::alerts::AlertPatterns;
    use crate::engine::projection::{FeedState, ProjectionView};
    use crate::error::LoadError;
    use crate::models::document::Document;
    use crate::models::load::{DriverId, GeoPoint, LoadStatus, OperationalStatus};
    use crate::notify::testing::RecordingSink;
    use crate::observability::metrics::Metrics;
    use crate::routing::StraightLineRouter;
    use crate::store::memory::InMemoryStore;

    fn session(store: &Arc<InMemoryStore>, sink: &RecordingSink) -> DriverSession {
        DriverSession::new(
            store.clone(),
            Arc::new(sink.clone()),
            Arc::new(StraightLineRouter::new(60.0)),
            AlertPatterns::default(),
            Metrics::new(),
        )
    }

    fn load_doc(driver: &str, status: &str) -> Document {
        json!({
            "status": status,
            "kind": "LOADED_RUN",
            "assignedDriverId": driver,
            "destinoCliente": "Cliente X",
            "geofence": {
                "active": true,
                "shape": { "type": "circle", "center": { "lat": -23.5505, "lng": -46.6333 } },
                "radiusMeters": 300.0
            }
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn wait_for(
        session: &DriverSession,
        predicate: impl Fn(&ProjectionView) -> bool,
    ) -> ProjectionView {
        let mut rx = session.watch_projection();
        timeout(Duration::from_secs(2), async {
            loop {
                let view = rx.borrow_and_update().clone();
                if predicate(&view) {
                    return view;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("projection did not reach expected state")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn accept_then_auto_start_reaches_in_transit() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        let id = store.insert(load_doc("drv-1", "PENDING_ACCEPTANCE"));

        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_until(|| driver.alert_session().is_some()).await;

        driver.accept(&id).await.unwrap();
        let view = wait_for(&driver, |view| {
            view.load.as_ref().is_some_and(|load| load.status == LoadStatus::InTransit)
        })
        .await;

        assert_eq!(view.operational_status, OperationalStatus::LoadedRun);
        assert!(driver.alert_session().is_none());
        wait_until(|| store.get(&id).unwrap()["status"] == "IN_TRANSIT").await;
        assert!(store.get(&id).unwrap().contains_key("tripStartedAt"));
    }

    #[tokio::test]
    async fn failed_accept_keeps_offer_alert_running() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        let id = store.insert(load_doc("drv-1", "PENDING_ACCEPTANCE"));
        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_until(|| driver.alert_session().is_some()).await;

        store.set_offline(true);
        let err = driver.accept(&id).await.unwrap_err();

        assert!(matches!(err, LoadError::RemoteMutationFailed { .. }));
        assert_eq!(driver.alert_session(), Some(id.clone()));
        assert!(driver.projection().load.is_none());
    }

    #[tokio::test]
    async fn geofence_entry_requests_confirmation_once() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        let id = store.insert(load_doc("drv-1", "IN_TRANSIT"));
        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_for(&driver, |view| view.load.is_some()).await;

        let outside = GeoPoint { lat: -23.60, lng: -46.6333 };
        let inside = GeoPoint { lat: -23.5510, lng: -46.6333 };
        assert!(!driver.report_position(outside).await.unwrap());
        assert!(driver.report_position(inside).await.unwrap());
        assert!(!driver.report_position(inside).await.unwrap());

        let view = wait_for(&driver, |view| view.confirmation_pending).await;
        assert_eq!(
            view.load.unwrap().status,
            LoadStatus::AwaitingArrivalConfirmation
        );
        assert_eq!(store.get(&id).unwrap()["status"], "AWAITING_ARRIVAL_CONFIRMATION");
    }

    #[tokio::test]
    async fn teardown_stops_alerts_and_delivery() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        let id = store.insert(load_doc("drv-1", "PENDING_ACCEPTANCE"));
        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_until(|| driver.alert_session().is_some()).await;

        driver.teardown();
        store.insert(load_doc("drv-1", "PENDING_ACCEPTANCE"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.stopped(), vec![id]);
        assert_eq!(driver.projection().feed, FeedState::Unsubscribed);
        driver.teardown();
    }

    #[tokio::test]
    async fn resubscribing_as_another_driver_starts_clean() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        store.insert(load_doc("drv-1", "IN_TRANSIT"));
        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_for(&driver, |view| view.load.is_some()).await;

        driver.subscribe(DriverId::new("drv-2")).await.unwrap();
        let view = wait_for(&driver, |view| view.feed == FeedState::Live).await;

        assert!(view.load.is_none());
        assert_eq!(driver.driver_id(), Some(DriverId::new("drv-2")));
    }

    #[tokio::test]
    async fn broken_feed_marks_projection_stale() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        store.insert(load_doc("drv-1", "IN_TRANSIT"));
        driver.subscribe(DriverId::new("drv-1")).await.unwrap();
        wait_for(&driver, |view| view.load.is_some()).await;

        store.fail_subscriptions("connection reset");

        let view = wait_for(&driver, |view| view.feed == FeedState::Stale).await;
        assert!(view.load.is_some());
    }

    #[tokio::test]
    async fn actions_require_a_subscription() {
        let store = Arc::new(InMemoryStore::new());
        let sink = RecordingSink::default();
        let driver = session(&store, &sink);
        let id = store.insert(load_doc("drv-1", "PENDING_ACCEPTANCE"));

        assert!(matches!(
            driver.accept(&id).await,
            Err(LoadError::NotSubscribed)
        ));
    }
}
