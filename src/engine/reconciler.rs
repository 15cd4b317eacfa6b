//! Applies live-query snapshots to local state.
//!
//! Changes are applied strictly in delivery order. Every side effect (offer
//! alert, auto-start, arrival alert, projection reset) is guarded by a
//! comparison against the status last applied for the same load: an
//! identical status is a redelivery and fires nothing, a different one is a
//! real remote change and is applied as authoritative, even when it moves the
//! load back along the lifecycle.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::alerts::AlertDispatcher;
use crate::engine::projection::ActiveLoadProjection;
use crate::models::change::{ChangeKind, DocumentChange, QuerySnapshot};
use crate::models::document::normalize;
use crate::models::load::{DriverId, Load, LoadId, LoadStatus};
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferState {
    Alerted,
    /// The driver's answer was written; waiting for the store to show it.
    Answered,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Accepted loads now shown as trips; each needs its IN_TRANSIT write.
    pub auto_starts: Vec<Load>,
    /// The projection was cleared and the operational status went back to
    /// "no scheduled load".
    pub projection_reset: bool,
    pub malformed: usize,
}

pub struct Reconciler {
    driver_id: DriverId,
    projection: ActiveLoadProjection,
    applied: HashMap<LoadId, Load>,
    offers: HashMap<LoadId, OfferState>,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(driver_id: DriverId, metrics: Metrics) -> Self {
        Self {
            driver_id,
            projection: ActiveLoadProjection::new(),
            applied: HashMap::new(),
            offers: HashMap::new(),
            metrics,
        }
    }

    pub fn driver_id(&self) -> &DriverId {
        &self.driver_id
    }

    pub fn projection(&self) -> &ActiveLoadProjection {
        &self.projection
    }

    /// Last applied snapshot of an open load.
    pub fn known(&self, load_id: &LoadId) -> Option<&Load> {
        self.applied.get(load_id)
    }

    pub fn apply(
        &mut self,
        snapshot: QuerySnapshot,
        alerts: &mut AlertDispatcher,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for change in snapshot.changes {
            self.metrics
                .change_events_total
                .with_label_values(&[change.kind.as_str()])
                .inc();
            self.apply_change(change, alerts, &mut outcome);
        }

        if snapshot.size == 0 && self.projection.is_occupied() {
            self.reset_projection(&mut outcome);
        }

        outcome
    }

    fn apply_change(
        &mut self,
        change: DocumentChange,
        alerts: &mut AlertDispatcher,
        outcome: &mut ReconcileOutcome,
    ) {
        if change.kind == ChangeKind::Removed {
            self.retire(&change.load_id, alerts, outcome);
            return;
        }

        let load = match normalize(&change.load_id, &change.document) {
            Ok(load) => load,
            Err(err) => {
                self.metrics.malformed_documents_total.inc();
                outcome.malformed += 1;
                warn!(error = %err, change = change.kind.as_str(), "skipping malformed document");
                return;
            }
        };

        if load.assigned_driver_id != self.driver_id {
            warn!(load_id = %load.id, assigned = %load.assigned_driver_id, "ignoring load assigned to another driver");
            return;
        }

        if !load.status.is_open() {
            self.retire(&load.id, alerts, outcome);
            return;
        }

        let previous = self
            .applied
            .insert(load.id.clone(), load.clone())
            .map(|known| known.status);

        if previous == Some(load.status) {
            self.refresh(load);
            return;
        }

        if let Some(previous) = previous {
            if load.status.rank() < previous.rank() && self.projection.holds(&load.id) {
                info!(load_id = %load.id, status = %load.status, previous = %previous, "load moved back; clearing trip");
                self.projection.clear();
                outcome.projection_reset = true;
            }
        }

        match load.status {
            LoadStatus::AwaitingScheduling | LoadStatus::PendingAcceptance => {
                self.offer(&load, alerts)
            }
            LoadStatus::Accepted => self.accepted(load, alerts, outcome),
            LoadStatus::InTransit | LoadStatus::AwaitingArrivalConfirmation => {
                self.trip(load, previous, alerts)
            }
            LoadStatus::Refused | LoadStatus::Completed => {}
        }
    }

    /// Same status as last applied: only the projected snapshot's fields are
    /// refreshed, no side effect fires.
    fn refresh(&mut self, load: Load) {
        if load.status.is_trip() && self.projection.holds(&load.id) {
            self.projection.track(load);
        } else {
            debug!(load_id = %load.id, status = %load.status, "status unchanged");
        }
    }

    fn offer(&mut self, load: &Load, alerts: &mut AlertDispatcher) {
        if self.offers.contains_key(&load.id) {
            return;
        }
        alerts.request_offer(load);
        self.offers.insert(load.id.clone(), OfferState::Alerted);
    }

    fn accepted(&mut self, load: Load, alerts: &mut AlertDispatcher, outcome: &mut ReconcileOutcome) {
        self.settle_offer(&load.id, alerts);

        if self.projection.has_trip_for(&load.id) {
            debug!(load_id = %load.id, "trip already started locally");
            return;
        }

        self.projection.start_trip(&load, Utc::now());
        info!(load_id = %load.id, label = %load.kind.trip_label(), "trip started");
        outcome.auto_starts.push(load);
    }

    fn trip(&mut self, load: Load, previous: Option<LoadStatus>, alerts: &mut AlertDispatcher) {
        self.settle_offer(&load.id, alerts);

        let arrived = load.status == LoadStatus::AwaitingArrivalConfirmation
            && previous != Some(LoadStatus::AwaitingArrivalConfirmation);
        self.projection.track(load.clone());

        if arrived {
            alerts.request_arrival(&load);
        }
    }

    fn settle_offer(&mut self, load_id: &LoadId, alerts: &mut AlertDispatcher) {
        self.offers.remove(load_id);
        alerts.resolve(load_id);
    }

    fn retire(&mut self, load_id: &LoadId, alerts: &mut AlertDispatcher, outcome: &mut ReconcileOutcome) {
        self.applied.remove(load_id);
        self.settle_offer(load_id, alerts);

        if self.projection.holds(load_id) {
            self.reset_projection(outcome);
        }
    }

    fn reset_projection(&mut self, outcome: &mut ReconcileOutcome) {
        if self.projection.clear() {
            outcome.projection_reset = true;
            info!(driver_id = %self.driver_id, "projection cleared, no scheduled load");
        }
    }

    /// Records that the driver's answer to an offer was written, so the offer
    /// is not raised again while the store catches up.
    pub(crate) fn answer_offer(&mut self, load_id: &LoadId) {
        if self
            .applied
            .get(load_id)
            .is_some_and(|load| load.status.is_offer())
        {
            self.offers.insert(load_id.clone(), OfferState::Answered);
        }
    }

    /// Undoes an optimistic trip start whose write failed, so the next
    /// observation of the accepted load starts it again.
    pub(crate) fn revert_trip_start(&mut self, load_id: &LoadId) -> bool {
        let still_accepted = self
            .applied
            .get(load_id)
            .is_some_and(|load| load.status == LoadStatus::Accepted);
        if !still_accepted {
            return false;
        }

        self.applied.remove(load_id);
        if self.projection.holds(load_id) {
            self.projection.clear();
        }
        warn!(load_id = %load_id, "trip start reverted");
        true
    }

    pub(crate) fn mark_stale(&mut self) {
        self.projection.mark_stale();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::Reconciler;
    use crate::engine::alerts::{AlertDispatcher, AlertPatterns};
    use crate::engine::projection::FeedState;
    use crate::models::change::{ChangeKind, DocumentChange, QuerySnapshot};
    use crate::models::load::{DriverId, LoadId, LoadStatus, OperationalStatus};
    use crate::notify::testing::RecordingSink;
    use crate::notify::{AlertKind, Vibration};
    use crate::observability::metrics::Metrics;

    fn setup() -> (Reconciler, AlertDispatcher, RecordingSink) {
        let sink = RecordingSink::default();
        let metrics = Metrics::new();
        let driver = DriverId::new("drv-1");
        (
            Reconciler::new(driver.clone(), metrics.clone()),
            AlertDispatcher::new(driver, Arc::new(sink.clone()), AlertPatterns::default(), metrics),
            sink,
        )
    }

    fn doc(id: &str, status: &str, kind: &str) -> Value {
        let trip_started = match status {
            "IN_TRANSIT" | "AWAITING_ARRIVAL_CONFIRMATION" => json!("2026-03-01T10:00:00Z"),
            _ => Value::Null,
        };
        json!({
            "status": status,
            "kind": kind,
            "assignedDriverId": "drv-1",
            "destinoCliente": "Cliente X",
            "tripStartedAt": trip_started,
            "ref": id,
        })
    }

    fn change(kind: ChangeKind, id: &str, document: Value) -> DocumentChange {
        DocumentChange {
            kind,
            load_id: LoadId::new(id),
            document: document.as_object().cloned().unwrap(),
        }
    }

    fn single(kind: ChangeKind, id: &str, status: &str, size: usize) -> QuerySnapshot {
        QuerySnapshot {
            changes: vec![change(kind, id, doc(id, status, "LOADED_RUN"))],
            size,
        }
    }

    fn lifecycle_stream() -> Vec<QuerySnapshot> {
        vec![
            single(ChangeKind::Added, "os-1", "PENDING_ACCEPTANCE", 1),
            single(ChangeKind::Modified, "os-1", "ACCEPTED", 1),
            single(ChangeKind::Modified, "os-1", "IN_TRANSIT", 1),
            single(ChangeKind::Modified, "os-1", "AWAITING_ARRIVAL_CONFIRMATION", 1),
        ]
    }

    #[test]
    fn new_offer_raises_one_loaded_run_alert_without_projection() {
        let (mut reconciler, mut alerts, sink) = setup();

        reconciler.apply(
            single(ChangeKind::Added, "os-1", "PENDING_ACCEPTANCE", 1),
            &mut alerts,
        );

        let delivered = sink.alerts();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, AlertKind::Offer);
        assert!(delivered[0].title.contains("Viagem carregado"));
        assert!(delivered[0].body.contains("Cliente X"));
        assert!(reconciler.projection().load().is_none());
        assert_eq!(alerts.active_session(), Some(&LoadId::new("os-1")));
    }

    #[test]
    fn modified_offer_for_same_load_is_not_raised_again() {
        let (mut reconciler, mut alerts, sink) = setup();

        reconciler.apply(single(ChangeKind::Added, "os-1", "AWAITING_SCHEDULING", 1), &mut alerts);
        reconciler.apply(single(ChangeKind::Modified, "os-1", "PENDING_ACCEPTANCE", 1), &mut alerts);

        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn accepted_load_starts_trip_once() {
        let (mut reconciler, mut alerts, sink) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "PENDING_ACCEPTANCE", 1), &mut alerts);

        let first = reconciler.apply(single(ChangeKind::Modified, "os-1", "ACCEPTED", 1), &mut alerts);
        let second = reconciler.apply(single(ChangeKind::Modified, "os-1", "ACCEPTED", 1), &mut alerts);

        assert_eq!(first.auto_starts.len(), 1);
        assert!(second.auto_starts.is_empty());
        let view = reconciler.projection().view();
        assert_eq!(view.load.unwrap().status, LoadStatus::InTransit);
        assert_eq!(view.operational_status, OperationalStatus::LoadedRun);
        assert!(alerts.active_session().is_none());
        assert_eq!(sink.stopped(), vec![LoadId::new("os-1")]);
    }

    #[test]
    fn direct_assignment_without_offer_still_starts_trip() {
        let (mut reconciler, mut alerts, sink) = setup();

        let outcome = reconciler.apply(single(ChangeKind::Added, "os-1", "ACCEPTED", 1), &mut alerts);

        assert_eq!(outcome.auto_starts.len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn arrival_raises_single_short_alert_and_flags_confirmation() {
        let (mut reconciler, mut alerts, sink) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "IN_TRANSIT", 1), &mut alerts);

        reconciler.apply(
            single(ChangeKind::Modified, "os-1", "AWAITING_ARRIVAL_CONFIRMATION", 1),
            &mut alerts,
        );
        reconciler.apply(
            single(ChangeKind::Modified, "os-1", "AWAITING_ARRIVAL_CONFIRMATION", 1),
            &mut alerts,
        );

        let delivered = sink.alerts();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, AlertKind::Arrival);
        assert!(matches!(delivered[0].vibration, Vibration::OneShot(_)));
        assert!(reconciler.projection().view().confirmation_pending);
    }

    #[test]
    fn empty_result_set_resets_projection_exactly_once() {
        let (mut reconciler, mut alerts, _) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "IN_TRANSIT", 1), &mut alerts);

        let first = reconciler.apply(
            QuerySnapshot {
                changes: vec![],
                size: 0,
            },
            &mut alerts,
        );
        let second = reconciler.apply(
            QuerySnapshot {
                changes: vec![],
                size: 0,
            },
            &mut alerts,
        );

        assert!(first.projection_reset);
        assert!(!second.projection_reset);
        let view = reconciler.projection().view();
        assert!(view.load.is_none());
        assert_eq!(view.operational_status, OperationalStatus::NoScheduledLoad);
    }

    #[test]
    fn removal_of_projected_load_clears_it() {
        let (mut reconciler, mut alerts, _) = setup();
        reconciler.apply(
            QuerySnapshot {
                changes: vec![
                    change(ChangeKind::Added, "os-1", doc("os-1", "AWAITING_ARRIVAL_CONFIRMATION", "EMPTY_RUN")),
                    change(ChangeKind::Added, "os-2", doc("os-2", "PENDING_ACCEPTANCE", "EMPTY_RUN")),
                ],
                size: 2,
            },
            &mut alerts,
        );

        let outcome = reconciler.apply(
            single(ChangeKind::Removed, "os-1", "COMPLETED", 1),
            &mut alerts,
        );

        assert!(outcome.projection_reset);
        assert!(!reconciler.projection().view().confirmation_pending);
        assert!(reconciler.known(&LoadId::new("os-1")).is_none());
        assert_eq!(alerts.active_session(), Some(&LoadId::new("os-2")));
    }

    #[test]
    fn duplicated_deliveries_change_nothing() {
        let (mut once, mut once_alerts, once_sink) = setup();
        for snapshot in lifecycle_stream() {
            once.apply(snapshot, &mut once_alerts);
        }

        let (mut twice, mut twice_alerts, twice_sink) = setup();
        for snapshot in lifecycle_stream() {
            twice.apply(snapshot.clone(), &mut twice_alerts);
            twice.apply(snapshot, &mut twice_alerts);
        }

        assert_eq!(once.projection().view(), twice.projection().view());
        assert_eq!(once_alerts.active_session(), twice_alerts.active_session());
        assert_eq!(once_sink.events(), twice_sink.events());
    }

    #[test]
    fn two_open_trips_replayed_raise_one_arrival() {
        let stream = || {
            vec![
                single(ChangeKind::Modified, "os-1", "AWAITING_ARRIVAL_CONFIRMATION", 2),
                single(ChangeKind::Modified, "os-2", "IN_TRANSIT", 2),
            ]
        };

        let (mut once, mut once_alerts, once_sink) = setup();
        for snapshot in stream() {
            once.apply(snapshot, &mut once_alerts);
        }

        let (mut twice, mut twice_alerts, twice_sink) = setup();
        for snapshot in stream().into_iter().chain(stream()) {
            twice.apply(snapshot, &mut twice_alerts);
        }

        assert_eq!(once_sink.alerts().len(), 1);
        assert_eq!(twice_sink.alerts().len(), 1);
        assert_eq!(once.projection().view(), twice.projection().view());
        assert!(twice.projection().holds(&LoadId::new("os-2")));
    }

    #[test]
    fn load_moved_back_to_offer_clears_trip_and_is_offered_again() {
        let (mut reconciler, mut alerts, sink) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "PENDING_ACCEPTANCE", 1), &mut alerts);
        reconciler.apply(single(ChangeKind::Modified, "os-1", "ACCEPTED", 1), &mut alerts);
        assert!(reconciler.projection().is_occupied());

        let outcome = reconciler.apply(
            single(ChangeKind::Modified, "os-1", "AWAITING_SCHEDULING", 1),
            &mut alerts,
        );

        assert!(outcome.projection_reset);
        assert!(outcome.auto_starts.is_empty());
        assert_eq!(
            reconciler.known(&LoadId::new("os-1")).map(|load| load.status),
            Some(LoadStatus::AwaitingScheduling)
        );
        let view = reconciler.projection().view();
        assert!(view.load.is_none());
        assert_eq!(view.operational_status, OperationalStatus::NoScheduledLoad);
        let offers: Vec<_> = sink
            .alerts()
            .into_iter()
            .filter(|alert| alert.kind == AlertKind::Offer)
            .collect();
        assert_eq!(offers.len(), 2);
        assert_eq!(alerts.active_session(), Some(&LoadId::new("os-1")));
    }

    #[test]
    fn arrival_rolled_back_to_transit_clears_confirmation() {
        let (mut reconciler, mut alerts, _) = setup();
        reconciler.apply(
            single(ChangeKind::Added, "os-1", "AWAITING_ARRIVAL_CONFIRMATION", 1),
            &mut alerts,
        );

        reconciler.apply(single(ChangeKind::Modified, "os-1", "IN_TRANSIT", 1), &mut alerts);

        let view = reconciler.projection().view();
        assert_eq!(view.load.unwrap().status, LoadStatus::InTransit);
        assert!(!view.confirmation_pending);
    }

    #[test]
    fn replayed_stream_with_removal_changes_nothing() {
        let stream = || {
            vec![
                single(ChangeKind::Added, "os-1", "IN_TRANSIT", 2),
                single(ChangeKind::Added, "os-2", "PENDING_ACCEPTANCE", 2),
                single(ChangeKind::Removed, "os-1", "COMPLETED", 1),
            ]
        };

        let (mut once, mut once_alerts, once_sink) = setup();
        for snapshot in stream() {
            once.apply(snapshot, &mut once_alerts);
        }

        let (mut twice, mut twice_alerts, twice_sink) = setup();
        for snapshot in stream().into_iter().chain(stream()) {
            twice.apply(snapshot, &mut twice_alerts);
        }

        assert_eq!(once.projection().view(), twice.projection().view());
        assert!(twice.projection().load().is_none());
        assert!(twice.known(&LoadId::new("os-1")).is_none());
        assert_eq!(once_alerts.active_session(), twice_alerts.active_session());
        assert_eq!(once_sink.events(), twice_sink.events());
    }

    #[test]
    fn malformed_document_is_skipped_without_side_effects() {
        let (mut reconciler, mut alerts, sink) = setup();

        let outcome = reconciler.apply(
            QuerySnapshot {
                changes: vec![
                    change(
                        ChangeKind::Added,
                        "os-1",
                        json!({ "status": "PENDING_ACCEPTANCE", "kind": "LOADED_RUN", "assignedDriverId": "drv-1" }),
                    ),
                    change(ChangeKind::Added, "os-2", doc("os-2", "PENDING_ACCEPTANCE", "EMPTY_RUN")),
                ],
                size: 2,
            },
            &mut alerts,
        );

        assert_eq!(outcome.malformed, 1);
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts()[0].load_id, LoadId::new("os-2"));
    }

    #[test]
    fn documents_for_other_drivers_are_ignored() {
        let (mut reconciler, mut alerts, sink) = setup();
        let mut foreign = doc("os-1", "PENDING_ACCEPTANCE", "EMPTY_RUN");
        foreign["assignedDriverId"] = json!("drv-2");

        reconciler.apply(
            QuerySnapshot {
                changes: vec![change(ChangeKind::Added, "os-1", foreign)],
                size: 1,
            },
            &mut alerts,
        );

        assert!(sink.events().is_empty());
        assert!(reconciler.known(&LoadId::new("os-1")).is_none());
    }

    #[test]
    fn answered_offer_is_not_raised_again() {
        let (mut reconciler, mut alerts, sink) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "PENDING_ACCEPTANCE", 1), &mut alerts);

        reconciler.answer_offer(&LoadId::new("os-1"));
        alerts.resolve(&LoadId::new("os-1"));
        reconciler.apply(single(ChangeKind::Modified, "os-1", "PENDING_ACCEPTANCE", 1), &mut alerts);

        assert_eq!(sink.alerts().len(), 1);
        assert!(alerts.active_session().is_none());
    }

    #[test]
    fn reverted_trip_start_is_retried_on_next_observation() {
        let (mut reconciler, mut alerts, _) = setup();
        reconciler.apply(single(ChangeKind::Modified, "os-1", "ACCEPTED", 1), &mut alerts);

        assert!(reconciler.revert_trip_start(&LoadId::new("os-1")));
        assert!(reconciler.projection().load().is_none());

        let retry = reconciler.apply(single(ChangeKind::Modified, "os-1", "ACCEPTED", 1), &mut alerts);
        assert_eq!(retry.auto_starts.len(), 1);
    }

    #[test]
    fn stale_feed_is_distinct_from_no_load() {
        let (mut reconciler, mut alerts, _) = setup();
        reconciler.apply(single(ChangeKind::Added, "os-1", "IN_TRANSIT", 1), &mut alerts);

        reconciler.mark_stale();

        let view = reconciler.projection().view();
        assert_eq!(view.feed, FeedState::Stale);
        assert!(view.load.is_some());
    }
}
