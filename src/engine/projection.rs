//! Single-slot view of the driver's current load.
//!
//! Mutators are crate-private: only the reconciler (including its optimistic
//! auto-start) writes here. Everyone else reads a [`ProjectionView`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::models::load::{Load, LoadId, LoadStatus, OperationalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Unsubscribed,
    Live,
    /// The live query failed; the slot is the last known state, not "no load".
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionView {
    pub feed: FeedState,
    pub load: Option<Load>,
    pub operational_status: OperationalStatus,
    pub confirmation_pending: bool,
}

impl ProjectionView {
    pub fn unsubscribed() -> Self {
        Self {
            feed: FeedState::Unsubscribed,
            load: None,
            operational_status: OperationalStatus::NoScheduledLoad,
            confirmation_pending: false,
        }
    }
}

// Derived flags live inside the slot so clearing the slot clears them too.
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    load: Load,
    label: OperationalStatus,
    confirmation_pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveLoadProjection {
    feed: FeedState,
    slot: Option<Slot>,
}

impl Default for ActiveLoadProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveLoadProjection {
    pub fn new() -> Self {
        Self {
            feed: FeedState::Live,
            slot: None,
        }
    }

    pub fn load(&self) -> Option<&Load> {
        self.slot.as_ref().map(|slot| &slot.load)
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }

    pub fn holds(&self, load_id: &LoadId) -> bool {
        self.load().is_some_and(|load| &load.id == load_id)
    }

    pub fn status_of(&self, load_id: &LoadId) -> Option<LoadStatus> {
        self.load()
            .filter(|load| &load.id == load_id)
            .map(|load| load.status)
    }

    pub fn has_trip_for(&self, load_id: &LoadId) -> bool {
        self.status_of(load_id).is_some_and(|status| status.is_trip())
    }

    pub fn view(&self) -> ProjectionView {
        match &self.slot {
            Some(slot) => ProjectionView {
                feed: self.feed,
                load: Some(slot.load.clone()),
                operational_status: slot.label,
                confirmation_pending: slot.confirmation_pending,
            },
            None => ProjectionView {
                feed: self.feed,
                load: None,
                operational_status: OperationalStatus::NoScheduledLoad,
                confirmation_pending: false,
            },
        }
    }

    /// Optimistically shows an accepted load as a trip in progress.
    pub(crate) fn start_trip(&mut self, load: &Load, at: DateTime<Utc>) {
        let mut load = load.clone();
        load.status = LoadStatus::InTransit;
        load.timestamps.trip_started_at.get_or_insert(at);
        self.occupy(load);
    }

    /// Merges a trip snapshot into the slot. Timestamps already known locally
    /// survive a snapshot that lacks them.
    pub(crate) fn track(&mut self, mut load: Load) {
        if let Some(current) = self.load().filter(|current| current.id == load.id) {
            let ours = &current.timestamps;
            let theirs = &mut load.timestamps;
            theirs.created_at = theirs.created_at.or(ours.created_at);
            theirs.accepted_at = theirs.accepted_at.or(ours.accepted_at);
            theirs.trip_started_at = theirs.trip_started_at.or(ours.trip_started_at);
            theirs.arrival_confirmation_requested_at = theirs
                .arrival_confirmation_requested_at
                .or(ours.arrival_confirmation_requested_at);
            theirs.completed_at = theirs.completed_at.or(ours.completed_at);
        }

        self.occupy(load);
    }

    /// Returns whether anything was cleared.
    pub(crate) fn clear(&mut self) -> bool {
        self.slot.take().is_some()
    }

    pub(crate) fn mark_stale(&mut self) {
        self.feed = FeedState::Stale;
    }

    fn occupy(&mut self, load: Load) {
        if let Some(current) = self.load().filter(|current| current.id != load.id) {
            warn!(replaced = %current.id, load_id = %load.id, "projection slot taken over by another load");
        }

        self.slot = Some(Slot {
            label: load.kind.trip_label(),
            confirmation_pending: load.status == LoadStatus::AwaitingArrivalConfirmation,
            load,
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ActiveLoadProjection, FeedState};
    use crate::models::load::{
        DriverId, Load, LoadId, LoadKind, LoadStatus, LoadTimestamps, OperationalStatus, Place,
    };

    fn load(status: LoadStatus, kind: LoadKind) -> Load {
        Load {
            id: LoadId::new("os-1"),
            status,
            kind,
            assigned_driver_id: DriverId::new("drv-1"),
            origin: Place::default(),
            destination: Place {
                client: Some("Cliente X".to_string()),
                city: None,
            },
            geofence: None,
            route: None,
            timestamps: LoadTimestamps::default(),
            refusal_reason: None,
        }
    }

    #[test]
    fn auto_start_shows_trip_with_kind_label() {
        let mut projection = ActiveLoadProjection::new();
        projection.start_trip(
            &load(LoadStatus::Accepted, LoadKind::EmptyRun),
            Utc::now(),
        );

        let view = projection.view();
        assert_eq!(view.load.unwrap().status, LoadStatus::InTransit);
        assert_eq!(view.operational_status, OperationalStatus::EmptyRun);
        assert!(projection.has_trip_for(&LoadId::new("os-1")));
    }

    #[test]
    fn local_trip_start_survives_store_snapshot_without_it() {
        let mut projection = ActiveLoadProjection::new();
        let started = Utc::now();
        projection.start_trip(&load(LoadStatus::Accepted, LoadKind::EmptyRun), started);

        projection.track(load(LoadStatus::InTransit, LoadKind::EmptyRun));

        assert_eq!(projection.status_of(&LoadId::new("os-1")), Some(LoadStatus::InTransit));
        assert_eq!(
            projection.load().unwrap().timestamps.trip_started_at,
            Some(started)
        );
    }

    #[test]
    fn clearing_drops_confirmation_flag_with_the_slot() {
        let mut projection = ActiveLoadProjection::new();
        projection.track(load(
            LoadStatus::AwaitingArrivalConfirmation,
            LoadKind::LoadedRun { weight_kg: None },
        ));
        assert!(projection.view().confirmation_pending);

        assert!(projection.clear());

        let view = projection.view();
        assert!(view.load.is_none());
        assert!(!view.confirmation_pending);
        assert_eq!(view.operational_status, OperationalStatus::NoScheduledLoad);
        assert!(!projection.clear());
    }

    #[test]
    fn stale_feed_keeps_last_known_load() {
        let mut projection = ActiveLoadProjection::new();
        projection.track(load(LoadStatus::InTransit, LoadKind::EmptyRun));

        projection.mark_stale();

        let view = projection.view();
        assert_eq!(view.feed, FeedState::Stale);
        assert!(view.load.is_some());
    }
}
