use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::LoadError;
use crate::models::document::{fields, Document};
use crate::models::load::{LoadId, LoadStatus};
use crate::observability::metrics::Metrics;
use crate::store::{LoadStore, StatusMutation};

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Driver accepts an offer.
    Accept,
    /// Engine-internal: an accepted load observed without a local trip.
    AutoStart,
    Refuse { reason: String },
    /// Geofence hit or dispatch marking the truck as arrived.
    MarkArrival,
    /// Driver confirms delivery.
    Confirm,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Accept => "accept",
            Trigger::AutoStart => "auto_start",
            Trigger::Refuse { .. } => "refuse",
            Trigger::MarkArrival => "mark_arrival",
            Trigger::Confirm => "confirm",
        }
    }

    pub fn allowed_from(&self) -> &'static [LoadStatus] {
        match self {
            Trigger::Accept | Trigger::Refuse { .. } => &[
                LoadStatus::PendingAcceptance,
                LoadStatus::AwaitingScheduling,
            ],
            Trigger::AutoStart => &[LoadStatus::Accepted],
            Trigger::MarkArrival => &[LoadStatus::InTransit],
            Trigger::Confirm => &[LoadStatus::AwaitingArrivalConfirmation],
        }
    }

    pub fn target(&self) -> LoadStatus {
        match self {
            Trigger::Accept => LoadStatus::Accepted,
            Trigger::AutoStart => LoadStatus::InTransit,
            Trigger::Refuse { .. } => LoadStatus::Refused,
            Trigger::MarkArrival => LoadStatus::AwaitingArrivalConfirmation,
            Trigger::Confirm => LoadStatus::Completed,
        }
    }

    /// Fields written alongside the status; only this transition's side
    /// effects, nothing else.
    fn fields(&self, at: DateTime<Utc>) -> Document {
        let stamp = Value::String(at.to_rfc3339());
        let mut doc = Document::new();
        match self {
            Trigger::Accept => {
                doc.insert(fields::ACCEPTED_AT.into(), stamp);
            }
            Trigger::AutoStart => {
                doc.insert(fields::TRIP_STARTED_AT.into(), stamp);
            }
            Trigger::Refuse { reason } => {
                doc.insert(fields::REFUSAL_REASON.into(), Value::String(reason.clone()));
                doc.insert(fields::REFUSED_AT.into(), stamp);
            }
            Trigger::MarkArrival => {
                doc.insert(fields::ARRIVAL_REQUESTED_AT.into(), stamp);
            }
            Trigger::Confirm => {
                doc.insert(fields::COMPLETED_AT.into(), stamp);
            }
        }
        doc
    }
}

/// Validates `trigger` against `from` and builds the store write for it.
pub fn plan_transition(
    load_id: &LoadId,
    from: LoadStatus,
    trigger: &Trigger,
    at: DateTime<Utc>,
) -> Result<StatusMutation, LoadError> {
    if !trigger.allowed_from().contains(&from) {
        return Err(LoadError::InvalidTransition {
            load_id: load_id.clone(),
            trigger: trigger.name(),
            from,
        });
    }

    Ok(StatusMutation {
        load_id: load_id.clone(),
        from,
        to: trigger.target(),
        fields: trigger.fields(at),
    })
}

/// Issues lifecycle transitions against the store. Local state is never
/// touched here; callers decide what to do once the write is confirmed.
#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn LoadStore>,
    metrics: Metrics,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn LoadStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub async fn apply(
        &self,
        load_id: &LoadId,
        from: LoadStatus,
        trigger: &Trigger,
    ) -> Result<StatusMutation, LoadError> {
        let mutation = match plan_transition(load_id, from, trigger, Utc::now()) {
            Ok(mutation) => mutation,
            Err(err) => {
                self.record(trigger, "invalid");
                warn!(load_id = %load_id, trigger = trigger.name(), from = %from, "transition rejected");
                return Err(err);
            }
        };

        let start = Instant::now();
        let result = self.store.set_status(&mutation).await;
        self.metrics
            .mutation_latency_seconds
            .with_label_values(&[trigger.name()])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.record(trigger, "success");
                info!(
                    load_id = %load_id,
                    trigger = trigger.name(),
                    from = %from,
                    to = %mutation.to,
                    "transition written"
                );
                Ok(mutation)
            }
            Err(source) => {
                self.record(trigger, "error");
                warn!(load_id = %load_id, trigger = trigger.name(), error = %source, "transition write failed");
                Err(LoadError::RemoteMutationFailed {
                    load_id: load_id.clone(),
                    trigger: trigger.name(),
                    source,
                })
            }
        }
    }

    fn record(&self, trigger: &Trigger, outcome: &str) {
        self.metrics
            .transitions_total
            .with_label_values(&[trigger.name(), outcome])
            .inc();
    }
}
