use std::sync::Arc;

use tracing::{debug, info};

use crate::models::load::{DriverId, Load, LoadId};
use crate::notify::{AlertKind, Notification, NotificationSink, OfferChoice, Vibration};
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPatterns {
    pub offer_loop_ms: Vec<u64>,
    pub arrival_ms: Vec<u64>,
}

impl Default for AlertPatterns {
    fn default() -> Self {
        Self {
            offer_loop_ms: vec![0, 800, 400, 800],
            arrival_ms: vec![0, 400],
        }
    }
}

/// Owns the one looping "urgent attention" session a device may run.
///
/// Offers loop until the driver answers them or the load leaves the offer
/// states; a newer offer for another load takes the loop over. Arrival
/// alerts are one-shot and never touch the loop.
pub struct AlertDispatcher {
    driver_id: DriverId,
    sink: Arc<dyn NotificationSink>,
    patterns: AlertPatterns,
    metrics: Metrics,
    looping: Option<LoadId>,
}

impl AlertDispatcher {
    pub fn new(
        driver_id: DriverId,
        sink: Arc<dyn NotificationSink>,
        patterns: AlertPatterns,
        metrics: Metrics,
    ) -> Self {
        Self {
            driver_id,
            sink,
            patterns,
            metrics,
            looping: None,
        }
    }

    pub fn active_session(&self) -> Option<&LoadId> {
        self.looping.as_ref()
    }

    /// Starts the looping offer alert for `load`. Returns `false` when the
    /// loop already runs for this load.
    pub fn request_offer(&mut self, load: &Load) -> bool {
        if self.looping.as_ref() == Some(&load.id) {
            debug!(load_id = %load.id, "offer alert already running");
            return false;
        }

        if let Some(previous) = &self.looping {
            info!(superseded = %previous, load_id = %load.id, "offer alert superseded");
            self.stop_loop();
        }

        self.sink.deliver(Notification {
            driver_id: self.driver_id.clone(),
            load_id: load.id.clone(),
            kind: AlertKind::Offer,
            title: format!("Nova ordem de serviço: {}", load.kind.trip_label()),
            body: format!("Destino: {}", load.destination.describe()),
            vibration: Vibration::Loop(self.patterns.offer_loop_ms.clone()),
            choices: vec![OfferChoice::Accept, OfferChoice::Refuse],
        });

        self.looping = Some(load.id.clone());
        self.metrics
            .alerts_total
            .with_label_values(&[AlertKind::Offer.as_str()])
            .inc();
        self.metrics.active_alert_sessions.inc();
        info!(driver_id = %self.driver_id, load_id = %load.id, "offer alert started");
        true
    }

    pub fn request_arrival(&mut self, load: &Load) {
        self.sink.deliver(Notification {
            driver_id: self.driver_id.clone(),
            load_id: load.id.clone(),
            kind: AlertKind::Arrival,
            title: "Chegada ao destino".to_string(),
            body: format!("Confirme a entrega em {}", load.destination.describe()),
            vibration: Vibration::OneShot(self.patterns.arrival_ms.clone()),
            choices: Vec::new(),
        });

        self.metrics
            .alerts_total
            .with_label_values(&[AlertKind::Arrival.as_str()])
            .inc();
        info!(driver_id = %self.driver_id, load_id = %load.id, "arrival alert delivered");
    }

    /// Stops the loop if it belongs to `load_id`.
    pub fn resolve(&mut self, load_id: &LoadId) -> bool {
        if self.looping.as_ref() != Some(load_id) {
            return false;
        }
        self.stop_loop();
        true
    }

    /// Stops whatever loop is running; a no-op when none is.
    pub fn cancel(&mut self) {
        self.stop_loop();
    }

    fn stop_loop(&mut self) {
        if let Some(load_id) = self.looping.take() {
            self.sink.stop(&self.driver_id, &load_id);
            self.metrics.active_alert_sessions.dec();
            info!(driver_id = %self.driver_id, load_id = %load_id, "offer alert stopped");
        }
    }
}
