//! Device notification seam. Delivery is fire-and-forget: nothing here tells
//! the core whether the driver saw or heard an alert.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::load::{DriverId, LoadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Offer,
    Arrival,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Offer => "offer",
            AlertKind::Arrival => "arrival",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferChoice {
    Accept,
    Refuse,
}

/// Vibration pattern in milliseconds, alternating wait/vibrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "pattern_ms", rename_all = "snake_case")]
pub enum Vibration {
    Loop(Vec<u64>),
    OneShot(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub driver_id: DriverId,
    pub load_id: LoadId,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub vibration: Vibration,
    /// Choices offered to the driver; an offer can only be dismissed by
    /// picking one of them.
    pub choices: Vec<OfferChoice>,
}

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: Notification);

    /// Stops the looping alert for `load_id`, if the device still runs one.
    fn stop(&self, driver_id: &DriverId, load_id: &LoadId);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertEvent {
    Alert(Notification),
    Stopped { driver_id: DriverId, load_id: LoadId },
}

impl AlertEvent {
    pub fn driver_id(&self) -> &DriverId {
        match self {
            AlertEvent::Alert(notification) => &notification.driver_id,
            AlertEvent::Stopped { driver_id, .. } => driver_id,
        }
    }
}

/// Publishes alerts to every connected device channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<AlertEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<AlertEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for BroadcastSink {
    fn deliver(&self, notification: Notification) {
        if self.tx.send(AlertEvent::Alert(notification)).is_err() {
            debug!("alert dropped: no connected devices");
        }
    }

    fn stop(&self, driver_id: &DriverId, load_id: &LoadId) {
        let stopped = AlertEvent::Stopped {
            driver_id: driver_id.clone(),
            load_id: load_id.clone(),
        };
        if self.tx.send(stopped).is_err() {
            debug!("alert stop dropped: no connected devices");
        }
    }
}
