//! The document store seam.
//!
//! The store is authoritative for load state. The core only ever reads it
//! through a live [`Subscription`] and writes it through
//! [`LoadStore::set_status`].

pub mod memory;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use crate::models::change::QuerySnapshot;
use crate::models::document::{self, Document};
use crate::models::load::{DriverId, LoadId, LoadStatus};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document {0} not found")]
    NotFound(LoadId),

    #[error("document {load_id} is {actual}, expected {expected}")]
    Conflict {
        load_id: LoadId,
        expected: LoadStatus,
        actual: String,
    },

    #[error("field {field} of document {load_id} is already set")]
    FieldAlreadySet { load_id: LoadId, field: String },

    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
}

/// A single status write, attributable to exactly one lifecycle transition.
/// The store applies it only while the document is still in `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMutation {
    pub load_id: LoadId,
    pub from: LoadStatus,
    pub to: LoadStatus,
    pub fields: Document,
}

/// `assignedDriverId == driver AND status IN open set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenLoadsQuery {
    pub driver_id: DriverId,
}

impl OpenLoadsQuery {
    pub fn for_driver(driver_id: &DriverId) -> Self {
        Self {
            driver_id: driver_id.clone(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        document::assigned_driver(doc) == Some(self.driver_id.as_str())
            && document::raw_status(doc).is_some_and(|status| status.is_open())
    }
}

pub type SnapshotResult = Result<QuerySnapshot, StoreError>;

/// Ordered stream of snapshots from a live query. Once cancelled, no further
/// item is yielded, including ones already buffered.
pub struct Subscription {
    inner: UnboundedReceiverStream<SnapshotResult>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SnapshotResult>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            cancelled: self.cancelled.clone(),
        }
    }
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Stream for Subscription {
    type Item = SnapshotResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.inner.close();
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait]
pub trait LoadStore: Send + Sync {
    async fn subscribe(&self, query: OpenLoadsQuery) -> Result<Subscription, StoreError>;

    async fn set_status(&self, mutation: &StatusMutation) -> Result<(), StoreError>;
}
