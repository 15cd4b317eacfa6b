use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::change::{ChangeKind, DocumentChange, QuerySnapshot};
use crate::models::document::{self, fields, Document};
use crate::models::load::LoadId;
use crate::store::{
    LoadStore, OpenLoadsQuery, SnapshotResult, StatusMutation, StoreError, Subscription,
};

struct Subscriber {
    query: OpenLoadsQuery,
    matching: HashSet<LoadId>,
    tx: mpsc::UnboundedSender<SnapshotResult>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<LoadId, Document>,
    subscribers: Vec<Subscriber>,
    offline: bool,
}

/// Process-local document store with live queries. Every write is fanned out
/// to each subscription as the change it causes in that subscription's
/// result set, in write order.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, doc: Document) -> LoadId {
        let load_id = LoadId::new(Uuid::new_v4().to_string());
        self.insert_with_id(load_id.clone(), doc);
        load_id
    }

    fn insert_with_id(&self, load_id: LoadId, doc: Document) {
        let mut inner = self.lock();
        inner.docs.insert(load_id.clone(), doc.clone());
        fan_out(&mut inner, &load_id, Some(&doc));
        debug!(load_id = %load_id, "document inserted");
    }

    /// Merges `patch` into the document; `null` values delete the field.
    pub fn update(&self, load_id: &LoadId, patch: Document) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let doc = inner
            .docs
            .get_mut(load_id)
            .ok_or_else(|| StoreError::NotFound(load_id.clone()))?;

        for (key, value) in patch {
            if value.is_null() {
                doc.remove(&key);
            } else {
                doc.insert(key, value);
            }
        }

        let updated = doc.clone();
        fan_out(&mut inner, load_id, Some(&updated));
        Ok(updated)
    }

    pub fn remove(&self, load_id: &LoadId) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let removed = inner
            .docs
            .remove(load_id)
            .ok_or_else(|| StoreError::NotFound(load_id.clone()))?;
        fan_out(&mut inner, load_id, None);
        Ok(removed)
    }

    pub fn get(&self, load_id: &LoadId) -> Option<Document> {
        self.lock().docs.get(load_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// While offline every status write fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
        info!(offline, "store connectivity changed");
    }

    /// Terminates every live subscription with an error.
    pub fn fail_subscriptions(&self, reason: &str) {
        let mut inner = self.lock();
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber
                .tx
                .send(Err(StoreError::SubscriptionClosed(reason.to_string())));
        }
        warn!(reason, "live queries terminated");
    }
}

#[async_trait]
impl LoadStore for InMemoryStore {
    async fn subscribe(&self, query: OpenLoadsQuery) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(StoreError::Unavailable("cannot open live query".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let changes: Vec<DocumentChange> = inner
            .docs
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(load_id, doc)| DocumentChange {
                kind: ChangeKind::Added,
                load_id: load_id.clone(),
                document: doc.clone(),
            })
            .collect();
        let matching = changes.iter().map(|change| change.load_id.clone()).collect();
        let size = changes.len();

        let _ = tx.send(Ok(QuerySnapshot { changes, size }));
        info!(driver_id = %query.driver_id, initial = size, "live query opened");

        inner.subscribers.push(Subscriber {
            query,
            matching,
            tx,
        });

        Ok(Subscription::new(rx))
    }

    async fn set_status(&self, mutation: &StatusMutation) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(StoreError::Unavailable(format!(
                "write to {} failed",
                mutation.load_id
            )));
        }

        let doc = inner
            .docs
            .get_mut(&mutation.load_id)
            .ok_or_else(|| StoreError::NotFound(mutation.load_id.clone()))?;

        if document::raw_status(doc) != Some(mutation.from) {
            let actual = doc
                .get(fields::STATUS)
                .and_then(Value::as_str)
                .unwrap_or("<none>")
                .to_string();
            return Err(StoreError::Conflict {
                load_id: mutation.load_id.clone(),
                expected: mutation.from,
                actual,
            });
        }

        if let Some(field) = mutation.fields.keys().find(|key| {
            fields::TIMESTAMPS.contains(&key.as_str()) && doc.get(*key).is_some_and(|v| !v.is_null())
        }) {
            return Err(StoreError::FieldAlreadySet {
                load_id: mutation.load_id.clone(),
                field: field.clone(),
            });
        }

        doc.insert(fields::STATUS.to_string(), mutation.to.as_str().into());
        for (key, value) in &mutation.fields {
            doc.insert(key.clone(), value.clone());
        }

        let updated = doc.clone();
        fan_out(&mut inner, &mutation.load_id, Some(&updated));
        Ok(())
    }
}

fn fan_out(inner: &mut Inner, load_id: &LoadId, after: Option<&Document>) {
    inner.subscribers.retain_mut(|subscriber| {
        let was = subscriber.matching.contains(load_id);
        let now = after.is_some_and(|doc| subscriber.query.matches(doc));

        let kind = match (was, now) {
            (false, true) => ChangeKind::Added,
            (true, true) => ChangeKind::Modified,
            (true, false) => ChangeKind::Removed,
            (false, false) => return !subscriber.tx.is_closed(),
        };

        if now {
            subscriber.matching.insert(load_id.clone());
        } else {
            subscriber.matching.remove(load_id);
        }

        let change = DocumentChange {
            kind,
            load_id: load_id.clone(),
            document: after.cloned().unwrap_or_default(),
        };
        let snapshot = QuerySnapshot {
            changes: vec![change],
            size: subscriber.matching.len(),
        };

        subscriber.tx.send(Ok(snapshot)).is_ok()
    });
}
