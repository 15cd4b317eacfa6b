use serde::{Deserialize, Serialize};

use crate::models::document::Document;
use crate::models::load::LoadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

/// One per-document change delivered by a live query. For `Removed` the
/// document is the post-write snapshot, empty when the document was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub load_id: LoadId,
    pub document: Document,
}

/// A single delivery from a live query: the ordered changes plus the size of
/// the result set after applying them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub changes: Vec<DocumentChange>,
    pub size: usize,
}

impl QuerySnapshot {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
