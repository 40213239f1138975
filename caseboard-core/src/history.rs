//! Bounded undo/redo stacks of local actions.
//!
//! Every action carries self-contained inverse and forward payloads —
//! full field maps, never references to live entities — so replay stays
//! well-defined even after remote peers have concurrently edited or
//! deleted the targets. No operational-transform rebasing happens: an
//! op whose target entity has since disappeared degrades to a per-op
//! no-op at replay time (the session logs the gap).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use uuid::Uuid;

use crate::replica::Collection;

/// Default bound on the undo stack.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// One self-contained replay descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryOp {
    /// Insert or fully restore an entity.
    PutEntity {
        collection: Collection,
        id: Uuid,
        fields: JsonMap<String, Value>,
    },
    /// Patch individual fields; `Null` removes a field.
    PatchEntity {
        collection: Collection,
        id: Uuid,
        patch: JsonMap<String, Value>,
    },
    /// Remove an entity.
    RemoveEntity { collection: Collection, id: Uuid },
    /// Set (or, with `Null`, clear) one metadata value.
    SetMeta { key: String, value: Value },
}

/// What kind of user action produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Edit,
    Move,
    Delete,
    Paste,
    Meta,
}

/// One undoable action: forward and inverse op lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAction {
    pub kind: ActionKind,
    pub undo: Vec<HistoryOp>,
    pub redo: Vec<HistoryOp>,
}

/// Bounded past/future stacks.
///
/// `push` clears the redo side and evicts the oldest past entry beyond
/// the bound. `undo`/`redo` hand one action back to the caller for
/// replay and move it to the opposite stack.
pub struct HistoryStack {
    past: VecDeque<HistoryAction>,
    future: Vec<HistoryAction>,
    limit: usize,
}

impl HistoryStack {
    pub fn new(limit: usize) -> Self {
        Self {
            past: VecDeque::with_capacity(limit.min(1024)),
            future: Vec::new(),
            limit,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }

    /// Record a freshly performed action. Clears the redo stack.
    pub fn push(&mut self, action: HistoryAction) {
        self.future.clear();
        self.past.push_back(action);
        while self.past.len() > self.limit {
            self.past.pop_front();
        }
    }

    /// Pop the most recent action for undo replay.
    ///
    /// The action is moved to the redo stack immediately; a partially
    /// skipped replay still keeps undo/redo symmetric.
    pub fn undo(&mut self) -> Option<HistoryAction> {
        let action = self.past.pop_back()?;
        self.future.push(action.clone());
        Some(action)
    }

    /// Pop the most recently undone action for redo replay.
    pub fn redo(&mut self) -> Option<HistoryAction> {
        let action = self.future.pop()?;
        self.past.push_back(action.clone());
        while self.past.len() > self.limit {
            self.past.pop_front();
        }
        Some(action)
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.past.len()
    }

    pub fn redo_len(&self) -> usize {
        self.future.len()
    }

    pub fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
    }
}
