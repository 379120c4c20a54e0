//! Action queue with per-lane execution discipline
//!
//! Pending actions live in one FIFO list; each backend lane additionally has
//! a single current slot. A lane slot is occupied exactly while an executor
//! call is in flight on that lane, and it is only freed by the terminal
//! backend callback for that action. The queue itself never talks to the
//! executor; the agent pulls dispatchable actions out of it.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::action::{Action, ActionKind, Lane};
use crate::types::ActionId;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The action was appended to the pending list.
    Accepted(ActionId),
    /// An equivalent action is already pending or in flight; its id is
    /// returned and the queue is unchanged.
    Duplicate(ActionId),
}

impl Enqueued {
    pub fn id(&self) -> ActionId {
        match self {
            Self::Accepted(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Ordered queue of pending actions plus one current slot per lane.
#[derive(Debug, Default)]
pub struct ActionQueue {
    pending: VecDeque<Action>,
    current: HashMap<Lane, Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, unless an equivalent one is already pending or
    /// current. A superseded pending storage mutation is dropped first, see
    /// [`superseded_by`].
    pub fn enqueue(&mut self, action: Action) -> Enqueued {
        if let Some(id) = self.find_equivalent(&action) {
            debug!(
                "rejecting duplicate {} action, already queued as {}",
                action.kind().kind_str(),
                id
            );
            return Enqueued::Duplicate(id);
        }

        self.drop_superseded(&action);

        let id = action.id();
        self.pending.push_back(action);
        Enqueued::Accepted(id)
    }

    fn find_equivalent(&self, action: &Action) -> Option<ActionId> {
        self.current
            .values()
            .chain(self.pending.iter())
            .find(|a| a.equivalent(action))
            .map(|a| a.id())
    }

    fn drop_superseded(&mut self, action: &Action) {
        let before = self.pending.len();
        self.pending.retain(|p| !superseded_by(p.kind(), action.kind()));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(
                "dropped {} pending action(s) superseded by {}",
                dropped,
                action.kind().kind_str()
            );
        }
    }

    /// Move the first pending action whose lane is free and which `admit`
    /// allows into its lane slot and return a copy of it. Scanning front to
    /// back keeps FIFO order within each lane; a blocked head only blocks its
    /// own lane.
    pub fn take_next<F>(&mut self, admit: F) -> Option<Action>
    where
        F: Fn(&Action) -> bool,
    {
        let idx = self
            .pending
            .iter()
            .position(|a| !self.current.contains_key(&a.lane()) && admit(a))?;
        let action = self.pending.remove(idx)?;
        self.current.insert(action.lane(), action.clone());
        Some(action)
    }

    /// Free a lane slot. Called only from a terminal backend callback; the
    /// id must match the current action so stale callbacks for an already
    /// replaced action cannot free the lane.
    pub fn complete(&mut self, lane: Lane, id: ActionId) -> Option<Action> {
        match self.current.get(&lane) {
            Some(a) if a.id() == id => self.current.remove(&lane),
            _ => None,
        }
    }

    pub fn current(&self, lane: Lane) -> Option<&Action> {
        self.current.get(&lane)
    }

    /// Drop all pending actions, leaving lane slots to drain through their
    /// terminal callbacks. Returns the number of dropped actions.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Drop pending actions matching a predicate. In-flight actions are
    /// never affected.
    pub fn remove_pending<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&Action) -> bool,
    {
        let before = self.pending.len();
        self.pending.retain(|a| !pred(a));
        before - self.pending.len()
    }

    pub fn has_current(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.current.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Whether pending action `old` is made irrelevant by newly enqueued `new`.
/// Conservative last-writer-wins over pending storage mutations: a deletion
/// covers any earlier pending mutation of a subset of its messages, a move
/// covers an earlier pending move of a subset. Everything else keeps FIFO
/// order.
fn superseded_by(old: &ActionKind, new: &ActionKind) -> bool {
    let subset = |old_ids: &[crate::types::MessageId], new_ids: &[crate::types::MessageId]| {
        !old_ids.is_empty() && old_ids.iter().all(|id| new_ids.contains(id))
    };

    match (old, new) {
        (
            ActionKind::MoveMessages { ids: old_ids, .. }
            | ActionKind::DeleteMessages { ids: old_ids }
            | ActionKind::FlagMessages { ids: old_ids, .. },
            ActionKind::DeleteMessages { ids: new_ids },
        ) => subset(old_ids, new_ids),
        (
            ActionKind::MoveMessages { ids: old_ids, .. },
            ActionKind::MoveMessages { ids: new_ids, .. },
        ) => subset(old_ids, new_ids),
        _ => false,
    }
}
