//! Pending process groups and actions, with index- and sequence-keyed surgery.

use chrono::Utc;
use std::collections::VecDeque;
use tracing::warn;

use crate::error::{OrchError, Result};
use crate::model::{Action, ProcessGroup, SequenceNumber};

#[derive(Debug, Default)]
pub struct ProcessGroupQueue {
    items: VecDeque<ProcessGroup>,
}

impl ProcessGroupQueue {
    pub fn push_back(&mut self, group: ProcessGroup) {
        self.items.push_back(group);
    }

    pub fn push_front(&mut self, group: ProcessGroup) {
        self.items.push_front(group);
    }

    /// Insert before `index`; an index past the end appends.
    pub fn insert(&mut self, index: usize, group: ProcessGroup) {
        let index = index.min(self.items.len());
        self.items.insert(index, group);
    }

    pub fn remove(&mut self, index: usize) -> Result<ProcessGroup> {
        self.items
            .remove(index)
            .ok_or_else(|| OrchError::ProcessGroupNotFound(format!("index {index}")))
    }

    pub fn pop_front(&mut self) -> Option<ProcessGroup> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn list(&self) -> Vec<ProcessGroup> {
        self.items.iter().cloned().collect()
    }
}

/// Pending actions in dispatch order.
#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<Action>,
}

impl ActionQueue {
    fn stamp(mut action: Action) -> Action {
        action.queued_at.get_or_insert_with(Utc::now);
        action
    }

    /// Replace the queue with a freshly expanded plan.
    pub fn replace(&mut self, actions: Vec<Action>) {
        self.items = actions.into_iter().map(Self::stamp).collect();
    }

    pub fn push_back(&mut self, action: Action) {
        self.items.push_back(Self::stamp(action));
    }

    pub fn push_front(&mut self, action: Action) {
        self.items.push_front(Self::stamp(action));
    }

    pub fn insert(&mut self, index: usize, action: Action) {
        let index = index.min(self.items.len());
        self.items.insert(index, Self::stamp(action));
    }

    pub fn remove(&mut self, index: usize) -> Result<Action> {
        self.items
            .remove(index)
            .ok_or_else(|| OrchError::ActionNotFound(format!("index {index}")))
    }

    pub fn remove_sequence(&mut self, sequence: SequenceNumber) -> Result<Action> {
        let index = self
            .items
            .iter()
            .position(|a| a.sequence == sequence)
            .ok_or_else(|| OrchError::ActionNotFound(format!("sequence {sequence}")))?;
        self.remove(index)
    }

    /// Insert `actions` immediately after sequence number `after`.
    ///
    /// The `n`th supplement gets `after + n·0.01`, so it sorts before the
    /// pending action that followed `after` without renumbering anything. If a
    /// slot would reach that next sequence number, the whole pending queue is
    /// renumbered from `floor(after) + 1` instead. Returns the assigned numbers.
    pub fn supplement(&mut self, after: SequenceNumber, actions: Vec<Action>) -> Vec<SequenceNumber> {
        if actions.is_empty() {
            return Vec::new();
        }
        let index = self
            .items
            .iter()
            .position(|a| a.sequence > after)
            .unwrap_or(self.items.len());
        let next = self.items.get(index).map(|a| a.sequence);
        let count = actions.len();
        let collides = next.is_some_and(|n| after.supplement(count) >= n);

        for (i, mut action) in actions.into_iter().enumerate() {
            action.sequence = after.supplement(i + 1);
            self.items.insert(index + i, Self::stamp(action));
        }

        if collides {
            warn!(
                after = %after,
                count,
                "supplement slots collide with the next pending action, renumbering queue"
            );
            self.renumber(SequenceNumber::from(after.value().floor() + 1.0));
        }

        self.items
            .range(index..index + count)
            .map(|a| a.sequence)
            .collect()
    }

    fn renumber(&mut self, base: SequenceNumber) {
        for (i, action) in self.items.iter_mut().enumerate() {
            action.sequence = SequenceNumber::from(base.value() + i as f64);
        }
    }

    pub fn pop_front(&mut self) -> Option<Action> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn list(&self) -> Vec<Action> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(n: usize) -> ActionQueue {
        let mut q = ActionQueue::default();
        q.replace(
            (0..n)
                .map(|i| Action::new("sim", format!("op{i}")).with_sequence(i as f64))
                .collect(),
        );
        q
    }

    #[test]
    fn supplement_sorts_before_next_action() {
        // Action 1 was dispatched and errored; 2 and 3 are pending.
        let mut q = queue_of(4);
        q.pop_front();
        q.pop_front();
        let seqs = q.supplement(SequenceNumber::from(1.0), vec![Action::new("sim", "fix")]);
        assert_eq!(seqs, vec![SequenceNumber::from(1.01)]);
        let first = q.pop_front().unwrap();
        assert_eq!(first.operation, "fix");
        assert_eq!(q.pop_front().unwrap().sequence, SequenceNumber::from(2.0));
    }

    #[test]
    fn supplement_leaves_other_numbers_alone() {
        let mut q = queue_of(3);
        q.supplement(
            SequenceNumber::from(0.0),
            vec![Action::new("sim", "a"), Action::new("sim", "b")],
        );
        let seqs: Vec<f64> = q.list().iter().map(|a| a.sequence.value()).collect();
        assert_eq!(seqs, vec![0.0, 0.01, 0.02, 1.0, 2.0]);
    }

    #[test]
    fn colliding_supplement_renumbers_queue() {
        let mut q = ActionQueue::default();
        q.replace(vec![
            Action::new("sim", "x").with_sequence(2.01),
            Action::new("sim", "y").with_sequence(3.0),
        ]);
        // 2.0 + 0.01 == 2.01, which is already taken.
        q.supplement(SequenceNumber::from(2.0), vec![Action::new("sim", "fix")]);
        let ops: Vec<String> = q.list().iter().map(|a| a.operation.clone()).collect();
        assert_eq!(ops, vec!["fix", "x", "y"]);
        let seqs: Vec<f64> = q.list().iter().map(|a| a.sequence.value()).collect();
        assert_eq!(seqs, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn supplement_past_end_appends() {
        let mut q = queue_of(2);
        let seqs = q.supplement(SequenceNumber::from(5.0), vec![Action::new("sim", "late")]);
        assert_eq!(seqs, vec![SequenceNumber::from(5.01)]);
        assert_eq!(q.list().last().unwrap().operation, "late");
    }

    #[test]
    fn remove_by_sequence_and_index() {
        let mut q = queue_of(3);
        assert_eq!(q.remove_sequence(SequenceNumber::from(1.0)).unwrap().operation, "op1");
        assert!(q.remove_sequence(SequenceNumber::from(1.0)).is_err());
        assert_eq!(q.remove(0).unwrap().operation, "op0");
        assert!(q.remove(5).is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn queued_at_is_stamped() {
        let mut q = ActionQueue::default();
        q.push_back(Action::new("sim", "wait"));
        assert!(q.list()[0].queued_at.is_some());
    }

    #[test]
    fn group_queue_insert_clamps_index() {
        let mut q = ProcessGroupQueue::default();
        q.push_back(ProcessGroup::new("sequence", "a"));
        q.insert(10, ProcessGroup::new("sequence", "b"));
        q.push_front(ProcessGroup::new("sequence", "c"));
        let labels: Vec<String> = q.list().into_iter().map(|g| g.label).collect();
        assert_eq!(labels, vec!["c", "a", "b"]);
        assert_eq!(q.clear(), 3);
        assert!(q.is_empty());
    }
}
