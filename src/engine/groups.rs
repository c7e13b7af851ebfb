//! Atomic group buffering.
//!
//! DeFi multi-step operations sharing an `atomic_group_id` are held here
//! until every member has arrived, then handed to the target adapter as one
//! bundle. Partial success does not exist: the group fills together or is
//! rejected together.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug)]
struct GroupState {
    expected: usize,
    /// (sequence_in_group, operation_id), kept sorted on drain.
    members: Vec<(u32, String)>,
}

#[derive(Default)]
pub struct AtomicGroupBuffer {
    groups: Mutex<HashMap<String, GroupState>>,
}

impl AtomicGroupBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one member. Returns the full member list, ordered by
    /// `sequence_in_group`, once the last member arrives.
    pub fn add(
        &self,
        group_id: &str,
        operation_id: &str,
        sequence: u32,
        expected: usize,
    ) -> Option<Vec<String>> {
        let mut groups = self.groups.lock();
        let state = groups.entry(group_id.to_string()).or_insert_with(|| GroupState {
            expected,
            members: Vec::with_capacity(expected),
        });

        if state.expected != expected {
            warn!(
                group_id = %group_id,
                first = state.expected,
                now = expected,
                "group members disagree on group size; keeping the first"
            );
        }
        if state
            .members
            .iter()
            .any(|(_, member)| member == operation_id)
        {
            return None;
        }

        state.members.push((sequence, operation_id.to_string()));
        if state.members.len() < state.expected {
            return None;
        }

        let mut state = groups.remove(group_id)?;
        state.members.sort_by_key(|(sequence, _)| *sequence);
        Some(
            state
                .members
                .into_iter()
                .map(|(_, operation_id)| operation_id)
                .collect(),
        )
    }

    /// Operation ids of groups still waiting for members.
    pub fn pending(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.lock().contains_key(group_id)
    }
}
