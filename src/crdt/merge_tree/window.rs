//! Collaboration window: the range of sequence numbers still in play
//!
//! Everything at or below `min_seq` has been observed by every client, so
//! attribution older than that no longer affects how positions resolve.
//! Everything above it is "in the window" and must keep full attribution.

use super::stamp::{ClientId, SeqNum};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Interning table between long client ids and short `ClientId`s
#[derive(Debug, Clone, Default)]
pub struct ClientRoster {
    long_ids: Vec<String>,
    by_long_id: HashMap<String, ClientId>,
}

impl ClientRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short id for `long_id`, allocating one on first sight
    pub fn get_or_add(&mut self, long_id: &str) -> Result<ClientId> {
        if let Some(id) = self.by_long_id.get(long_id) {
            return Ok(*id);
        }
        let id = self.next_id()?;
        self.long_ids.push(long_id.to_string());
        self.by_long_id.insert(long_id.to_string(), id);
        Ok(id)
    }

    /// Id the next new client would receive
    pub fn next_id(&self) -> Result<ClientId> {
        u32::try_from(self.long_ids.len())
            .map(ClientId)
            .map_err(|_| Error::TooManyClients(self.long_ids.len()))
    }

    pub fn short_id(&self, long_id: &str) -> Option<ClientId> {
        self.by_long_id.get(long_id).copied()
    }

    pub fn long_id(&self, client: ClientId) -> Option<&str> {
        self.long_ids.get(client.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.long_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.long_ids.is_empty()
    }
}

/// Per-replica collaboration state
///
/// Invariant: `min_seq <= current_seq`, and `min_seq` never decreases.
#[derive(Debug, Clone, Default)]
pub struct CollabWindow {
    collaborating: bool,
    local_client: Option<ClientId>,
    min_seq: SeqNum,
    current_seq: SeqNum,
    roster: ClientRoster,
}

impl CollabWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborating(&self) -> bool {
        self.collaborating
    }

    /// Short id of this replica, once collaboration started
    pub fn local_client(&self) -> Option<ClientId> {
        self.local_client
    }

    pub fn min_seq(&self) -> SeqNum {
        self.min_seq
    }

    pub fn current_seq(&self) -> SeqNum {
        self.current_seq
    }

    pub fn roster(&self) -> &ClientRoster {
        &self.roster
    }

    pub(crate) fn roster_mut(&mut self) -> &mut ClientRoster {
        &mut self.roster
    }

    /// Enter collaboration as `long_id` with `initial_seq` already applied
    pub(crate) fn start_collaboration(
        &mut self,
        long_id: &str,
        initial_seq: SeqNum,
    ) -> Result<ClientId> {
        let local = self.roster.get_or_add(long_id)?;
        self.collaborating = true;
        self.local_client = Some(local);
        self.current_seq = initial_seq;
        self.min_seq = self.min_seq.min(initial_seq);
        Ok(local)
    }

    pub(crate) fn set_current_seq(&mut self, seq: SeqNum) {
        self.current_seq = seq;
    }

    /// Raise the window floor; returns false (and changes nothing) when
    /// `new_min` is not above the current floor
    ///
    /// A floor above `current_seq` means every message up to it has been
    /// delivered, so `current_seq` is raised along with it.
    pub(crate) fn advance_min_seq(&mut self, new_min: SeqNum) -> bool {
        if new_min <= self.min_seq {
            return false;
        }
        self.min_seq = new_min;
        self.current_seq = self.current_seq.max(new_min);
        true
    }

    /// Restore window bounds from a snapshot
    pub(crate) fn reset(&mut self, min_seq: SeqNum, current_seq: SeqNum) {
        self.min_seq = min_seq;
        self.current_seq = current_seq.max(min_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_interns_ids() {
        let mut roster = ClientRoster::new();
        let a = roster.get_or_add("alice").unwrap();
        let b = roster.get_or_add("bob").unwrap();

        assert_ne!(a, b);
        assert_eq!(roster.get_or_add("alice").unwrap(), a);
        assert_eq!(roster.next_id().unwrap(), ClientId(2));
        assert_eq!(roster.long_id(b), Some("bob"));
        assert_eq!(roster.short_id("carol"), None);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_min_seq_never_decreases() {
        let mut window = CollabWindow::new();
        window.start_collaboration("me", 10).unwrap();

        assert!(window.advance_min_seq(5));
        assert!(!window.advance_min_seq(3));
        assert!(!window.advance_min_seq(5));
        assert_eq!(window.min_seq(), 5);
        assert_eq!(window.current_seq(), 10);
    }

    #[test]
    fn test_min_seq_drags_current_seq() {
        let mut window = CollabWindow::new();
        window.start_collaboration("me", 2).unwrap();

        window.advance_min_seq(7);
        assert_eq!(window.current_seq(), 7);
    }

    #[test]
    fn test_start_collaboration() {
        let mut window = CollabWindow::new();
        assert!(!window.collaborating());

        let me = window.start_collaboration("me", 4).unwrap();
        assert!(window.collaborating());
        assert_eq!(window.local_client(), Some(me));
        assert_eq!(window.current_seq(), 4);
        assert_eq!(window.min_seq(), 0);
    }
}
