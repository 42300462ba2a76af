//! Observer registry for sequence events
//!
//! Observers are called synchronously on the thread applying the message:
//! `pre_op` before the tree changes, `op` after, and `load_finished` once when
//! the object becomes usable.

use crate::protocol::SequencedMessage;
use crate::snapshot::MergeTreeChunk;
use crate::sync::ClientState;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sequenced message being applied, as seen by observers
#[derive(Debug, Clone, Copy)]
pub struct SequenceEvent<'a> {
    pub message: &'a SequencedMessage,
    /// True when the message acknowledges an op made on this replica
    pub local: bool,
    /// Client state as the message is taken up; `Reconciling` while catching
    /// up on messages queued during load
    pub state: ClientState,
}

/// Receives notifications from a shared string
pub trait Observer: Send {
    fn pre_op(&mut self, _event: &SequenceEvent<'_>) {}

    fn op(&mut self, _event: &SequenceEvent<'_>) {}

    /// Called once with the header the object was loaded from, segments omitted
    fn load_finished(&mut self, _header: &MergeTreeChunk) {}
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observers in subscription order
#[derive(Default)]
pub struct Observers {
    entries: Vec<(SubscriptionId, Box<dyn Observer>)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl Observer + 'static) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.entries.push((id, Box::new(observer)));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn pre_op(&mut self, event: &SequenceEvent<'_>) {
        for (_, observer) in &mut self.entries {
            observer.pre_op(event);
        }
    }

    pub(crate) fn op(&mut self, event: &SequenceEvent<'_>) {
        for (_, observer) in &mut self.entries {
            observer.op(event);
        }
    }

    pub(crate) fn load_finished(&mut self, header: &MergeTreeChunk) {
        for (_, observer) in &mut self.entries {
            observer.load_finished(header);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MergeTreeOp;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Observer for Recorder {
        fn pre_op(&mut self, event: &SequenceEvent<'_>) {
            self.0
                .lock()
                .unwrap()
                .push(format!("pre {}", event.message.sequence_number));
        }

        fn op(&mut self, event: &SequenceEvent<'_>) {
            self.0
                .lock()
                .unwrap()
                .push(format!("op {}", event.message.sequence_number));
        }
    }

    fn message(seq: u64) -> SequencedMessage {
        SequencedMessage {
            sequence_number: seq,
            reference_sequence_number: seq - 1,
            client_id: "peer".to_string(),
            minimum_sequence_number: 0,
            contents: MergeTreeOp::remove(0, 1),
        }
    }

    #[test]
    fn test_fires_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::new();
        observers.subscribe(Recorder(log.clone()));

        let msg = message(4);
        let event = SequenceEvent {
            message: &msg,
            local: false,
            state: ClientState::Idle,
        };
        observers.pre_op(&event);
        observers.op(&event);

        assert_eq!(*log.lock().unwrap(), vec!["pre 4", "op 4"]);
    }

    #[test]
    fn test_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::new();
        let id = observers.subscribe(Recorder(log.clone()));

        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());

        let msg = message(1);
        observers.op(&SequenceEvent {
            message: &msg,
            local: true,
            state: ClientState::LocalPending,
        });
        assert!(log.lock().unwrap().is_empty());
    }
}
