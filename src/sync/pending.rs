//! Queues held by a client between sequencing events
//!
//! - `MessageQueue` buffers sequenced messages that arrive before the object
//!   has a valid base state (still loading). They are drained in arrival
//!   order, which is sequence order.
//! - `PendingOps` tracks local ops submitted to the sequencer and not yet
//!   echoed back, oldest first.

use crate::crdt::merge_tree::LocalSeq;
use crate::protocol::{MergeTreeOp, SequencedMessage};
use std::collections::VecDeque;

/// FIFO of sequenced messages waiting to be applied
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    messages: VecDeque<SequencedMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: SequencedMessage) {
        self.messages.push_back(message);
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn dequeue(&mut self) -> Option<SequencedMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A local op awaiting acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub local_seq: LocalSeq,
    pub op: MergeTreeOp,
}

/// Outstanding local ops, oldest first
///
/// The sequencer preserves each client's submission order, so
/// acknowledgments always match the front of the queue.
#[derive(Debug, Clone, Default)]
pub struct PendingOps {
    ops: VecDeque<PendingOp>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, local_seq: LocalSeq, op: MergeTreeOp) {
        self.ops.push_back(PendingOp { local_seq, op });
    }

    pub fn front(&self) -> Option<&PendingOp> {
        self.ops.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingOp> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
