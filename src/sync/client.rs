//! Client: per-replica sequencing coordinator
//!
//! Applies local edits immediately, applies sequenced edits strictly in
//! sequence order, and reconciles the echoes of its own edits by re-tagging
//! the provisional attribution in place.
//!
//! # State Machine
//!
//! ```text
//!            local edit                 last ack
//!   Idle ───────────────▶ LocalPending ─────────▶ Idle
//!     │                        │
//!     │ apply_msg batch        │ apply_msg batch
//!     ▼                        ▼
//!   Reconciling ◀──────────────┘
//!     │
//!     │ protocol violation (from any state)
//!     ▼
//!   Desynchronized   (terminal: reload from a snapshot)
//! ```

use super::pending::{MessageQueue, PendingOps};
use crate::crdt::merge_tree::{LocalSeq, Marker, MergeTree, PropertySet, SeqNum, Stamp, View};
use crate::error::{Error, ProtocolViolation, Result};
use crate::protocol::{MergeTreeOp, ObjectMessage, SequencedMessage};
use tracing::{debug, info, warn};

/// Observable state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No local ops awaiting acknowledgment
    Idle,
    /// One or more local ops submitted and not yet echoed back
    LocalPending,
    /// Applying a batch of sequenced messages
    ///
    /// Held only while the batch runs, so callers never see it between calls.
    /// Observers do, through the state carried by each sequence event.
    Reconciling,
    /// A protocol violation was detected; no further messages are applied
    Desynchronized,
}

/// Sequencing coordinator owning one merge tree
///
/// # Example
///
/// ```rust
/// use mergetree_core::crdt::merge_tree::PropertySet;
/// use mergetree_core::protocol::SequencedMessage;
/// use mergetree_core::sync::{Client, ClientState};
///
/// let mut alice = Client::new();
/// alice.start_collaboration("alice", 0).unwrap();
///
/// let op = alice.insert_text_local(0, "hello", PropertySet::new()).unwrap();
/// assert_eq!(alice.state(), ClientState::LocalPending);
///
/// // The sequencer echoes the op back with seq 1
/// alice.apply_msg(&SequencedMessage::sequenced(op, "alice", 1, 0)).unwrap();
/// assert_eq!(alice.state(), ClientState::Idle);
/// assert_eq!(alice.get_text(), "hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Client {
    tree: MergeTree,
    long_id: Option<String>,
    local_seq: LocalSeq,
    pending_ops: PendingOps,
    messages: MessageQueue,
    reconciling: bool,
    desynchronized: bool,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &MergeTree {
        &self.tree
    }

    pub(crate) fn tree_mut(&mut self) -> &mut MergeTree {
        &mut self.tree
    }

    /// Long id this client collaborates as, once collaboration started
    pub fn long_client_id(&self) -> Option<&str> {
        self.long_id.as_deref()
    }

    pub fn state(&self) -> ClientState {
        if self.desynchronized {
            ClientState::Desynchronized
        } else if self.reconciling {
            ClientState::Reconciling
        } else if self.pending_ops.is_empty() {
            ClientState::Idle
        } else {
            ClientState::LocalPending
        }
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    pub fn pending_op_count(&self) -> usize {
        self.pending_ops.len()
    }

    pub fn get_text(&self) -> String {
        self.tree.get_text()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn current_seq(&self) -> SeqNum {
        self.tree.window().current_seq()
    }

    pub fn min_seq(&self) -> SeqNum {
        self.tree.window().min_seq()
    }

    /// Start collaborating as `long_id` with everything up to `initial_seq`
    /// already applied
    pub fn start_collaboration(
        &mut self,
        long_id: impl Into<String>,
        initial_seq: SeqNum,
    ) -> Result<()> {
        let long_id = long_id.into();
        let short = self.tree.start_collaboration(&long_id, initial_seq)?;
        info!(client = %long_id, short_id = %short, initial_seq, "started collaboration");
        self.long_id = Some(long_id);
        Ok(())
    }

    pub fn insert_text_local(
        &mut self,
        pos: usize,
        text: &str,
        props: PropertySet,
    ) -> Result<ObjectMessage> {
        self.apply_local(MergeTreeOp::insert_text(pos, text, props))
    }

    pub fn insert_marker_local(
        &mut self,
        pos: usize,
        marker: Marker,
        props: PropertySet,
    ) -> Result<ObjectMessage> {
        self.apply_local(MergeTreeOp::insert_marker(pos, marker, props))
    }

    pub fn remove_range_local(&mut self, start: usize, end: usize) -> Result<ObjectMessage> {
        self.apply_local(MergeTreeOp::remove(start, end))
    }

    pub fn annotate_range_local(
        &mut self,
        start: usize,
        end: usize,
        props: PropertySet,
    ) -> Result<ObjectMessage> {
        self.apply_local(MergeTreeOp::annotate(start, end, props))
    }

    /// Apply a local op and return the message to submit
    ///
    /// Before collaboration starts, edits are attributed as `Universal` and
    /// nothing is tracked for acknowledgment.
    pub fn apply_local(&mut self, op: MergeTreeOp) -> Result<ObjectMessage> {
        if self.desynchronized {
            return Err(Error::Desynchronized);
        }

        let collaborating = self.tree.window().collaborating();
        let local_seq = self.local_seq + 1;
        let stamp = if collaborating {
            Stamp::local(local_seq)
        } else {
            Stamp::Universal
        };
        apply_op(&mut self.tree, &op, stamp, View::Local)?;

        if collaborating {
            self.local_seq = local_seq;
            self.pending_ops.push(local_seq, op.clone());
            debug!(local_seq, pending = self.pending_ops.len(), "applied local op");
        }

        Ok(ObjectMessage {
            reference_sequence_number: self.current_seq(),
            contents: op,
        })
    }

    /// Apply a sequenced message
    ///
    /// Any protocol violation moves the client to `Desynchronized`; from then
    /// on every call fails with `Error::Desynchronized`.
    pub fn apply_msg(&mut self, message: &SequencedMessage) -> Result<()> {
        if self.desynchronized {
            return Err(Error::Desynchronized);
        }

        match self.try_apply(message) {
            Err(err @ (Error::Protocol(_) | Error::TooManyClients(_))) => {
                warn!(
                    seq = message.sequence_number,
                    client = %message.client_id,
                    error = %err,
                    "protocol violation, replica desynchronized"
                );
                self.desynchronized = true;
                Err(err)
            }
            other => other,
        }
    }

    fn try_apply(&mut self, message: &SequencedMessage) -> Result<()> {
        let seq = message.sequence_number;
        let reference = message.reference_sequence_number;
        let window = self.tree.window();

        if seq <= window.current_seq() {
            return Err(ProtocolViolation::OutOfOrder {
                last: window.current_seq(),
                received: seq,
            }
            .into());
        }
        if reference >= seq {
            return Err(ProtocolViolation::ReferenceAhead { seq, reference }.into());
        }
        if reference < window.min_seq() {
            return Err(ProtocolViolation::ReferenceBehindWindow {
                reference,
                min_seq: window.min_seq(),
            }
            .into());
        }

        let own = window.collaborating()
            && self.long_id.as_deref() == Some(message.client_id.as_str());
        if own {
            self.acknowledge(message)?;
        } else {
            let client = self
                .tree
                .window_mut()
                .roster_mut()
                .get_or_add(&message.client_id)?;
            let stamp = Stamp::sequenced(seq, client);
            apply_op(
                &mut self.tree,
                &message.contents,
                stamp,
                View::remote(reference, client),
            )
            .map_err(|err| match err {
                Error::InvalidRange { .. } | Error::PositionOutOfBounds { .. } => {
                    ProtocolViolation::InvalidRemoteOp {
                        seq,
                        reason: err.to_string(),
                    }
                    .into()
                }
                other => other,
            })?;
            debug!(seq, reference, client = %message.client_id, "applied remote op");
        }

        self.tree.window_mut().set_current_seq(seq);
        Ok(())
    }

    fn acknowledge(&mut self, message: &SequencedMessage) -> Result<()> {
        let seq = message.sequence_number;
        let Some(front) = self.pending_ops.front() else {
            return Err(ProtocolViolation::UnexpectedAck { seq }.into());
        };
        if front.op != message.contents {
            return Err(ProtocolViolation::AckMismatch { seq }.into());
        }
        let Some(pending) = self.pending_ops.pop_front() else {
            return Err(ProtocolViolation::UnexpectedAck { seq }.into());
        };
        let Some(me) = self.tree.window().local_client() else {
            return Err(ProtocolViolation::UnexpectedAck { seq }.into());
        };

        let annotated = match &pending.op {
            MergeTreeOp::Annotate { props, .. } => Some(props),
            _ => None,
        };
        self.tree
            .ack(pending.local_seq, Stamp::sequenced(seq, me), annotated);
        debug!(seq, local_seq = pending.local_seq, "acknowledged local op");
        Ok(())
    }

    /// Mark the start or end of a batch of sequenced messages
    pub fn set_reconciling(&mut self, reconciling: bool) {
        self.reconciling = reconciling;
    }

    pub fn update_min_seq(&mut self, min_seq: SeqNum) -> bool {
        self.tree.update_min_seq(min_seq)
    }

    /// Translate `pos` as seen by `client_id` at `ref_seq` into the local view
    pub fn rebase_position(&self, pos: usize, ref_seq: SeqNum, client_id: &str) -> Result<usize> {
        let roster = self.tree.window().roster();
        // A client never seen has authored nothing; any unallocated id
        // reproduces its view.
        let client = match roster.short_id(client_id) {
            Some(client) => client,
            None => roster.next_id()?,
        };
        self.tree.rebase_position(pos, ref_seq, client)
    }

    pub fn enqueue_msg(&mut self, message: SequencedMessage) {
        self.messages.enqueue(message);
    }

    pub fn has_messages(&self) -> bool {
        self.messages.has_messages()
    }

    pub fn dequeue_msg(&mut self) -> Option<SequencedMessage> {
        self.messages.dequeue()
    }

    pub fn queued_message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Apply `op` to `tree` with the given attribution
fn apply_op(tree: &mut MergeTree, op: &MergeTreeOp, stamp: Stamp, view: View) -> Result<()> {
    match op {
        MergeTreeOp::Insert { pos1, props, .. } => {
            let Some(content) = op.insert_content() else {
                return Err(ProtocolViolation::InvalidRemoteOp {
                    seq: stamp.seq().unwrap_or_default(),
                    reason: "insert must carry exactly one of text or marker".to_string(),
                }
                .into());
            };
            tree.insert(*pos1, content, props.clone(), stamp, view)
        }
        MergeTreeOp::Remove { pos1, pos2 } => tree.remove(*pos1, *pos2, stamp, view),
        MergeTreeOp::Annotate { pos1, pos2, props } => {
            tree.annotate(*pos1, *pos2, props, stamp, view)
        }
    }
}
