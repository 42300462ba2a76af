//! SharedString: the collaborative sequence object hosts interact with
//!
//! Wires a `Client` to the outside world: a `Sequencer` for outbound ops,
//! sequenced messages and minimum sequence number updates inbound, snapshot
//! load and extraction, and observers.
//!
//! # Lifecycle
//!
//! ```text
//!   create()                      unloaded()
//!      │                              │ begin_load(header)
//!      │                              ▼
//!      │                           Loading ──── fatal error / dropped load ───▶ Failed
//!      │                              │ complete_load(body)
//!      ▼                              ▼
//!   Loaded (detached) ──attach──▶ Loaded (collaborating)
//! ```
//!
//! While not loaded, inbound messages are queued and local edits are
//! deferred. Both are applied, in order, when loading completes.

use super::events::{Observer, Observers, SequenceEvent, SubscriptionId};
use super::load::{LoadSignal, LoadState};
use super::sequencer::Sequencer;
use crate::config::Config;
use crate::crdt::merge_tree::{Marker, PropertySet, SeqNum};
use crate::error::{Error, ProtocolViolation, Result};
use crate::protocol::{MergeTreeOp, SequencedMessage};
use crate::snapshot::{
    append_chunk, seed_tree, BlobStorage, MergeTreeChunk, Snapshot, SnapshotTree,
};
use crate::sync::Client;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};

/// Collaborative text-and-marker sequence
pub struct SharedString {
    id: String,
    config: Config,
    client: Client,
    signal: LoadSignal,
    sequencer: Option<Box<dyn Sequencer>>,
    /// Client id given to `attach` before loading finished
    pending_attach: Option<String>,
    /// Local edits issued before loading finished
    deferred: Vec<MergeTreeOp>,
    /// Largest minimum sequence number seen before loading finished
    pending_min_seq: Option<SeqNum>,
    /// Header of the snapshot being loaded
    header: Option<MergeTreeChunk>,
    expects_body: bool,
    observers: Observers,
}

impl SharedString {
    /// New empty object, loaded and detached
    ///
    /// Edits made before `attach` predate collaboration and are part of the
    /// state the host publishes when attaching.
    pub fn create(id: impl Into<String>) -> Self {
        let string = Self::with_state(id.into(), LoadState::Loaded);
        debug!(id = %string.id, "created shared string");
        string
    }

    /// Object that will be populated from a snapshot
    pub fn unloaded(id: impl Into<String>) -> Self {
        Self::with_state(id.into(), LoadState::Unloaded)
    }

    fn with_state(id: String, state: LoadState) -> Self {
        Self {
            id,
            config: Config::default(),
            client: Client::new(),
            signal: LoadSignal::new(state),
            sequencer: None,
            pending_attach: None,
            deferred: Vec::new(),
            pending_min_seq: None,
            header: None,
            expects_body: false,
            observers: Observers::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn load_state(&self) -> LoadState {
        self.signal.get()
    }

    /// Resolves when the object is usable, or fails if loading failed
    pub fn loaded(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.signal.ready()
    }

    /// True once `attach` has been called
    pub fn is_attached(&self) -> bool {
        self.sequencer.is_some()
    }

    pub fn is_desynchronized(&self) -> bool {
        self.client.is_desynchronized()
    }

    // Queries

    pub fn get_text(&self) -> String {
        self.client.get_text()
    }

    pub fn get_text_range(&self, start: usize, end: usize) -> Result<String> {
        self.client.tree().get_text_range(start, end)
    }

    pub fn len(&self) -> usize {
        self.client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.client.is_empty()
    }

    // Local edits

    pub fn insert_text(&mut self, pos: usize, text: &str, props: PropertySet) -> Result<()> {
        self.edit(MergeTreeOp::insert_text(pos, text, props))
    }

    pub fn insert_marker(&mut self, pos: usize, marker: Marker, props: PropertySet) -> Result<()> {
        self.edit(MergeTreeOp::insert_marker(pos, marker, props))
    }

    pub fn remove_text(&mut self, start: usize, end: usize) -> Result<()> {
        self.edit(MergeTreeOp::remove(start, end))
    }

    pub fn annotate_range(&mut self, start: usize, end: usize, props: PropertySet) -> Result<()> {
        self.edit(MergeTreeOp::annotate(start, end, props))
    }

    fn edit(&mut self, op: MergeTreeOp) -> Result<()> {
        match self.load_state() {
            LoadState::Loaded => self.submit_local(op),
            LoadState::Unloaded | LoadState::Loading => {
                debug!(id = %self.id, deferred = self.deferred.len() + 1, "deferring local edit");
                self.deferred.push(op);
                Ok(())
            }
            LoadState::Failed => Err(Error::LoadFailed),
        }
    }

    fn submit_local(&mut self, op: MergeTreeOp) -> Result<()> {
        let message = self.client.apply_local(op)?;
        if self.client.tree().window().collaborating() {
            if let Some(sequencer) = &self.sequencer {
                sequencer.submit(message);
            }
        }
        Ok(())
    }

    // Collaboration

    /// Join collaboration as `client_id`, submitting future edits to `sequencer`
    ///
    /// If the object is still loading, collaboration starts once it is loaded.
    pub fn attach(
        &mut self,
        client_id: impl Into<String>,
        sequencer: impl Sequencer + 'static,
    ) -> Result<()> {
        let client_id = client_id.into();
        if let Some(existing) = self
            .client
            .long_client_id()
            .or(self.pending_attach.as_deref())
        {
            return Err(Error::AlreadyAttached(existing.to_string()));
        }

        match self.load_state() {
            LoadState::Loaded => {
                let seq = self.client.current_seq();
                self.client.start_collaboration(client_id, seq)?;
            }
            LoadState::Unloaded | LoadState::Loading => {
                debug!(id = %self.id, client = %client_id, "attach deferred until loaded");
                self.pending_attach = Some(client_id);
            }
            LoadState::Failed => return Err(Error::LoadFailed),
        }
        self.sequencer = Some(Box::new(sequencer));
        Ok(())
    }

    /// Handle a sequenced message from the sequencer
    ///
    /// Messages arriving before the object is loaded are queued.
    pub fn process(&mut self, message: SequencedMessage) -> Result<()> {
        match self.load_state() {
            LoadState::Loaded => self.apply(&message),
            LoadState::Unloaded | LoadState::Loading => {
                self.client.enqueue_msg(message);
                Ok(())
            }
            LoadState::Failed => Err(Error::LoadFailed),
        }
    }

    /// Handle a minimum sequence number update
    ///
    /// Before the object is loaded only the largest value is remembered.
    pub fn process_min_sequence_number_changed(&mut self, min_seq: SeqNum) -> Result<()> {
        match self.load_state() {
            LoadState::Loaded => {
                if self.client.is_desynchronized() {
                    return Err(Error::Desynchronized);
                }
                self.client.update_min_seq(min_seq);
                Ok(())
            }
            LoadState::Unloaded | LoadState::Loading => {
                self.pending_min_seq = self.pending_min_seq.max(Some(min_seq));
                Ok(())
            }
            LoadState::Failed => Err(Error::LoadFailed),
        }
    }

    /// `process` followed by the message's minimum sequence number
    pub fn deliver(&mut self, message: SequencedMessage) -> Result<()> {
        let min_seq = message.minimum_sequence_number;
        self.process(message)?;
        self.process_min_sequence_number_changed(min_seq)
    }

    fn apply(&mut self, message: &SequencedMessage) -> Result<()> {
        if self.client.is_desynchronized() {
            return Err(Error::Desynchronized);
        }
        let local = self.client.long_client_id() == Some(message.client_id.as_str());
        let event = SequenceEvent {
            message,
            local,
            state: self.client.state(),
        };
        self.observers.pre_op(&event);
        self.client.apply_msg(message)?;
        self.observers.op(&event);
        Ok(())
    }

    // Observers

    pub fn subscribe(&mut self, observer: impl Observer + 'static) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // Snapshots

    /// Capture the sequenced state
    pub fn snapshot(&self) -> Result<Snapshot> {
        if self.load_state() != LoadState::Loaded {
            return Err(Error::NotLoaded);
        }
        Ok(Snapshot::extract(self.client.tree(), &self.config.snapshot))
    }

    /// Capture and serialize the sequenced state
    pub fn summarize(&self) -> Result<SnapshotTree> {
        self.snapshot()?.emit(&self.config.snapshot)
    }

    /// Load from a snapshot taken at `expected_seq`, fetching the body from
    /// `storage`
    ///
    /// `header` is `None` for an object that has never been summarized. A
    /// failed fetch returns the object to `Unloaded` so the host can retry;
    /// dropping the future before it completes leaves the object `Failed`.
    pub async fn load<S: BlobStorage + ?Sized>(
        &mut self,
        expected_seq: SeqNum,
        header: Option<&[u8]>,
        storage: &S,
    ) -> Result<()> {
        self.begin_load(expected_seq, header)?;
        let guard = self.signal.guard();

        let body = if self.expects_body {
            let name = self.config.snapshot.body_blob_name.clone();
            let fetched = storage.fetch(&name).await;
            match fetched {
                Ok(bytes) => Some(bytes),
                Err(err) if err.is_transient() => {
                    guard.disarm();
                    self.reset_load(&err);
                    return Err(err);
                }
                Err(err) => {
                    guard.disarm();
                    return Err(self.fail_load(err));
                }
            }
        } else {
            None
        };

        guard.disarm();
        self.complete_load(body)
    }

    /// First load phase: parse the header and seed the tree
    ///
    /// Fails fatally if the header was taken at a sequence number other than
    /// `expected_seq`.
    pub fn begin_load(&mut self, expected_seq: SeqNum, header: Option<&[u8]>) -> Result<()> {
        let state = self.load_state();
        if state != LoadState::Unloaded {
            return Err(Error::LoadConflict {
                action: "begin load",
                state: state.as_str(),
            });
        }
        self.signal.set(LoadState::Loading);

        let chunk = match header {
            Some(bytes) => match Snapshot::process_chunk(bytes) {
                Ok(chunk) => chunk,
                Err(err) => return Err(self.fail_load(err)),
            },
            None => MergeTreeChunk::empty(),
        };
        if chunk.chunk_sequence_number != expected_seq {
            let violation = ProtocolViolation::ChunkSequenceMismatch {
                expected: expected_seq,
                found: chunk.chunk_sequence_number,
            };
            return Err(self.fail_load(violation.into()));
        }

        let mut seeded = chunk.clone();
        seeded.segments = Vec::new();
        if let Err(err) = seed_tree(self.client.tree_mut(), chunk) {
            return Err(self.fail_load(err));
        }
        debug!(
            id = %self.id,
            seq = seeded.chunk_sequence_number,
            segments = self.client.tree().segment_count(),
            "loaded snapshot header"
        );
        self.expects_body = header.is_some();
        self.header = Some(seeded);
        Ok(())
    }

    /// Second load phase: append the body, then apply everything that was
    /// held back while loading
    ///
    /// Deferred local edits that do not fit the loaded content are returned in
    /// `Error::DeferredEditsRejected`; the object is loaded regardless.
    pub fn complete_load(&mut self, body: Option<Bytes>) -> Result<()> {
        let state = self.load_state();
        if state != LoadState::Loading {
            return Err(Error::LoadConflict {
                action: "complete load",
                state: state.as_str(),
            });
        }

        if let Some(bytes) = body {
            let chunk = match Snapshot::process_chunk(&bytes) {
                Ok(chunk) => chunk,
                Err(err) => return Err(self.fail_load(err)),
            };
            let expected = self
                .header
                .as_ref()
                .map_or(0, |header| header.chunk_sequence_number);
            if chunk.chunk_sequence_number != expected {
                let violation = ProtocolViolation::ChunkSequenceMismatch {
                    expected,
                    found: chunk.chunk_sequence_number,
                };
                return Err(self.fail_load(violation.into()));
            }
            if let Err(err) = append_chunk(self.client.tree_mut(), chunk) {
                return Err(self.fail_load(err));
            }
        }

        self.finish_load()
    }

    fn finish_load(&mut self) -> Result<()> {
        if let Some(client_id) = self.pending_attach.take() {
            let seq = self.client.current_seq();
            if let Err(err) = self.client.start_collaboration(client_id, seq) {
                return Err(self.fail_load(err));
            }
        }

        self.client.set_reconciling(true);
        let drained = self.drain_queue();
        self.client.set_reconciling(false);
        if let Err(err) = drained {
            return Err(self.fail_load(err));
        }

        if let Some(min_seq) = self.pending_min_seq.take() {
            if min_seq > self.client.min_seq() {
                self.client.update_min_seq(min_seq);
            }
        }

        let mut rejected = Vec::new();
        for op in std::mem::take(&mut self.deferred) {
            if let Err(err) = self.submit_local(op.clone()) {
                warn!(id = %self.id, error = %err, "deferred local edit rejected");
                rejected.push((op, err));
            }
        }

        self.signal.set(LoadState::Loaded);
        info!(
            id = %self.id,
            seq = self.client.current_seq(),
            len = self.client.len(),
            "shared string loaded"
        );
        let header = self.header.take().unwrap_or_else(MergeTreeChunk::empty);
        self.observers.load_finished(&header);

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(Error::DeferredEditsRejected { rejected })
        }
    }

    fn drain_queue(&mut self) -> Result<()> {
        while let Some(message) = self.client.dequeue_msg() {
            if message.sequence_number <= self.client.current_seq() {
                debug!(
                    seq = message.sequence_number,
                    "skipping queued message already in snapshot"
                );
                continue;
            }
            self.apply(&message)?;
        }
        Ok(())
    }

    fn reset_load(&mut self, err: &Error) {
        warn!(id = %self.id, error = %err, "snapshot fetch failed, load can be retried");
        self.client
            .tree_mut()
            .reload_from_segments(std::iter::empty(), 0, 0);
        self.header = None;
        self.expects_body = false;
        self.signal.set(LoadState::Unloaded);
    }

    fn fail_load(&mut self, err: Error) -> Error {
        warn!(id = %self.id, error = %err, "load failed");
        self.header = None;
        self.signal.set(LoadState::Failed);
        err
    }
}

impl fmt::Debug for SharedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedString")
            .field("id", &self.id)
            .field("state", &self.load_state())
            .field("attached", &self.is_attached())
            .field("client", &self.client.state())
            .field("observers", &self.observers)
            .finish()
    }
}
