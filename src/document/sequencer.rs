//! Outbound half of the sequencer connection

use crate::protocol::ObjectMessage;
use tokio::sync::mpsc;
use tracing::warn;

/// Accepts local ops for sequencing
///
/// Submission never blocks and has no cancellation path: once handed over, an
/// op comes back as a sequenced message or the connection is lost.
pub trait Sequencer: Send {
    fn submit(&self, message: ObjectMessage);
}

impl Sequencer for mpsc::UnboundedSender<ObjectMessage> {
    fn submit(&self, message: ObjectMessage) {
        if self.send(message).is_err() {
            warn!("sequencer channel closed, local op not submitted");
        }
    }
}
