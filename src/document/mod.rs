//! Collaborative sequence object and its host-facing boundaries

pub mod events;
mod load;
pub mod sequencer;
pub mod shared_string;

pub use events::{Observer, Observers, SequenceEvent, SubscriptionId};
pub use load::LoadState;
pub use sequencer::Sequencer;
pub use shared_string::SharedString;
