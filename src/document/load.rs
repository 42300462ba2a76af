//! Load lifecycle state and readiness signal

use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Where an object is in its load lifecycle
///
/// `Unloaded -> Loading -> Loaded`, with `Failed` reachable from `Loading`
/// and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
            LoadState::Failed => "failed",
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared load state that futures can wait on
#[derive(Debug, Clone)]
pub(crate) struct LoadSignal {
    tx: Arc<watch::Sender<LoadState>>,
}

impl LoadSignal {
    pub fn new(state: LoadState) -> Self {
        let (tx, _) = watch::channel(state);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> LoadState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: LoadState) {
        self.tx.send_replace(state);
    }

    /// Resolves once the state is `Loaded` (Ok) or `Failed` (Err)
    ///
    /// The future does not borrow the object, so it can be handed to another
    /// task while loading proceeds.
    pub fn ready(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let state = match rx.wait_for(LoadState::is_settled).await {
                Ok(state) => *state,
                Err(_) => LoadState::Failed,
            };
            match state {
                LoadState::Loaded => Ok(()),
                _ => Err(Error::LoadFailed),
            }
        }
    }

    /// Marks the load failed unless disarmed first
    pub fn guard(&self) -> LoadGuard {
        LoadGuard {
            signal: self.clone(),
            armed: true,
        }
    }
}

/// Fails the load if dropped while armed
pub(crate) struct LoadGuard {
    signal: LoadSignal,
    armed: bool,
}

impl LoadGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("load abandoned before completion");
            self.signal.set(LoadState::Failed);
        }
    }
}
