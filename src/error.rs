//! # Harness Error Taxonomy
//!
//! Transport collaborators report failures as plain `anyhow::Error`s. The
//! drivers classify every failure by the stage it happened in, because the
//! stage decides what the harness does with it:
//!
//! - **Setup**: naming lookup or connection/session/endpoint creation failed.
//!   The run is aborted after the transport handle is released.
//! - **Transport**: a send, receive or commit failed. Fatal for the sender and
//!   for the listener's driving task; inside the delivery callback the error is
//!   logged and swallowed instead.
//! - **InvalidParameters**: the parameters violate an invariant and the run
//!   never touches the transport.
//! - **Interrupted**: the listener stopped waiting for completion.
//!
//! Failures while closing the transport are never turned into a
//! `HarnessError`; they are logged where they happen.

use thiserror::Error;

/// Errors surfaced by the sender and listener drivers.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("setup failed while {stage}")]
    Setup {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("transport failed while {stage}")]
    Transport {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid benchmark parameters: {0}")]
    InvalidParameters(String),

    #[error("listener interrupted: {0}")]
    Interrupted(String),
}

impl HarnessError {
    /// Returns true for failures that happened before any message moved.
    pub fn is_setup(&self) -> bool {
        matches!(self, HarnessError::Setup { .. })
    }

    /// Returns true for send, receive and commit failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, HarnessError::Transport { .. })
    }
}

/// Classifies collaborator results by the stage they came from.
pub trait ResultExt<T> {
    fn setup(self, stage: impl Into<String>) -> Result<T, HarnessError>;
    fn transport(self, stage: impl Into<String>) -> Result<T, HarnessError>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn setup(self, stage: impl Into<String>) -> Result<T, HarnessError> {
        self.map_err(|source| HarnessError::Setup {
            stage: stage.into(),
            source,
        })
    }

    fn transport(self, stage: impl Into<String>) -> Result<T, HarnessError> {
        self.map_err(|source| HarnessError::Transport {
            stage: stage.into(),
            source,
        })
    }
}
