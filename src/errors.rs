//! Error types for the repoforge crate.
//!
//! This module defines a unified error enumeration used across configuration
//! parsing, content fetching, Git cache operations, and workspace-root
//! assembly. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Inside the consumer maps, errors travel as `(message, fatal)` pairs
//! through per-key loggers; `SetupError` is the boundary type surfaced by
//! the synchronous layers and by the setup driver.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the repoforge library.
///
/// - Used across config parsing, fetching, unpacking, the Git cache and CAS.
/// - Implements `std::error::Error` via `thiserror`.
pub enum SetupError {
    /// JSON shape or type violation in a repository description.
    #[error("Schema violation: {0}")]
    Schema(String),

    /// I/O error from the filesystem or a subprocess.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure while fetching content.
    #[error("Network Error: {0}")]
    Network(String),

    /// Content digest did not match the expected value.
    #[error("Hash mismatch for {source_name}: expected {expected}, got {actual}")]
    Verify {
        source_name: String,
        expected: String,
        actual: String,
    },

    /// A remote collaborator (mirror, serve endpoint) reported failure.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// A critical Git operation completed with a non-ok result.
    #[error("Git operation failed: {0}")]
    Op(String),

    /// Repository alias resolution revisited a description.
    #[error("Cyclic repository reference involving {0}")]
    Cycle(String),

    /// The named repository is not present in the configuration.
    #[error("Missing config entry for repository {0}")]
    UnknownRepository(String),

    /// Malformed archive content (tar/zip decode failure).
    #[error("Archive decode failed: {0}")]
    Archive(String),

    /// One or more repositories could not be set up; carries the collected
    /// fatal messages.
    #[error("Setup failed:\n{0}")]
    SetupFailed(String),

    /// Invariant violation inside the crate.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SetupError {
    /// Stable kind tag, used when a `SetupError` is forwarded through a
    /// map logger as a plain message.
    pub fn kind(&self) -> &'static str {
        match self {
            SetupError::Schema(_) | SetupError::UnknownRepository(_) => "schema",
            SetupError::Io(_) | SetupError::Network(_) | SetupError::Archive(_) => "io",
            SetupError::Verify { .. } => "verify",
            SetupError::Upstream(_) => "upstream",
            SetupError::Op(_) => "op",
            SetupError::Cycle(_) => "cycle",
            SetupError::SetupFailed(_) => "upstream",
            SetupError::Internal(_) => "internal",
        }
    }
}
