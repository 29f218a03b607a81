//! Error types.

/// A wait ended because its channel was cancelled, or its caller gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Failures surfaced to callers of the bridge.
///
/// Broken invariants (a second value on a channel, foreign calls off the loop
/// thread) are not represented here; they panic.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("an event loop is already installed for this process")]
    AlreadyInstalled,
    #[error("no event loop installed")]
    NotInstalled,
    #[error("event loop already started")]
    AlreadyStarted,
    #[error("foreign runtime could not allocate a {0}")]
    ResourceUnavailable(&'static str),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to build host runtime: {0}")]
    HostRuntime(#[from] std::io::Error),
}
