use thiserror::Error;

use crate::types::PatchHandle;

/// Errors reported to patch consumers.
///
/// Expected transient conditions (library not loaded yet, title gate
/// excludes the current run) are not errors; they surface as an unapplied
/// record that self-heals on the next load notification. Invariant
/// violations never surface here at all, they halt the environment through
/// [`SystemPort::fatal`](crate::os::SystemPort::fatal).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("invalid replacement descriptor: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported replacement descriptor version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("no registered patch for handle {0}")]
    PatchNotFound(PatchHandle),

    #[error("internal error: {0}")]
    Internal(&'static str),
}
