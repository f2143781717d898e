//! cafepatch: live function patching for Cafe OS system libraries.
//!
//! Given a target function — a library export, a raw address, or a symbol
//! inside an executable image — the engine redirects calls to a replacement
//! while keeping the original callable through a generated trampoline.
//! Patches on the same function stack and can be removed in any order, and
//! the set survives library unload/reload cycles by re-resolving and
//! re-applying on loader notifications.
//!
//! The host OS (dynamic loader, kernel copy, cache maintenance, per-core
//! scheduling) is reached exclusively through the [`os::SystemPort`] and
//! [`os::CodeArena`] traits, so the whole engine runs unmodified against an
//! in-memory host in tests.

pub mod code;
pub mod error;
pub mod module;
pub mod os;
pub mod patch;
pub mod types;

pub use error::PatchError;
pub use module::{ExportResolver, LibraryId};
pub use os::{CodeArena, SystemPort};
pub use patch::{api_version, FunctionPatcher, FunctionReplacementData, API_VERSION};
pub use types::{
    EffectiveAddress, ExecutableInfo, ModuleHandle, PatchHandle, PatchTarget, PhysicalAddress,
    TargetProcess, TitleGate, Upid,
};

#[cfg(test)]
mod test_support;
