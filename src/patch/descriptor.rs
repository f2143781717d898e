use crate::error::PatchError;
use crate::types::{EffectiveAddress, PatchTarget, TargetProcess};

/// Versioned API surface. Bumped when the descriptor grows a capability
/// consumers must opt into.
pub const API_VERSION: u32 = 2;

/// Descriptor revisions. Older consumers keep working with the tags they
/// were built against; feature use is validated against the tag.
pub const DESCRIPTOR_VERSION_1: u32 = 1;
pub const DESCRIPTOR_VERSION_2: u32 = 2;
pub const DESCRIPTOR_VERSION_3: u32 = 3;

/// A patch request as handed over by a consumer.
///
/// `version` gates which fields may carry non-default values: revision 1
/// knows library and raw-address targets only, revision 2 adds the process
/// scope, revision 3 adds executable targets with title gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionReplacementData {
    pub version: u32,
    pub target: PatchTarget,
    /// Entry address of the replacement function.
    pub replace_addr: EffectiveAddress,
    /// Word the consumer reads the call-original trampoline address from.
    pub call_original_slot: EffectiveAddress,
    pub target_process: TargetProcess,
}

impl FunctionReplacementData {
    pub fn v1(
        target: PatchTarget,
        replace_addr: EffectiveAddress,
        call_original_slot: EffectiveAddress,
    ) -> Self {
        FunctionReplacementData {
            version: DESCRIPTOR_VERSION_1,
            target,
            replace_addr,
            call_original_slot,
            target_process: TargetProcess::All,
        }
    }

    pub fn v2(
        target: PatchTarget,
        replace_addr: EffectiveAddress,
        call_original_slot: EffectiveAddress,
        target_process: TargetProcess,
    ) -> Self {
        FunctionReplacementData {
            version: DESCRIPTOR_VERSION_2,
            target,
            replace_addr,
            call_original_slot,
            target_process,
        }
    }

    pub fn v3(
        target: PatchTarget,
        replace_addr: EffectiveAddress,
        call_original_slot: EffectiveAddress,
        target_process: TargetProcess,
    ) -> Self {
        FunctionReplacementData {
            version: DESCRIPTOR_VERSION_3,
            target,
            replace_addr,
            call_original_slot,
            target_process,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PatchError> {
        match self.version {
            DESCRIPTOR_VERSION_1 => {
                if self.target_process != TargetProcess::All {
                    return Err(PatchError::InvalidArgument(
                        "process scopes need descriptor version 2",
                    ));
                }
                if self.target.is_executable_target() {
                    return Err(PatchError::InvalidArgument(
                        "executable targets need descriptor version 3",
                    ));
                }
            }
            DESCRIPTOR_VERSION_2 => {
                if self.target.is_executable_target() {
                    return Err(PatchError::InvalidArgument(
                        "executable targets need descriptor version 3",
                    ));
                }
            }
            DESCRIPTOR_VERSION_3 => {}
            other => return Err(PatchError::UnsupportedVersion(other)),
        }

        match &self.target {
            PatchTarget::LibraryExport { symbol, .. } if symbol.is_empty() => {
                return Err(PatchError::InvalidArgument("empty symbol name"));
            }
            PatchTarget::ExecutableExport {
                executable, symbol, ..
            } if executable.is_empty() || symbol.is_empty() => {
                return Err(PatchError::InvalidArgument(
                    "empty executable or symbol name",
                ));
            }
            PatchTarget::ExecutableOffset { executable, .. } if executable.is_empty() => {
                return Err(PatchError::InvalidArgument("empty executable name"));
            }
            _ => {}
        }

        if let Some(gate) = self.target.gate() {
            if gate.title_ids.is_empty() {
                return Err(PatchError::InvalidArgument("empty title allow-list"));
            }
            if gate.version_min > gate.version_max {
                return Err(PatchError::InvalidArgument("inverted title version range"));
            }
        }

        Ok(())
    }
}
