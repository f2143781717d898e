use crate::code::generator::{needs_jump_table, JUMP_TABLE_WORDS, JUMP_TO_ORIGINAL_WORDS};
use crate::error::PatchError;
use crate::os::CodeArena;
use crate::patch::descriptor::FunctionReplacementData;
use crate::types::{EffectiveAddress, PatchHandle, PatchTarget, PhysicalAddress, TargetProcess};

/// One registered patch: the request, its owned code buffers and its live
/// state. Owned exclusively by the patch set; consumers only ever hold the
/// [`PatchHandle`].
#[derive(Debug)]
pub(crate) struct PatchedFunction {
    pub(crate) handle: PatchHandle,
    pub(crate) target: PatchTarget,
    pub(crate) replacement: EffectiveAddress,
    pub(crate) call_original_slot: EffectiveAddress,
    pub(crate) scope: TargetProcess,

    /// Where the target resolved to on the most recent apply. Stale after
    /// an unload until the next successful apply.
    pub(crate) resolved_effective: Option<EffectiveAddress>,
    pub(crate) resolved_physical: Option<PhysicalAddress>,

    /// The instruction word the install overwrote.
    pub(crate) saved_instruction: Option<u32>,
    /// The branch word installed at the target.
    pub(crate) replace_with: Option<u32>,

    /// Trampoline the consumer calls the original through.
    pub(crate) jump_to_original: EffectiveAddress,
    /// Jump table for far or process-scoped replacements.
    pub(crate) jump_table: Option<EffectiveAddress>,

    pub(crate) is_patched: bool,
}

impl PatchedFunction {
    /// Build the record and carve its code buffers out of the arena. The
    /// jump table is only allocated when the replacement cannot be reached
    /// by a single unscoped branch.
    pub(crate) fn new(
        handle: PatchHandle,
        descriptor: &FunctionReplacementData,
        arena: &mut dyn CodeArena,
    ) -> Result<Self, PatchError> {
        let jump_table = if needs_jump_table(descriptor.replace_addr, descriptor.target_process) {
            let Some(buf) = arena.alloc(JUMP_TABLE_WORDS) else {
                return Err(PatchError::Internal("failed to allocate jump table"));
            };
            Some(buf)
        } else {
            None
        };

        let Some(jump_to_original) = arena.alloc(JUMP_TO_ORIGINAL_WORDS) else {
            if let Some(buf) = jump_table {
                arena.free(buf);
            }
            return Err(PatchError::Internal("failed to allocate trampoline"));
        };

        let (resolved_effective, resolved_physical) = match descriptor.target {
            PatchTarget::RawAddress {
                effective,
                physical,
            } => (Some(effective), Some(physical)),
            _ => (None, None),
        };

        Ok(PatchedFunction {
            handle,
            target: descriptor.target.clone(),
            replacement: descriptor.replace_addr,
            call_original_slot: descriptor.call_original_slot,
            scope: descriptor.target_process,
            resolved_effective,
            resolved_physical,
            saved_instruction: None,
            replace_with: None,
            jump_to_original,
            jump_table,
            is_patched: false,
        })
    }

    /// Give the code buffers back. Must run before the record is dropped;
    /// the arena is not reachable from `Drop`.
    pub(crate) fn release_buffers(&mut self, arena: &mut dyn CodeArena) {
        arena.free(self.jump_to_original);
        if let Some(buf) = self.jump_table.take() {
            arena.free(buf);
        }
    }
}
