//! Generation of the two code sequences a patch needs: the
//! trampoline-to-original handed to the caller, and the replacement-jump
//! installed over the target's first instruction.
//!
//! Both generators are pure word emitters; writing the result into live
//! code memory and keeping caches coherent is the installer's job.

use crate::code::ppc;
use crate::code::writer::{InstructionWriter, WriterError};
use crate::types::{EffectiveAddress, TargetProcess, Upid};

/// Capacity of the trampoline-to-original buffer, in words.
pub const JUMP_TO_ORIGINAL_WORDS: usize = 5;

/// Capacity of the replacement jump table, in words. Sized for the worst
/// case: a two-compare process gate plus long branches on both paths.
pub const JUMP_TABLE_WORDS: usize = 15;

/// Whether installing `replacement` needs a jump table, or a single direct
/// branch at the target suffices.
pub fn needs_jump_table(replacement: EffectiveAddress, scope: TargetProcess) -> bool {
    !ppc::is_direct_branch_target(replacement) || scope != TargetProcess::All
}

/// Emit the sequence that re-executes the overwritten instruction and
/// resumes the original function at its second instruction.
///
/// Two words when the resume address is branchable, otherwise the
/// five-word indirect form. Returns the number of words emitted.
pub fn emit_jump_to_original(
    buf: &mut [u32],
    saved_instruction: u32,
    original: EffectiveAddress,
) -> Result<usize, WriterError> {
    let resume = original.offset(4);
    let mut w = InstructionWriter::new(buf);

    if ppc::is_direct_branch_target(resume) {
        w.put(saved_instruction)?;
        w.put(ppc::ba(resume))?;
    } else {
        // r11 and CTR are volatile scratch at a function entry, so they can
        // be clobbered before the saved instruction runs.
        w.put_all(&ppc::load_r11(resume.get()))?;
        w.put(ppc::MTCTR_R11)?;
        w.put(saved_instruction)?;
        w.put(ppc::BCTR)?;
    }

    Ok(w.len())
}

/// Inputs for [`emit_jump_table`].
#[derive(Debug, Clone, Copy)]
pub struct JumpTableParams {
    /// Entry address of the patched function.
    pub original: EffectiveAddress,
    /// Entry address of the replacement function.
    pub replacement: EffectiveAddress,
    /// The instruction word the install will overwrite.
    pub saved_instruction: u32,
    pub scope: TargetProcess,
    /// Where generated code reads the live UPID from.
    pub process_id_location: EffectiveAddress,
}

/// Emit the jump table the target's entry branch lands on when a single
/// direct branch to the replacement is not enough.
///
/// Layout: an optional UPID gate (fall through to "resume original" when
/// the current process is out of scope, branch to the replacement path
/// otherwise), then the branch to the replacement. Each branch uses the
/// short form when its target is reachable. Returns the number of words
/// emitted.
pub fn emit_jump_table(buf: &mut [u32], params: &JumpTableParams) -> Result<usize, WriterError> {
    let mut w = InstructionWriter::new(buf);
    let mut gates = Vec::new();

    let single;
    let gate_upids: &[Upid] = match params.scope {
        TargetProcess::All => &[],
        TargetProcess::GameAndMenu => &[Upid::WII_U_MENU, Upid::GAME],
        TargetProcess::Process(upid) => {
            single = [upid];
            &single
        }
    };

    if params.scope != TargetProcess::All {
        w.put_all(&ppc::load_word_at_r11(params.process_id_location))?;
        for upid in gate_upids {
            w.put(ppc::cmpwi_r11(upid.get() as u16))?;
            gates.push(w.reserve_beq()?);
        }

        // Out-of-scope path: behave exactly like the unpatched function.
        let resume = params.original.offset(4);
        w.put(params.saved_instruction)?;
        if ppc::is_direct_branch_target(resume) {
            w.put(ppc::ba(resume))?;
        } else {
            w.put_all(&ppc::load_r11(resume.get()))?;
            w.put(ppc::MTCTR_R11)?;
            w.put(ppc::BCTR)?;
        }
    }

    for gate in gates {
        w.bind_beq(gate)?;
    }

    if ppc::is_direct_branch_target(params.replacement) {
        w.put(ppc::ba(params.replacement))?;
    } else {
        w.put_all(&ppc::load_r11(params.replacement.get()))?;
        w.put(ppc::MTCTR_R11)?;
        w.put(ppc::BCTR)?;
    }

    Ok(w.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVED: u32 = 0x9421_FFE8; // stwu r1, -0x18(r1)
    const PID_LOC: EffectiveAddress = EffectiveAddress(0x1000_0444);

    #[test]
    fn jump_to_original_short_form() {
        let mut buf = [0u32; JUMP_TO_ORIGINAL_WORDS];
        let n = emit_jump_to_original(&mut buf, SAVED, EffectiveAddress(0x0100_0000)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf[0], SAVED);
        assert_eq!(buf[1], 0x4900_0006); // ba 0x01000004
    }

    #[test]
    fn jump_to_original_long_form() {
        let mut buf = [0u32; JUMP_TO_ORIGINAL_WORDS];
        let n = emit_jump_to_original(&mut buf, SAVED, EffectiveAddress(0x1001_0000)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(
            buf,
            [
                0x3D60_1001, // lis r11, 0x1001
                0x616B_0004, // ori r11, r11, 0x0004
                ppc::MTCTR_R11,
                SAVED,
                ppc::BCTR,
            ]
        );
    }

    #[test]
    fn unscoped_far_replacement_is_plain_long_branch() {
        let mut buf = [0u32; JUMP_TABLE_WORDS];
        let params = JumpTableParams {
            original: EffectiveAddress(0x0100_0000),
            replacement: EffectiveAddress(0x2000_1234),
            saved_instruction: SAVED,
            scope: TargetProcess::All,
            process_id_location: PID_LOC,
        };
        let n = emit_jump_table(&mut buf, &params).unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            buf[..4],
            [0x3D60_2000, 0x616B_1234, ppc::MTCTR_R11, ppc::BCTR]
        );
    }

    #[test]
    fn single_process_gate_with_short_branches() {
        let mut buf = [0u32; JUMP_TABLE_WORDS];
        let params = JumpTableParams {
            original: EffectiveAddress(0x0100_0000),
            replacement: EffectiveAddress(0x0090_0000),
            saved_instruction: SAVED,
            scope: TargetProcess::Process(Upid::GAME),
            process_id_location: PID_LOC,
        };
        let n = emit_jump_table(&mut buf, &params).unwrap();
        assert_eq!(n, 7);
        assert_eq!(
            buf[..7],
            [
                0x3D60_1000,        // lis r11, upid@ha
                0x816B_0444,        // lwz r11, upid@l(r11)
                0x2C0B_000F,        // cmpwi r11, 15
                0x4182_000C,        // beq +0x0C (replacement path)
                SAVED,              // out of scope: original behavior
                0x4900_0006,        // ba 0x01000004
                0x4800_0002 | 0x0090_0000, // ba 0x00900000
            ]
        );
    }

    #[test]
    fn game_and_menu_gate_with_long_branches_fills_the_table() {
        let mut buf = [0u32; JUMP_TABLE_WORDS];
        let params = JumpTableParams {
            original: EffectiveAddress(0x3000_0000),
            replacement: EffectiveAddress(0x2000_0000),
            saved_instruction: SAVED,
            scope: TargetProcess::GameAndMenu,
            process_id_location: PID_LOC,
        };
        let n = emit_jump_table(&mut buf, &params).unwrap();
        assert_eq!(n, JUMP_TABLE_WORDS);
        // Both compares branch to the replacement path at word 11.
        assert_eq!(buf[2], ppc::cmpwi_r11(2));
        assert_eq!(buf[3], ppc::beq(0x20));
        assert_eq!(buf[4], ppc::cmpwi_r11(15));
        assert_eq!(buf[5], ppc::beq(0x18));
        assert_eq!(buf[6], SAVED);
        // Long branch back to original+4, then long branch to replacement.
        assert_eq!(buf[7..11], [0x3D60_3000, 0x616B_0004, ppc::MTCTR_R11, ppc::BCTR]);
        assert_eq!(buf[11..15], [0x3D60_2000, 0x616B_0000, ppc::MTCTR_R11, ppc::BCTR]);
    }

    #[test]
    fn gate_offsets_match_short_original_path() {
        // Short branch back to the original shrinks the fall-through path,
        // which must pull the beq displacements in.
        let mut buf = [0u32; JUMP_TABLE_WORDS];
        let params = JumpTableParams {
            original: EffectiveAddress(0x0100_0000),
            replacement: EffectiveAddress(0x2000_0000),
            saved_instruction: SAVED,
            scope: TargetProcess::GameAndMenu,
            process_id_location: PID_LOC,
        };
        let n = emit_jump_table(&mut buf, &params).unwrap();
        assert_eq!(n, 12);
        assert_eq!(buf[3], ppc::beq(0x14));
        assert_eq!(buf[5], ppc::beq(0x0C));
    }

    #[test]
    fn jump_table_needed_iff_far_or_scoped() {
        let near = EffectiveAddress(0x0100_0000);
        let far = EffectiveAddress(0x0200_0000);
        assert!(!needs_jump_table(near, TargetProcess::All));
        assert!(needs_jump_table(far, TargetProcess::All));
        assert!(needs_jump_table(near, TargetProcess::GameAndMenu));
        assert!(needs_jump_table(near, TargetProcess::Process(Upid::GAME)));
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let mut buf = [0u32; 3];
        let params = JumpTableParams {
            original: EffectiveAddress(0x3000_0000),
            replacement: EffectiveAddress(0x2000_0000),
            saved_instruction: SAVED,
            scope: TargetProcess::GameAndMenu,
            process_id_location: PID_LOC,
        };
        assert!(matches!(
            emit_jump_table(&mut buf, &params),
            Err(WriterError::CapacityExceeded { capacity: 3 })
        ));
    }
}
