//! The patch set: registration, layered removal, load/unload reactions and
//! the cross-core installer.
//!
//! All state lives in one [`FunctionPatcher`] context guarded by a single
//! mutex. Installs and removals are rare next to calls running through the
//! trampolines, so the coarse lock buys correctness without costing
//! anything that matters.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, trace, warn};

use crate::code::generator::{
    emit_jump_table, emit_jump_to_original, needs_jump_table, JumpTableParams, JUMP_TABLE_WORDS,
    JUMP_TO_ORIGINAL_WORDS,
};
use crate::code::ppc;
use crate::error::PatchError;
use crate::module::ExportResolver;
use crate::os::{CodeArena, SystemPort};
use crate::types::{
    EffectiveAddress, ModuleHandle, PatchHandle, PatchTarget, PhysicalAddress, Upid,
};

mod descriptor;
mod record;

pub use descriptor::{
    FunctionReplacementData, API_VERSION, DESCRIPTOR_VERSION_1, DESCRIPTOR_VERSION_2,
    DESCRIPTOR_VERSION_3,
};

use record::PatchedFunction;

/// Version of the consumer-facing patching API.
pub fn api_version() -> u32 {
    API_VERSION
}

struct PatchSet {
    resolver: ExportResolver,
    arena: Box<dyn CodeArena>,
    records: Vec<PatchedFunction>,
    next_handle: u32,
}

/// The patching engine. One instance owns every registered patch for the
/// lifetime of the hosting process.
pub struct FunctionPatcher {
    system: Arc<dyn SystemPort>,
    state: Mutex<PatchSet>,
}

impl FunctionPatcher {
    pub fn new(system: Arc<dyn SystemPort>, arena: Box<dyn CodeArena>) -> Self {
        FunctionPatcher {
            system,
            state: Mutex::new(PatchSet {
                resolver: ExportResolver::new(),
                arena,
                records: Vec::new(),
                next_handle: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PatchSet> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a patch and try to apply it right away.
    ///
    /// The returned bool tells whether the patch is live now. A target that
    /// cannot be resolved yet (library not loaded, title gate closed) still
    /// registers and is applied automatically once a load notification
    /// makes it resolvable.
    pub fn add_function_patch(
        &self,
        descriptor: &FunctionReplacementData,
    ) -> Result<(PatchHandle, bool), PatchError> {
        descriptor.validate()?;

        let mut state = self.lock();
        let st = &mut *state;

        let handle = PatchHandle(st.next_handle);
        st.next_handle += 1;

        let mut record = PatchedFunction::new(handle, descriptor, &mut *st.arena)?;
        let applied = apply(&*self.system, &mut st.resolver, &mut record);
        st.records.push(record);

        self.system.memory_barrier();
        Ok((handle, applied))
    }

    /// Remove a patch, keeping every patch stacked on top of it intact.
    ///
    /// Records that landed on the same physical address after this one are
    /// unwound newest-first, the victim is restored and dropped, then the
    /// survivors are reapplied in their original order. Their relative
    /// ordering and effect are unchanged by the removal.
    pub fn remove_function_patch(&self, handle: PatchHandle) -> Result<(), PatchError> {
        let mut state = self.lock();
        let st = &mut *state;

        let index = st
            .records
            .iter()
            .position(|record| record.handle == handle)
            .ok_or(PatchError::PatchNotFound(handle))?;

        let stacked: Vec<usize> = match st.records[index].resolved_physical {
            Some(physical) => (index + 1..st.records.len())
                .filter(|&i| st.records[i].resolved_physical == Some(physical))
                .collect(),
            None => Vec::new(),
        };

        for &i in stacked.iter().rev() {
            restore(&*self.system, &mut st.records[i]);
        }
        restore(&*self.system, &mut st.records[index]);

        let mut victim = st.records.remove(index);
        victim.release_buffers(&mut *st.arena);
        debug!("removed patch {handle}");

        // Everything past the removal point shifted down by one.
        for &i in &stacked {
            let record = &mut st.records[i - 1];
            if !apply(&*self.system, &mut st.resolver, record) {
                warn!(
                    "failed to reapply patch {} after removing {handle}; waiting for the next module load",
                    record.handle
                );
            }
        }

        self.system.memory_barrier();
        Ok(())
    }

    pub fn is_function_patched(&self, handle: PatchHandle) -> Result<bool, PatchError> {
        let state = self.lock();
        state
            .records
            .iter()
            .find(|record| record.handle == handle)
            .map(|record| record.is_patched)
            .ok_or(PatchError::PatchNotFound(handle))
    }

    /// Loader notification: a module was loaded.
    ///
    /// A fresh module can satisfy any pending record, not just records that
    /// name it, so every record is retried; apply is a no-op for live ones.
    pub fn on_module_loaded(&self, _module: ModuleHandle) {
        let mut state = self.lock();
        let st = &mut *state;
        for record in &mut st.records {
            apply(&*self.system, &mut st.resolver, record);
        }
        self.system.memory_barrier();
    }

    /// Loader notification: a module is about to be gone.
    ///
    /// Records resolving through it are marked unpatched (their installed
    /// bytes are about to become unmapped), the cached handle is dropped,
    /// and a liveness sweep catches anything else that changed underneath.
    pub fn on_module_unloaded(&self, module: ModuleHandle) {
        let mut state = self.lock();
        let st = &mut *state;

        if let Some(library) = st.resolver.library_for_handle(module) {
            for record in &mut st.records {
                if let PatchTarget::LibraryExport { library: l, .. } = &record.target {
                    if *l == library && record.is_patched {
                        debug!(
                            "{} unloaded; marking patch {} unpatched",
                            library.module_name(),
                            record.handle
                        );
                        record.is_patched = false;
                    }
                }
            }
        }
        st.resolver.reset_module(module);

        liveness_sweep(&*self.system, &mut st.records);
    }

    /// Per-launch hook. Inert unless the foreground process is the system
    /// menu or the game; other processes never see these patches.
    pub fn on_application_start(&self) {
        let upid = self.system.current_process();
        if upid != Upid::WII_U_MENU && upid != Upid::GAME {
            debug!("staying inert in process {}", upid.get());
            return;
        }

        let mut state = self.lock();
        let st = &mut *state;

        // Addresses from the previous launch may be gone or reused.
        liveness_sweep(&*self.system, &mut st.records);
        for record in &mut st.records {
            apply(&*self.system, &mut st.resolver, record);
        }
        self.system.memory_barrier();
    }

    /// Per-exit hook: every cached loader handle is stale now.
    pub fn on_application_end(&self) {
        self.lock().resolver.reset_all();
    }
}

impl Drop for FunctionPatcher {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for mut record in st.records.drain(..) {
            restore(&*self.system, &mut record);
            record.release_buffers(&mut *st.arena);
        }
    }
}

/// Make `record` live. No-op when already live; false when the target is
/// not resolvable or gated off right now.
fn apply(
    system: &dyn SystemPort,
    resolver: &mut ExportResolver,
    record: &mut PatchedFunction,
) -> bool {
    if record.is_patched {
        return true;
    }
    if !title_gate_allows(system, record) {
        return false;
    }

    let Some(real) = resolver.resolve(system, &record.target) else {
        trace!("target of patch {} is not resolvable yet", record.handle);
        return false;
    };
    let physical = match &record.target {
        PatchTarget::RawAddress { physical, .. } => *physical,
        _ => match system.effective_to_physical(real) {
            Some(physical) => physical,
            None => {
                error!("no physical mapping for {real}");
                system.fatal("patch target has no physical address");
            }
        },
    };
    record.resolved_effective = Some(real);
    record.resolved_physical = Some(physical);

    // Save the word the install overwrites. Out-of-band read: another core
    // may have rewritten this site and our cache may still hold the old
    // line.
    let Some(current) = system.read_code_word(physical) else {
        error!("failed to read the instruction at {physical}");
        system.fatal("failed to save the target's first instruction");
    };
    record.saved_instruction = Some(current);

    let mut trampoline = [0u32; JUMP_TO_ORIGINAL_WORDS];
    let used = match emit_jump_to_original(&mut trampoline, current, real) {
        Ok(used) => used,
        Err(_) => system.fatal("call-original trampoline overflowed its buffer"),
    };
    install_code_buffer(
        system,
        record.jump_to_original,
        &trampoline[..used],
        JUMP_TO_ORIGINAL_WORDS,
    );
    system.write_word(record.call_original_slot, record.jump_to_original.get());
    system.memory_barrier();

    let replace_with = if needs_jump_table(record.replacement, record.scope) {
        let Some(table) = record.jump_table else {
            system.fatal("jump table was never allocated");
        };
        if !ppc::is_direct_branch_target(table) {
            error!("jump table at {table} is outside direct branch range");
            system.fatal("jump table is not branch-reachable");
        }

        let params = JumpTableParams {
            original: real,
            replacement: record.replacement,
            saved_instruction: current,
            scope: record.scope,
            process_id_location: system.process_id_location(),
        };
        let mut words = [0u32; JUMP_TABLE_WORDS];
        let used = match emit_jump_table(&mut words, &params) {
            Ok(used) => used,
            Err(_) => system.fatal("jump table overflowed its buffer"),
        };
        install_code_buffer(system, table, &words[..used], JUMP_TABLE_WORDS);
        ppc::ba(table)
    } else {
        ppc::ba(record.replacement)
    };
    record.replace_with = Some(replace_with);
    system.memory_barrier();

    broadcast_code_write(system, physical, real, replace_with);
    record.is_patched = true;
    debug!("patched {} at {real} [{physical}]", record.handle);
    true
}

/// Take `record` out of the live code path. No-op when not live; abandons
/// the write when the site no longer holds our branch (a newer patch or a
/// reloaded library owns it now).
fn restore(system: &dyn SystemPort, record: &mut PatchedFunction) -> bool {
    if !record.is_patched {
        return false;
    }
    let (Some(real), Some(physical), Some(expected), Some(saved)) = (
        record.resolved_effective,
        record.resolved_physical,
        record.replace_with,
        record.saved_instruction,
    ) else {
        system.fatal("restore without a saved instruction");
    };

    let Some(current) = system.read_code_word(physical) else {
        error!("failed to read back the instruction at {physical}");
        return false;
    };
    if current != expected {
        warn!(
            "{physical} holds {current:#010x}, not our branch {expected:#010x}; \
             leaving the site untouched"
        );
        record.is_patched = false;
        return false;
    }

    broadcast_code_write(system, physical, real, saved);
    record.is_patched = false;
    debug!("restored {} at {real}", record.handle);
    true
}

/// Check which records still own their installed word, newest first.
///
/// Only the most recent record at an address ever holds the live branch,
/// so one read settles every record sharing that address: a match keeps
/// the whole chain, a mismatch retires it.
fn liveness_sweep(system: &dyn SystemPort, records: &mut [PatchedFunction]) {
    let mut unchanged: HashSet<u32> = HashSet::new();
    let mut changed: HashSet<u32> = HashSet::new();

    for record in records.iter_mut().rev() {
        let Some(physical) = record.resolved_physical else {
            continue;
        };
        if !record.is_patched || unchanged.contains(&physical.get()) {
            continue;
        }
        if changed.contains(&physical.get()) {
            record.is_patched = false;
            continue;
        }

        let Some(current) = system.read_code_word(physical) else {
            error!("failed to read the instruction at {physical}");
            continue;
        };
        if Some(current) == record.replace_with {
            unchanged.insert(physical.get());
        } else {
            debug!(
                "patch {} lost its site {physical} ({current:#010x} live)",
                record.handle
            );
            record.is_patched = false;
            changed.insert(physical.get());
        }
    }
}

/// Write generated words into a code buffer and push them out to the point
/// of coherency. The full buffer capacity is flushed so a shrinking
/// regeneration never leaves stale tail words cached.
fn install_code_buffer(
    system: &dyn SystemPort,
    buffer: EffectiveAddress,
    words: &[u32],
    capacity_words: usize,
) {
    for (i, &word) in words.iter().enumerate() {
        system.write_word(buffer.offset((i * 4) as u32), word);
    }
    let len = (capacity_words * 4) as u32;
    system.flush_data_cache(buffer, len);
    system.invalidate_instruction_cache(buffer, len);
}

/// The one genuinely multi-party step: every core must run the write-and-
/// invalidate itself so no core keeps executing a stale view of the entry
/// word. Blocks until the rendezvous is complete.
fn broadcast_code_write(
    system: &dyn SystemPort,
    physical: PhysicalAddress,
    effective: EffectiveAddress,
    word: u32,
) {
    system.run_on_each_core(&|core| {
        trace!("core {core}: writing {word:#010x} to {effective} [{physical}]");
        if !system.write_code_word(physical, word) {
            system.fatal("kernel rejected the cross-core code write");
        }
        system.invalidate_instruction_cache(effective, 4);
    });
}

fn title_gate_allows(system: &dyn SystemPort, record: &PatchedFunction) -> bool {
    let Some(gate) = record.target.gate() else {
        return true;
    };

    let title_id = system.current_title_id();
    if !gate.accepts_title(title_id) {
        trace!("patch {} is not for title {title_id:#018x}", record.handle);
        return false;
    }

    let Some(version) = system.title_version(title_id) else {
        system.fatal("failed to query the running title's version");
    };
    if !gate.accepts_version(version) {
        debug!(
            "skipping patch {}: title version {version} outside [{}, {}]",
            record.handle, gate.version_min, gate.version_max
        );
        return false;
    }
    true
}
