//! Host OS seam.
//!
//! Everything the patch engine needs from the console OS goes through
//! [`SystemPort`]: the dynamic loader, the kernel copy/scan primitives,
//! address translation, cache maintenance and the per-core rendezvous.
//! Production builds bind these to the real OS calls; the test suites use a
//! scripted in-memory implementation.

use crate::types::{EffectiveAddress, ExecutableInfo, ModuleHandle, PhysicalAddress, Upid};

/// Narrow interface over the host OS.
///
/// All methods take `&self`; implementations are expected to be internally
/// synchronized where the underlying OS call needs it.
pub trait SystemPort: Send + Sync {
    /// Handle for a module if it is currently loaded. Must not force-load;
    /// an unloaded module simply yields `None`.
    fn module_handle(&self, module_name: &str) -> Option<ModuleHandle>;

    /// Address of an exported function of a loaded module.
    fn find_export(&self, module: ModuleHandle, symbol: &str) -> Option<EffectiveAddress>;

    /// Every executable image the loader currently has mapped, with its
    /// text-segment base.
    fn loaded_executables(&self) -> Vec<ExecutableInfo>;

    /// Kernel-level symbol scan over an executable that does not export
    /// through the loader. Expensive; only used for executable targets.
    fn find_export_in_executable(&self, executable: &str, symbol: &str)
        -> Option<EffectiveAddress>;

    /// Translate an effective address. `None` means the address is not
    /// mapped in the current view.
    fn effective_to_physical(&self, addr: EffectiveAddress) -> Option<PhysicalAddress>;

    /// Out-of-band read of one instruction word through its physical
    /// address. Required when the effective-address view may hold a stale
    /// cache line for code another core just rewrote.
    fn read_code_word(&self, addr: PhysicalAddress) -> Option<u32>;

    /// Kernel copy of one instruction word to a physical address. Returns
    /// false if the kernel rejects the copy.
    fn write_code_word(&self, addr: PhysicalAddress, word: u32) -> bool;

    /// Plain cached read of one word at an effective address.
    fn read_word(&self, addr: EffectiveAddress) -> Option<u32>;

    /// Plain cached write of one word at an effective address. Only used on
    /// memory this module owns (code buffers and caller slots).
    fn write_word(&self, addr: EffectiveAddress, word: u32);

    fn flush_data_cache(&self, addr: EffectiveAddress, len: u32);

    fn invalidate_instruction_cache(&self, addr: EffectiveAddress, len: u32);

    /// Store-ordering barrier.
    fn memory_barrier(&self);

    /// Run `work` once on every execution core and return only after all
    /// cores completed. A stalled core is an unrecoverable host condition;
    /// there is no timeout.
    fn run_on_each_core(&self, work: &(dyn Fn(u32) + Sync));

    /// UPID of the current foreground process.
    fn current_process(&self) -> Upid;

    /// Effective address of the kernel-maintained UPID word. Generated
    /// process-gated code loads from this address on every call.
    fn process_id_location(&self) -> EffectiveAddress;

    fn current_title_id(&self) -> u64;

    /// Installed version of a title, `None` if the title database has no
    /// entry for it.
    fn title_version(&self, title_id: u64) -> Option<u16>;

    /// Halt the entire environment. Called for invariant violations where
    /// continuing would execute corrupted code.
    fn fatal(&self, msg: &str) -> !;
}

/// Arena the generated code buffers are carved from.
///
/// Buffers are word-aligned, never move, and stay executable for their
/// whole lifetime. The arena must hand out addresses that a direct absolute
/// branch can reach; handing out anything else is an arena defect the
/// engine escalates as fatal.
pub trait CodeArena: Send {
    /// Allocate a buffer of `words` instruction words. `None` on exhaustion.
    fn alloc(&mut self, words: usize) -> Option<EffectiveAddress>;

    /// Return a buffer previously handed out by `alloc`.
    fn free(&mut self, addr: EffectiveAddress);
}
