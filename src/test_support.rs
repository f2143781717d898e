//! Scripted in-memory host for the test suites: a word-addressed memory,
//! fake loader state, and journals for the cache and cross-core traffic
//! the engine is supposed to produce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::os::{CodeArena, SystemPort};
use crate::types::{EffectiveAddress, ExecutableInfo, ModuleHandle, PhysicalAddress, Upid};

/// Fixed linear mapping used by the fake address space.
const PHYS_OFFSET: u32 = 0x3000_0000;

fn to_physical(addr: EffectiveAddress) -> PhysicalAddress {
    PhysicalAddress(addr.get().wrapping_add(PHYS_OFFSET))
}

struct FakeModule {
    handle: ModuleHandle,
    loaded: bool,
    exports: HashMap<String, EffectiveAddress>,
}

#[derive(Default)]
struct Inner {
    /// Word memory keyed by physical address.
    memory: HashMap<u32, u32>,
    modules: HashMap<String, FakeModule>,
    next_module_handle: u32,
    executables: Vec<ExecutableInfo>,
    kernel_exports: HashMap<(String, String), EffectiveAddress>,
    upid: u32,
    title_id: u64,
    title_versions: HashMap<u64, u16>,
    /// Core currently inside the rendezvous, if any.
    current_core: Option<u32>,
    /// (core, physical, word) per kernel code write.
    code_writes: Vec<(u32, u32, u32)>,
    dc_flushes: Vec<(u32, u32)>,
    ic_invalidates: Vec<(u32, u32)>,
    barriers: usize,
}

pub(crate) struct FakeSystem {
    inner: Mutex<Inner>,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeSystem {
            inner: Mutex::new(Inner {
                next_module_handle: 1,
                upid: Upid::GAME.get(),
                title_id: 0x0005_0000_1010_0000,
                ..Inner::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn poke(&self, addr: EffectiveAddress, word: u32) {
        self.lock().memory.insert(to_physical(addr).get(), word);
    }

    pub fn peek(&self, addr: EffectiveAddress) -> u32 {
        *self
            .lock()
            .memory
            .get(&to_physical(addr).get())
            .unwrap_or_else(|| panic!("nothing mapped at {addr}"))
    }

    /// Register a module as loaded. Export addresses are effective.
    pub fn load_module(&self, name: &str, exports: &[(&str, u32)]) -> ModuleHandle {
        let mut inner = self.lock();
        let handle = ModuleHandle(inner.next_module_handle);
        inner.next_module_handle += 1;
        inner.modules.insert(
            name.to_string(),
            FakeModule {
                handle,
                loaded: true,
                exports: exports
                    .iter()
                    .map(|&(symbol, addr)| (symbol.to_string(), EffectiveAddress(addr)))
                    .collect(),
            },
        );
        handle
    }

    pub fn unload_module(&self, name: &str) -> ModuleHandle {
        let mut inner = self.lock();
        let module = inner
            .modules
            .get_mut(name)
            .unwrap_or_else(|| panic!("module {name} was never loaded"));
        module.loaded = false;
        module.handle
    }

    pub fn add_executable(&self, name: &str, text_addr: u32) {
        self.lock().executables.push(ExecutableInfo {
            name: name.to_string(),
            text_addr: EffectiveAddress(text_addr),
        });
    }

    pub fn add_kernel_export(&self, executable: &str, symbol: &str, addr: u32) {
        self.lock().kernel_exports.insert(
            (executable.to_string(), symbol.to_string()),
            EffectiveAddress(addr),
        );
    }

    pub fn set_upid(&self, upid: Upid) {
        self.lock().upid = upid.get();
    }

    pub fn set_title(&self, title_id: u64, version: u16) {
        let mut inner = self.lock();
        inner.title_id = title_id;
        inner.title_versions.insert(title_id, version);
    }

    /// Data-cache flushes issued so far, as (address, length) pairs.
    pub fn dc_flushes(&self) -> Vec<(u32, u32)> {
        self.lock().dc_flushes.clone()
    }

    /// Instruction-cache invalidates issued so far.
    pub fn ic_invalidates(&self) -> Vec<(u32, u32)> {
        self.lock().ic_invalidates.clone()
    }

    pub fn barrier_count(&self) -> usize {
        self.lock().barriers
    }

    /// Kernel code writes that hit `addr`, as (core, word) pairs.
    pub fn code_writes_at(&self, addr: PhysicalAddress) -> Vec<(u32, u32)> {
        self.lock()
            .code_writes
            .iter()
            .filter(|&&(_, physical, _)| physical == addr.get())
            .map(|&(core, _, word)| (core, word))
            .collect()
    }
}

impl SystemPort for FakeSystem {
    fn module_handle(&self, module_name: &str) -> Option<ModuleHandle> {
        let inner = self.lock();
        let module = inner.modules.get(module_name)?;
        module.loaded.then_some(module.handle)
    }

    fn find_export(&self, module: ModuleHandle, symbol: &str) -> Option<EffectiveAddress> {
        let inner = self.lock();
        let entry = inner
            .modules
            .values()
            .find(|m| m.handle == module && m.loaded)?;
        entry.exports.get(symbol).copied()
    }

    fn loaded_executables(&self) -> Vec<ExecutableInfo> {
        self.lock().executables.clone()
    }

    fn find_export_in_executable(
        &self,
        executable: &str,
        symbol: &str,
    ) -> Option<EffectiveAddress> {
        self.lock()
            .kernel_exports
            .get(&(executable.to_string(), symbol.to_string()))
            .copied()
    }

    fn effective_to_physical(&self, addr: EffectiveAddress) -> Option<PhysicalAddress> {
        Some(to_physical(addr))
    }

    fn read_code_word(&self, addr: PhysicalAddress) -> Option<u32> {
        self.lock().memory.get(&addr.get()).copied()
    }

    fn write_code_word(&self, addr: PhysicalAddress, word: u32) -> bool {
        let mut inner = self.lock();
        let core = inner.current_core.unwrap_or(0);
        inner.code_writes.push((core, addr.get(), word));
        inner.memory.insert(addr.get(), word);
        true
    }

    fn read_word(&self, addr: EffectiveAddress) -> Option<u32> {
        self.lock().memory.get(&to_physical(addr).get()).copied()
    }

    fn write_word(&self, addr: EffectiveAddress, word: u32) {
        self.lock().memory.insert(to_physical(addr).get(), word);
    }

    fn flush_data_cache(&self, addr: EffectiveAddress, len: u32) {
        self.lock().dc_flushes.push((addr.get(), len));
    }

    fn invalidate_instruction_cache(&self, addr: EffectiveAddress, len: u32) {
        self.lock().ic_invalidates.push((addr.get(), len));
    }

    fn memory_barrier(&self) {
        self.lock().barriers += 1;
    }

    fn run_on_each_core(&self, work: &(dyn Fn(u32) + Sync)) {
        for core in 0..3 {
            // Don't hold the lock across the callback; it calls back in.
            self.lock().current_core = Some(core);
            work(core);
            self.lock().current_core = None;
        }
    }

    fn current_process(&self) -> Upid {
        Upid(self.lock().upid)
    }

    fn process_id_location(&self) -> EffectiveAddress {
        EffectiveAddress(0x1000_0444)
    }

    fn current_title_id(&self) -> u64 {
        self.lock().title_id
    }

    fn title_version(&self, title_id: u64) -> Option<u16> {
        self.lock().title_versions.get(&title_id).copied()
    }

    fn fatal(&self, msg: &str) -> ! {
        panic!("{msg}");
    }
}

/// Bump arena over a fixed window of the fake address space. `free` only
/// counts; the window is small enough that tests never need reuse.
pub(crate) struct FakeArena {
    next: u32,
    end: u32,
    freed: Arc<AtomicUsize>,
}

impl FakeArena {
    /// 32 KiB window at the bottom of the branch-reachable range.
    pub fn new() -> Self {
        Self::at(0x0080_0000, 32 * 1024)
    }

    pub fn at(base: u32, size: u32) -> Self {
        FakeArena {
            next: base,
            end: base + size,
            freed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_capacity_words(words: u32) -> Self {
        Self::at(0x0080_0000, words * 4)
    }

    pub fn freed_counter(&self) -> Arc<AtomicUsize> {
        self.freed.clone()
    }
}

impl CodeArena for FakeArena {
    fn alloc(&mut self, words: usize) -> Option<EffectiveAddress> {
        let bytes = (words * 4) as u32;
        if self.next.checked_add(bytes)? > self.end {
            return None;
        }
        let addr = EffectiveAddress(self.next);
        self.next += bytes;
        Some(addr)
    }

    fn free(&mut self, _addr: EffectiveAddress) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}
