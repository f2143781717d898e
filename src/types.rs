use core::fmt;

use crate::module::LibraryId;

/// Effective (virtual) address in the 32-bit target address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectiveAddress(pub u32);

impl EffectiveAddress {
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Address `bytes` further along, with 32-bit wraparound.
    pub const fn offset(self, bytes: u32) -> Self {
        EffectiveAddress(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for EffectiveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Physical address as used by the kernel copy primitive. Distinct from
/// [`EffectiveAddress`] because cross-core visible writes bypass the
/// effective-address cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

impl PhysicalAddress {
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Opaque handle to a dynamically loaded module, as issued by the host loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u32);

/// Identity of a registered patch. Stable for the lifetime of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchHandle(pub u32);

impl fmt::Display for PatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Process identifier of the foreground process (the kernel's UPID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Upid(pub u32);

impl Upid {
    pub const ROOT_RPX: Upid = Upid(1);
    pub const WII_U_MENU: Upid = Upid(2);
    pub const TVII: Upid = Upid(3);
    pub const E_MANUAL: Upid = Upid(4);
    pub const HOME_MENU: Upid = Upid(5);
    pub const ERROR_DISPLAY: Upid = Upid(6);
    pub const MINI_MIIVERSE: Upid = Upid(7);
    pub const INTERNET_BROWSER: Upid = Upid(8);
    pub const MIIVERSE: Upid = Upid(9);
    pub const ESHOP: Upid = Upid(10);
    pub const DOWNLOAD_MANAGEMENT: Upid = Upid(12);
    pub const GAME: Upid = Upid(15);

    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Which processes a patch is active in. The generated entry code compares
/// the live UPID against the scope on every call, so a single install covers
/// process switches without re-patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetProcess {
    /// Active in every process; allows the single-instruction install path.
    All,
    /// Active in the system menu and the running game.
    GameAndMenu,
    /// Active only in one specific process.
    Process(Upid),
}

impl TargetProcess {
    pub fn matches(self, current: Upid) -> bool {
        match self {
            TargetProcess::All => true,
            TargetProcess::GameAndMenu => {
                current == Upid::WII_U_MENU || current == Upid::GAME
            }
            TargetProcess::Process(upid) => current == upid,
        }
    }
}

/// Title-based gating for patches that target an executable image rather
/// than a system library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleGate {
    /// Title ids the patch applies to. Must not be empty.
    pub title_ids: Vec<u64>,
    /// Inclusive title-version range.
    pub version_min: u16,
    pub version_max: u16,
}

impl TitleGate {
    /// Gate that accepts any version of the given titles.
    pub fn titles(title_ids: Vec<u64>) -> Self {
        TitleGate {
            title_ids,
            version_min: 0,
            version_max: u16::MAX,
        }
    }

    pub fn accepts_title(&self, title_id: u64) -> bool {
        self.title_ids.contains(&title_id)
    }

    pub fn accepts_version(&self, version: u16) -> bool {
        version >= self.version_min && version <= self.version_max
    }
}

/// What a patch attaches to. Exactly one addressing mode per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    /// An exported function of a known system library, re-resolved on every
    /// apply because load addresses change between launches.
    LibraryExport { library: LibraryId, symbol: String },
    /// A fixed effective/physical address pair supplied by the caller.
    RawAddress {
        effective: EffectiveAddress,
        physical: PhysicalAddress,
    },
    /// A function found by scanning an executable's symbol table.
    ExecutableExport {
        executable: String,
        symbol: String,
        gate: TitleGate,
    },
    /// A fixed offset into an executable's text segment.
    ExecutableOffset {
        executable: String,
        text_offset: u32,
        gate: TitleGate,
    },
}

impl PatchTarget {
    pub(crate) fn gate(&self) -> Option<&TitleGate> {
        match self {
            PatchTarget::ExecutableExport { gate, .. }
            | PatchTarget::ExecutableOffset { gate, .. } => Some(gate),
            _ => None,
        }
    }

    pub(crate) fn is_executable_target(&self) -> bool {
        self.gate().is_some()
    }
}

/// One loaded executable image as reported by the host loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableInfo {
    pub name: String,
    pub text_addr: EffectiveAddress,
}
