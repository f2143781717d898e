//! System-library table and export resolution.
//!
//! Resolution is strictly non-forcing: a library that is not loaded yet
//! resolves to nothing, and the patch set retries when the loader reports
//! a load. Module handles are cached per library until an unload
//! notification invalidates them.

use log::{debug, trace, warn};

use crate::code::ppc;
use crate::os::SystemPort;
use crate::types::{EffectiveAddress, ModuleHandle, PatchTarget};

/// The system libraries whose exports can be patched by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryId {
    Avm,
    Camera,
    Coreinit,
    Dc,
    Dmae,
    Drmapp,
    Erreula,
    Gx2,
    H264,
    Lzma920,
    Mic,
    Nfc,
    NioProf,
    Nlibcurl,
    Nlibnss,
    Nlibnss2,
    NnAc,
    NnAcp,
    NnAct,
    NnAoc,
    NnBoss,
    NnCcr,
    NnCmpt,
    NnDlp,
    NnEc,
    NnFp,
    NnHai,
    NnHpad,
    NnIdbe,
    NnNdm,
    NnNets2,
    NnNfp,
    NnNim,
    NnOlv,
    NnPdm,
    NnSave,
    NnSl,
    NnSpm,
    NnTemp,
    NnUds,
    NnVctl,
    Nsysccr,
    Nsyshid,
    Nsyskbd,
    Nsysnet,
    Nsysuhs,
    Nsysuvd,
    Ntag,
    Padscore,
    ProcUi,
    SndCore,
    SndUser,
    Sndcore2,
    Snduser2,
    Swkbd,
    Sysapp,
    Tcl,
    Tve,
    Uac,
    UacRpl,
    UsbMic,
    Uvc,
    Uvd,
    Vpad,
    Vpadbase,
    Zlib125,
}

impl LibraryId {
    /// File name the loader knows this library by.
    pub fn module_name(self) -> &'static str {
        match self {
            LibraryId::Avm => "avm.rpl",
            LibraryId::Camera => "camera.rpl",
            LibraryId::Coreinit => "coreinit.rpl",
            LibraryId::Dc => "dc.rpl",
            LibraryId::Dmae => "dmae.rpl",
            LibraryId::Drmapp => "drmapp.rpl",
            LibraryId::Erreula => "erreula.rpl",
            LibraryId::Gx2 => "gx2.rpl",
            LibraryId::H264 => "h264.rpl",
            LibraryId::Lzma920 => "lzma920.rpl",
            LibraryId::Mic => "mic.rpl",
            LibraryId::Nfc => "nfc.rpl",
            LibraryId::NioProf => "nio_prof.rpl",
            LibraryId::Nlibcurl => "nlibcurl.rpl",
            LibraryId::Nlibnss => "nlibnss.rpl",
            LibraryId::Nlibnss2 => "nlibnss2.rpl",
            LibraryId::NnAc => "nn_ac.rpl",
            LibraryId::NnAcp => "nn_acp.rpl",
            LibraryId::NnAct => "nn_act.rpl",
            LibraryId::NnAoc => "nn_aoc.rpl",
            LibraryId::NnBoss => "nn_boss.rpl",
            LibraryId::NnCcr => "nn_ccr.rpl",
            LibraryId::NnCmpt => "nn_cmpt.rpl",
            LibraryId::NnDlp => "nn_dlp.rpl",
            LibraryId::NnEc => "nn_ec.rpl",
            LibraryId::NnFp => "nn_fp.rpl",
            LibraryId::NnHai => "nn_hai.rpl",
            LibraryId::NnHpad => "nn_hpad.rpl",
            LibraryId::NnIdbe => "nn_idbe.rpl",
            LibraryId::NnNdm => "nn_ndm.rpl",
            LibraryId::NnNets2 => "nn_nets2.rpl",
            LibraryId::NnNfp => "nn_nfp.rpl",
            LibraryId::NnNim => "nn_nim.rpl",
            LibraryId::NnOlv => "nn_olv.rpl",
            LibraryId::NnPdm => "nn_pdm.rpl",
            LibraryId::NnSave => "nn_save.rpl",
            LibraryId::NnSl => "nn_sl.rpl",
            LibraryId::NnSpm => "nn_spm.rpl",
            LibraryId::NnTemp => "nn_temp.rpl",
            LibraryId::NnUds => "nn_uds.rpl",
            LibraryId::NnVctl => "nn_vctl.rpl",
            LibraryId::Nsysccr => "nsysccr.rpl",
            LibraryId::Nsyshid => "nsyshid.rpl",
            LibraryId::Nsyskbd => "nsyskbd.rpl",
            LibraryId::Nsysnet => "nsysnet.rpl",
            LibraryId::Nsysuhs => "nsysuhs.rpl",
            LibraryId::Nsysuvd => "nsysuvd.rpl",
            LibraryId::Ntag => "ntag.rpl",
            LibraryId::Padscore => "padscore.rpl",
            LibraryId::ProcUi => "proc_ui.rpl",
            LibraryId::SndCore => "snd_core.rpl",
            LibraryId::SndUser => "snd_user.rpl",
            LibraryId::Sndcore2 => "sndcore2.rpl",
            LibraryId::Snduser2 => "snduser2.rpl",
            LibraryId::Swkbd => "swkbd.rpl",
            LibraryId::Sysapp => "sysapp.rpl",
            LibraryId::Tcl => "tcl.rpl",
            LibraryId::Tve => "tve.rpl",
            LibraryId::Uac => "uac.rpl",
            LibraryId::UacRpl => "uac_rpl.rpl",
            LibraryId::UsbMic => "usb_mic.rpl",
            LibraryId::Uvc => "uvc.rpl",
            LibraryId::Uvd => "uvd.rpl",
            LibraryId::Vpad => "vpad.rpl",
            LibraryId::Vpadbase => "vpadbase.rpl",
            LibraryId::Zlib125 => "zlib125.rpl",
        }
    }

    pub fn all() -> &'static [LibraryId] {
        use LibraryId::*;
        &[
            Avm, Camera, Coreinit, Dc, Dmae, Drmapp, Erreula, Gx2, H264, Lzma920, Mic, Nfc,
            NioProf, Nlibcurl, Nlibnss, Nlibnss2, NnAc, NnAcp, NnAct, NnAoc, NnBoss, NnCcr,
            NnCmpt, NnDlp, NnEc, NnFp, NnHai, NnHpad, NnIdbe, NnNdm, NnNets2, NnNfp, NnNim,
            NnOlv, NnPdm, NnSave, NnSl, NnSpm, NnTemp, NnUds, NnVctl, Nsysccr, Nsyshid,
            Nsyskbd, Nsysnet, Nsysuhs, Nsysuvd, Ntag, Padscore, ProcUi, SndCore, SndUser,
            Sndcore2, Snduser2, Swkbd, Sysapp, Tcl, Tve, Uac, UacRpl, UsbMic, Uvc, Uvd, Vpad,
            Vpadbase, Zlib125,
        ]
    }
}

struct CachedHandle {
    library: LibraryId,
    handle: Option<ModuleHandle>,
}

/// Resolves patch targets to effective addresses, caching module handles
/// between resolutions. Never touches target memory beyond reading export
/// words for thunk detection.
pub struct ExportResolver {
    handles: Vec<CachedHandle>,
}

impl Default for ExportResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportResolver {
    pub fn new() -> Self {
        ExportResolver {
            handles: LibraryId::all()
                .iter()
                .map(|&library| CachedHandle {
                    library,
                    handle: None,
                })
                .collect(),
        }
    }

    /// Current effective address of `target`, or `None` while the target
    /// cannot be resolved (library or executable not loaded, symbol absent).
    pub fn resolve(
        &mut self,
        system: &dyn SystemPort,
        target: &PatchTarget,
    ) -> Option<EffectiveAddress> {
        match target {
            PatchTarget::RawAddress { effective, .. } => Some(*effective),
            PatchTarget::LibraryExport { library, symbol } => {
                self.resolve_library_export(system, *library, symbol)
            }
            PatchTarget::ExecutableOffset {
                executable,
                text_offset,
                ..
            } => resolve_text_offset(system, executable, *text_offset),
            PatchTarget::ExecutableExport {
                executable, symbol, ..
            } => {
                let addr = system.find_export_in_executable(executable, symbol);
                if addr.is_none() {
                    warn!("failed to find {symbol:?} in {executable:?}");
                }
                addr
            }
        }
    }

    fn resolve_library_export(
        &mut self,
        system: &dyn SystemPort,
        library: LibraryId,
        symbol: &str,
    ) -> Option<EffectiveAddress> {
        let slot = self
            .handles
            .iter_mut()
            .find(|slot| slot.library == library)?;

        if slot.handle.is_none() {
            trace!("checking whether {} is loaded", library.module_name());
            slot.handle = system.module_handle(library.module_name());
        }
        let Some(handle) = slot.handle else {
            trace!("{} is not loaded yet", library.module_name());
            return None;
        };

        let Some(addr) = system.find_export(handle, symbol) else {
            trace!("export lookup failed for {symbol}");
            return None;
        };

        follow_export_thunk(system, addr, symbol)
    }

    /// Drop every cached handle. Called when the application ends and all
    /// loader handles become stale.
    pub fn reset_all(&mut self) {
        for slot in &mut self.handles {
            if slot.handle.is_some() {
                trace!("resetting handle for {}", slot.library.module_name());
            }
            slot.handle = None;
        }
    }

    /// Drop the cached handle of one module. Returns whether the handle was
    /// one of ours.
    pub fn reset_module(&mut self, handle: ModuleHandle) -> bool {
        for slot in &mut self.handles {
            if slot.handle == Some(handle) {
                trace!("resetting handle for {}", slot.library.module_name());
                slot.handle = None;
                return true;
            }
        }
        false
    }

    /// Which library a loader handle belongs to, if it is cached.
    pub fn library_for_handle(&self, handle: ModuleHandle) -> Option<LibraryId> {
        self.handles
            .iter()
            .find(|slot| slot.handle == Some(handle))
            .map(|slot| slot.library)
    }
}

/// Some libraries export a one-instruction relative branch instead of the
/// function body. Follow it once; a destination that is again a branch
/// means the thunk was never resolved and the symbol is unusable.
fn follow_export_thunk(
    system: &dyn SystemPort,
    addr: EffectiveAddress,
    symbol: &str,
) -> Option<EffectiveAddress> {
    let Some(word) = system.read_word(addr) else {
        return Some(addr);
    };
    let Some(dest) = ppc::relative_branch_target(addr, word) else {
        return Some(addr);
    };

    debug!("{symbol} at {addr} is a thunk, following to {dest}");
    match system.read_word(dest) {
        Some(dest_word) if ppc::relative_branch_target(dest, dest_word).is_some() => {
            warn!("{symbol} thunk at {addr} leads to another thunk at {dest}");
            None
        }
        _ => Some(dest),
    }
}

fn resolve_text_offset(
    system: &dyn SystemPort,
    executable: &str,
    text_offset: u32,
) -> Option<EffectiveAddress> {
    let executables = system.loaded_executables();
    if executables.is_empty() {
        // The loader always has at least the main executable mapped.
        system.fatal("loader reported no executables; info patches missing?");
    }

    for info in &executables {
        if info.name.ends_with(executable) {
            return Some(info.text_addr.offset(text_offset));
        }
    }

    if executable.ends_with(".rpx") {
        warn!("cannot patch function: {executable:?} is not loaded");
    } else {
        debug!("cannot patch function: {executable:?} is not loaded");
    }
    None
}
