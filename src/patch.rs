//! Code-patch manager: NOP-outs, conditional-jump inversions, and their
//! reversal. The patch table is a `lazy_static` process-wide singleton —
//! unlike `AccessTracker`, which this crate gives one instance per `Engine`,
//! every `PatchManager` shares the same table.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use serde::Serialize;

use crate::disasm::{invert_jcc_bytes, Disassembler};
use crate::error::{Error, Result};
use crate::memio::MemoryIO;

/// Longest possible x86-64 instruction, used to size the read before an
/// instruction's real length is known.
const MAX_INSN_LEN: usize = 15;

/// A patch record: the bytes that were overwritten, kept so the patch can
/// be reversed, and a caller-supplied description. Stays in the table after
/// `restore` (with `active` cleared) so `list()` keeps showing its history
/// until a fresh `install` at the same address replaces it outright.
#[derive(Debug, Clone, Serialize)]
pub struct Patch {
    pub address: u64,
    pub original_bytes: Vec<u8>,
    pub patched_bytes: Vec<u8>,
    pub description: String,
    pub active: bool,
}

lazy_static! {
    static ref PATCHES: Mutex<HashMap<u64, Patch>> = Mutex::new(HashMap::new());
}

#[derive(Debug, Default)]
pub struct PatchManager;

impl PatchManager {
    pub fn new() -> Self {
        Self
    }

    /// True iff `address` carries a currently-active patch (a restored one
    /// still in the table for `list()` doesn't count).
    pub fn is_patched(&self, address: u64) -> bool {
        PATCHES.lock().unwrap().get(&address).map_or(false, |p| p.active)
    }

    pub fn list(&self) -> Vec<Patch> {
        PATCHES.lock().unwrap().values().cloned().collect()
    }

    /// Overwrites the instruction at `address` with a `0x90` sled the same
    /// length as the original, recording the bytes it replaced.
    pub fn nop(&self, memio: &MemoryIO, disasm: &Disassembler, address: u64, desc: impl Into<String>) -> Result<()> {
        self.install(memio, disasm, address, desc.into(), |_insn, disasm, original| {
            Ok(disasm.nop_bytes(original.len()))
        })
    }

    /// Flips a conditional jump's condition bit in place, leaving the rest
    /// of the instruction untouched.
    pub fn invert_cond_jump(
        &self,
        memio: &MemoryIO,
        disasm: &Disassembler,
        address: u64,
        desc: impl Into<String>,
    ) -> Result<()> {
        self.install(memio, disasm, address, desc.into(), |_insn, _disasm, original| {
            let mut bytes = original.to_vec();
            invert_jcc_bytes(&mut bytes)?;
            Ok(bytes)
        })
    }

    /// Decodes the instruction at `address`, builds the replacement via
    /// `make_patched`, writes it, and records the patch. Rejects a second
    /// patch at an address that already carries an active one.
    fn install(
        &self,
        memio: &MemoryIO,
        disasm: &Disassembler,
        address: u64,
        description: String,
        make_patched: impl FnOnce(&crate::disasm::DecodedInsn, &Disassembler, &[u8]) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let mut patches = PATCHES.lock().unwrap();
        if patches.get(&address).map_or(false, |p| p.active) {
            return Err(Error::PatchConflict(address));
        }

        let probe = memio.read(address, MAX_INSN_LEN)?;
        let insn = disasm.decode(address, &probe)?;
        let original = probe[..insn.len].to_vec();

        let patched_bytes = make_patched(&insn, disasm, &original)?;
        memio.write_code(address, &patched_bytes)?;

        patches.insert(
            address,
            Patch {
                address,
                original_bytes: original,
                patched_bytes,
                description,
                active: true,
            },
        );
        Ok(())
    }

    /// Restores the original bytes at `address` and marks the patch
    /// inactive. A no-op, not an error, when `address` has no patch or the
    /// patch there is already inactive.
    pub fn restore(&self, memio: &MemoryIO, address: u64) -> Result<()> {
        let mut patches = PATCHES.lock().unwrap();
        let Some(patch) = patches.get_mut(&address) else {
            return Ok(());
        };
        if !patch.active {
            return Ok(());
        }

        let original_bytes = patch.original_bytes.clone();
        memio.write_code(address, &original_bytes)?;

        patches.get_mut(&address).unwrap().active = false;
        Ok(())
    }

    /// Restores every active patch. Best-effort: collects and returns the
    /// first error encountered, having already attempted the rest.
    pub fn restore_all(&self, memio: &MemoryIO) -> Result<()> {
        let addresses: Vec<u64> = PATCHES
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.active)
            .map(|p| p.address)
            .collect();
        let mut first_err = None;
        for address in addresses {
            if let Err(e) = self.restore(memio, address) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_reports_nothing_patched() {
        // PATCHES is a process-wide singleton; only assert non-membership for
        // an address no other test touches.
        let manager = PatchManager::new();
        assert!(!manager.is_patched(0xDEAD_BEEF_0000));
    }

    #[test]
    fn restoring_an_address_with_no_patch_is_a_no_op() {
        let manager = PatchManager::new();
        let memio = MemoryIO::new(crate::process::ProcessHandle::new(), crate::memio::new_tracker_handle());
        // No process is attached, but restore() should short-circuit before
        // ever touching memio since there's nothing recorded at this address.
        assert!(manager.restore(&memio, 0xDEAD_BEEF_1000).is_ok());
    }
}
