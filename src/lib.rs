//! A live memory inspector and instruction-level patcher for Linux/x86-64
//! processes: attach to a PID, scan its memory for candidate values, track
//! hardware-breakpoint-triggered accesses to an address, and patch code in
//! place.

pub mod aob;
pub mod disasm;
pub mod error;
pub mod hwbreak;
pub mod memio;
pub mod patch;
pub mod process;
pub mod region;
pub mod scanner;
pub mod tracker;

pub use error::{Error, Result};

use hwbreak::{BreakpointKind, BreakpointSize};
use memio::MemoryIO;
use process::ProcessHandle;
use scanner::Scanner;
use tracker::AccessTracker;

/// Assembles a `ProcessHandle`, `MemoryIO`, `Scanner`, `AccessTracker`, and
/// `PatchManager` that all agree on one target process and share a single
/// tracker-ownership channel: while `AccessTracker` is tracking,
/// `MemoryIO::write_code` (and so `PatchManager`) transparently forwards its
/// writes there instead of issuing `ptrace` calls of its own.
#[derive(Clone)]
pub struct Engine {
    process: ProcessHandle,
    memio: MemoryIO,
    scanner: Scanner,
    tracker: AccessTracker,
    patches: patch::PatchManager,
    disasm: disasm::Disassembler,
}

impl Engine {
    pub fn new() -> Self {
        let process = ProcessHandle::new();
        let tracker_handle = memio::new_tracker_handle();
        let memio = MemoryIO::new(process.clone(), tracker_handle.clone());
        let scanner = Scanner::new(process.clone(), memio.clone());
        let tracker = AccessTracker::new(process.clone(), tracker_handle);

        Self {
            process,
            memio,
            scanner,
            tracker,
            patches: patch::PatchManager::new(),
            disasm: disasm::Disassembler::new(),
        }
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn memio(&self) -> &MemoryIO {
        &self.memio
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    pub fn patches(&self) -> &patch::PatchManager {
        &self.patches
    }

    pub fn disasm(&self) -> &disasm::Disassembler {
        &self.disasm
    }

    pub fn attach(&self, pid: i32) -> Result<()> {
        self.process.attach(pid)
    }

    pub fn detach(&self) {
        if self.tracker.is_tracking() {
            let _ = self.tracker.stop_tracking();
        }
        self.process.detach();
    }

    pub fn nop(&self, address: u64, desc: impl Into<String>) -> Result<()> {
        self.patches.nop(&self.memio, &self.disasm, address, desc)
    }

    pub fn invert_cond_jump(&self, address: u64, desc: impl Into<String>) -> Result<()> {
        self.patches.invert_cond_jump(&self.memio, &self.disasm, address, desc)
    }

    pub fn restore_patch(&self, address: u64) -> Result<()> {
        self.patches.restore(&self.memio, address)
    }

    pub fn track_address(&self, address: u64, kind: BreakpointKind, size: BreakpointSize) -> Result<()> {
        self.tracker.start_tracking(address, kind, size)
    }

    pub fn stop_tracking(&self) -> Result<()> {
        self.tracker.stop_tracking()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_engine_is_detached() {
        let engine = Engine::new();
        assert!(!engine.process().is_attached());
        assert!(!engine.tracker().is_tracking());
    }
}
