//! Hardware-breakpoint-based instruction access tracking: ATTACH → arm
//! DR0-3/DR7 → (CONT, waitpid, record SIGTRAP, clear DR6) loop, terminated
//! by a SIGSTOP request that clears DR0/DR7 and detaches. State lives
//! behind one `AccessTracker` handle per process, with the loop itself run
//! on a dedicated `std::thread` (no async runtime).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;

use crate::disasm::Disassembler;
use crate::error::{Error, Result};
use crate::hwbreak::{BreakpointKind, BreakpointSize, HwSlotTable};
use crate::memio::{TrackerHandle, WriteCodeRequest};
use crate::process::ProcessHandle;

/// One observed access to the watched address.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccessRecord {
    pub instruction_pointer: u64,
    pub bytes: [u8; 16],
    pub count: u64,
    pub is_write: bool,
}

enum Control {
    Stop,
    WriteCode(WriteCodeRequest),
}

struct Session {
    thread: JoinHandle<()>,
    control_tx: Sender<Control>,
}

struct Shared {
    records: Mutex<HashMap<u64, AccessRecord>>,
    running: AtomicBool,
}

/// A cheaply-cloneable handle to the tracking session for one process.
#[derive(Clone)]
pub struct AccessTracker {
    process: ProcessHandle,
    tracker_handle: TrackerHandle,
    shared: Arc<Shared>,
    session: Arc<Mutex<Option<Session>>>,
}

impl AccessTracker {
    pub fn new(process: ProcessHandle, tracker_handle: TrackerHandle) -> Self {
        Self {
            process,
            tracker_handle,
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Starts tracking `address` for the given access kind/size. Attaches and
    /// arms the hardware breakpoint synchronously, so a failure (most
    /// commonly `Error::Permission`) is reported to the caller directly
    /// rather than only logged off-thread; once armed, the tracker thread
    /// takes over as the sole `ptrace`-attached owner of the target for the
    /// session's duration.
    pub fn start_tracking(&self, address: u64, kind: BreakpointKind, size: BreakpointSize) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(Error::Busy);
        }

        let pid = self.process.require_pid()?;

        ptrace::attach(pid).map_err(Error::from_ptrace)?;
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            other => log::warn!("unexpected wait status after attach: {:?}", other),
        }

        let mut slots = HwSlotTable::new();
        let armed_slot = match slots.set(pid, address, kind, size) {
            Ok(slot) => slot,
            Err(e) => {
                let _ = ptrace::detach(pid, None);
                return Err(e);
            }
        };

        if let Err(e) = ptrace::cont(pid, None) {
            let _ = slots.clear_all(pid);
            let _ = ptrace::detach(pid, None);
            return Err(Error::from_ptrace(e));
        }

        let (control_tx, control_rx) = mpsc::channel();
        *self.tracker_handle.lock().unwrap() = Some({
            let (code_tx, code_rx) = mpsc::channel::<WriteCodeRequest>();
            // Forward write-code requests arriving on the public channel into
            // the tracker thread's single control queue.
            let forward_tx = control_tx.clone();
            thread::spawn(move || {
                for request in code_rx {
                    if forward_tx.send(Control::WriteCode(request)).is_err() {
                        break;
                    }
                }
            });
            code_tx
        });

        self.shared.records.lock().unwrap().clear();
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let tracker_handle = Arc::clone(&self.tracker_handle);
        let process = self.process.clone();

        let thread = thread::spawn(move || {
            tracker_loop(pid, slots, armed_slot, control_rx, shared, tracker_handle, process);
        });

        *session = Some(Session { thread, control_tx });
        Ok(())
    }

    /// Signals the tracker thread to clear its breakpoint, detach, and exit,
    /// then joins it.
    pub fn stop_tracking(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let Some(session) = session.take() else {
            return Ok(());
        };

        let _ = session.control_tx.send(Control::Stop);
        let _ = session.thread.join();

        self.shared.running.store(false, Ordering::SeqCst);
        *self.tracker_handle.lock().unwrap() = None;
        Ok(())
    }

    /// Every recorded access, sorted descending by hit count.
    pub fn records(&self) -> Vec<AccessRecord> {
        let mut records: Vec<AccessRecord> = self.shared.records.lock().unwrap().values().copied().collect();
        records.sort_by(|a, b| b.count.cmp(&a.count));
        records
    }

    pub fn clear_records(&self) {
        self.shared.records.lock().unwrap().clear();
    }

    pub fn total_access_count(&self) -> u64 {
        self.shared.records.lock().unwrap().values().map(|r| r.count).sum()
    }
}

/// The tracker thread body, taking over an already-attached, already-armed
/// target: loop `waitpid` → record-or-forward → `PTRACE_CONT` until told to
/// stop, then clear the breakpoint and detach.
fn tracker_loop(
    pid: Pid,
    mut slots: HwSlotTable,
    armed_slot: usize,
    control_rx: Receiver<Control>,
    shared: Arc<Shared>,
    tracker_handle: TrackerHandle,
    process: ProcessHandle,
) {
    loop {
        match control_rx.try_recv() {
            Ok(Control::Stop) => break,
            Ok(Control::WriteCode(request)) => {
                let outcome = write_code_direct(pid, request.address, &request.bytes);
                let _ = request.reply.send(outcome);
                continue;
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                if let Ok(Some(triggered)) = slots.triggered_slot(pid) {
                    if triggered == armed_slot {
                        if let Ok(regs) = ptrace::getregs(pid) {
                            let window = read_instruction_window(pid, regs.rip);
                            let is_write = Disassembler::new()
                                .decode(regs.rip, &window)
                                .map(|insn| insn.writes_memory)
                                .unwrap_or(false);

                            let mut records = shared.records.lock().unwrap();
                            let entry = records.entry(regs.rip).or_insert(AccessRecord {
                                instruction_pointer: regs.rip,
                                bytes: window,
                                count: 0,
                                is_write,
                            });
                            entry.count += 1;
                            entry.bytes = window;
                            entry.is_write = is_write;
                        }
                    }
                    let _ = slots.clear_status(pid);
                }
                let _ = ptrace::cont(pid, None);
            }
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                process.detach();
                shared.running.store(false, Ordering::SeqCst);
                *tracker_handle.lock().unwrap() = None;
                return;
            }
            Ok(_) => {
                let _ = ptrace::cont(pid, None);
            }
            Err(e) => {
                log::error!("waitpid failed during tracking: {}", e);
                break;
            }
        }
    }

    let _ = slots.clear_all(pid);
    let _ = ptrace::detach(pid, None);

    shared.running.store(false, Ordering::SeqCst);
    *tracker_handle.lock().unwrap() = None;
}

/// Executed on the tracker thread itself, since it already holds the
/// exclusive `ptrace` attachment: mirrors `MemoryIO`'s own
/// `PTRACE_POKETEXT` loop but runs without re-acquiring anything.
fn write_code_direct(pid: Pid, address: u64, bytes: &[u8]) -> Result<()> {
    let word_size = std::mem::size_of::<i64>() as u64;
    let start_word = address - (address % word_size);
    let end = address + bytes.len() as u64;
    let end_word = end + ((word_size - (end % word_size)) % word_size);

    let mut word = start_word;
    while word < end_word {
        let existing = ptrace::read(pid, word as ptrace::AddressType).map_err(Error::from_ptrace)?;
        let mut word_bytes = existing.to_ne_bytes();

        for (i, slot) in word_bytes.iter_mut().enumerate() {
            let byte_addr = word + i as u64;
            if byte_addr >= address && byte_addr < end {
                *slot = bytes[(byte_addr - address) as usize];
            }
        }

        let patched = i64::from_ne_bytes(word_bytes);
        unsafe {
            ptrace::write(pid, word as ptrace::AddressType, patched as *mut libc::c_void)
                .map_err(Error::from_ptrace)?;
        }

        word += word_size;
    }

    Ok(())
}

/// Reads the 16 bytes starting at `address` via two word-sized
/// `PTRACE_PEEKTEXT`s, for recording what instruction tripped a breakpoint.
/// Any read that fails leaves its half of the window zeroed.
fn read_instruction_window(pid: Pid, address: u64) -> [u8; 16] {
    let mut window = [0u8; 16];
    for (i, chunk) in window.chunks_mut(8).enumerate() {
        let word_addr = address + (i * 8) as u64;
        if let Ok(word) = ptrace::read(pid, word_addr as ptrace::AddressType) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memio::new_tracker_handle;

    #[test]
    fn fresh_tracker_is_not_tracking() {
        let tracker = AccessTracker::new(ProcessHandle::new(), new_tracker_handle());
        assert!(!tracker.is_tracking());
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn start_tracking_without_attached_process_errors() {
        let tracker = AccessTracker::new(ProcessHandle::new(), new_tracker_handle());
        let err = tracker
            .start_tracking(0x1000, BreakpointKind::Write, BreakpointSize::Four)
            .unwrap_err();
        assert!(matches!(err, Error::Detached));
    }

    #[test]
    fn stop_tracking_without_a_session_is_a_no_op() {
        let tracker = AccessTracker::new(ProcessHandle::new(), new_tracker_handle());
        assert!(tracker.stop_tracking().is_ok());
    }
}
