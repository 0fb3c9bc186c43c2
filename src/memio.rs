//! Target-memory transport: plain data I/O plus the text-segment write path
//! that must funnel through the tracker whenever one is attached. Data
//! reads/writes go straight through `/proc/<pid>/mem`, but `write_code`
//! either forwards to the tracking thread (the sole ptrace-attached owner
//! while tracking is active) or, when nothing is tracking, performs the
//! `PTRACE_PEEKTEXT`/`PTRACE_POKETEXT` partial-word-preserving loop itself.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::process::ProcessHandle;

/// A code-patch write routed to the thread that owns the ptrace attachment.
pub struct WriteCodeRequest {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub reply: mpsc::Sender<Result<()>>,
}

/// Shared slot the tracker installs its inbound channel into while tracking
/// is active, and clears on shutdown. `None` means no tracker owns the
/// attachment, so `MemoryIO` may issue `ptrace` calls directly.
pub type TrackerHandle = Arc<Mutex<Option<mpsc::Sender<WriteCodeRequest>>>>;

pub fn new_tracker_handle() -> TrackerHandle {
    Arc::new(Mutex::new(None))
}

/// Plain-data and code-patch transport against one target process.
#[derive(Clone)]
pub struct MemoryIO {
    process: ProcessHandle,
    tracker: TrackerHandle,
}

impl MemoryIO {
    pub fn new(process: ProcessHandle, tracker: TrackerHandle) -> Self {
        Self { process, tracker }
    }

    /// Reads `len` bytes starting at `address` via `/proc/<pid>/mem`, falling
    /// back to `process_vm_readv` if the `pread` fails (e.g. across a
    /// mapping boundary on some kernels).
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let pid = self.process.require_pid()?;

        match Self::pread_mem(pid, address, len) {
            Ok(buf) => Ok(buf),
            Err(_) => Self::process_vm_readv(pid, address, len),
        }
    }

    /// Writes data bytes (not instructions) via `/proc/<pid>/mem`.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let pid = self.process.require_pid()?;

        match Self::pwrite_mem(pid, address, data) {
            Ok(()) => Ok(()),
            Err(_) => Self::process_vm_writev(pid, address, data),
        }
    }

    /// Writes instruction bytes. If a tracker currently owns the ptrace
    /// attachment, the write is forwarded there and this call blocks for the
    /// reply; otherwise this function performs the `PTRACE_POKETEXT` loop.
    pub fn write_code(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let forwarder = self.tracker.lock().unwrap().clone();

        if let Some(sender) = forwarder {
            let (reply_tx, reply_rx) = mpsc::channel();
            let request = WriteCodeRequest {
                address,
                bytes: bytes.to_vec(),
                reply: reply_tx,
            };
            sender
                .send(request)
                .map_err(|_| Error::TransportFailure { address })?;
            return reply_rx
                .recv()
                .map_err(|_| Error::TransportFailure { address })?;
        }

        let pid = self.process.require_pid()?;

        // The calling process may already be `pid`'s tracer (e.g. a child
        // spawned with `PTRACE_TRACEME`); try the word loop directly first
        // and only bracket it with our own attach/detach if that fails,
        // mirroring the try-then-fall-back shape `read`/`write` use above.
        match Self::poketext_partial(pid, address, bytes) {
            Ok(()) => Ok(()),
            Err(_) => Self::attach_write_detach(pid, address, bytes),
        }
    }

    /// Brackets the `PTRACE_POKETEXT` loop with its own attach/detach, for
    /// the case where nothing already holds the tracer relationship on
    /// `pid`.
    fn attach_write_detach(pid: Pid, address: u64, bytes: &[u8]) -> Result<()> {
        use nix::sys::ptrace;
        use nix::sys::wait::{waitpid, WaitStatus};

        ptrace::attach(pid).map_err(Error::from_ptrace)?;
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            other => log::warn!("unexpected wait status after attach: {:?}", other),
        }

        let result = Self::poketext_partial(pid, address, bytes);

        let _ = ptrace::detach(pid, None);
        result
    }

    fn pread_mem(pid: Pid, address: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = OpenOptions::new().read(true).open(format!("/proc/{}/mem", pid))?;
        file.seek(SeekFrom::Start(address))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn pwrite_mem(pid: Pid, address: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(format!("/proc/{}/mem", pid))?;
        file.seek(SeekFrom::Start(address))?;
        file.write_all(data)
    }

    fn process_vm_readv(pid: Pid, address: u64, len: usize) -> Result<Vec<u8>> {
        use nix::sys::uio::{process_vm_readv, IoVec, RemoteIoVec};

        let mut buf = vec![0u8; len];
        let local = [IoVec::from_mut_slice(&mut buf)];
        let remote = [RemoteIoVec {
            base: address as usize,
            len,
        }];

        let read = process_vm_readv(pid, &local, &remote).map_err(Error::from)?;
        if read != len {
            return Err(Error::TransportFailure { address });
        }
        Ok(buf)
    }

    fn process_vm_writev(pid: Pid, address: u64, data: &[u8]) -> Result<()> {
        use nix::sys::uio::{process_vm_writev, IoVec, RemoteIoVec};

        let local = [IoVec::from_slice(data)];
        let remote = [RemoteIoVec {
            base: address as usize,
            len: data.len(),
        }];

        let written = process_vm_writev(pid, &local, &remote).map_err(Error::from)?;
        if written != data.len() {
            return Err(Error::TransportFailure { address });
        }
        Ok(())
    }

    /// `PTRACE_PEEKTEXT`/`PTRACE_POKETEXT` word-at-a-time, preserving the
    /// bytes of the first and last word that fall outside `[address,
    /// address+bytes.len())`.
    fn poketext_partial(pid: Pid, address: u64, bytes: &[u8]) -> Result<()> {
        use nix::sys::ptrace;

        let word_size = size_of::<i64>() as u64;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_handle_starts_empty() {
        let handle = new_tracker_handle();
        assert!(handle.lock().unwrap().is_none());
    }

    #[test]
    fn memory_io_without_attached_process_rejects_reads() {
        let memio = MemoryIO::new(ProcessHandle::new(), new_tracker_handle());
        assert!(matches!(memio.read(0x1000, 4), Err(Error::Detached)));
    }
}
