//! Owns the target PID and its attach/detach lifecycle.

use std::fs;
use std::sync::{Arc, Mutex, RwLock};

use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, Uid};

use crate::error::{Error, Result};
use crate::region::{Perms, RegionMap};

/// Emitted whenever a process is attached to or detached from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Attached(i32),
    Detached(i32),
}

type Observer = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

struct Inner {
    pid: RwLock<Option<Pid>>,
    base_address: RwLock<Option<u64>>,
    observers: Mutex<Vec<Observer>>,
}

/// A cheaply-cloneable handle to the single selected target process.
///
/// All operations are no-ops (or return `Error::Detached`) when no process is
/// selected.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pid: RwLock::new(None),
                base_address: RwLock::new(None),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an observer for attach/detach events.
    pub fn observe(&self, f: Observer) {
        self.inner.observers.lock().unwrap().push(f);
    }

    fn notify(&self, event: ProcessEvent) {
        for observer in self.inner.observers.lock().unwrap().iter() {
            observer(event);
        }
    }

    /// Select `pid` as the target process. Logs an advisory (not a hard
    /// error) if the caller isn't root, since an unprivileged `ptrace` may
    /// still succeed against a child the caller spawned itself.
    pub fn attach(&self, pid: i32) -> Result<()> {
        if !Uid::effective().is_root() {
            log::warn!("not running as root; ptrace operations against {} may fail", pid);
        }

        let pid = Pid::from_raw(pid);
        *self.inner.base_address.write().unwrap() = Self::find_base_address(pid);
        *self.inner.pid.write().unwrap() = Some(pid);

        log::debug!("attached to pid {}", pid);
        self.notify(ProcessEvent::Attached(pid.as_raw()));
        Ok(())
    }

    /// Release the current target, if any. A no-op when already detached.
    pub fn detach(&self) {
        let prior = self.inner.pid.write().unwrap().take();
        *self.inner.base_address.write().unwrap() = None;

        if let Some(pid) = prior {
            log::debug!("detached from pid {}", pid);
            self.notify(ProcessEvent::Detached(pid.as_raw()));
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        *self.inner.pid.read().unwrap()
    }

    pub fn require_pid(&self) -> Result<Pid> {
        self.pid().ok_or(Error::Detached)
    }

    pub fn is_attached(&self) -> bool {
        self.pid().is_some()
    }

    pub fn base_address(&self) -> Option<u64> {
        *self.inner.base_address.read().unwrap()
    }

    /// `kill(pid, SIGSTOP)`. No-op when detached.
    pub fn suspend(&self) -> Result<()> {
        match self.pid() {
            Some(pid) => signal::kill(pid, Signal::SIGSTOP).map_err(Error::from),
            None => Ok(()),
        }
    }

    /// `kill(pid, SIGCONT)`. No-op when detached.
    pub fn resume(&self) -> Result<()> {
        match self.pid() {
            Some(pid) => signal::kill(pid, Signal::SIGCONT).map_err(Error::from),
            None => Ok(()),
        }
    }

    /// Parses the first executable mapping belonging to the main binary
    /// (`/proc/<pid>/exe`) out of `/proc/<pid>/maps`.
    fn find_base_address(pid: Pid) -> Option<u64> {
        let exe = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
        let exe = exe.to_str()?;

        let map = RegionMap::new().with_must_have(Perms::EXEC);
        let regions = map.parse(pid).ok()?;

        regions
            .into_iter()
            .find(|r| r.pathname.as_deref() == Some(exe))
            .map(|r| r.start)
    }
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII scoped suspension used while scanning. Resumes on every exit path,
/// including an early return via `?` or an unwind.
pub struct SuspensionGuard<'a> {
    process: &'a ProcessHandle,
    should_resume: bool,
}

impl<'a> SuspensionGuard<'a> {
    pub fn new(process: &'a ProcessHandle, suspend: bool) -> Result<Self> {
        let should_resume = suspend && process.is_attached();
        if should_resume {
            process.suspend()?;
        }
        Ok(Self { process, should_resume })
    }
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        if self.should_resume {
            let _ = self.process.resume();
        }
    }
}
