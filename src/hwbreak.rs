//! DR0–DR7 management: the bounded four-slot hardware breakpoint table.
//!
//! Every function here must only ever be called from the thread that
//! currently owns the `ptrace` attachment to the target — `AccessTracker` is
//! the sole caller.

use memoffset::offset_of;
use nix::unistd::Pid;
use serde::Serialize;

use crate::error::{Error, Result};

pub const MAX_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakpointKind {
    Execute,
    Write,
    IoReadWrite,
    ReadWrite,
}

impl BreakpointKind {
    fn condition_bits(self) -> u64 {
        match self {
            BreakpointKind::Execute => 0b00,
            BreakpointKind::Write => 0b01,
            BreakpointKind::IoReadWrite => 0b10,
            BreakpointKind::ReadWrite => 0b11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakpointSize {
    One,
    Two,
    Four,
    Eight,
}

impl BreakpointSize {
    fn length_bits(self) -> u64 {
        match self {
            BreakpointSize::One => 0b00,
            BreakpointSize::Two => 0b01,
            BreakpointSize::Eight => 0b10,
            BreakpointSize::Four => 0b11,
        }
    }

    pub fn from_byte_len(len: u8) -> Result<Self> {
        Ok(match len {
            1 => BreakpointSize::One,
            2 => BreakpointSize::Two,
            4 => BreakpointSize::Four,
            8 => BreakpointSize::Eight,
            _ => return Err(Error::ParseError(format!("unsupported breakpoint size {}", len))),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HwSlot {
    pub in_use: bool,
    pub watched_address: u64,
    pub kind: BreakpointKind,
    pub size: BreakpointSize,
}

impl Default for HwSlot {
    fn default() -> Self {
        Self {
            in_use: false,
            watched_address: 0,
            kind: BreakpointKind::Execute,
            size: BreakpointSize::One,
        }
    }
}

/// Offset of debug register `n` (0..=7) within `struct user`, as used by
/// `PTRACE_PEEKUSER`/`PTRACE_POKEUSER`.
fn dr_offset(n: u8) -> usize {
    offset_of!(libc::user, u_debugreg) + (n as usize) * std::mem::size_of::<libc::c_long>()
}

fn peek_user(pid: Pid, offset: usize) -> Result<i64> {
    use nix::errno::Errno;

    Errno::clear();
    let value = unsafe { libc::ptrace(libc::PTRACE_PEEKUSER, pid.as_raw(), offset as *mut libc::c_void, 0) };
    if value == -1 && Errno::last() != Errno::UnknownErrno {
        if Errno::last() == Errno::EPERM {
            return Err(Error::Permission);
        }
        return Err(Error::Ptrace(nix::Error::from(Errno::last())));
    }
    Ok(value as i64)
}

fn poke_user(pid: Pid, offset: usize, value: i64) -> Result<()> {
    use nix::errno::Errno;

    Errno::clear();
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            offset as *mut libc::c_void,
            value as *mut libc::c_void,
        )
    };
    if rc == -1 && Errno::last() != Errno::UnknownErrno {
        if Errno::last() == Errno::EPERM {
            return Err(Error::Permission);
        }
        return Err(Error::Ptrace(nix::Error::from(Errno::last())));
    }
    Ok(())
}

/// The four-slot DR0–DR3/DR7 table. Owned exclusively by the tracker thread
/// for the duration of a tracking session.
#[derive(Debug, Default)]
pub struct HwSlotTable {
    slots: [HwSlot; MAX_SLOTS],
}

impl HwSlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use)
    }

    /// Picks the lowest free slot, pokes DR0-3 and DR7, and marks it in use.
    pub fn set(&mut self, pid: Pid, address: u64, kind: BreakpointKind, size: BreakpointSize) -> Result<usize> {
        let slot = self.free_slot().ok_or(Error::SlotExhausted)?;

        poke_user(pid, dr_offset(slot as u8), address as i64)?;

        let mut dr7 = peek_user(pid, dr_offset(7))? as u64;
        dr7 |= 1 << (slot * 2);

        let cond_bits = 16 + slot * 4;
        dr7 &= !(0b11u64 << cond_bits);
        dr7 |= kind.condition_bits() << cond_bits;

        let len_bits = 18 + slot * 4;
        dr7 &= !(0b11u64 << len_bits);
        dr7 |= size.length_bits() << len_bits;

        poke_user(pid, dr_offset(7), dr7 as i64)?;

        self.slots[slot] = HwSlot {
            in_use: true,
            watched_address: address,
            kind,
            size,
        };

        Ok(slot)
    }

    /// Zeroes the address register and the two-bit enable field for `slot`.
    pub fn clear(&mut self, pid: Pid, slot: usize) -> Result<()> {
        if slot >= MAX_SLOTS || !self.slots[slot].in_use {
            return Ok(());
        }

        poke_user(pid, dr_offset(slot as u8), 0)?;

        let mut dr7 = peek_user(pid, dr_offset(7))? as u64;
        dr7 &= !(1 << (slot * 2));
        poke_user(pid, dr_offset(7), dr7 as i64)?;

        self.slots[slot] = HwSlot::default();
        Ok(())
    }

    pub fn clear_all(&mut self, pid: Pid) -> Result<()> {
        for slot in 0..MAX_SLOTS {
            self.clear(pid, slot)?;
        }
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Option<&HwSlot> {
        self.slots.get(slot).filter(|s| s.in_use)
    }

    /// Reads DR6 and returns the lowest-numbered slot whose status bit
    /// fired, if any.
    pub fn triggered_slot(&self, pid: Pid) -> Result<Option<usize>> {
        let dr6 = peek_user(pid, dr_offset(6))? as u64;
        Ok((0..MAX_SLOTS).find(|&i| dr6 & (1 << i) != 0))
    }

    /// Clears DR6 after the caller has handled the trap.
    pub fn clear_status(&self, pid: Pid) -> Result<()> {
        poke_user(pid, dr_offset(6), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_kind_condition_bits_match_intel_encoding() {
        assert_eq!(BreakpointKind::Execute.condition_bits(), 0b00);
        assert_eq!(BreakpointKind::Write.condition_bits(), 0b01);
        assert_eq!(BreakpointKind::IoReadWrite.condition_bits(), 0b10);
        assert_eq!(BreakpointKind::ReadWrite.condition_bits(), 0b11);
    }

    #[test]
    fn breakpoint_size_length_bits_match_intel_encoding() {
        assert_eq!(BreakpointSize::One.length_bits(), 0b00);
        assert_eq!(BreakpointSize::Two.length_bits(), 0b01);
        assert_eq!(BreakpointSize::Eight.length_bits(), 0b10);
        assert_eq!(BreakpointSize::Four.length_bits(), 0b11);
    }

    #[test]
    fn from_byte_len_rejects_unsupported_widths() {
        assert!(BreakpointSize::from_byte_len(3).is_err());
        assert!(BreakpointSize::from_byte_len(4).is_ok());
    }

    #[test]
    fn dr_offsets_are_monotonically_increasing() {
        for n in 0..7 {
            assert!(dr_offset(n) < dr_offset(n + 1));
        }
    }

    #[test]
    fn free_slot_table_reports_no_triggered_slot_logic_without_pid() {
        let table = HwSlotTable::new();
        assert!(table.slot(0).is_none());
        assert_eq!(table.free_slot(), Some(0));
    }
}
