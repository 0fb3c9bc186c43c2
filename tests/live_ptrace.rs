//! Live-process integration tests. Each of these actually attaches via
//! `ptrace` to a spawned child and so needs `CAP_SYS_PTRACE`/root and a
//! single-tracer process (the kernel allows only one tracer per tracee) —
//! they're marked `#[ignore]` and meant to be run explicitly:
//!
//!     sudo cargo test -- --ignored --test-threads=1
//!
//! Single-threaded because `PatchManager`'s patch table is a process-wide
//! singleton shared by every `Engine` in this binary.

use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use spawn_ptrace::CommandPtraceSpawn;

use memhook::hwbreak::{BreakpointKind, BreakpointSize};
use memhook::scanner::{ScanKind, ScanValue, ValueType};
use memhook::Engine;

fn spawn_sleeper() -> std::process::Child {
    Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn_ptrace()
        .expect("failed to spawn traced child")
}

#[test]
#[ignore]
fn attach_and_detach_round_trip() {
    let child = spawn_sleeper();
    let engine = Engine::new();

    engine.attach(child.id() as i32).expect("attach should succeed");
    assert!(engine.process().is_attached());

    engine.detach();
    assert!(!engine.process().is_attached());
}

#[test]
#[ignore]
fn scan_then_next_scan_narrows_to_a_known_value() {
    let child = spawn_sleeper();
    let engine = Engine::new();
    engine.attach(child.id() as i32).unwrap();

    engine.scanner().new_scan(ValueType::I32, ScanKind::Unknown).unwrap();
    while engine.scanner().is_running() {
        thread::sleep(Duration::from_millis(20));
    }
    let first_pass = engine.scanner().candidates().len();
    assert!(first_pass > 0, "expected at least one readable i32-aligned candidate");

    engine.scanner().next_scan(ScanKind::Unchanged).unwrap();
    while engine.scanner().is_running() {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(engine.scanner().candidates().len() <= first_pass);

    engine.detach();
}

#[test]
#[ignore]
fn hardware_watch_records_an_access() {
    let child = spawn_sleeper();
    let engine = Engine::new();
    engine.attach(child.id() as i32).unwrap();

    let base = engine.process().base_address().expect("expected a base address");
    engine
        .track_address(base, BreakpointKind::Execute, BreakpointSize::One)
        .expect("should arm a hardware breakpoint");

    thread::sleep(Duration::from_millis(500));
    engine.stop_tracking().unwrap();

    engine.detach();
}

#[test]
#[ignore]
fn nop_patch_then_restore_round_trips_bytes() {
    let child = spawn_sleeper();
    let engine = Engine::new();
    engine.attach(child.id() as i32).unwrap();

    let base = engine.process().base_address().expect("expected a base address");
    let before = engine.memio().read(base, 8).unwrap();

    engine.nop(base, "test nop").expect("nop patch should succeed");
    assert!(engine.patches().is_patched(base));

    engine.restore_patch(base).expect("restore should succeed");
    let after = engine.memio().read(base, 8).unwrap();
    assert_eq!(before, after);

    engine.detach();
}

#[test]
#[ignore]
fn double_patch_at_the_same_address_is_rejected() {
    let child = spawn_sleeper();
    let engine = Engine::new();
    engine.attach(child.id() as i32).unwrap();

    let base = engine.process().base_address().unwrap();
    engine.nop(base, "first").unwrap();
    assert!(engine.nop(base, "second").is_err());

    engine.restore_patch(base).unwrap();
    engine.detach();
}

#[test]
#[ignore]
fn aob_scan_finds_the_elf_magic_bytes() {
    let child = spawn_sleeper();
    let engine = Engine::new();
    engine.attach(child.id() as i32).unwrap();

    engine.scanner().new_aob_scan("7F 45 4C 46").expect("aob scan should start");
    while engine.scanner().is_running() {
        thread::sleep(Duration::from_millis(20));
    }
    let hits = engine.scanner().candidates();
    assert!(!hits.is_empty(), "expected to find the ELF magic in the tracee's own image");

    engine.detach();
}
