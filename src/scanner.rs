//! Streaming value scanner over a process's readable memory regions. A scan
//! runs on a background `std::thread` so a caller can poll its progress,
//! matching the concurrency model the rest of this crate uses (plain
//! threads, atomics, no async runtime).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use serde::Serialize;

use crate::aob;
use crate::error::{Error, Result};
use crate::memio::MemoryIO;
use crate::process::{ProcessHandle, SuspensionGuard};
use crate::region::{Perms, RegionMap};

/// Absolute tolerance used when comparing `F32`/`F64` candidates, since a
/// process's own floating-point arithmetic rarely reproduces a literal
/// bit-exactly.
const FLOAT_TOLERANCE: f64 = 1e-3;

/// The width/representation a scan operates over. `String`/`ByteArray` carry
/// their length in bytes since, unlike the numeric variants, it isn't fixed
/// by the type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String(usize),
    ByteArray(usize),
}

impl ValueType {
    fn byte_len(self) -> usize {
        match self {
            ValueType::I8 | ValueType::U8 => 1,
            ValueType::I16 | ValueType::U16 => 2,
            ValueType::I32 | ValueType::U32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::U64 | ValueType::F64 => 8,
            ValueType::String(len) | ValueType::ByteArray(len) => len,
        }
    }

    /// How far a scan's address cursor advances between reads. Numeric types
    /// step by their own width (values are naturally aligned to it); a byte
    /// pattern can start at any offset, so it steps by one.
    fn scan_stride(self) -> usize {
        match self {
            ValueType::String(_) | ValueType::ByteArray(_) => 1,
            other => other.byte_len(),
        }
    }

    fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

/// A decoded value, tagged with the type it was read as. Numeric widths
/// decode to their own variant; `String`/`ByteArray` both decode to `Bytes`,
/// since what distinguishes them is only how `ScanKind::Unknown` judges a
/// first-pass hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
}

macro_rules! decode_numeric {
    ($ty:expr, $bytes:expr, $($variant:ident => $prim:ty),+ $(,)?) => {
        match $ty {
            $(ValueType::$variant => {
                let arr: [u8; std::mem::size_of::<$prim>()] = $bytes.try_into().ok()?;
                Some(ScanValue::$variant(<$prim>::from_ne_bytes(arr)))
            })+
            _ => None,
        }
    };
}

fn decode_numeric(value_type: ValueType, bytes: &[u8]) -> Option<ScanValue> {
    decode_numeric!(value_type, bytes,
        I8 => i8, U8 => u8, I16 => i16, U16 => u16,
        I32 => i32, U32 => u32, I64 => i64, U64 => u64,
        F32 => f32, F64 => f64,
    )
}

fn decode(value_type: ValueType, bytes: &[u8]) -> Option<ScanValue> {
    match value_type {
        ValueType::String(_) | ValueType::ByteArray(_) => Some(ScanValue::Bytes(bytes.to_vec())),
        other => decode_numeric(other, bytes),
    }
}

impl ScanValue {
    fn as_f64(&self) -> f64 {
        match self {
            ScanValue::I8(v) => *v as f64,
            ScanValue::U8(v) => *v as f64,
            ScanValue::I16(v) => *v as f64,
            ScanValue::U16(v) => *v as f64,
            ScanValue::I32(v) => *v as f64,
            ScanValue::U32(v) => *v as f64,
            ScanValue::I64(v) => *v as f64,
            ScanValue::U64(v) => *v as f64,
            ScanValue::F32(v) => *v as f64,
            ScanValue::F64(v) => *v,
            ScanValue::Bytes(_) => 0.0,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScanValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// The comparison a scan pass applies: the first six compare against a
/// supplied literal, the rest (`Changed`/`Unchanged`/`Unknown`) only make
/// sense on a `next_scan` against a prior candidate. `EqualBytes` is the
/// byte-array/string counterpart of `Equal`, mask-aware so an AOB wildcard
/// position matches anything.
#[derive(Debug, Clone)]
pub enum ScanKind {
    Equal(ScanValue),
    Bigger(ScanValue),
    Smaller(ScanValue),
    Range(ScanValue, ScanValue),
    Increased,
    IncreasedBy(ScanValue),
    Decreased,
    DecreasedBy(ScanValue),
    Changed,
    Unchanged,
    Unknown,
    EqualBytes { pattern: Vec<u8>, mask: Vec<bool> },
}

/// True if `kind` requires a previous candidate value to evaluate (i.e.
/// cannot be used as the first scan in a session).
fn requires_baseline(kind: &ScanKind) -> bool {
    matches!(
        kind,
        ScanKind::Increased
            | ScanKind::IncreasedBy(_)
            | ScanKind::Decreased
            | ScanKind::DecreasedBy(_)
            | ScanKind::Changed
            | ScanKind::Unchanged
    )
}

/// True if `a` and `b` should be considered equal for `value_type`: exact
/// for everything but floats, which get an absolute tolerance.
fn approx_eq(a: f64, b: f64, value_type: ValueType) -> bool {
    if value_type.is_float() {
        (a - b).abs() <= FLOAT_TOLERANCE
    } else {
        a == b
    }
}

fn matches_numeric(kind: &ScanKind, previous: Option<&ScanValue>, current: &ScanValue, value_type: ValueType) -> bool {
    let cur = current.as_f64();
    match kind {
        ScanKind::Equal(v) => approx_eq(cur, v.as_f64(), value_type),
        ScanKind::Bigger(v) => cur > v.as_f64(),
        ScanKind::Smaller(v) => cur < v.as_f64(),
        ScanKind::Range(lo, hi) => {
            let (lo, hi) = (lo.as_f64(), hi.as_f64());
            if value_type.is_float() {
                cur >= lo - FLOAT_TOLERANCE && cur <= hi + FLOAT_TOLERANCE
            } else {
                cur >= lo && cur <= hi
            }
        }
        ScanKind::Increased => previous.map_or(false, |p| cur > p.as_f64()),
        ScanKind::IncreasedBy(v) => previous.map_or(false, |p| approx_eq(cur, p.as_f64() + v.as_f64(), value_type)),
        ScanKind::Decreased => previous.map_or(false, |p| cur < p.as_f64()),
        ScanKind::DecreasedBy(v) => previous.map_or(false, |p| approx_eq(cur, p.as_f64() - v.as_f64(), value_type)),
        ScanKind::Changed => previous.map_or(false, |p| !approx_eq(cur, p.as_f64(), value_type)),
        ScanKind::Unchanged => previous.map_or(false, |p| approx_eq(cur, p.as_f64(), value_type)),
        ScanKind::Unknown => true,
        ScanKind::EqualBytes { .. } => false,
    }
}

/// True if every byte of `haystack` agrees with `pattern` at mask positions
/// marked `true`; a `false` mask position (a wildcard) matches anything.
fn bytes_match_masked(pattern: &[u8], mask: &[bool], haystack: &[u8]) -> bool {
    pattern.len() == haystack.len()
        && pattern
            .iter()
            .zip(mask.iter())
            .zip(haystack.iter())
            .all(|((p, keep), h)| !keep || p == h)
}

fn matches_bytes(kind: &ScanKind, previous: Option<&ScanValue>, current: &ScanValue, value_type: ValueType) -> bool {
    let cur = match current.as_bytes() {
        Some(b) => b,
        None => return false,
    };
    match kind {
        ScanKind::EqualBytes { pattern, mask } => bytes_match_masked(pattern, mask, cur),
        ScanKind::Unknown => match value_type {
            // First-pass heuristic: a "string" candidate is one whose first
            // two bytes look like printable ASCII.
            ValueType::String(_) => cur.iter().take(2).all(|&b| (0x20..=0x7e).contains(&b)),
            _ => true,
        },
        ScanKind::Changed => previous.and_then(ScanValue::as_bytes).map_or(false, |p| p != cur),
        ScanKind::Unchanged => previous.and_then(ScanValue::as_bytes).map_or(false, |p| p == cur),
        _ => false,
    }
}

/// Dispatches to the byte-pattern or numeric comparison depending on
/// `value_type`, the single entry point both `new_scan` and `next_scan` use.
fn matches(kind: &ScanKind, previous: Option<&ScanValue>, current: &ScanValue, value_type: ValueType) -> bool {
    match value_type {
        ValueType::String(_) | ValueType::ByteArray(_) => matches_bytes(kind, previous, current, value_type),
        _ => matches_numeric(kind, previous, current, value_type),
    }
}

/// One surviving hit: its address and the value last observed there.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub address: u64,
    pub value: ScanValue,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanProgress {
    pub bytes_scanned: u64,
    pub bytes_total: u64,
    pub candidates_found: u64,
}

struct Inner {
    process: ProcessHandle,
    memio: MemoryIO,
    value_type: Mutex<Option<ValueType>>,
    candidates: RwLock<Vec<Candidate>>,
    bytes_scanned: AtomicU64,
    bytes_total: AtomicU64,
    running: AtomicBool,
    cancel: AtomicBool,
}

/// A cheaply-cloneable handle to one scan session against one process.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<Inner>,
}

impl Scanner {
    pub fn new(process: ProcessHandle, memio: MemoryIO) -> Self {
        Self {
            inner: Arc::new(Inner {
                process,
                memio,
                value_type: Mutex::new(None),
                candidates: RwLock::new(Vec::new()),
                bytes_scanned: AtomicU64::new(0),
                bytes_total: AtomicU64::new(0),
                running: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            bytes_scanned: self.inner.bytes_scanned.load(Ordering::SeqCst),
            bytes_total: self.inner.bytes_total.load(Ordering::SeqCst),
            candidates_found: self.inner.candidates.read().unwrap().len() as u64,
        }
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.inner.candidates.read().unwrap().clone()
    }

    pub fn cancel_scan(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Drops every candidate and forgets the scan's value type, ready for a
    /// fresh `new_scan`.
    pub fn reset(&self) {
        self.inner.candidates.write().unwrap().clear();
        *self.inner.value_type.lock().unwrap() = None;
        self.inner.bytes_scanned.store(0, Ordering::SeqCst);
        self.inner.bytes_total.store(0, Ordering::SeqCst);
    }

    /// Starts a first-pass scan over every readable region, spawning a
    /// background thread and returning once it has started. Regions only
    /// need to be readable, not writable, since an AOB/byte-array signature
    /// may live in read-only mapped code or rodata.
    pub fn new_scan(&self, value_type: ValueType, kind: ScanKind) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        if requires_baseline(&kind) {
            return Err(Error::NoBaseline);
        }

        let pid = self.inner.process.require_pid()?;
        let regions = RegionMap::new().with_must_have(Perms::READ).parse(pid)?;

        *self.inner.value_type.lock().unwrap() = Some(value_type);
        self.inner.candidates.write().unwrap().clear();
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.bytes_scanned.store(0, Ordering::SeqCst);
        self.inner
            .bytes_total
            .store(regions.iter().map(|r| r.size()).sum(), Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let width = value_type.byte_len();
        let stride = value_type.scan_stride();

        thread::spawn(move || {
            let _guard = SuspensionGuard::new(&inner.process, true);
            let mut found = Vec::new();

            'regions: for region in regions {
                let mut offset = 0u64;
                while offset + width as u64 <= region.size() {
                    if inner.cancel.load(Ordering::SeqCst) {
                        break 'regions;
                    }

                    let address = region.start + offset;
                    if let Ok(bytes) = inner.memio.read(address, width) {
                        if let Some(value) = decode(value_type, &bytes) {
                            if matches(&kind, None, &value, value_type) {
                                found.push(Candidate { address, value });
                            }
                        }
                    }

                    offset += stride as u64;
                    inner.bytes_scanned.fetch_add(stride as u64, Ordering::SeqCst);
                }
            }

            *inner.candidates.write().unwrap() = found;
            inner.running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Re-reads every surviving candidate and filters by `kind`, using each
    /// candidate's previously observed value as the differential baseline.
    pub fn next_scan(&self, kind: ScanKind) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let value_type = self.inner.value_type.lock().unwrap().ok_or(Error::NoBaseline)?;
        self.inner.process.require_pid()?;

        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let width = value_type.byte_len();

        thread::spawn(move || {
            let _guard = SuspensionGuard::new(&inner.process, true);
            let previous = inner.candidates.read().unwrap().clone();
            inner.bytes_total.store((previous.len() * width) as u64, Ordering::SeqCst);
            inner.bytes_scanned.store(0, Ordering::SeqCst);

            let mut survivors = Vec::new();
            for candidate in previous {
                if inner.cancel.load(Ordering::SeqCst) {
                    break;
                }

                if let Ok(bytes) = inner.memio.read(candidate.address, width) {
                    if let Some(value) = decode(value_type, &bytes) {
                        if matches(&kind, Some(&candidate.value), &value, value_type) {
                            survivors.push(Candidate {
                                address: candidate.address,
                                value,
                            });
                        }
                    }
                }

                inner.bytes_scanned.fetch_add(width as u64, Ordering::SeqCst);
            }

            *inner.candidates.write().unwrap() = survivors;
            inner.running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Starts a first-pass scan for a wildcard AOB signature, routed through
    /// the same `new_scan` pipeline as a numeric scan: the pattern becomes a
    /// `ByteArray` value type and an `EqualBytes` kind, so the result
    /// supports `next_scan` filtering like any other candidate set.
    pub fn new_aob_scan(&self, pattern: &str) -> Result<()> {
        let tokens = aob::parse_aob(pattern)?;
        let (pattern_bytes, mask) = aob::tokens_to_pattern_and_mask(&tokens);
        let value_type = ValueType::ByteArray(pattern_bytes.len());
        self.new_scan(
            value_type,
            ScanKind::EqualBytes {
                pattern: pattern_bytes,
                mask,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_numeric_width() {
        assert_eq!(decode(ValueType::U8, &[42]), Some(ScanValue::U8(42)));
        assert_eq!(decode(ValueType::I32, &1i32.to_ne_bytes()), Some(ScanValue::I32(1)));
        assert_eq!(decode(ValueType::F64, &1.5f64.to_ne_bytes()), Some(ScanValue::F64(1.5)));
    }

    #[test]
    fn decodes_byte_array_as_bytes() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(decode(ValueType::ByteArray(4), &bytes), Some(ScanValue::Bytes(bytes.to_vec())));
    }

    #[test]
    fn equal_compares_by_value_not_representation() {
        let kind = ScanKind::Equal(ScanValue::I32(100));
        assert!(matches_numeric(&kind, None, &ScanValue::I32(100), ValueType::I32));
        assert!(!matches_numeric(&kind, None, &ScanValue::I32(101), ValueType::I32));
    }

    #[test]
    fn equal_on_floats_tolerates_small_drift() {
        let kind = ScanKind::Equal(ScanValue::F32(1.0));
        assert!(matches_numeric(&kind, None, &ScanValue::F32(1.0 + 1e-5), ValueType::F32));
        assert!(!matches_numeric(&kind, None, &ScanValue::F32(1.1), ValueType::F32));
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let kind = ScanKind::Range(ScanValue::I32(10), ScanValue::I32(20));
        assert!(matches_numeric(&kind, None, &ScanValue::I32(10), ValueType::I32));
        assert!(matches_numeric(&kind, None, &ScanValue::I32(20), ValueType::I32));
        assert!(!matches_numeric(&kind, None, &ScanValue::I32(21), ValueType::I32));
    }

    #[test]
    fn increased_by_requires_exact_delta_from_baseline() {
        let kind = ScanKind::IncreasedBy(ScanValue::I32(5));
        assert!(matches_numeric(&kind, Some(&ScanValue::I32(10)), &ScanValue::I32(15), ValueType::I32));
        assert!(!matches_numeric(&kind, Some(&ScanValue::I32(10)), &ScanValue::I32(16), ValueType::I32));
    }

    #[test]
    fn differential_kinds_without_baseline_never_match() {
        assert!(!matches_numeric(&ScanKind::Changed, None, &ScanValue::I32(1), ValueType::I32));
        assert!(!matches_numeric(&ScanKind::Increased, None, &ScanValue::I32(1), ValueType::I32));
    }

    #[test]
    fn requires_baseline_flags_only_differential_kinds() {
        assert!(requires_baseline(&ScanKind::Increased));
        assert!(requires_baseline(&ScanKind::Changed));
        assert!(!requires_baseline(&ScanKind::Equal(ScanValue::I32(0))));
        assert!(!requires_baseline(&ScanKind::Unknown));
    }

    #[test]
    fn equal_bytes_respects_wildcard_mask() {
        let kind = ScanKind::EqualBytes {
            pattern: vec![0xAA, 0x00, 0xCC],
            mask: vec![true, false, true],
        };
        let hit = ScanValue::Bytes(vec![0xAA, 0xFF, 0xCC]);
        let miss = ScanValue::Bytes(vec![0xAA, 0xFF, 0xCD]);
        assert!(matches_bytes(&kind, None, &hit, ValueType::ByteArray(3)));
        assert!(!matches_bytes(&kind, None, &miss, ValueType::ByteArray(3)));
    }

    #[test]
    fn unknown_string_heuristic_requires_printable_prefix() {
        let printable = ScanValue::Bytes(b"hi there".to_vec());
        let binary = ScanValue::Bytes(vec![0x00, 0x01, 0x02]);
        assert!(matches_bytes(&ScanKind::Unknown, None, &printable, ValueType::String(8)));
        assert!(!matches_bytes(&ScanKind::Unknown, None, &binary, ValueType::String(3)));
    }

    #[test]
    fn byte_array_stride_is_one_regardless_of_width() {
        assert_eq!(ValueType::ByteArray(4).scan_stride(), 1);
        assert_eq!(ValueType::I32.scan_stride(), 4);
    }

    #[test]
    fn new_scan_on_detached_process_errors() {
        let process = ProcessHandle::new();
        let memio = MemoryIO::new(process.clone(), crate::memio::new_tracker_handle());
        let scanner = Scanner::new(process, memio);
        let err = scanner.new_scan(ValueType::I32, ScanKind::Equal(ScanValue::I32(1))).unwrap_err();
        assert!(matches!(err, Error::Detached));
    }

    #[test]
    fn new_scan_rejects_differential_kind_with_no_baseline() {
        let process = ProcessHandle::new();
        let memio = MemoryIO::new(process.clone(), crate::memio::new_tracker_handle());
        let scanner = Scanner::new(process, memio);
        let err = scanner.new_scan(ValueType::I32, ScanKind::Changed).unwrap_err();
        assert!(matches!(err, Error::NoBaseline));
    }

    #[test]
    fn new_aob_scan_on_detached_process_errors() {
        let process = ProcessHandle::new();
        let memio = MemoryIO::new(process.clone(), crate::memio::new_tracker_handle());
        let scanner = Scanner::new(process, memio);
        let err = scanner.new_aob_scan("48 8B ?? 00").unwrap_err();
        assert!(matches!(err, Error::Detached));
    }
}
