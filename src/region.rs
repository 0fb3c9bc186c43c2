//! `/proc/<pid>/maps` parsing and permission filtering.

use std::fs;

use bitflags::bitflags;
use nix::unistd::Pid;
use serde::Serialize;

use crate::error::Result;

bitflags! {
    #[derive(Serialize)]
    pub struct Perms: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXEC    = 0b0100;
        const PRIVATE = 0b1000;
    }
}

/// One mapping out of `/proc/<pid>/maps`. Immutable within a scan pass; the
/// whole set is re-parsed between passes.
#[derive(Debug, Clone, Serialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub dev: (u32, u32),
    pub inode: u64,
    pub pathname: Option<String>,
}

impl Region {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parses `/proc/<pid>/maps` and retains only regions whose permission set
/// satisfies both `must_have` and `must_not_have`.
#[derive(Debug, Clone, Default)]
pub struct RegionMap {
    must_have: Perms,
    must_not_have: Perms,
}

impl RegionMap {
    pub fn new() -> Self {
        Self {
            must_have: Perms::empty(),
            must_not_have: Perms::empty(),
        }
    }

    pub fn with_must_have(mut self, perms: Perms) -> Self {
        self.must_have = perms;
        self
    }

    pub fn with_must_not_have(mut self, perms: Perms) -> Self {
        self.must_not_have = perms;
        self
    }

    /// Parse `/proc/<pid>/maps`, ignoring trailing blank lines and malformed
    /// lines, and apply the permission masks.
    pub fn parse(&self, pid: Pid) -> Result<Vec<Region>> {
        let contents = fs::read_to_string(format!("/proc/{}/maps", pid))?;

        let mut regions = Vec::new();
        for line in contents.lines() {
            if let Some(region) = parse_maps_line(line) {
                if region.perms.contains(self.must_have)
                    && !region.perms.intersects(self.must_not_have)
                {
                    regions.push(region);
                }
            }
        }

        Ok(regions)
    }

    /// True iff `addr` falls in a region whose path is the main binary
    /// (a colour-coding hint for callers, not a correctness signal).
    pub fn is_static_address(&self, pid: Pid, addr: u64) -> bool {
        let exe = match fs::read_link(format!("/proc/{}/exe", pid)) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let exe = exe.to_str().unwrap_or_default();

        let regions = match self.parse(pid) {
            Ok(r) => r,
            Err(_) => return false,
        };

        regions
            .iter()
            .any(|r| r.contains(addr) && r.pathname.as_deref() == Some(exe))
    }
}

fn parse_maps_line(line: &str) -> Option<Region> {
    // Format: `start-end perms offset dev:inode pathname`
    // e.g.    `00400000-0040b000 r-xp 00000000 08:01 131104 /usr/bin/cat`
    let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());

    let addr = fields.next()?;
    let perms_str = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let pathname = fields.next().map(str::trim).filter(|s| !s.is_empty());

    let (start_str, end_str) = addr.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;

    let (dev_major, dev_minor) = dev.split_once(':')?;
    let dev = (
        u32::from_str_radix(dev_major, 16).ok()?,
        u32::from_str_radix(dev_minor, 16).ok()?,
    );

    Some(Region {
        start,
        end,
        perms: parse_perms(perms_str),
        offset: u64::from_str_radix(offset, 16).ok()?,
        dev,
        inode: inode.parse().ok()?,
        pathname: pathname.map(str::to_string),
    })
}

fn parse_perms(s: &str) -> Perms {
    let bytes = s.as_bytes();
    let mut perms = Perms::empty();
    if bytes.first() == Some(&b'r') {
        perms |= Perms::READ;
    }
    if bytes.get(1) == Some(&b'w') {
        perms |= Perms::WRITE;
    }
    if bytes.get(2) == Some(&b'x') {
        perms |= Perms::EXEC;
    }
    if bytes.get(3) == Some(&b'p') {
        perms |= Perms::PRIVATE;
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let line = "00400000-0040b000 r-xp 00000000 08:01 131104 /usr/bin/cat";
        let region = parse_maps_line(line).unwrap();

        assert_eq!(region.start, 0x0040_0000);
        assert_eq!(region.end, 0x0040_b000);
        assert!(region.perms.contains(Perms::READ | Perms::EXEC | Perms::PRIVATE));
        assert!(!region.perms.contains(Perms::WRITE));
        assert_eq!(region.dev, (8, 1));
        assert_eq!(region.inode, 131104);
        assert_eq!(region.pathname.as_deref(), Some("/usr/bin/cat"));
    }

    #[test]
    fn parses_anonymous_mapping_without_pathname() {
        let line = "7f000000-7f001000 rw-p 00000000 00:00 0 ";
        let region = parse_maps_line(line).unwrap();
        assert_eq!(region.pathname, None);
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_maps_line("not a maps line").is_none());
        assert!(parse_maps_line("").is_none());
    }

    #[test]
    fn filters_satisfy_both_masks() {
        let map = RegionMap::new()
            .with_must_have(Perms::READ)
            .with_must_not_have(Perms::WRITE);

        let rw = Region {
            start: 0,
            end: 0x1000,
            perms: Perms::READ | Perms::WRITE,
            offset: 0,
            dev: (0, 0),
            inode: 0,
            pathname: None,
        };
        let ro = Region {
            perms: Perms::READ,
            ..rw.clone()
        };

        assert!(ro.perms.contains(map.must_have) && !ro.perms.intersects(map.must_not_have));
        assert!(!(rw.perms.contains(map.must_have) && !rw.perms.intersects(map.must_not_have)));
    }
}
