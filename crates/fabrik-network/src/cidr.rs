//! IPv4 CIDR blocks and address ranges.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{NetworkError, NetworkResult};

/// An IPv4 block. Host bits of the parsed address are masked off, so
/// `127.0.0.1/25` and `127.0.0.0/25` denote the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> NetworkResult<Self> {
        if prefix > 32 {
            return Err(NetworkError::InvalidCidr(format!("{addr}/{prefix}")));
        }
        Ok(Self {
            network: u32::from(addr) & mask(prefix),
            prefix,
        })
    }

    pub fn parse(s: &str) -> NetworkResult<Self> {
        s.parse()
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last())
    }

    /// Number of addresses in the block, network and broadcast included.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Addresses strictly between network and broadcast.
    pub fn host_count(&self) -> u64 {
        self.size().saturating_sub(2)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == self.network
    }

    pub fn is_host(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        self.contains(addr) && a != self.network && a != self.last()
    }

    /// Address `offset` positions after the network address, if inside the block.
    pub fn nth(&self, offset: u64) -> Option<Ipv4Addr> {
        (offset < self.size()).then(|| Ipv4Addr::from(self.network + offset as u32))
    }

    /// First and last host as raw integers; `None` for /31 and /32.
    pub(crate) fn host_bounds(&self) -> Option<(u32, u32)> {
        (self.host_count() > 0).then(|| (self.network + 1, self.last() - 1))
    }

    fn last(&self) -> u32 {
        self.network | !mask(self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Ipv4Cidr::new(addr, prefix).map_err(|_| invalid())
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive address range, rendered `a - b` (or `a` when single).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    pub(crate) fn from_raw((start, end): (u32, u32)) -> Self {
        Self {
            start: Ipv4Addr::from(start),
            end: Ipv4Addr::from(end),
        }
    }

    pub fn address_count(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{} - {}", self.start, self.end)
        }
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Range sets ─────────────────────────────────────────────────────
//
// Sorted, non-overlapping inclusive `(start, end)` pairs over raw u32
// addresses. Blocks can be large (/8), so address sets are never expanded.

pub(crate) type Ranges = Vec<(u32, u32)>;

pub(crate) fn count(ranges: &[(u32, u32)]) -> u64 {
    ranges
        .iter()
        .map(|&(s, e)| u64::from(e) - u64::from(s) + 1)
        .sum()
}

/// Remove a single address.
pub(crate) fn remove_point(ranges: &[(u32, u32)], point: u32) -> Ranges {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, e) in ranges {
        if point < s || point > e {
            out.push((s, e));
            continue;
        }
        if point > s {
            out.push((s, point - 1));
        }
        if point < e {
            out.push((point + 1, e));
        }
    }
    out
}

/// Split after the first `n` addresses: `(head, tail)`.
pub(crate) fn split_at(ranges: &[(u32, u32)], n: u64) -> (Ranges, Ranges) {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut left = n;
    for &(s, e) in ranges {
        let len = u64::from(e) - u64::from(s) + 1;
        if left == 0 {
            tail.push((s, e));
        } else if left >= len {
            head.push((s, e));
            left -= len;
        } else {
            let cut = s + left as u32;
            head.push((s, cut - 1));
            tail.push((cut, e));
            left = 0;
        }
    }
    (head, tail)
}

/// Sort and coalesce adjacent or overlapping ranges.
pub(crate) fn merge(mut ranges: Ranges) -> Ranges {
    ranges.sort_unstable();
    let mut out: Ranges = Vec::with_capacity(ranges.len());
    for (s, e) in ranges {
        match out.last_mut() {
            Some(last) if u64::from(s) <= u64::from(last.1) + 1 => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

/// `outer` minus the single range `cut`.
pub(crate) fn subtract(outer: (u32, u32), cut: Option<(u32, u32)>) -> Ranges {
    let Some((cs, ce)) = cut else {
        return vec![outer];
    };
    let (s, e) = outer;
    let mut out = Vec::new();
    if cs > s {
        out.push((s, (cs - 1).min(e)));
    }
    if ce < e {
        out.push(((ce + 1).max(s), e));
    }
    out.retain(|&(a, b)| a <= b);
    out
}

pub(crate) fn addresses(ranges: &[(u32, u32)]) -> Vec<Ipv4Addr> {
    ranges
        .iter()
        .flat_map(|&(s, e)| (s..=e).map(Ipv4Addr::from))
        .collect()
}
