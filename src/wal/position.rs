//! Commit positions: opaque progress tokens for the upstream source.
//!
//! A position is either a replication LSN or a Kafka coordinate, depending on
//! which listener produced the event. Ordering is only defined within a
//! variant; bus positions from different partitions are incomparable and must
//! never be folded into a single checkpoint.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A PostgreSQL log sequence number: a 64-bit monotonic position in the WAL
/// with the canonical `X/XXXXXXXX` two-group hex string form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;
        if hi.is_empty() || lo.is_empty() || lo.contains('/') {
            return Err(Error::InvalidLsn(s.to_string()));
        }
        let hi = u64::from_str_radix(hi, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(Error::InvalidLsn(s.to_string()));
        }
        Ok(Lsn(hi << 32 | lo))
    }
}

/// Where an event came from, and therefore what "progress" means for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitPosition {
    Wal(Lsn),
    Bus {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl CommitPosition {
    pub fn wal(lsn: Lsn) -> Self {
        CommitPosition::Wal(lsn)
    }

    pub fn bus(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        CommitPosition::Bus {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CommitPosition::Wal(lsn) => lsn.is_zero(),
            CommitPosition::Bus { topic, .. } => topic.is_empty(),
        }
    }

    pub fn as_lsn(&self) -> Option<Lsn> {
        match self {
            CommitPosition::Wal(lsn) => Some(*lsn),
            CommitPosition::Bus { .. } => None,
        }
    }
}

impl fmt::Display for CommitPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitPosition::Wal(lsn) => lsn.fmt(f),
            CommitPosition::Bus {
                topic,
                partition,
                offset,
            } => write!(f, "{topic}/{partition}/{offset}"),
        }
    }
}

impl PartialOrd for CommitPosition {
    /// Ordering is defined within a variant only. Bus positions additionally
    /// require the same topic and partition; anything else is incomparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (CommitPosition::Wal(a), CommitPosition::Wal(b)) => a.partial_cmp(b),
            (
                CommitPosition::Bus {
                    topic: t1,
                    partition: p1,
                    offset: o1,
                },
                CommitPosition::Bus {
                    topic: t2,
                    partition: p2,
                    offset: o2,
                },
            ) => {
                if t1 == t2 && p1 == p2 {
                    o1.partial_cmp(o2)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
