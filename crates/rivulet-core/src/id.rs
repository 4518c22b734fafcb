//! Stream entry identifiers
//!
//! A [`StreamId`] is the composite `(ms, seq)` key of a stream entry. Ids
//! compare lexicographically by their numeric parts and render as
//! `"<ms>-<seq>"`, the textual form external inspection tooling expects.
//!
//! Backward pagination depends on [`StreamId::predecessor`] being exact: the
//! predecessor of `(T, 0)` is `(T - 1, MAX_SEQUENCE)`, so feeding the
//! predecessor of the last id seen back in as the next upper bound never
//! skips or repeats an entry.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StreamError, StreamResult};

/// Largest sequence number within a single millisecond
pub const MAX_SEQUENCE: u64 = u64::MAX;

/// Identifier of a stream entry
///
/// Field order matters: the derived `Ord` compares `ms` first, then `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    /// Millisecond timestamp part
    pub ms: u64,
    /// Sequence within the millisecond
    pub seq: u64,
}

impl StreamId {
    /// The smallest possible id, `0-0`. Never assigned to an entry.
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

    /// The largest possible id
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: MAX_SEQUENCE,
    };

    /// Create a new id
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The next id in order, or `None` for [`StreamId::MAX`]
    pub fn successor(&self) -> Option<StreamId> {
        if self.seq < MAX_SEQUENCE {
            Some(Self::new(self.ms, self.seq + 1))
        } else if self.ms < u64::MAX {
            Some(Self::new(self.ms + 1, 0))
        } else {
            None
        }
    }

    /// The previous id in order, or `None` for [`StreamId::MIN`]
    pub fn predecessor(&self) -> Option<StreamId> {
        if self.seq > 0 {
            Some(Self::new(self.ms, self.seq - 1))
        } else if self.ms > 0 {
            Some(Self::new(self.ms - 1, MAX_SEQUENCE))
        } else {
            None
        }
    }

    /// Whether this is `0-0`
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    /// Parse a range start bound.
    ///
    /// Accepts `-` (MIN), `+` (MAX), `<ms>` (sequence 0), `<ms>-<seq>`, and an
    /// exclusive form prefixed with `(`.
    pub fn parse_start(s: &str) -> StreamResult<StreamId> {
        match s {
            "-" => Ok(Self::MIN),
            "+" => Ok(Self::MAX),
            _ => match s.strip_prefix('(') {
                Some(inner) => parse_with_default(inner, 0)?
                    .successor()
                    .ok_or_else(|| StreamError::InvalidId(s.to_string())),
                None => parse_with_default(s, 0),
            },
        }
    }

    /// Parse a range end bound.
    ///
    /// Same forms as [`StreamId::parse_start`], but a bare `<ms>` covers the
    /// whole millisecond (`<ms>-MAX_SEQUENCE`).
    pub fn parse_end(s: &str) -> StreamResult<StreamId> {
        match s {
            "-" => Ok(Self::MIN),
            "+" => Ok(Self::MAX),
            _ => match s.strip_prefix('(') {
                Some(inner) => parse_with_default(inner, MAX_SEQUENCE)?
                    .predecessor()
                    .ok_or_else(|| StreamError::InvalidId(s.to_string())),
                None => parse_with_default(s, MAX_SEQUENCE),
            },
        }
    }
}

fn parse_part(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn parse_with_default(s: &str, default_seq: u64) -> StreamResult<StreamId> {
    let invalid = || StreamError::InvalidId(s.to_string());
    match s.split_once('-') {
        Some((ms, seq)) => Ok(StreamId::new(
            parse_part(ms).ok_or_else(invalid)?,
            parse_part(seq).ok_or_else(invalid)?,
        )),
        None => Ok(StreamId::new(parse_part(s).ok_or_else(invalid)?, default_seq)),
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_with_default(s, 0)
    }
}

// Textual form for human-readable formats (JSON, TOML), a plain tuple for
// compact binary formats such as the journal's postcard encoding.
impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            (self.ms, self.seq).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let (ms, seq) = <(u64, u64)>::deserialize(deserializer)?;
            Ok(Self::new(ms, seq))
        }
    }
}

/// How an append chooses the id of the new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdSpec {
    /// Clock-driven id, `*`
    #[default]
    Auto,
    /// Fixed millisecond with an auto-assigned sequence, `<ms>-*`
    Partial(u64),
    /// Caller-chosen id; must be greater than the stream's last id
    Explicit(StreamId),
}

impl FromStr for IdSpec {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Auto);
        }
        if let Some(ms) = s.strip_suffix("-*") {
            return parse_part(ms)
                .map(Self::Partial)
                .ok_or_else(|| StreamError::InvalidId(s.to_string()));
        }
        s.parse().map(Self::Explicit)
    }
}

impl Display for IdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "*"),
            Self::Partial(ms) => write!(f, "{}-*", ms),
            Self::Explicit(id) => write!(f, "{}", id),
        }
    }
}

impl From<StreamId> for IdSpec {
    fn from(id: StreamId) -> Self {
        Self::Explicit(id)
    }
}
