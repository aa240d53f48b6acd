//! Entries: ordered blob sequences with metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blob::BlobId;
use super::InvalidIdentifier;

const TICK_DIGITS: usize = 16;
const NODE_DIGITS: usize = 8;

/// Sortable entry identifier: 16 hex digits of a monotonic microsecond tick
/// followed by 8 hex digits identifying the generator that issued it.
///
/// Lexicographic order equals issue order for ids from one generator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Issue time recovered from the tick. A bumped tick may run a few
    /// microseconds ahead of the wall clock.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let micros = u64::from_str_radix(&self.0[..TICK_DIGITS], 16).ok()?;
        DateTime::from_timestamp_micros(i64::try_from(micros).ok()?)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == TICK_DIGITS + NODE_DIGITS
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidIdentifier::Entry(s.to_string()))
        }
    }
}

impl TryFrom<String> for EntryId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

/// Issues strictly increasing [`EntryId`]s without locking.
///
/// Within one generator ids never repeat: when the clock has not advanced
/// (or went backwards) the tick is bumped past the last one issued. Two
/// generators collide only if they issue the same tick and drew the same
/// 32-bit node suffix.
#[derive(Debug)]
pub struct EntryIdGenerator {
    last_tick: AtomicU64,
    node: u32,
}

impl Default for EntryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        let node = (uuid::Uuid::new_v4().as_u128() & u128::from(u32::MAX)) as u32;
        Self::with_node(node)
    }

    /// Generator with a fixed node suffix
    pub fn with_node(node: u32) -> Self {
        Self {
            last_tick: AtomicU64::new(0),
            node,
        }
    }

    pub fn next_id(&self) -> EntryId {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();
        let mut last = self.last_tick.load(Ordering::Relaxed);
        let tick = loop {
            let candidate = now.max(last + 1);
            match self.last_tick.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(observed) => last = observed,
            }
        };
        EntryId(format!(
            "{:0tw$x}{:0nw$x}",
            tick,
            self.node,
            tw = TICK_DIGITS,
            nw = NODE_DIGITS
        ))
    }
}

/// Attribute map and tag set attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl EntryMetadata {
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Everything needed to create an entry; the id is assigned by the library
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub metadata: EntryMetadata,
    pub blob_sequence: Vec<BlobId>,
}

/// A committed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: EntryId,
    pub metadata: EntryMetadata,
    pub blob_sequence: Vec<BlobId>,
}

impl Entry {
    pub fn from_spec(entry_id: EntryId, spec: EntrySpec) -> Self {
        Self {
            entry_id,
            metadata: spec.metadata,
            blob_sequence: spec.blob_sequence,
        }
    }
}
