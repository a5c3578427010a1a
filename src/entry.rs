//! Keyspace `Entry` shapes: §3 of the spec.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stream entry id: (ms, seq), lexicographically ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        StreamId { ms, seq }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// One record in a stream: an id plus its fields, preserving insertion
/// order (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

/// Which typed shape an `Entry` holds. The shape is fixed at creation
/// (spec §3 invariant): a command requiring a different shape fails with
/// WRONGTYPE rather than coercing.
#[derive(Debug, Clone)]
pub enum EntryData {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Stream(Vec<StreamRecord>),
}

impl EntryData {
    pub fn type_name(&self) -> &'static str {
        match self {
            EntryData::String(_) => "string",
            EntryData::List(_) => "list",
            EntryData::Stream(_) => "stream",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub data: EntryData,
    /// Absolute expiration in unix-ms. 0 means "never".
    pub expires_at_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

impl Entry {
    pub fn new(data: EntryData, expires_at_ms: u64) -> Self {
        Entry { data, expires_at_ms }
    }

    pub fn new_string(value: Vec<u8>, expires_at_ms: u64) -> Self {
        Entry::new(EntryData::String(value), expires_at_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at_ms != 0 && now_ms() > self.expires_at_ms
    }
}
