//! Packed actor addresses
//!
//! Every addressable thing in a deployment, whether a logical object id or
//! the id of the instance currently owning it, is a single `u64`:
//!
//! ```text
//!  63            34 33          18 17            0
//! ┌────────────────┬──────────────┬───────────────┐
//! │ time (30 bits) │ process (16) │ sequence (18) │
//! └────────────────┴──────────────┴───────────────┘
//! ```
//!
//! `time` counts seconds since 2020-01-01T00:00:00Z, `process` routes the
//! address to the OS process hosting it, and `sequence` disambiguates ids
//! minted within the same second.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const TIME_BITS: u32 = 30;
const PROCESS_BITS: u32 = 16;
const SEQUENCE_BITS: u32 = 18;

/// Largest encodable time value (seconds since the epoch)
pub const MAX_TIME: u32 = (1 << TIME_BITS) - 1;
/// Largest encodable process id
pub const MAX_PROCESS: u16 = u16::MAX;
/// Largest encodable sequence value
pub const MAX_SEQUENCE: u32 = (1 << SEQUENCE_BITS) - 1;

/// Unix timestamp of 2020-01-01T00:00:00Z
const EPOCH_2020_SECS: u64 = 1_577_836_800;

/// Packed `(time, process, sequence)` address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(u64);

/// Decoded fields of an [`ActorId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorIdParts {
    pub time: u32,
    pub process: u16,
    pub sequence: u32,
}

impl ActorId {
    /// The "no address" value
    pub const ZERO: ActorId = ActorId(0);

    /// Encode an address. `time` and `sequence` are truncated to their field widths.
    pub const fn new(process: u16, time: u32, sequence: u32) -> Self {
        let time = (time & MAX_TIME) as u64;
        let sequence = (sequence & MAX_SEQUENCE) as u64;
        Self((time << (PROCESS_BITS + SEQUENCE_BITS)) | ((process as u64) << SEQUENCE_BITS) | sequence)
    }

    /// Reinterpret a raw wire value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn time(&self) -> u32 {
        (self.0 >> (PROCESS_BITS + SEQUENCE_BITS)) as u32 & MAX_TIME
    }

    pub const fn process(&self) -> u16 {
        (self.0 >> SEQUENCE_BITS) as u16
    }

    pub const fn sequence(&self) -> u32 {
        self.0 as u32 & MAX_SEQUENCE
    }

    pub const fn parts(&self) -> ActorIdParts {
        ActorIdParts {
            time: self.time(),
            process: self.process(),
            sequence: self.sequence(),
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.process(), self.time(), self.sequence())
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self)
    }
}

impl From<ActorId> for u64 {
    fn from(id: ActorId) -> Self {
        id.0
    }
}

/// Seconds since 2020-01-01, saturating at the time field width
fn seconds_since_epoch() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(EPOCH_2020_SECS);
    now.saturating_sub(EPOCH_2020_SECS).min(MAX_TIME as u64) as u32
}

/// Mints addresses for one process
///
/// Logical ids and instance ids draw from separate counters so that creating
/// instances during migrations never eats into the id space of new objects.
pub struct IdGenerator {
    process: u16,
    clock: fn() -> u32,
    id_sequence: SequenceCounter,
    instance_sequence: SequenceCounter,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("process", &self.process)
            .finish()
    }
}

impl IdGenerator {
    /// Generator backed by the system clock
    pub fn new(process: u32) -> Result<Self> {
        Self::with_clock(process, seconds_since_epoch)
    }

    /// Generator with an injected clock, mainly for tests
    pub fn with_clock(process: u32, clock: fn() -> u32) -> Result<Self> {
        let process = u16::try_from(process).map_err(|_| {
            CoreError::configuration(
                format!("process id {} exceeds maximum {}", process, MAX_PROCESS),
                Some("process.id"),
            )
        })?;
        Ok(Self {
            process,
            clock,
            id_sequence: SequenceCounter::default(),
            instance_sequence: SequenceCounter::default(),
        })
    }

    pub fn process(&self) -> u16 {
        self.process
    }

    /// New logical object id
    pub fn generate_id(&self) -> ActorId {
        let time = (self.clock)();
        ActorId::new(self.process, time, self.id_sequence.next(time, self.process))
    }

    /// New ownership-instance id
    pub fn generate_instance_id(&self) -> ActorId {
        let time = (self.clock)();
        ActorId::new(self.process, time, self.instance_sequence.next(time, self.process))
    }
}

/// Wrapping sequence with wrap-in-same-second detection
struct SequenceCounter {
    value: AtomicU32,
    /// Time of the most recent wrap, `u32::MAX` before any wrap
    wrapped_at: AtomicU32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self {
            value: AtomicU32::new(0),
            wrapped_at: AtomicU32::new(u32::MAX),
        }
    }
}

impl SequenceCounter {
    fn next(&self, time: u32, process: u16) -> u32 {
        let raw = self.value.fetch_add(1, Ordering::Relaxed);
        let sequence = raw & MAX_SEQUENCE;
        if sequence == MAX_SEQUENCE {
            let previous = self.wrapped_at.swap(time, Ordering::Relaxed);
            if previous == time {
                warn!(
                    process = process,
                    time = time,
                    "Address sequence wrapped twice within one second, ids may repeat"
                );
            }
        }
        sequence
    }
}
