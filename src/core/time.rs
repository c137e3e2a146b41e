//! Hybrid logical clock.
//!
//! `Hlc` is the ordering primitive for every record: (millis, counter,
//! node id), totally ordered, carried on the wire as
//! `<ISO-8601 millis UTC>-<4-hex counter>-<node-id>`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::{self, OwnedFormatItem};
use time::{OffsetDateTime, PrimitiveDateTime};

use super::error::CoreError;
use super::identity::NodeId;

/// Fixed-width datetime segment of the canonical string.
const DATETIME_LEN: usize = 24;
const COUNTER_LEN: usize = 4;

fn datetime_format() -> &'static OwnedFormatItem {
    static FORMAT: OnceLock<OwnedFormatItem> = OnceLock::new();
    FORMAT.get_or_init(|| {
        format_description::parse_owned::<2>(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z",
        )
        .expect("static datetime format")
    })
}

/// Wall clock reading in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hybrid logical clock timestamp.
///
/// `millis` is the physical component, `counter` breaks ties for writes in
/// the same millisecond, `node_id` breaks ties deterministically across
/// nodes. The node id participates in ordering but never in clock
/// arithmetic.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hlc {
    millis: u64,
    counter: u16,
    node_id: NodeId,
}

impl Hlc {
    pub fn new(millis: u64, counter: u16, node_id: NodeId) -> Self {
        Self {
            millis,
            counter,
            node_id,
        }
    }

    /// The zero timestamp: sorts before any real write from any node.
    pub fn zero(node_id: NodeId) -> Self {
        Self::new(0, 0, node_id)
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0 && self.counter == 0
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Rewrite the node id, preserving both time components.
    pub fn apply(&self, node_id: NodeId) -> Self {
        Self::new(self.millis, self.counter, node_id)
    }

    /// Advance for a local write at wall time `now_ms`.
    pub fn tick(&self, now_ms: u64) -> Self {
        if now_ms > self.millis {
            Self::new(now_ms, 0, self.node_id.clone())
        } else {
            Self::new(self.millis, self.counter.saturating_add(1), self.node_id.clone())
        }
    }

    /// Advance past a remote timestamp observed at wall time `now_ms`.
    pub fn observed(&self, remote: &Hlc, now_ms: u64) -> Self {
        let millis = self.millis.max(remote.millis).max(now_ms);
        let counter = if millis == self.millis && millis == remote.millis {
            self.counter.max(remote.counter).saturating_add(1)
        } else if millis == self.millis {
            self.counter.saturating_add(1)
        } else if millis == remote.millis {
            remote.counter.saturating_add(1)
        } else {
            0
        };
        Self::new(millis, counter, self.node_id.clone())
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidHlc {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        // <24-char datetime>-<4-hex counter>-<node-id>; the node id may
        // itself contain '-', so split at fixed offsets from the left.
        if raw.len() < DATETIME_LEN + 1 + COUNTER_LEN + 1 + 1 {
            return Err(invalid("too short"));
        }
        let (datetime, rest) = raw
            .split_at_checked(DATETIME_LEN)
            .ok_or_else(|| invalid("malformed datetime"))?;
        let rest = rest
            .strip_prefix('-')
            .ok_or_else(|| invalid("missing separator after datetime"))?;
        let (counter, rest) = rest
            .split_at_checked(COUNTER_LEN)
            .ok_or_else(|| invalid("malformed counter"))?;
        let node_id = rest
            .strip_prefix('-')
            .ok_or_else(|| invalid("missing separator after counter"))?;

        let parsed = PrimitiveDateTime::parse(datetime, datetime_format())
            .map_err(|err| invalid(&format!("bad datetime: {err}")))?
            .assume_utc();
        let nanos = parsed.unix_timestamp_nanos();
        if nanos < 0 {
            return Err(invalid("datetime before unix epoch"));
        }
        let millis = (nanos / 1_000_000) as u64;
        let counter = u16::from_str_radix(counter, 16)
            .map_err(|err| invalid(&format!("bad counter: {err}")))?;
        let node_id = NodeId::new(node_id).map_err(|_| invalid("empty node id"))?;

        Ok(Self::new(millis, counter, node_id))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = OffsetDateTime::from_unix_timestamp_nanos(self.millis as i128 * 1_000_000)
            .expect("hlc millis within datetime range")
            .format(datetime_format())
            .expect("static datetime format");
        write!(f, "{}-{:04x}-{}", datetime, self.counter, self.node_id)
    }
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hlc({self})")
    }
}

impl FromStr for Hlc {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Hlc::parse(&raw).map_err(D::Error::custom)
    }
}
