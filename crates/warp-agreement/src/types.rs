//! Identifiers shared across the agreement core

use chrono::{TimeZone, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a cooperating site
pub type SiteId = u64;

/// Globally unique, totally ordered transaction id
pub type TxnId = i64;

/// Placeholder for "nothing heard yet"
pub const UNKNOWN_TXN_ID: TxnId = -1;

/// Ordered set of sites
pub type SiteSet = BTreeSet<SiteId>;

/// Bits of a transaction id holding the initiator
pub const INITIATOR_BITS: u32 = 14;

/// Bits between the timestamp and the initiator
pub const COUNTER_BITS: u32 = 8;

const INITIATOR_MASK: i64 = (1 << INITIATOR_BITS) - 1;

/// Milliseconds since the unix epoch of 2020-01-01T00:00:00Z
const ID_EPOCH_MILLIS: i64 = 1_577_836_800_000;

/// Initiator encoded in the low bits of a generated transaction id
pub fn initiator_of(txn_id: TxnId) -> SiteId {
    (txn_id & INITIATOR_MASK) as SiteId
}

/// Issues strictly increasing transaction ids for one initiator.
///
/// Ids are `timestamp << 22 | counter << 14 | initiator`. When the clock
/// stalls or steps backwards the counter field absorbs the difference, so
/// ids never repeat or decrease.
#[derive(Debug, Clone)]
pub struct TxnIdGenerator {
    initiator: SiteId,
    last: TxnId,
}

impl TxnIdGenerator {
    /// Create a generator for the given initiator
    pub fn new(initiator: SiteId) -> Self {
        Self {
            initiator,
            last: UNKNOWN_TXN_ID,
        }
    }

    /// Next id using the wall clock
    pub fn next_id(&mut self) -> TxnId {
        self.next_id_at(Utc::now().timestamp_millis())
    }

    /// Next id for an explicit unix-millis timestamp
    pub fn next_id_at(&mut self, unix_millis: i64) -> TxnId {
        let since_epoch = (unix_millis - ID_EPOCH_MILLIS).max(0);
        let candidate = (since_epoch << (COUNTER_BITS + INITIATOR_BITS))
            | (self.initiator as i64 & INITIATOR_MASK);
        let next = if candidate > self.last {
            candidate
        } else {
            self.last + (1 << INITIATOR_BITS)
        };
        self.last = next;
        next
    }

    /// Last id handed out
    pub fn last_id(&self) -> TxnId {
        self.last
    }
}

/// Display helper rendering a transaction id with its wall-clock time
pub struct TxnIdDisplay(pub TxnId);

impl fmt::Display for TxnIdDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            return write!(f, "{}", self.0);
        }
        let millis = (self.0 >> (COUNTER_BITS + INITIATOR_BITS)) + ID_EPOCH_MILLIS;
        match Utc.timestamp_millis_opt(millis).single() {
            Some(ts) => write!(
                f,
                "{}@{}/{}",
                self.0,
                ts.format("%H:%M:%S%.3f"),
                initiator_of(self.0)
            ),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_carry_initiator() {
        let mut generator = TxnIdGenerator::new(37);
        let id = generator.next_id();
        assert_eq!(initiator_of(id), 37);
        assert!(id > 0);
    }

    #[test]
    fn test_ids_increase_when_clock_stalls() {
        let mut generator = TxnIdGenerator::new(2);
        let now = 1_700_000_000_000;
        let first = generator.next_id_at(now);
        let second = generator.next_id_at(now);
        let third = generator.next_id_at(now - 5_000);
        assert!(first < second && second < third);
        assert_eq!(initiator_of(third), 2);
        assert_eq!(generator.last_id(), third);
    }

    #[test]
    fn test_ids_follow_clock() {
        let mut generator = TxnIdGenerator::new(1);
        let early = generator.next_id_at(1_700_000_000_000);
        let late = generator.next_id_at(1_700_000_000_001);
        assert_eq!(late - early, 1 << (COUNTER_BITS + INITIATOR_BITS));
    }

    #[test]
    fn test_display() {
        assert_eq!(TxnIdDisplay(UNKNOWN_TXN_ID).to_string(), "-1");
        let mut generator = TxnIdGenerator::new(3);
        let rendered = TxnIdDisplay(generator.next_id_at(ID_EPOCH_MILLIS + 1_000)).to_string();
        assert!(rendered.ends_with("@00:00:01.000/3"), "{}", rendered);
    }
}
