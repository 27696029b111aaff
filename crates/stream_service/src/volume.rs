//! Per-symbol running-volume accumulation.
//!
//! The ledger holds, for each symbol, the running sum of trade sizes in
//! observed order and the maximum timestamp seen. Batches are applied to a
//! stage first and committed only after the flush succeeds, so a retried
//! flush recomputes identical volumes instead of double-counting.

use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    running: Decimal,
    max_ts: i64,
}

/// Committed per-symbol accumulator state.
#[derive(Debug, Default)]
pub struct VolumeLedger {
    entries: HashMap<i64, Entry>,
}

/// Uncommitted accumulator updates produced by staging a batch.
#[derive(Debug)]
pub struct LedgerDelta {
    entries: HashMap<i64, Entry>,
}

/// A scratch view over the ledger for one flush attempt.
pub struct LedgerStage<'a> {
    base: &'a VolumeLedger,
    scratch: HashMap<i64, Entry>,
}

impl VolumeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the symbol's accumulator has been initialized, either from a
    /// persisted row or as empty.
    pub fn is_seeded(&self, symbol_id: i64) -> bool {
        self.entries.contains_key(&symbol_id)
    }

    /// Seed from the most recently persisted row for the symbol.
    pub fn seed(&mut self, symbol_id: i64, volume: Decimal, ts_ms: i64) {
        self.entries.entry(symbol_id).or_insert(Entry {
            running: volume,
            max_ts: ts_ms,
        });
    }

    /// Seed a symbol with no persisted history.
    pub fn seed_empty(&mut self, symbol_id: i64) {
        self.entries.entry(symbol_id).or_insert(Entry {
            running: Decimal::ZERO,
            max_ts: i64::MIN,
        });
    }

    /// Begin staging a batch.
    pub fn begin(&self) -> LedgerStage<'_> {
        LedgerStage {
            base: self,
            scratch: HashMap::new(),
        }
    }

    /// Commit staged updates after a successful flush.
    pub fn commit(&mut self, delta: LedgerDelta) {
        self.entries.extend(delta.entries);
    }
}

impl LedgerStage<'_> {
    /// Add a trade's size to the symbol's running sum.
    ///
    /// Returns the running volume including this trade and whether the
    /// trade is late (older than the symbol's max seen timestamp). Equal
    /// timestamps are not late; insertion order breaks the tie.
    pub fn apply(&mut self, symbol_id: i64, ts_ms: i64, size: Decimal) -> (Decimal, bool) {
        let entry = self.scratch.entry(symbol_id).or_insert_with(|| {
            self.base
                .entries
                .get(&symbol_id)
                .copied()
                .unwrap_or(Entry {
                    running: Decimal::ZERO,
                    max_ts: i64::MIN,
                })
        });

        let late = ts_ms < entry.max_ts;
        entry.running += size;
        entry.max_ts = entry.max_ts.max(ts_ms);
        (entry.running, late)
    }

    pub fn into_delta(self) -> LedgerDelta {
        LedgerDelta {
            entries: self.scratch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn running_volume_is_prefix_sum() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);

        let mut stage = ledger.begin();
        let (v1, late1) = stage.apply(1, 1000, dec!(100));
        let (v2, late2) = stage.apply(1, 2000, dec!(50));
        let (v3, late3) = stage.apply(1, 3000, dec!(0));
        assert_eq!((v1, v2, v3), (dec!(100), dec!(150), dec!(150)));
        assert!(!late1 && !late2 && !late3);
        ledger.commit(stage.into_delta());

        // next batch continues from the committed sum
        let mut stage = ledger.begin();
        let (v4, _) = stage.apply(1, 4000, dec!(25));
        assert_eq!(v4, dec!(175));
    }

    #[test]
    fn seed_resumes_from_persisted_volume() {
        let mut ledger = VolumeLedger::new();
        ledger.seed(7, dec!(1000), 5000);

        let mut stage = ledger.begin();
        let (v, late) = stage.apply(7, 6000, dec!(10));
        assert_eq!(v, dec!(1010));
        assert!(!late);
    }

    #[test]
    fn older_than_seed_is_late_but_still_accumulates() {
        let mut ledger = VolumeLedger::new();
        ledger.seed(7, dec!(1000), 5000);

        let mut stage = ledger.begin();
        let (v, late) = stage.apply(7, 4000, dec!(10));
        assert_eq!(v, dec!(1010));
        assert!(late);

        // equal timestamps tie-break by insertion order, not lateness
        let (_, late_eq) = stage.apply(7, 5000, dec!(5));
        assert!(!late_eq);
    }

    #[test]
    fn uncommitted_stage_leaves_ledger_unchanged() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);

        {
            let mut stage = ledger.begin();
            stage.apply(1, 1000, dec!(100));
            // dropped without commit, e.g. a failed flush
        }

        let mut stage = ledger.begin();
        let (v, _) = stage.apply(1, 1000, dec!(100));
        assert_eq!(v, dec!(100));
    }

    #[test]
    fn symbols_are_independent() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);
        ledger.seed_empty(2);

        let mut stage = ledger.begin();
        let (v1, _) = stage.apply(1, 1000, dec!(100));
        let (v2, _) = stage.apply(2, 1000, dec!(7));
        assert_eq!(v1, dec!(100));
        assert_eq!(v2, dec!(7));
    }
}
