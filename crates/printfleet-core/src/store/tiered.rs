// ── Tiered metrics series ──
//
// In-memory tables for the four metrics tiers plus the downsampling
// and stitching algorithms. The store wraps this in its own lock; the
// functions here are plain, synchronous, and deterministic given `now`.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetentionPolicy;
use crate::model::{MetricsSnapshot, Tier, aggregate};

use super::DownsampleReport;

type RowKey = (String, DateTime<Utc>);

/// One tier's rows keyed by (serial, timestamp), with its id sequence.
#[derive(Debug, Clone, Default)]
struct TierTable {
    next_id: u64,
    rows: BTreeMap<RowKey, MetricsSnapshot>,
}

impl TierTable {
    fn assign_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn for_serial(&self, serial: &str) -> impl DoubleEndedIterator<Item = &MetricsSnapshot> {
        let lo = (serial.to_owned(), DateTime::<Utc>::MIN_UTC);
        let hi = (serial.to_owned(), DateTime::<Utc>::MAX_UTC);
        self.rows.range(lo..=hi).map(|(_, row)| row)
    }
}

/// Stored form: JSON maps cannot carry tuple keys.
#[derive(Serialize, Deserialize)]
struct StoredTier {
    next_id: u64,
    rows: Vec<MetricsSnapshot>,
}

impl From<StoredTier> for TierTable {
    fn from(stored: StoredTier) -> Self {
        let mut next_id = stored.next_id;
        let rows = stored
            .rows
            .into_iter()
            .map(|row| {
                next_id = next_id.max(row.id);
                ((row.serial.clone(), row.timestamp), row)
            })
            .collect();
        Self { next_id, rows }
    }
}

impl From<TierTable> for StoredTier {
    fn from(table: TierTable) -> Self {
        Self {
            next_id: table.next_id,
            rows: table.rows.into_values().collect(),
        }
    }
}

/// All metrics rows, every tier.
#[derive(Debug, Clone, Default)]
pub struct TieredSeries {
    tiers: BTreeMap<Tier, TierTable>,
}

impl Serialize for TieredSeries {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let stored: BTreeMap<Tier, StoredTier> = self
            .tiers
            .iter()
            .map(|(tier, table)| (*tier, StoredTier::from(table.clone())))
            .collect();
        stored.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TieredSeries {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = BTreeMap::<Tier, StoredTier>::deserialize(deserializer)?;
        Ok(Self {
            tiers: stored
                .into_iter()
                .map(|(tier, table)| (tier, TierTable::from(table)))
                .collect(),
        })
    }
}

impl TieredSeries {
    fn table(&self, tier: Tier) -> Option<&TierTable> {
        self.tiers.get(&tier)
    }

    fn table_mut(&mut self, tier: Tier) -> &mut TierTable {
        self.tiers.entry(tier).or_default()
    }

    pub fn len(&self, tier: Tier) -> usize {
        self.table(tier).map_or(0, |t| t.rows.len())
    }

    pub fn rows(&self, tier: Tier, serial: &str) -> Vec<MetricsSnapshot> {
        self.table(tier)
            .map(|t| t.for_serial(serial).cloned().collect())
            .unwrap_or_default()
    }

    /// Append a raw row. A row already stored for the same serial and
    /// timestamp wins; its id is returned.
    pub fn insert_raw(&mut self, snapshot: &MetricsSnapshot) -> u64 {
        let table = self.table_mut(Tier::Raw);
        let key = (snapshot.serial.clone(), snapshot.timestamp);
        if let Some(existing) = table.rows.get(&key) {
            return existing.id;
        }
        let id = table.assign_id();
        let mut row = snapshot.clone();
        row.id = id;
        row.tier = Tier::Raw;
        row.sealed = false;
        table.rows.insert(key, row);
        id
    }

    /// Newest raw row, else the newest rollup.
    pub fn latest(&self, serial: &str) -> Option<MetricsSnapshot> {
        Tier::LADDER
            .iter()
            .find_map(|tier| self.table(*tier)?.for_serial(serial).next_back().cloned())
    }

    pub fn delete(&mut self, tier: Tier, id: u64) -> bool {
        let table = self.table_mut(tier);
        let key = table
            .rows
            .iter()
            .find(|(_, row)| row.id == id)
            .map(|(key, _)| key.clone());
        key.is_some_and(|key| table.rows.remove(&key).is_some())
    }

    // ── Stitched history ─────────────────────────────────────────────

    /// Finest rows first; each coarser tier only fills the span before
    /// the earliest row already taken.
    pub fn history(
        &self,
        serial: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<MetricsSnapshot> {
        let mut out = Vec::new();
        let mut boundary: Option<DateTime<Utc>> = None;

        for tier in Tier::LADDER {
            let Some(table) = self.table(tier) else {
                continue;
            };
            let start = tier.floor(since);
            let stop = boundary.map(|b| tier.floor(b));
            let taken: Vec<&MetricsSnapshot> = table
                .for_serial(serial)
                .filter(|row| row.timestamp >= start && row.timestamp <= until)
                .filter(|row| stop.is_none_or(|stop| row.timestamp < stop))
                .collect();

            if let Some(first) = taken.first() {
                boundary = Some(first.timestamp);
            }
            out.extend(taken.into_iter().cloned());
        }

        out.sort_by_key(|row| (row.timestamp, row.tier));
        out
    }

    // ── Downsampling ─────────────────────────────────────────────────

    /// Roll every complete window up one tier, finest pair first, then
    /// prune and seal what has aged past retention.
    pub fn downsample(&mut self, now: DateTime<Utc>, retention: &RetentionPolicy) -> DownsampleReport {
        let mut report = DownsampleReport::default();
        for (fine, days) in [
            (Tier::Raw, retention.raw_days),
            (Tier::Hourly, retention.hourly_days),
            (Tier::Daily, retention.daily_days),
        ] {
            let Some(coarse) = fine.coarser() else {
                continue;
            };
            let cutoff = now - TimeDelta::days(i64::from(days));
            self.drop_late_rows(fine, coarse, &mut report);
            self.materialize(fine, coarse, now, &mut report);
            self.prune(fine, coarse, cutoff, &mut report);
        }
        report
    }

    /// Whether the window containing `ts` is frozen at `tier` or any
    /// coarser tier.
    fn window_sealed(&self, tier: Tier, serial: &str, ts: DateTime<Utc>) -> bool {
        let mut current = Some(tier);
        while let Some(t) = current {
            let key = (serial.to_owned(), t.floor(ts));
            if self
                .table(t)
                .and_then(|table| table.rows.get(&key))
                .is_some_and(|row| row.sealed)
            {
                return true;
            }
            current = t.coarser();
        }
        false
    }

    fn drop_late_rows(&mut self, fine: Tier, coarse: Tier, report: &mut DownsampleReport) {
        let Some(table) = self.table(fine) else {
            return;
        };
        let late: Vec<RowKey> = table
            .rows
            .iter()
            .filter(|((serial, ts), _)| self.window_sealed(coarse, serial, *ts))
            .map(|(key, _)| key.clone())
            .collect();

        let table = self.table_mut(fine);
        for key in &late {
            table.rows.remove(key);
        }
        report.late_dropped += late.len() as u64;
    }

    /// Group `fine` rows by their complete `coarse` window.
    fn complete_windows(
        &self,
        fine: Tier,
        coarse: Tier,
        now: DateTime<Utc>,
    ) -> BTreeMap<RowKey, Vec<&MetricsSnapshot>> {
        let mut windows: BTreeMap<RowKey, Vec<&MetricsSnapshot>> = BTreeMap::new();
        if let Some(table) = self.table(fine) {
            for ((serial, ts), row) in &table.rows {
                let start = coarse.floor(*ts);
                if coarse.window_end(start) <= now {
                    windows.entry((serial.clone(), start)).or_default().push(row);
                }
            }
        }
        windows
    }

    fn materialize(&mut self, fine: Tier, coarse: Tier, now: DateTime<Utc>, report: &mut DownsampleReport) {
        let rollups: Vec<MetricsSnapshot> = self
            .complete_windows(fine, coarse, now)
            .into_iter()
            .filter_map(|((serial, start), rows)| aggregate(&serial, coarse, start, &rows))
            .collect();

        let table = self.table_mut(coarse);
        let (mut created, mut updated) = (0, 0);
        for mut rollup in rollups {
            let key = (rollup.serial.clone(), rollup.timestamp);
            match table.rows.get_mut(&key) {
                Some(existing) if existing.sealed || existing.same_values(&rollup) => {}
                Some(existing) => {
                    existing.counters = rollup.counters;
                    existing.supplies = rollup.supplies;
                    existing.sample_count = rollup.sample_count;
                    updated += 1;
                }
                None => {
                    rollup.id = table.assign_id();
                    table.rows.insert(key, rollup);
                    created += 1;
                }
            }
        }
        DownsampleReport::bump(&mut report.created, coarse, created);
        DownsampleReport::bump(&mut report.updated, coarse, updated);
    }

    /// Remove `fine` rows whose coarse window ended before `cutoff` and
    /// whose coarse row exists, then seal that row.
    fn prune(&mut self, fine: Tier, coarse: Tier, cutoff: DateTime<Utc>, report: &mut DownsampleReport) {
        let mut doomed: Vec<RowKey> = Vec::new();
        let mut seal: Vec<RowKey> = Vec::new();

        for ((serial, start), rows) in self.complete_windows(fine, coarse, cutoff) {
            let key = (serial, start);
            let confirmed = self
                .table(coarse)
                .is_some_and(|table| table.rows.contains_key(&key));
            if !confirmed {
                continue;
            }
            doomed.extend(rows.iter().map(|row| (row.serial.clone(), row.timestamp)));
            seal.push(key);
        }

        let table = self.table_mut(fine);
        for key in &doomed {
            table.rows.remove(key);
        }
        DownsampleReport::bump(&mut report.pruned, fine, doomed.len() as u64);

        let table = self.table_mut(coarse);
        for key in &seal {
            if let Some(row) = table.rows.get_mut(key) {
                row.sealed = true;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Counter;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn raw(ts: DateTime<Utc>, pages: u64, jams: u64) -> MetricsSnapshot {
        MetricsSnapshot::raw("ABC123", ts, Default::default())
            .with_counter(Counter::PageCount, pages)
            .with_counter(Counter::JamEvents, jams)
            .with_supply("black", 80)
    }

    #[test]
    fn hourly_rollup_uses_last_value_and_sum() {
        let mut series = TieredSeries::default();
        for (m, pages, jams) in [(5, 100, 1), (25, 105, 0), (45, 110, 2)] {
            series.insert_raw(&raw(at(1, 10, m), pages, jams));
        }

        let report = series.downsample(at(1, 12, 0), &RetentionPolicy::default());
        assert_eq!(report.created.get(&Tier::Hourly), Some(&1));

        let hourly = series.rows(Tier::Hourly, "ABC123");
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].timestamp, at(1, 10, 0));
        assert_eq!(hourly[0].counter(Counter::PageCount), Some(110));
        assert_eq!(hourly[0].counter(Counter::JamEvents), Some(3));
        assert_eq!(hourly[0].sample_count, 3);
    }

    #[test]
    fn incomplete_windows_are_not_materialized() {
        let mut series = TieredSeries::default();
        series.insert_raw(&raw(at(1, 10, 5), 100, 0));
        let report = series.downsample(at(1, 10, 30), &RetentionPolicy::default());
        assert!(report.is_noop());
        assert_eq!(series.len(Tier::Hourly), 0);
    }

    #[test]
    fn downsampling_twice_changes_nothing() {
        let mut series = TieredSeries::default();
        for day in 1..=3 {
            for hour in [8, 9, 17] {
                series.insert_raw(&raw(at(day, hour, 15), u64::from(day * 100 + hour), 1));
            }
        }
        let now = at(20, 0, 0);
        let first = series.downsample(now, &RetentionPolicy::default());
        assert!(!first.is_noop());
        let snapshot = series.clone();

        let second = series.downsample(now, &RetentionPolicy::default());
        assert!(second.is_noop(), "{second:?}");
        for tier in Tier::LADDER {
            assert_eq!(series.rows(tier, "ABC123"), snapshot.rows(tier, "ABC123"));
        }
    }

    #[test]
    fn late_rows_update_unsealed_rollups() {
        let mut series = TieredSeries::default();
        series.insert_raw(&raw(at(1, 10, 5), 100, 1));
        series.downsample(at(1, 11, 0), &RetentionPolicy::default());

        series.insert_raw(&raw(at(1, 10, 50), 120, 4));
        let report = series.downsample(at(1, 11, 5), &RetentionPolicy::default());
        assert_eq!(report.updated.get(&Tier::Hourly), Some(&1));

        let hourly = &series.rows(Tier::Hourly, "ABC123")[0];
        assert_eq!(hourly.counter(Counter::PageCount), Some(120));
        assert_eq!(hourly.counter(Counter::JamEvents), Some(5));
    }

    #[test]
    fn pruning_follows_materialization_and_seals() {
        let mut series = TieredSeries::default();
        series.insert_raw(&raw(at(1, 10, 5), 100, 1));
        let retention = RetentionPolicy::default();

        // Past raw retention: rolled up and pruned in the same pass.
        let report = series.downsample(at(12, 0, 0), &retention);
        assert_eq!(report.pruned.get(&Tier::Raw), Some(&1));
        assert_eq!(series.len(Tier::Raw), 0);
        let hourly = &series.rows(Tier::Hourly, "ABC123")[0];
        assert!(hourly.sealed);
        assert_eq!(hourly.counter(Counter::PageCount), Some(100));

        // A straggler for the sealed hour is discarded.
        series.insert_raw(&raw(at(1, 10, 30), 999, 9));
        let report = series.downsample(at(12, 0, 0), &retention);
        assert_eq!(report.late_dropped, 1);
        assert_eq!(series.rows(Tier::Hourly, "ABC123")[0].counter(Counter::PageCount), Some(100));

        let report = series.downsample(at(12, 0, 0), &retention);
        assert!(report.is_noop(), "{report:?}");
    }

    #[test]
    fn monthly_rollups_cascade() {
        let mut series = TieredSeries::default();
        series.insert_raw(&raw(at(3, 9, 0), 500, 2));
        series.insert_raw(&raw(at(20, 9, 0), 800, 3));

        let now = Utc.with_ymd_and_hms(2025, 4, 2, 0, 0, 0).unwrap();
        series.downsample(now, &RetentionPolicy::default());

        let monthly = series.rows(Tier::Monthly, "ABC123");
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].timestamp, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(monthly[0].counter(Counter::PageCount), Some(800));
        assert_eq!(monthly[0].counter(Counter::JamEvents), Some(5));
        assert_eq!(monthly[0].sample_count, 2);
    }

    #[test]
    fn history_stitches_daily_and_raw_without_gaps() {
        let mut series = TieredSeries::default();
        let retention = RetentionPolicy {
            raw_days: 2,
            hourly_days: 3,
            daily_days: 365,
        };
        for day in 1..=10 {
            series.insert_raw(&raw(at(day, 12, 0), u64::from(day) * 10, 0));
        }
        series.downsample(at(10, 18, 0), &retention);

        // Days 1-6 come from daily rows, 7-8 from hourly, 9-10 from raw.
        let history = series.history("ABC123", at(1, 0, 0), at(10, 23, 0));
        let pages: Vec<u64> = history
            .iter()
            .map(|r| r.counter(Counter::PageCount).unwrap())
            .collect();
        assert_eq!(pages, (1..=10).map(|d| d * 10).collect::<Vec<_>>());
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(history.first().unwrap().tier, Tier::Daily);
        assert_eq!(history.last().unwrap().tier, Tier::Raw);
    }

    #[test]
    fn raw_duplicates_keep_first_id() {
        let mut series = TieredSeries::default();
        let id = series.insert_raw(&raw(at(1, 10, 0), 1, 0));
        assert_eq!(series.insert_raw(&raw(at(1, 10, 0), 2, 0)), id);
        assert_eq!(series.len(Tier::Raw), 1);
        assert!(series.delete(Tier::Raw, id));
        assert!(!series.delete(Tier::Raw, id));
    }

    #[test]
    fn series_survives_json() {
        let mut series = TieredSeries::default();
        series.insert_raw(&raw(at(1, 10, 0), 1, 0));
        series.downsample(at(1, 12, 0), &RetentionPolicy::default());

        let json = serde_json::to_string(&series).unwrap();
        let mut back: TieredSeries = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows(Tier::Hourly, "ABC123"), series.rows(Tier::Hourly, "ABC123"));
        assert_eq!(back.insert_raw(&raw(at(1, 11, 0), 2, 0)), 2);
    }
}
