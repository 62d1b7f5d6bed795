// ── Metrics domain types ──
//
// One `MetricsSnapshot` schema serves all four tiers; the tier only
// changes the resolution of `timestamp` (a bucket start for rollups).

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

// ── Tier ─────────────────────────────────────────────────────────────

/// Resolution level in the retention ladder.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Raw,
    Hourly,
    Daily,
    Monthly,
}

impl Tier {
    /// Finest first.
    pub const LADDER: [Tier; 4] = [Tier::Raw, Tier::Hourly, Tier::Daily, Tier::Monthly];

    /// The next coarser tier, if any.
    pub fn coarser(self) -> Option<Tier> {
        match self {
            Self::Raw => Some(Self::Hourly),
            Self::Hourly => Some(Self::Daily),
            Self::Daily => Some(Self::Monthly),
            Self::Monthly => None,
        }
    }

    /// Start of the window containing `ts`. Raw rows have no window.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = ts.date_naive().and_time(NaiveTime::MIN).and_utc();
        match self {
            Self::Raw => ts,
            Self::Hourly => midnight + TimeDelta::hours(i64::from(ts.hour())),
            Self::Daily => midnight,
            Self::Monthly => NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
                .map_or(midnight, |d| d.and_time(NaiveTime::MIN).and_utc()),
        }
    }

    /// Exclusive end of the window starting at `start`.
    pub fn window_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Raw => start,
            Self::Hourly => start + TimeDelta::hours(1),
            Self::Daily => start + TimeDelta::days(1),
            Self::Monthly => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + TimeDelta::days(31)),
        }
    }
}

// ── Aggregation rules ────────────────────────────────────────────────

/// How a value collapses when several finer rows fold into one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationRule {
    /// Monotonic counters and gauges: the latest reading wins.
    LastValue,
    /// Per-interval event counts: readings add up.
    Sum,
}

/// Supply levels are percentages and keep the latest reading.
pub const SUPPLY_RULE: AggregationRule = AggregationRule::LastValue;

/// A named device counter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Counter {
    PageCount,
    ColorPages,
    MonoPages,
    ScanCount,
    FaxPages,
    CopyPages,
    OtherPages,
    CopyMonoPages,
    CopyFlatbedScans,
    CopyAdfScans,
    FaxFlatbedScans,
    FaxAdfScans,
    ScanToHostFlatbed,
    ScanToHostAdf,
    DuplexSheets,
    JamEvents,
    ScannerJamEvents,
}

impl Counter {
    /// Counters whose all-zero reading marks a snapshot as empty.
    pub const PRIMARY: [Counter; 4] = [
        Counter::PageCount,
        Counter::ColorPages,
        Counter::MonoPages,
        Counter::ScanCount,
    ];

    /// The aggregation rule for this counter. Kept as an explicit table;
    /// adding a counter forces a decision here.
    pub fn rule(self) -> AggregationRule {
        match self {
            Self::PageCount
            | Self::ColorPages
            | Self::MonoPages
            | Self::ScanCount
            | Self::FaxPages
            | Self::CopyPages
            | Self::OtherPages
            | Self::CopyMonoPages
            | Self::CopyFlatbedScans
            | Self::CopyAdfScans
            | Self::FaxFlatbedScans
            | Self::FaxAdfScans
            | Self::ScanToHostFlatbed
            | Self::ScanToHostAdf
            | Self::DuplexSheets => AggregationRule::LastValue,
            Self::JamEvents | Self::ScannerJamEvents => AggregationRule::Sum,
        }
    }
}

// ── Readings & snapshots ─────────────────────────────────────────────

/// Counter and supply values as read from a device, before they are
/// stamped with an owner and a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReading {
    pub counters: BTreeMap<Counter, u64>,
    /// Supply name → remaining percentage.
    pub supplies: BTreeMap<String, u8>,
}

/// One time-stamped measurement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Assigned by the store, unique within a tier. Zero before saving.
    #[serde(default)]
    pub id: u64,
    pub serial: String,
    /// Collection time for raw rows, bucket start for rollups.
    pub timestamp: DateTime<Utc>,
    pub tier: Tier,
    #[serde(default)]
    pub counters: BTreeMap<Counter, u64>,
    #[serde(default)]
    pub supplies: BTreeMap<String, u8>,
    /// How many raw readings this row stands for.
    #[serde(default = "one")]
    pub sample_count: u32,
    /// Set once the finer rows behind this rollup have been pruned; a
    /// sealed row is never recomputed.
    #[serde(default)]
    pub sealed: bool,
}

fn one() -> u32 {
    1
}

impl MetricsSnapshot {
    /// A raw row for `serial` taken at `timestamp`.
    pub fn raw(serial: impl Into<String>, timestamp: DateTime<Utc>, reading: MetricsReading) -> Self {
        Self {
            id: 0,
            serial: serial.into(),
            timestamp,
            tier: Tier::Raw,
            counters: reading.counters,
            supplies: reading.supplies,
            sample_count: 1,
            sealed: false,
        }
    }

    pub fn with_counter(mut self, counter: Counter, value: u64) -> Self {
        self.counters.insert(counter, value);
        self
    }

    pub fn with_supply(mut self, name: impl Into<String>, percent: u8) -> Self {
        self.supplies.insert(name.into(), percent);
        self
    }

    pub fn counter(&self, counter: Counter) -> Option<u64> {
        self.counters.get(&counter).copied()
    }

    /// True when every primary counter is absent or zero. Such readings
    /// come from devices that answered without real data.
    pub fn is_empty_reading(&self) -> bool {
        Counter::PRIMARY
            .iter()
            .all(|c| self.counter(*c).unwrap_or(0) == 0)
    }

    /// Whether two rows carry the same aggregated values.
    pub fn same_values(&self, other: &Self) -> bool {
        self.counters == other.counters
            && self.supplies == other.supplies
            && self.sample_count == other.sample_count
    }
}

/// Fold `rows` (any order) into one row of `tier` starting at `bucket_start`.
///
/// Returns `None` for an empty input.
pub fn aggregate(
    serial: &str,
    tier: Tier,
    bucket_start: DateTime<Utc>,
    rows: &[&MetricsSnapshot],
) -> Option<MetricsSnapshot> {
    if rows.is_empty() {
        return None;
    }

    let mut ordered: Vec<&MetricsSnapshot> = rows.to_vec();
    ordered.sort_by_key(|r| (r.timestamp, r.id));

    let mut counters = BTreeMap::new();
    let mut supplies = BTreeMap::new();
    let mut sample_count: u32 = 0;

    for row in ordered {
        sample_count = sample_count.saturating_add(row.sample_count.max(1));
        for (&counter, &value) in &row.counters {
            match counter.rule() {
                AggregationRule::LastValue => {
                    counters.insert(counter, value);
                }
                AggregationRule::Sum => {
                    let total = counters.entry(counter).or_insert(0u64);
                    *total = total.saturating_add(value);
                }
            }
        }
        for (name, &level) in &row.supplies {
            match SUPPLY_RULE {
                AggregationRule::LastValue => {
                    supplies.insert(name.clone(), level);
                }
                AggregationRule::Sum => {
                    let total = supplies.entry(name.clone()).or_insert(0u8);
                    *total = total.saturating_add(level);
                }
            }
        }
    }

    Some(MetricsSnapshot {
        id: 0,
        serial: serial.to_owned(),
        timestamp: bucket_start,
        tier,
        counters,
        supplies,
        sample_count,
        sealed: false,
    })
}
