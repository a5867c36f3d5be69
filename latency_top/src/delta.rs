//! Per-table rates between two snapshots
//!
//! Each snapshot is collapsed by [`AGGREGATION_LABEL`], erasing every other
//! label, and the `_sum` / `_count` members of a latency family are paired up
//! to give the number of events and their average over the interval.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::scrape::parser::Snapshot;

/// Label that [`compute_delta`] aggregates by.
pub const AGGREGATION_LABEL: &str = "table_name";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced while aggregating snapshots
pub enum Error {
    /// A sample does not carry the aggregation label
    #[error("Sample {metric_name} has no {label} label")]
    MissingLabel {
        /// Metric name of the sample
        metric_name: String,
        /// The label that was asked for
        label: String,
    },
    /// A metric name does not decompose into `<stem>_sum` or `<stem>_count`
    #[error("Metric {0} is not of the form <family>_sum or <family>_count")]
    MetricShape(String),
    /// Only one half of a `_sum` / `_count` pair is present in both snapshots
    #[error("Family {family} for {label_value} has no {missing} metric")]
    IncompletePair {
        /// Family stem
        family: String,
        /// Value of the aggregation label
        label_value: String,
        /// The absent half
        missing: Component,
    },
    /// Summing or subtracting values left the `i64` range
    #[error("Arithmetic overflow for {metric_name} at {label_value}")]
    Overflow {
        /// Metric name being aggregated
        metric_name: String,
        /// Value of the aggregation label
        label_value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The half of a latency family a metric name belongs to
pub enum Component {
    /// `<stem>_sum`, total observed latency
    Sum,
    /// `<stem>_count`, number of observations
    Count,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Sum => write!(f, "sum"),
            Component::Count => write!(f, "count"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A metric name paired with the value of the aggregation label
pub struct AggregationKey {
    /// Full metric name, for instance `log_sync_latency_sum`
    pub metric_name: String,
    /// Value of the aggregation label, for instance a table name
    pub label_value: String,
}

/// Summed sample values per [`AggregationKey`]
pub type Aggregate = FxHashMap<AggregationKey, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
/// Change of one family for one label value over the interval
pub struct Rate {
    /// `sum` after minus `sum` before
    pub sum_delta: i64,
    /// `count` after minus `count` before
    pub count_delta: i64,
    /// `sum_delta / count_delta`, or `0` when `count_delta` is zero
    pub average: f64,
}

impl Rate {
    /// Build a [`Rate`] from its deltas. Deltas may be negative after a
    /// counter reset and are kept as-is.
    #[must_use]
    pub fn new(sum_delta: i64, count_delta: i64) -> Self {
        let average = if count_delta == 0 {
            0.0
        } else {
            sum_delta as f64 / count_delta as f64
        };
        Self {
            sum_delta,
            count_delta,
            average,
        }
    }
}

/// Family stem to label value to [`Rate`]
pub type Rates = FxHashMap<String, FxHashMap<String, Rate>>;

/// Split `<stem>_sum` / `<stem>_count` where the stem is `[a-z_]+`.
#[must_use]
pub fn split_family(metric_name: &str) -> Option<(&str, Component)> {
    let (stem, component) = if let Some(stem) = metric_name.strip_suffix("_sum") {
        (stem, Component::Sum)
    } else if let Some(stem) = metric_name.strip_suffix("_count") {
        (stem, Component::Count)
    } else {
        return None;
    };

    let valid = !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_lowercase() || b == b'_');
    valid.then_some((stem, component))
}

/// Sum the values of `snapshot` per metric name and value of `label`.
///
/// # Errors
///
/// Returns [`Error::MissingLabel`] if any sample lacks `label` and
/// [`Error::Overflow`] if a sum leaves the `i64` range.
pub fn aggregate_by_tag(snapshot: &Snapshot, label: &str) -> Result<Aggregate, Error> {
    let mut aggregate = Aggregate::default();

    for sample in snapshot.samples() {
        let label_value = sample
            .labels
            .get(label)
            .ok_or_else(|| Error::MissingLabel {
                metric_name: sample.metric_name.clone(),
                label: label.to_string(),
            })?;

        let key = AggregationKey {
            metric_name: sample.metric_name.clone(),
            label_value: label_value.clone(),
        };
        let total = aggregate.entry(key).or_insert(0);
        *total = total
            .checked_add(sample.value)
            .ok_or_else(|| Error::Overflow {
                metric_name: sample.metric_name.clone(),
                label_value: label_value.clone(),
            })?;
    }

    Ok(aggregate)
}

#[derive(Debug, Default)]
struct Pair {
    sum: Option<i64>,
    count: Option<i64>,
}

/// Compute per-table rates between `before` and `after`.
///
/// Only keys present in both snapshots contribute; a table that appears or
/// vanishes between the two produces no rate.
///
/// # Errors
///
/// Fails if either snapshot cannot be aggregated by [`AGGREGATION_LABEL`], if
/// a shared metric name is not a `_sum` / `_count` metric, or if a family has
/// only one of the two for some table.
pub fn compute_delta(before: &Snapshot, after: &Snapshot) -> Result<Rates, Error> {
    let before = aggregate_by_tag(before, AGGREGATION_LABEL)?;
    let after = aggregate_by_tag(after, AGGREGATION_LABEL)?;

    let mut pairs: FxHashMap<(String, String), Pair> = FxHashMap::default();
    for (key, then) in &before {
        let Some(now) = after.get(key) else {
            continue;
        };

        let (family, component) = split_family(&key.metric_name)
            .ok_or_else(|| Error::MetricShape(key.metric_name.clone()))?;
        let delta = now.checked_sub(*then).ok_or_else(|| Error::Overflow {
            metric_name: key.metric_name.clone(),
            label_value: key.label_value.clone(),
        })?;

        let pair = pairs
            .entry((family.to_string(), key.label_value.clone()))
            .or_default();
        match component {
            Component::Sum => pair.sum = Some(delta),
            Component::Count => pair.count = Some(delta),
        }
    }

    let mut rates = Rates::default();
    for ((family, label_value), pair) in pairs {
        let (sum_delta, count_delta) = match (pair.sum, pair.count) {
            (Some(sum), Some(count)) => (sum, count),
            (sum, _) => {
                let missing = if sum.is_none() {
                    Component::Sum
                } else {
                    Component::Count
                };
                return Err(Error::IncompletePair {
                    family,
                    label_value,
                    missing,
                });
            }
        };

        rates
            .entry(family)
            .or_default()
            .insert(label_value, Rate::new(sum_delta, count_delta));
    }

    Ok(rates)
}
