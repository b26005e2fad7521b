//! Derived views over registries.
//!
//! Pure helpers for the read side of a feature: counting, summing, summarising and
//! joining parent/child ID lists. Everything returns freshly built values.

use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count items per key
pub fn count_by<'a, T, K, I>(items: I, key: impl Fn(&T) -> K) -> BTreeMap<K, usize>
where
    T: 'a,
    K: Ord,
    I: IntoIterator<Item = &'a T>,
{
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(key(item)).or_insert(0) += 1;
    }
    counts
}

/// Sum a numeric projection
pub fn sum_by<'a, T, I>(items: I, value: impl Fn(&T) -> f64) -> f64
where
    T: 'a,
    I: IntoIterator<Item = &'a T>,
{
    items.into_iter().map(value).sum()
}

/// Mean of a numeric projection, `None` for no items
pub fn average_by<'a, T, I>(items: I, value: impl Fn(&T) -> f64) -> Option<f64>
where
    T: 'a,
    I: IntoIterator<Item = &'a T>,
{
    Summary::of(items.into_iter().map(value)).map(|s| s.mean)
}

/// `part / whole`, or `0.0` when `whole` is zero
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Count, sum, mean, min and max of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of samples
    pub count: usize,
    /// Sum of samples
    pub sum: f64,
    /// Arithmetic mean
    pub mean: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
}

impl Summary {
    /// Summarise `values`; `None` when empty
    #[allow(clippy::cast_precision_loss)]
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut iter = values.into_iter();
        let first = iter.next()?;
        let mut summary = Self {
            count: 1,
            sum: first,
            mean: first,
            min: first,
            max: first,
        };
        for value in iter {
            summary.count += 1;
            summary.sum += value;
            summary.min = summary.min.min(value);
            summary.max = summary.max.max(value);
        }
        summary.mean = summary.sum / summary.count as f64;
        Some(summary)
    }
}

/// The `n` items with the greatest `key`, greatest first
pub fn latest_by<'a, T, K, I>(items: I, n: usize, key: impl Fn(&T) -> K) -> Vec<T>
where
    T: Clone + 'a,
    K: Ord,
    I: IntoIterator<Item = &'a T>,
{
    let mut sorted: Vec<&T> = items.into_iter().collect();
    sorted.sort_by(|a, b| key(b).cmp(&key(a)));
    sorted.into_iter().take(n).cloned().collect()
}

/// Copies of the children named in `ids`, skipping IDs that no longer resolve
#[must_use]
pub fn resolve_children<V: Clone>(ids: &[String], registry: &Registry<V>) -> Vec<V> {
    ids.iter().filter_map(|id| registry.get_cloned(id)).collect()
}
