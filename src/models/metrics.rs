use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One labeled time series in canonical form. `values` is sorted ascending
/// by timestamp; each point is `(epoch_seconds, stringified_value)` the way
/// the Prometheus HTTP API emits matrices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSeries {
    #[serde(rename = "metric")]
    pub labels: BTreeMap<String, String>,
    pub values: Vec<(f64, String)>,
}

/// Deterministic identity of a series: its sorted label pairs.
pub fn series_signature(labels: &BTreeMap<String, String>) -> String {
    let mut sig = String::new();
    for (k, v) in labels {
        if !sig.is_empty() {
            sig.push(',');
        }
        sig.push_str(k);
        sig.push('=');
        sig.push_str(v);
    }
    sig
}

pub fn format_sample_value(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Accumulates raw `(labels, timestamp, value)` rows into canonical series:
/// rows with the same label projection land in one series, and each series'
/// points come out sorted ascending by timestamp.
#[derive(Default)]
pub struct SeriesBuilder {
    series: BTreeMap<String, MetricSeries>,
}

impl SeriesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, labels: BTreeMap<String, String>, timestamp: f64, value: f64) {
        let key = series_signature(&labels);
        self.series
            .entry(key)
            .or_insert_with(|| MetricSeries { labels, values: Vec::new() })
            .values
            .push((timestamp, format_sample_value(value)));
    }

    pub fn finish(self) -> Vec<MetricSeries> {
        self.series
            .into_values()
            .map(|mut s| {
                s.values
                    .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                s
            })
            .collect()
    }
}
