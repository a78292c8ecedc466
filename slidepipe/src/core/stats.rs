//! Per-stage statistics artifact.

use super::{LinkStrategy, LinkTally};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Divides two counts, yielding `0.0` for a zero denominator.
///
/// The result is rounded to six decimals so reports stay stable.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let value = numerator as f64 / denominator as f64;
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// The record a stage writes once, before reporting success.
///
/// `processed` counts items that were actually scored or extracted. Items
/// lost to per-item errors are counted in `failed` only, so for every stage
/// `processed == saved + discarded`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    /// Items scored or extracted.
    #[serde(default)]
    pub processed: u64,
    /// Items kept (routed to the kept class, or written). Files written by
    /// older tools may call this `passed`; see [`StageStats::from_json_str`].
    #[serde(default)]
    pub saved: u64,
    /// Items routed to the rejected class.
    #[serde(default)]
    pub discarded: u64,
    /// Items skipped because of a per-item error.
    #[serde(default)]
    pub failed: u64,
    /// Threshold the stage applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_used: Option<f64>,
    /// Requested link strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_strategy: Option<LinkStrategy>,
    /// Most degraded strategy that actually took effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_strategy_used: Option<LinkStrategy>,
    /// Placements per effective strategy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub link_counts: BTreeMap<String, u64>,
    /// Batch size the stage ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Diagnostic samples kept per class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_per_class: Option<usize>,
    /// Wall-clock seconds spent inside the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    /// Stage-specific keys (`kept_<class>`, `<class>_ratio`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StageStats {
    /// Creates zero-valued stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the threshold used.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold_used = Some(threshold);
        self
    }

    /// Sets the requested strategy and folds in the effective tally.
    #[must_use]
    pub fn with_links(mut self, requested: LinkStrategy, tally: &LinkTally) -> Self {
        self.link_strategy = Some(requested);
        self.link_strategy_used = tally.most_degraded(requested);
        self.link_counts = tally.to_map();
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets a stage-specific value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extra.insert(key.into(), value);
    }

    /// Records the number of items kept for a class label.
    pub fn set_kept(&mut self, class: &str, count: u64) {
        self.set_extra(format!("kept_{class}"), serde_json::json!(count));
    }

    /// Returns the number of items kept for a class label.
    #[must_use]
    pub fn kept(&self, class: &str) -> u64 {
        self.extra
            .get(&format!("kept_{class}"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Items seen by the stage, including failures.
    #[must_use]
    pub fn input_total(&self) -> u64 {
        self.processed + self.failed
    }

    /// Whether `processed == saved + discarded`.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.processed == self.saved + self.discarded
    }

    /// Fills in `kept_ratio` and `<class>_ratio` for every `kept_<class>`
    /// key, leaving values a stage already reported untouched.
    pub fn derive_ratios(&mut self) {
        let processed = self.processed;
        let saved = self.saved;
        let kept_classes: Vec<(String, u64)> = self
            .extra
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("kept_")
                    .filter(|class| *class != "ratio")
                    .and_then(|class| v.as_u64().map(|n| (class.to_string(), n)))
            })
            .collect();

        for (class, kept) in kept_classes {
            self.extra
                .entry(format!("{class}_ratio"))
                .or_insert_with(|| serde_json::json!(ratio(kept, processed)));
        }
        self.extra
            .entry("kept_ratio".to_string())
            .or_insert_with(|| serde_json::json!(ratio(saved, processed)));
    }

    /// Writes the stats as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, body)
    }

    /// Reads stats from a JSON file.
    pub fn read_json(path: &Path) -> io::Result<Self> {
        let body = fs::read_to_string(path)?;
        Self::from_json_str(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Parses a stats document.
    ///
    /// A `passed` key stands in for `saved` only when `saved` is absent;
    /// otherwise it is kept as an extra key.
    pub fn from_json_str(body: &str) -> serde_json::Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(body)?;
        if let Some(object) = value.as_object_mut() {
            if !object.contains_key("saved") {
                if let Some(passed) = object.remove("passed") {
                    object.insert("saved".to_string(), passed);
                }
            }
        }
        serde_json::from_value(value)
    }
}
