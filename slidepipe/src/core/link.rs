//! Link strategies for materializing classification outcomes.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a source file is exposed at a destination path.
///
/// How far a placement degraded is judged against the requested strategy's
/// [`fallback order`](LinkStrategy::fallback_order), not the variant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStrategy {
    /// Symbolic link to the absolute source path.
    Symlink,
    /// Hard link (same filesystem only).
    Hardlink,
    /// Full byte copy.
    Copy,
    /// Nothing is placed.
    None,
}

impl Default for LinkStrategy {
    fn default() -> Self {
        Self::Symlink
    }
}

impl LinkStrategy {
    /// Every accepted value, in declaration order.
    pub const ALL: [Self; 4] = [Self::Symlink, Self::Hardlink, Self::Copy, Self::None];

    /// Returns the wire name of the strategy.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Symlink => "symlink",
            Self::Hardlink => "hardlink",
            Self::Copy => "copy",
            Self::None => "none",
        }
    }

    /// Strategies this one may fall back to, starting with itself.
    #[must_use]
    pub fn fallback_order(self) -> &'static [Self] {
        match self {
            Self::Symlink => &[Self::Symlink, Self::Hardlink, Self::Copy],
            Self::Hardlink => &[Self::Hardlink, Self::Symlink, Self::Copy],
            Self::Copy => &[Self::Copy],
            Self::None => &[],
        }
    }

    /// Returns true if the strategy places anything at all.
    #[must_use]
    pub fn places(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symlink" => Ok(Self::Symlink),
            "hardlink" => Ok(Self::Hardlink),
            "copy" => Ok(Self::Copy),
            "none" => Ok(Self::None),
            _ => Err(ConfigError::invalid(
                "link_strategy",
                s,
                "one of symlink|hardlink|copy|none",
            )),
        }
    }
}

/// Running count of the strategies that actually took effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTally {
    counts: BTreeMap<LinkStrategy, u64>,
}

impl LinkTally {
    /// Creates an empty tally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one placement.
    pub fn record(&mut self, effective: LinkStrategy) {
        *self.counts.entry(effective).or_insert(0) += 1;
    }

    /// Adds every count from another tally.
    pub fn merge(&mut self, other: &Self) {
        for (strategy, count) in &other.counts {
            *self.counts.entry(*strategy).or_insert(0) += count;
        }
    }

    /// Number of placements that used `strategy`.
    #[must_use]
    pub fn count(&self, strategy: LinkStrategy) -> u64 {
        self.counts.get(&strategy).copied().unwrap_or(0)
    }

    /// Total placements recorded, including no-ops.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// The strategy furthest down `requested`'s fallback order that placed
    /// a file, if any did. Strategies outside that order rank last.
    #[must_use]
    pub fn most_degraded(&self, requested: LinkStrategy) -> Option<LinkStrategy> {
        let order = requested.fallback_order();
        self.counts
            .keys()
            .copied()
            .filter(|s| s.places())
            .max_by_key(|s| order.iter().position(|o| o == s).unwrap_or(order.len()))
    }

    /// Counts keyed by wire name, for stats artifacts.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect()
    }
}
