//! Bounded top-k sampling.
//!
//! Stages keep a handful of the most confident items per class for human
//! review. [`TopK`] is the generic bounded collection; [`ClassSamples`]
//! keys one of them per class label and materializes the result through the
//! artifact router.

use crate::core::{LinkStrategy, LinkTally};
use crate::errors::RouterError;
use crate::router::ArtifactRouter;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A payload ordered by its score only.
#[derive(Debug, Clone)]
pub struct Scored<S, T> {
    /// Ranking key.
    pub score: S,
    /// Carried value.
    pub item: T,
}

impl<S: PartialOrd, T> PartialEq for Scored<S, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<S: PartialOrd, T> Eq for Scored<S, T> {}

impl<S: PartialOrd, T> PartialOrd for Scored<S, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: PartialOrd, T> Ord for Scored<S, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal)
    }
}

/// Keeps the `k` highest-scoring items offered to it.
///
/// Backed by a min-heap: once full, an item is admitted only if its score
/// strictly exceeds the current minimum, which it evicts. Order among equal
/// scores is unspecified.
#[derive(Debug, Clone)]
pub struct TopK<S, T> {
    k: usize,
    heap: BinaryHeap<Reverse<Scored<S, T>>>,
}

impl<S: PartialOrd, T> TopK<S, T> {
    /// Creates an empty collection bounded at `k`.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k),
        }
    }

    /// The bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.k
    }

    /// Number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Lowest retained score.
    #[must_use]
    pub fn min_score(&self) -> Option<&S> {
        self.heap.peek().map(|Reverse(s)| &s.score)
    }

    /// Offers an item; returns whether it was retained.
    pub fn offer(&mut self, score: S, item: T) -> bool {
        if self.k == 0 {
            return false;
        }
        let entry = Scored { score, item };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(entry));
            return true;
        }
        match self.heap.peek() {
            Some(Reverse(min)) if entry.score > min.score => {
                self.heap.pop();
                self.heap.push(Reverse(entry));
                true
            }
            _ => false,
        }
    }

    /// Consumes the collection, returning items by descending score.
    #[must_use]
    pub fn into_sorted_desc(self) -> Vec<Scored<S, T>> {
        // Ascending order of Reverse is descending order of score.
        self.heap.into_sorted_vec().into_iter().map(|Reverse(s)| s).collect()
    }
}

/// Per-class top-k of scored files.
#[derive(Debug, Clone)]
pub struct ClassSamples {
    k: usize,
    classes: BTreeMap<String, TopK<f32, PathBuf>>,
}

impl ClassSamples {
    /// Creates samples bounded at `k` per class.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            classes: BTreeMap::new(),
        }
    }

    /// Offers a file under `class` ranked by `confidence`.
    pub fn offer(&mut self, class: &str, confidence: f32, path: &Path) -> bool {
        let k = self.k;
        if k == 0 {
            return false;
        }
        self.classes
            .entry(class.to_string())
            .or_insert_with(|| TopK::new(k))
            .offer(confidence, path.to_path_buf())
    }

    /// Retained items for a class, without consuming.
    #[must_use]
    pub fn len(&self, class: &str) -> usize {
        self.classes.get(class).map_or(0, TopK::len)
    }

    /// Writes every retained item to `samples_dir/<class>/NNN_<file name>`,
    /// rank 1 being the most confident.
    pub fn materialize(
        self,
        router: &ArtifactRouter,
        samples_dir: &Path,
        strategy: LinkStrategy,
    ) -> Result<LinkTally, RouterError> {
        let mut tally = LinkTally::new();
        for (class, top) in self.classes {
            let class_dir = samples_dir.join(&class);
            for (rank, entry) in top.into_sorted_desc().into_iter().enumerate() {
                let name = entry
                    .item
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let dst = class_dir.join(format!("{:03}_{name}", rank + 1));
                tally.record(router.place(&entry.item, &dst, strategy)?);
            }
            debug!(class = %class, dir = %class_dir.display(), "samples materialized");
        }
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn scores<T>(top: TopK<f64, T>) -> Vec<f64> {
        top.into_sorted_desc().into_iter().map(|s| s.score).collect()
    }

    #[test]
    fn test_keeps_two_best_in_descending_order() {
        let mut top = TopK::new(2);
        for (i, s) in [0.3, 0.9, 0.5, 0.95].into_iter().enumerate() {
            top.offer(s, i);
        }
        assert_eq!(scores(top), vec![0.95, 0.9]);
    }

    #[test]
    fn test_bound_and_no_better_item_discarded() {
        let mut top = TopK::new(3);
        let mut rejected = Vec::new();
        let stream = [0.1, 0.7, 0.4, 0.2, 0.9, 0.05, 0.6, 0.8, 0.3];
        for s in stream {
            if !top.offer(s, ()) {
                rejected.push(s);
            }
            assert!(top.len() <= 3);
        }
        let kept = scores(top);
        let worst_kept = kept.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(rejected.iter().all(|r| *r <= worst_kept));
        assert_eq!(kept, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_equal_score_not_admitted_when_full() {
        let mut top = TopK::new(1);
        assert!(top.offer(0.5, "a"));
        assert!(!top.offer(0.5, "b"));
        assert_eq!(top.min_score(), Some(&0.5));
    }

    #[test]
    fn test_zero_bound_keeps_nothing() {
        let mut top = TopK::new(0);
        assert!(!top.offer(1.0, ()));
        assert!(top.is_empty());
    }

    #[test]
    fn test_materialize_rank_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("tiles");
        fs::create_dir_all(&src_dir).unwrap();

        let mut samples = ClassSamples::new(2);
        for (name, conf) in [("a.jpg", 0.6_f32), ("b.jpg", 0.99), ("c.jpg", 0.7)] {
            let path = src_dir.join(name);
            fs::write(&path, name).unwrap();
            samples.offer("tissue", conf, &path);
        }
        assert_eq!(samples.len("tissue"), 2);

        let out = dir.path().join("_samples");
        let tally = samples
            .materialize(&ArtifactRouter::default(), &out, LinkStrategy::Copy)
            .unwrap();

        assert_eq!(tally.count(LinkStrategy::Copy), 2);
        assert_eq!(fs::read_to_string(out.join("tissue/001_b.jpg")).unwrap(), "b.jpg");
        assert_eq!(fs::read_to_string(out.join("tissue/002_c.jpg")).unwrap(), "c.jpg");
        assert!(!out.join("tissue/003_a.jpg").exists());
    }
}
