// THEORY:
// The `RegionMatcher` decides which old segment shows the same content as
// which new segment. It compares descriptor bags, not positions, so a region
// that moved a few pixels still finds its partner.
//
// Key architectural principles & algorithm steps:
// 1.  **Bidirectional Nearest Neighbors**: For a candidate pair, every old row
//     is matched to its closest new row and every new row to its closest old
//     row (L2 distance, first minimum wins ties).
// 2.  **Median-by-Rank Acceptance**: A match list is summarized by the distance
//     at index `len / 2` after sorting. The pair is accepted when that distance
//     is at most `MAX_MEDIAN_DISTANCE`.
//     - Without cross-check, either direction may accept the pair (recall).
//     - With cross-check, only mutually consistent old→new matches are kept and
//       their median must pass (precision).
// 3.  **First Available Wins**: Old segments are visited serially. For each, the
//     new segments are scanned in parallel and the lowest-index unmatched
//     accepted candidate is claimed. Both flags are claimed with
//     compare-and-set, so the result is a one-to-one mapping and does not
//     depend on thread scheduling.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::core_modules::descriptor::Descriptors;
use crate::core_modules::segment::{MatchPair, Segment};

/// Inclusive upper bound on the median-by-rank distance of an accepted pair.
pub const MAX_MEDIAN_DISTANCE: f32 = 1.0;

/// Nearest-neighbor correspondence between two descriptor rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct RegionMatcher {
    pub cross_check: bool,
    pub max_distance: f32,
}

impl RegionMatcher {
    pub fn new(cross_check: bool) -> Self {
        Self {
            cross_check,
            max_distance: MAX_MEDIAN_DISTANCE,
        }
    }

    /// The acceptance rule for one (old, new) descriptor pair.
    pub fn accepts(&self, old: &Descriptors, new: &Descriptors) -> bool {
        if old.is_empty() || new.is_empty() {
            return false;
        }
        let forward = nearest_neighbors(old, new);
        let backward = nearest_neighbors(new, old);

        if self.cross_check {
            let mut mutual: Vec<f32> = forward
                .iter()
                .filter(|m| backward[m.train].train == m.query)
                .map(|m| m.distance)
                .collect();
            self.within_limit(&mut mutual)
        } else {
            let mut forward: Vec<f32> = forward.iter().map(|m| m.distance).collect();
            let mut backward: Vec<f32> = backward.iter().map(|m| m.distance).collect();
            self.within_limit(&mut forward) || self.within_limit(&mut backward)
        }
    }

    fn within_limit(&self, distances: &mut [f32]) -> bool {
        median_by_rank(distances).is_some_and(|median| median <= self.max_distance)
    }

    /// Pairs old and new segments. Segments without a descriptor are skipped.
    pub fn assign(&self, old: &[Segment<'_>], new: &[Segment<'_>]) -> Vec<MatchPair> {
        let mut pairs = Vec::new();

        for (old_index, old_segment) in old.iter().enumerate() {
            let Some(old_descriptor) = old_segment.descriptor() else {
                continue;
            };
            if old_segment.is_matched() {
                continue;
            }

            let candidate = new
                .par_iter()
                .enumerate()
                .filter(|(_, segment)| !segment.is_matched())
                .find_first(|(_, segment)| {
                    segment
                        .descriptor()
                        .is_some_and(|descriptor| self.accepts(old_descriptor, descriptor))
                });

            let Some((new_index, new_segment)) = candidate else {
                trace!(old_index, "no partner found");
                continue;
            };
            if !new_segment.try_mark_matched() {
                debug!(old_index, new_index, "candidate claimed concurrently");
                continue;
            }
            old_segment.try_mark_matched();
            pairs.push(MatchPair {
                old: old_index,
                new: new_index,
            });
        }

        debug!(pairs = pairs.len(), "region matching finished");
        pairs
    }
}

/// Closest `train` row for every `query` row.
pub fn nearest_neighbors(query: &Descriptors, train: &Descriptors) -> Vec<Correspondence> {
    query
        .iter_rows()
        .enumerate()
        .filter_map(|(query_index, row)| {
            train
                .iter_rows()
                .enumerate()
                .map(|(train_index, candidate)| (train_index, l2_distance(row, candidate)))
                .fold(None, |best: Option<(usize, f32)>, (index, distance)| match best {
                    Some((_, best_distance)) if best_distance <= distance => best,
                    _ => Some((index, distance)),
                })
                .map(|(train_index, distance)| Correspondence {
                    query: query_index,
                    train: train_index,
                    distance,
                })
        })
        .collect()
}

/// Sorts `distances` and returns the entry at index `len / 2`.
pub fn median_by_rank(distances: &mut [f32]) -> Option<f32> {
    if distances.is_empty() {
        return None;
    }
    distances.sort_by(f32::total_cmp);
    Some(distances[distances.len() / 2])
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
