use crate::features::{DescriptorKind, Descriptors, View};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Errors raised by the correspondence matcher.
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    /// Fewer matches survived the ratio test than the caller requires.
    #[error("insufficient correspondences: required {required}, found {found}")]
    InsufficientCorrespondences {
        /// Minimum number of matches.
        required: usize,
        /// Number of matches found.
        found: usize,
    },
    /// The two descriptor sets cannot be compared.
    #[error("incompatible descriptors: {left:?} vs {right:?}")]
    IncompatibleDescriptors {
        /// Layout of the query set.
        left: DescriptorKind,
        /// Layout of the train set.
        right: DescriptorKind,
    },
}

/// Parameters of the nearest-neighbour ratio-test matcher.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParams {
    /// Accept a match only if `d1 < ratio * d2`.
    pub ratio: f32,
    /// Minimum number of matches before the pair is reported usable.
    pub min_matches: usize,
    /// Keep only mutual nearest neighbours.
    pub cross_check: bool,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            ratio: 0.75,
            min_matches: 8,
            cross_check: false,
        }
    }
}

impl MatchingParams {
    /// Set the ratio-test threshold.
    pub fn with_ratio(mut self, ratio: f32) -> Self {
        self.ratio = ratio;
        self
    }

    /// Set the minimum number of matches.
    pub fn with_min_matches(mut self, min_matches: usize) -> Self {
        self.min_matches = min_matches;
        self
    }

    /// Enable or disable mutual consistency checking.
    pub fn with_cross_check(mut self, cross_check: bool) -> Self {
        self.cross_check = cross_check;
        self
    }
}

/// A match between descriptor `query` of set A and descriptor `train` of set B.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DescriptorMatch {
    /// Index into the query set.
    pub query: usize,
    /// Index into the train set.
    pub train: usize,
    /// Descriptor distance of the match.
    pub distance: f32,
}

/// A 2D-2D correspondence between two images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Correspondence {
    /// Index of image A.
    pub view_a: usize,
    /// Keypoint index in image A.
    pub keypoint_a: usize,
    /// Index of image B.
    pub view_b: usize,
    /// Keypoint index in image B.
    pub keypoint_b: usize,
}

// the two nearest train descriptors of one query as (index, distance)
fn two_nearest(a: &Descriptors, i: usize, b: &Descriptors) -> Option<((usize, f32), f32)> {
    let q = a.get(i)?;
    let mut best = (usize::MAX, f32::INFINITY);
    let mut second = f32::INFINITY;
    for j in 0..b.len() {
        let d = match b.get(j).and_then(|t| q.distance(&t)) {
            Some(d) => d,
            None => continue,
        };
        if d < best.1 {
            second = best.1;
            best = (j, d);
        } else if d < second {
            second = d;
        }
    }
    (best.0 != usize::MAX).then_some((best, second))
}

fn nearest(a: &Descriptors, i: usize, b: &Descriptors) -> Option<usize> {
    two_nearest(a, i, b).map(|((j, _), _)| j)
}

/// Match two descriptor sets with a 2-nearest-neighbour ratio test.
///
/// Every query descriptor of `a` is compared against all descriptors of `b`; the query is
/// kept only if its nearest distance is below `ratio` times the second-nearest one.
/// Queries are processed in parallel and the output keeps query order.
///
/// # Errors
///
/// [`MatchingError::InsufficientCorrespondences`] when fewer than `params.min_matches`
/// matches survive, [`MatchingError::IncompatibleDescriptors`] when the sets differ in layout.
pub fn match_descriptors(
    a: &Descriptors,
    b: &Descriptors,
    params: &MatchingParams,
) -> Result<Vec<DescriptorMatch>, MatchingError> {
    if a.kind() != b.kind() {
        return Err(MatchingError::IncompatibleDescriptors {
            left: a.kind(),
            right: b.kind(),
        });
    }

    let matches: Vec<DescriptorMatch> = (0..a.len())
        .into_par_iter()
        .filter_map(|i| {
            let ((j, d1), d2) = two_nearest(a, i, b)?;
            // a lone candidate cannot be disambiguated
            if !d2.is_finite() || d1 >= params.ratio * d2 {
                return None;
            }
            if params.cross_check && nearest(b, j, a) != Some(i) {
                return None;
            }
            Some(DescriptorMatch {
                query: i,
                train: j,
                distance: d1,
            })
        })
        .collect();

    log::debug!(
        "ratio test kept {} of {} queries against {} candidates",
        matches.len(),
        a.len(),
        b.len()
    );

    if matches.len() < params.min_matches {
        return Err(MatchingError::InsufficientCorrespondences {
            required: params.min_matches,
            found: matches.len(),
        });
    }
    Ok(matches)
}

/// Match the descriptors of two views and return image correspondences.
pub fn match_views(
    view_a: usize,
    a: &View,
    view_b: usize,
    b: &View,
    params: &MatchingParams,
) -> Result<Vec<Correspondence>, MatchingError> {
    let matches = match_descriptors(a.descriptors(), b.descriptors(), params)?;
    Ok(matches
        .into_iter()
        .map(|m| Correspondence {
            view_a,
            keypoint_a: m.query,
            view_b,
            keypoint_b: m.train,
        })
        .collect())
}

/// Match many independent view pairs in parallel.
///
/// Results are returned in the order of `pairs`.
pub fn match_pairs(
    views: &[View],
    pairs: &[(usize, usize)],
    params: &MatchingParams,
) -> Vec<Result<Vec<Correspondence>, MatchingError>> {
    pairs
        .par_iter()
        .map(|&(i, j)| match_views(i, &views[i], j, &views[j], params))
        .collect()
}
