use serde::{Deserialize, Serialize};

use crate::{
    bow::{union, BowVector, LNorm},
    BowErr, BowResult,
};

/// Similarity between two bag-of-words vectors. Every mode is a similarity:
/// higher means more alike, and vectors with no word in common score 0.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoringType {
    /// `2 - |a - b|_1` over L1 normalized vectors. Range `[0, 2]`.
    L1,
    /// `2 - |a - b|_2^2` over L2 normalized vectors. Range `[0, 2]`.
    L2,
    /// `2 * sum(a_i * b_i / (a_i + b_i))` over L1 normalized vectors. Range `[0, 1]`.
    ChiSquare,
    /// `sum(sqrt(a_i * b_i))` over L1 normalized vectors. Range `[0, 1]`.
    Bhattacharyya,
    /// `sum(a_i * b_i)` over unnormalized vectors. Unbounded.
    DotProduct,
}

impl ScoringType {
    /// Norm vectors must be normalized with before scoring, if any.
    pub fn norm(self) -> Option<LNorm> {
        match self {
            ScoringType::L1 | ScoringType::ChiSquare | ScoringType::Bhattacharyya => {
                Some(LNorm::L1)
            }
            ScoringType::L2 => Some(LNorm::L2),
            ScoringType::DotProduct => None,
        }
    }

    /// Score of a normalized vector against itself.
    pub fn max_score(self) -> Option<f64> {
        match self {
            ScoringType::L1 | ScoringType::L2 => Some(2.),
            ScoringType::ChiSquare | ScoringType::Bhattacharyya => Some(1.),
            ScoringType::DotProduct => None,
        }
    }

    /// Score of two vectors sharing no word.
    pub fn min_score(self) -> f64 {
        0.
    }

    /// Compute the similarity of `a` and `b`. Only words present in at least
    /// one of the two vectors are visited.
    pub fn score(self, a: &BowVector, b: &BowVector) -> f64 {
        match self {
            // |x| + |y| - |x - y| vanishes unless both weights are non-zero,
            // and sums to 2 - |a - b|_1 when both vectors are L1 normalized.
            ScoringType::L1 => union(a, b)
                .map(|(_, x, y)| x.abs() + y.abs() - (x - y).abs())
                .sum(),
            // 2 - |a - b|^2 == 2 a.b for unit vectors.
            ScoringType::L2 => 2. * union(a, b).map(|(_, x, y)| x * y).sum::<f64>(),
            ScoringType::ChiSquare => {
                2. * union(a, b)
                    .filter(|(_, x, y)| x + y != 0.)
                    .map(|(_, x, y)| x * y / (x + y))
                    .sum::<f64>()
            }
            ScoringType::Bhattacharyya => union(a, b).map(|(_, x, y)| (x * y).sqrt()).sum(),
            ScoringType::DotProduct => union(a, b).map(|(_, x, y)| x * y).sum(),
        }
    }

    /// Integer code used by the text format. Code 3 is reserved for the
    /// asymmetric KL divergence, which is not supported.
    pub fn code(self) -> u32 {
        match self {
            ScoringType::L1 => 0,
            ScoringType::L2 => 1,
            ScoringType::ChiSquare => 2,
            ScoringType::Bhattacharyya => 4,
            ScoringType::DotProduct => 5,
        }
    }

    pub fn from_code(code: u32) -> BowResult<Self> {
        match code {
            0 => Ok(ScoringType::L1),
            1 => Ok(ScoringType::L2),
            2 => Ok(ScoringType::ChiSquare),
            4 => Ok(ScoringType::Bhattacharyya),
            5 => Ok(ScoringType::DotProduct),
            c => Err(BowErr::corrupt(0, format!("unknown scoring type {}", c))),
        }
    }
}
