use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, iter::Peekable};

use crate::{scoring::ScoringType, BowErr, BowResult, NodeId, WordId};

/// Bag-of-Words representation of an image or descriptor set.
///
/// Key: word/leaf id in the vocabulary.
///
/// Value: total weight of that word in provided features. Absent words weigh 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BowVector(BTreeMap<WordId, f64>);

/// Norm used to normalize a [`BowVector`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LNorm {
    L1,
    L2,
}

impl BowVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `v` to the weight of word `id`.
    pub fn add_weight(&mut self, id: WordId, v: f64) {
        *self.0.entry(id).or_insert(0.) += v;
    }

    /// Set the weight of word `id` unless it already has one.
    pub fn add_if_not_exist(&mut self, id: WordId, v: f64) {
        self.0.entry(id).or_insert(v);
    }

    pub fn get(&self, id: WordId) -> f64 {
        self.0.get(&id).copied().unwrap_or(0.)
    }

    pub fn contains(&self, id: WordId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// (word, weight) pairs in ascending word order.
    pub fn iter(&self) -> impl Iterator<Item = (WordId, f64)> + '_ {
        self.0.iter().map(|(&w, &v)| (w, v))
    }

    pub fn words(&self) -> impl Iterator<Item = WordId> + '_ {
        self.0.keys().copied()
    }

    /// Norm of the vector under `norm`.
    pub fn norm(&self, norm: LNorm) -> f64 {
        match norm {
            LNorm::L1 => self.0.values().map(|v| v.abs()).sum(),
            LNorm::L2 => self.0.values().map(|v| v * v).sum::<f64>().sqrt(),
        }
    }

    /// Scale the vector to unit norm. An all-zero vector is left untouched.
    pub fn normalize(&mut self, norm: LNorm) {
        let n = self.norm(norm);
        if n > 0. {
            let inv = 1. / n;
            for w in self.0.values_mut() {
                *w *= inv;
            }
        }
    }

    pub(crate) fn scale(&mut self, s: f64) {
        for w in self.0.values_mut() {
            *w *= s;
        }
    }

    /// Drop words whose weight is not strictly positive.
    pub(crate) fn retain_positive(&mut self) {
        self.0.retain(|_, v| *v > 0.);
    }

    /// Squared Euclidean distance, the raw distance form of the L2 score.
    pub fn squared_distance(&self, other: &Self) -> f64 {
        union(self, other).map(|(_, a, b)| (a - b) * (a - b)).sum()
    }
}

impl std::iter::FromIterator<(WordId, f64)> for BowVector {
    fn from_iter<I: IntoIterator<Item = (WordId, f64)>>(iter: I) -> Self {
        let mut bow = BowVector::new();
        for (w, v) in iter {
            bow.add_weight(w, v);
        }
        bow
    }
}

impl fmt::Display for BowVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (w, v) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "<{}, {}>", w, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Iterate the union of the words of two vectors as `(word, a[word], b[word])`,
/// in ascending word order. Missing weights read as 0.
pub(crate) fn union<'a>(a: &'a BowVector, b: &'a BowVector) -> Union<'a> {
    Union {
        a: a.0.iter().peekable(),
        b: b.0.iter().peekable(),
    }
}

pub(crate) struct Union<'a> {
    a: Peekable<std::collections::btree_map::Iter<'a, WordId, f64>>,
    b: Peekable<std::collections::btree_map::Iter<'a, WordId, f64>>,
}

impl<'a> Iterator for Union<'a> {
    type Item = (WordId, f64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let wa = self.a.peek().map(|&(&w, _)| w);
        let wb = self.b.peek().map(|&(&w, _)| w);
        match (wa, wb) {
            (None, None) => None,
            (Some(_), None) => self.a.next().map(|(&w, &v)| (w, v, 0.)),
            (None, Some(_)) => self.b.next().map(|(&w, &v)| (w, 0., v)),
            (Some(wa), Some(wb)) if wa < wb => self.a.next().map(|(&w, &v)| (w, v, 0.)),
            (Some(wa), Some(wb)) if wb < wa => self.b.next().map(|(&w, &v)| (w, 0., v)),
            (Some(w), Some(_)) => {
                let (_, &va) = self.a.next()?;
                let (_, &vb) = self.b.next()?;
                Some((w, va, vb))
            }
        }
    }
}

/// Direct index: maps a vocabulary node to the positions of the features
/// that quantized through it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FeatureVector(BTreeMap<NodeId, Vec<usize>>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that feature `i_feature` passed through `node`.
    pub fn add_feature(&mut self, node: NodeId, i_feature: usize) {
        self.0.entry(node).or_default().push(i_feature);
    }

    pub fn get(&self, node: NodeId) -> Option<&[usize]> {
        self.0.get(&node).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[usize])> + '_ {
        self.0.iter().map(|(&n, f)| (n, f.as_slice()))
    }
}

/// How word weights are computed from the training corpus and combined with
/// term frequency when transforming a descriptor set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightingType {
    /// Term frequency times inverse document frequency.
    TfIdf,
    /// Term frequency only. Every word weighs 1.
    Tf,
    /// Inverse document frequency only. Each word counts once per image.
    Idf,
    /// Presence indicator. Every word weighs 1 and counts once per image.
    Binary,
}

impl WeightingType {
    /// Whether word weights come from document frequencies in the training set.
    pub fn uses_idf(self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Idf)
    }

    /// Whether repeated occurrences of a word accumulate.
    pub fn uses_tf(self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Tf)
    }

    /// Integer code used by the text format.
    pub fn code(self) -> u32 {
        match self {
            WeightingType::TfIdf => 0,
            WeightingType::Tf => 1,
            WeightingType::Idf => 2,
            WeightingType::Binary => 3,
        }
    }

    pub fn from_code(code: u32) -> BowResult<Self> {
        match code {
            0 => Ok(WeightingType::TfIdf),
            1 => Ok(WeightingType::Tf),
            2 => Ok(WeightingType::Idf),
            3 => Ok(WeightingType::Binary),
            c => Err(BowErr::corrupt(0, format!("unknown weighting type {}", c))),
        }
    }
}

/// The (weighting, scoring) pair a vector was produced under. Vectors of
/// different kinds must never be compared.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BowKind {
    pub weighting: WeightingType,
    pub scoring: ScoringType,
}

impl fmt::Display for BowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.weighting, self.scoring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(pairs: &[(WordId, f64)]) -> BowVector {
        pairs.iter().copied().collect()
    }

    #[test]
    fn add_weight_accumulates() {
        let mut v = BowVector::new();
        v.add_weight(3, 0.5);
        v.add_weight(3, 0.25);
        v.add_if_not_exist(3, 10.);
        v.add_if_not_exist(1, 2.);
        assert_eq!(v.get(3), 0.75);
        assert_eq!(v.get(1), 2.);
        assert_eq!(v.get(7), 0.);
        assert_eq!(v.words().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn normalize_l1_and_l2() {
        let mut v = bow(&[(0, 3.), (4, 1.)]);
        v.normalize(LNorm::L1);
        assert_eq!(v.get(0), 0.75);
        assert_eq!(v.get(4), 0.25);

        let mut v = bow(&[(0, 3.), (4, 4.)]);
        v.normalize(LNorm::L2);
        assert!((v.norm(LNorm::L2) - 1.).abs() < 1e-12);
        assert!((v.get(0) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn normalize_empty_is_noop() {
        let mut v = BowVector::new();
        v.normalize(LNorm::L1);
        assert!(v.is_empty());
    }

    #[test]
    fn union_walks_both_vectors_in_order() {
        let a = bow(&[(1, 1.), (3, 3.)]);
        let b = bow(&[(2, 2.), (3, 4.), (9, 9.)]);
        let u: Vec<_> = union(&a, &b).collect();
        assert_eq!(
            u,
            vec![(1, 1., 0.), (2, 0., 2.), (3, 3., 4.), (9, 0., 9.)]
        );
        assert_eq!(a.squared_distance(&b), 1. + 4. + 1. + 81.);
    }

    #[test]
    fn feature_vector_groups_by_node() {
        let mut fv = FeatureVector::new();
        fv.add_feature(5, 0);
        fv.add_feature(2, 1);
        fv.add_feature(5, 2);
        assert_eq!(fv.get(5), Some(&[0, 2][..]));
        assert_eq!(fv.get(2), Some(&[1][..]));
        assert_eq!(fv.get(3), None);
        assert_eq!(fv.len(), 2);
    }

    #[test]
    fn weighting_codes() {
        for w in [
            WeightingType::TfIdf,
            WeightingType::Tf,
            WeightingType::Idf,
            WeightingType::Binary,
        ] {
            assert_eq!(WeightingType::from_code(w.code()).unwrap(), w);
        }
        assert!(WeightingType::from_code(4).is_err());
    }
}
