use proptest::prelude::*;
use vbow::*;

const NORMALIZED: [ScoringType; 4] = [
    ScoringType::L1,
    ScoringType::L2,
    ScoringType::ChiSquare,
    ScoringType::Bhattacharyya,
];

fn bow_strategy() -> impl Strategy<Value = BowVector> {
    prop::collection::btree_map(0usize..64, 0.001f64..10., 1..20)
        .prop_map(|m| m.into_iter().collect::<BowVector>())
}

fn normalized(mut v: BowVector, s: ScoringType) -> BowVector {
    if let Some(norm) = s.norm() {
        v.normalize(norm);
    }
    v
}

proptest! {
    #[test]
    fn scores_are_symmetric(a in bow_strategy(), b in bow_strategy()) {
        for s in NORMALIZED.iter().copied().chain(std::iter::once(ScoringType::DotProduct)) {
            let (a, b) = (normalized(a.clone(), s), normalized(b.clone(), s));
            prop_assert!((s.score(&a, &b) - s.score(&b, &a)).abs() < 1e-12);
        }
    }

    #[test]
    fn self_score_is_the_maximum(a in bow_strategy(), b in bow_strategy()) {
        for s in NORMALIZED.iter().copied() {
            let (a, b) = (normalized(a.clone(), s), normalized(b.clone(), s));
            let max = s.max_score().unwrap();
            prop_assert!((s.score(&a, &a) - max).abs() < 1e-9);
            prop_assert!(s.score(&a, &b) <= max + 1e-9);
            prop_assert!(s.score(&a, &b) >= -1e-12);
        }
    }

    #[test]
    fn l1_score_is_two_minus_l1_distance(a in bow_strategy(), b in bow_strategy()) {
        let a = normalized(a, ScoringType::L1);
        let b = normalized(b, ScoringType::L1);
        let words: std::collections::BTreeSet<WordId> = a.words().chain(b.words()).collect();
        let dist: f64 = words.iter().map(|&w| (a.get(w) - b.get(w)).abs()).sum();
        prop_assert!((ScoringType::L1.score(&a, &b) - (2. - dist)).abs() < 1e-9);
    }

    #[test]
    fn l2_score_is_two_minus_squared_distance(a in bow_strategy(), b in bow_strategy()) {
        let a = normalized(a, ScoringType::L2);
        let b = normalized(b, ScoringType::L2);
        prop_assert!((ScoringType::L2.score(&a, &b) - (2. - a.squared_distance(&b))).abs() < 1e-9);
    }

    #[test]
    fn disjoint_vectors_score_zero(a in bow_strategy(), b in bow_strategy()) {
        let b: BowVector = b.iter().map(|(w, v)| (w + 64, v)).collect();
        for s in NORMALIZED.iter().copied().chain(std::iter::once(ScoringType::DotProduct)) {
            let (a, b) = (normalized(a.clone(), s), normalized(b.clone(), s));
            prop_assert_eq!(s.score(&a, &b), 0.);
        }
    }
}
