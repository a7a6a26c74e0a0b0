use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, RwLock};
use vbow::*;

fn random_embeddings(n_images: usize, per_image: usize, dim: usize, seed: u64) -> Vec<Vec<Embedding>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_images)
        .map(|_| {
            (0..per_image)
                .map(|_| Embedding::new((0..dim).map(|_| rng.gen::<f32>()).collect()))
                .collect()
        })
        .collect()
}

/// Images made of noisy copies of a few shared "places".
fn place_images(n_images: usize, seed: u64) -> Vec<Vec<FloatDescriptor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let places: Vec<Vec<f32>> = (0..12)
        .map(|_| (0..8).map(|_| rng.gen_range(-50f32..50.)).collect())
        .collect();
    (0..n_images)
        .map(|i| {
            (0..16)
                .map(|j| {
                    let p = &places[(i * 3 + j % 4) % places.len()];
                    FloatDescriptor::new(p.iter().map(|x| x + rng.gen_range(-1f32..1.)).collect())
                })
                .collect()
        })
        .collect()
}

#[test]
fn cnn_scenario_every_image_retrieves_itself() {
    let images = random_embeddings(200, 2, 4096, 7);
    let params = VocabularyParams::new(10, 6).max_iterations(10).seed(3);
    let voc = Vocabulary::build(&images, params).unwrap();
    assert!(voc.num_words() <= 10usize.pow(6));

    let mut db = Database::new(voc, DatabaseParams::default());
    for (i, img) in images.iter().enumerate() {
        assert_eq!(db.add(img).unwrap(), i);
    }
    for (i, img) in images.iter().enumerate() {
        let ret = db.query(img, 5).unwrap();
        assert_eq!(ret[0].id, i, "query {} returned {:?}", i, ret);
        assert!((ret[0].score - 2.).abs() < 1e-9);
    }
}

#[test]
fn self_query_reaches_max_score_under_every_norm() {
    let images = place_images(30, 11);
    for scoring in [
        ScoringType::L1,
        ScoringType::L2,
        ScoringType::ChiSquare,
        ScoringType::Bhattacharyya,
    ] {
        let params = VocabularyParams::new(4, 4).scoring(scoring);
        let voc = Vocabulary::build(&images, params).unwrap();
        let max = scoring.max_score().unwrap();
        let mut db = Database::new(voc, DatabaseParams::default());
        for img in images.iter() {
            db.add(img).unwrap();
        }
        for (i, img) in images.iter().enumerate() {
            let ret = db.query(img, 1).unwrap();
            assert_eq!(ret.len(), 1);
            assert!((ret[0].score - max).abs() < 1e-9, "{:?}", scoring);
            // identical images tie at the top and the lowest id wins
            let first_copy = images.iter().position(|x| x == img).unwrap();
            assert!(ret[0].id == i || ret[0].id == first_copy);
        }
    }
}

#[test]
fn empty_database_answers_nothing() {
    let images = place_images(10, 1);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap();
    let db = Database::new(voc, DatabaseParams::default());
    for img in images.iter() {
        assert!(db.query(img, 10).unwrap().is_empty());
    }
}

#[test]
fn results_only_contain_entries_sharing_a_word() {
    let images = place_images(20, 5);
    let voc = Vocabulary::build(&images, VocabularyParams::new(4, 3)).unwrap();
    let mut db = Database::new(voc, DatabaseParams::default());
    for img in images.iter() {
        db.add(img).unwrap();
    }
    let q = db.vocabulary().transform(&images[0]).unwrap();
    for r in db.query(&images[0], 0).unwrap() {
        let e = db.entry(r.id).unwrap();
        assert!(q.words().any(|w| e.contains(w)));
        assert!(r.score > 0.);
    }
}

#[test]
fn disjoint_vectors_score_min_through_vocabulary() {
    let images = place_images(10, 2);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 2)).unwrap();
    let a: BowVector = vec![(0, 0.5), (1, 0.5)].into_iter().collect();
    let b: BowVector = vec![(2, 1.)].into_iter().collect();
    assert_eq!(voc.score(&a, &b), 0.);
}

#[test]
fn shared_vocabulary_transforms_concurrently() {
    let images = place_images(16, 9);
    let voc = Arc::new(Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap());
    let expected: Vec<BowVector> = images.iter().map(|i| voc.transform(i).unwrap()).collect();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let voc = voc.clone();
            let images = &images;
            let expected = &expected;
            s.spawn(move || {
                for (img, e) in images.iter().zip(expected) {
                    assert_eq!(&voc.transform(img).unwrap(), e);
                }
            });
        }
    });
}

#[test]
fn readers_share_a_locked_database() {
    let images = place_images(16, 4);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap();
    let db = RwLock::new(Database::new(voc, DatabaseParams::default()));
    for img in images.iter() {
        db.write().unwrap().add(img).unwrap();
    }
    std::thread::scope(|s| {
        for t in 0..4 {
            let db = &db;
            let images = &images;
            s.spawn(move || {
                let guard = db.read().unwrap();
                let ret = guard.query(&images[t], 3).unwrap();
                assert!(!ret.is_empty());
            });
        }
    });
}

#[test]
fn text_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let images = place_images(20, 8);
    let voc = Vocabulary::build(&images, VocabularyParams::new(4, 3)).unwrap();

    let voc_path = dir.path().join("small_voc.txt");
    voc.save_text(&voc_path).unwrap();
    let loaded = Vocabulary::<FloatDescriptor>::load_text(&voc_path).unwrap();
    assert!(loaded == voc);
    for img in images.iter() {
        assert_eq!(loaded.transform(img).unwrap(), voc.transform(img).unwrap());
    }

    let mut db = Database::new(voc, DatabaseParams::with_direct_index(2));
    for img in images.iter() {
        db.add(img).unwrap();
    }
    let db_path = dir.path().join("small_db.txt");
    db.save_text(&db_path).unwrap();
    let loaded = Database::<FloatDescriptor>::load_text(&db_path).unwrap();
    assert!(loaded == db);
    for img in images.iter() {
        assert_eq!(loaded.query(img, 4).unwrap(), db.query(img, 4).unwrap());
    }
}

#[cfg(feature = "bincode")]
#[test]
fn binary_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let images = place_images(12, 3);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap();

    let voc_path = dir.path().join("small.voc");
    voc.save(&voc_path).unwrap();
    assert!(Vocabulary::<FloatDescriptor>::load(&voc_path).unwrap() == voc);

    let mut db = Database::new(voc, DatabaseParams::default());
    for img in images.iter() {
        db.add(img).unwrap();
    }
    let db_path = dir.path().join("small.db");
    db.save(&db_path).unwrap();
    let loaded = Database::<FloatDescriptor>::load(&db_path).unwrap();
    assert!(loaded == db);
    assert_eq!(loaded.query(&images[0], 3).unwrap(), db.query(&images[0], 3).unwrap());
}

/// Overwrite the little-endian u64 at `offset` of a bincode file.
#[cfg(feature = "bincode")]
fn patch_u64(path: &std::path::Path, offset: usize, value: u64) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    std::fs::write(path, bytes).unwrap();
}

#[cfg(feature = "bincode")]
fn truncate_half(path: &std::path::Path) {
    let bytes = std::fs::read(path).unwrap();
    std::fs::write(path, &bytes[..bytes.len() / 2]).unwrap();
}

// A vocabulary encodes as k, l (u64), weighting, scoring (u32), dimension (u64), ...
#[cfg(feature = "bincode")]
const K_OFFSET: usize = 0;
#[cfg(feature = "bincode")]
const DIMENSION_OFFSET: usize = 24;

#[cfg(feature = "bincode")]
#[test]
fn broken_binary_vocabulary_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let images = place_images(12, 3);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap();
    let path = dir.path().join("small.voc");

    voc.save(&path).unwrap();
    truncate_half(&path);
    assert!(matches!(
        Vocabulary::<FloatDescriptor>::load(&path),
        Err(BowErr::Bincode(_))
    ));

    voc.save(&path).unwrap();
    patch_u64(&path, K_OFFSET, 1);
    assert!(matches!(
        Vocabulary::<FloatDescriptor>::load(&path),
        Err(BowErr::CorruptFormat { .. })
    ));

    voc.save(&path).unwrap();
    patch_u64(&path, DIMENSION_OFFSET, 3);
    assert!(matches!(
        Vocabulary::<FloatDescriptor>::load(&path),
        Err(BowErr::CorruptFormat { .. })
    ));
}

#[cfg(feature = "bincode")]
#[test]
fn broken_binary_database_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let images = place_images(12, 3);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 3)).unwrap();
    let mut db = Database::new(voc, DatabaseParams::with_direct_index(1));
    for img in images.iter() {
        db.add(img).unwrap();
    }
    let path = dir.path().join("small.db");

    db.save(&path).unwrap();
    truncate_half(&path);
    assert!(matches!(
        Database::<FloatDescriptor>::load(&path),
        Err(BowErr::Bincode(_))
    ));

    // the vocabulary leads the database file
    db.save(&path).unwrap();
    patch_u64(&path, K_OFFSET, 1);
    assert!(matches!(
        Database::<FloatDescriptor>::load(&path),
        Err(BowErr::CorruptFormat { .. })
    ));

    db.save(&path).unwrap();
    patch_u64(&path, DIMENSION_OFFSET, 3);
    assert!(matches!(
        Database::<FloatDescriptor>::load(&path),
        Err(BowErr::CorruptFormat { .. })
    ));
}

#[test]
fn truncated_file_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let images = place_images(10, 6);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 2)).unwrap();
    let path = dir.path().join("voc.txt");
    voc.save_text(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let last = text.lines().last().unwrap();
    let cut = &text[..text.len() - last.len() / 2 - 1];
    std::fs::write(&path, cut).unwrap();
    assert!(matches!(
        Vocabulary::<FloatDescriptor>::load_text(&path),
        Err(BowErr::CorruptFormat { .. })
    ));
}

#[test]
fn wrong_descriptor_space_is_rejected() {
    let images = place_images(10, 6);
    let voc = Vocabulary::build(&images, VocabularyParams::new(3, 2)).unwrap();
    let mut db = Database::new(voc, DatabaseParams::default());
    let wrong = vec![FloatDescriptor::new(vec![0.; 64])];
    assert!(matches!(
        db.add(&wrong),
        Err(BowErr::DimensionMismatch {
            expected: 8,
            found: 64
        })
    ));
    assert!(matches!(
        db.query(&wrong, 1),
        Err(BowErr::DimensionMismatch { .. })
    ));
    assert!(db.is_empty());
}
