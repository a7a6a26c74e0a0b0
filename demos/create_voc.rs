use rand::{rngs::StdRng, Rng, SeedableRng};
use vbow::{Embedding, ScoringType, Vocabulary, VocabularyParams, WeightingType};

/// Synthetic stand-in for CNN features: every image holds noisy copies of a
/// few of 50 "scene" vectors.
fn features(n_images: usize, dim: usize) -> Vec<Vec<Embedding>> {
    let mut rng = StdRng::seed_from_u64(0);
    let scenes: Vec<Vec<f32>> = (0..50)
        .map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect())
        .collect();
    (0..n_images)
        .map(|i| {
            (0..20)
                .map(|j| {
                    let s = &scenes[(i + j * 7) % scenes.len()];
                    Embedding::new(s.iter().map(|x| x + rng.gen_range(-0.05..0.05)).collect())
                })
                .collect()
        })
        .collect()
}

fn main() {
    env_logger::init();

    let features = features(200, 256);
    println!(
        "Generated {} descriptors in {} images.",
        features.iter().map(|f| f.len()).sum::<usize>(),
        features.len()
    );

    // Create vocabulary from features
    let params = VocabularyParams::new(10, 3)
        .weighting(WeightingType::TfIdf)
        .scoring(ScoringType::L1);
    let voc = Vocabulary::build(&features, params).unwrap();
    println!("\nVocabulary = {:#?}", voc);

    // Save vocab and load it again just for fun
    std::fs::create_dir_all("vocabs").unwrap();
    voc.save_text("vocabs/demo_voc.txt").unwrap();
    let loaded_voc = Vocabulary::<Embedding>::load_text("vocabs/demo_voc.txt").unwrap();

    // Make sure save & load worked
    assert_eq!(voc, loaded_voc);
    println!("Saved and reloaded vocabulary in vocabs/demo_voc.txt");
}
