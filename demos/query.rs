use rand::{rngs::StdRng, Rng, SeedableRng};
use vbow::*;

const NIMAGES: usize = 40;

/// ORB-like binary descriptors. Consecutive images see overlapping scenery.
fn features() -> Vec<Vec<Orb>> {
    let mut rng = StdRng::seed_from_u64(1);
    let landmarks: Vec<[u8; 32]> = (0..NIMAGES + 10).map(|_| rng.gen()).collect();
    (0..NIMAGES)
        .map(|i| {
            (0..60)
                .map(|j| {
                    let mut d = landmarks[i + j % 10];
                    // flip a few bits
                    for _ in 0..4 {
                        let bit = rng.gen_range(0..256);
                        d[bit / 8] ^= 1 << (bit % 8);
                    }
                    Orb::new(d)
                })
                .collect()
        })
        .collect()
}

fn main() {
    env_logger::init();
    let features = features();

    println!("Creating a small 9^3 vocabulary...");
    let voc = Vocabulary::build(&features, VocabularyParams::new(9, 3)).unwrap();
    println!("Vocabulary information: {:#?}", voc);

    println!("Matching images against themselves (0 low, 2 high):");
    let v0 = voc.transform(&features[0]).unwrap();
    for (i, f) in features.iter().enumerate().take(4) {
        let v = voc.transform(f).unwrap();
        println!("Image 0 vs Image {}: {}", i, voc.score(&v0, &v));
    }

    println!("\nCreating a database...");
    let mut db = Database::new(voc, DatabaseParams::default());
    for f in features.iter() {
        db.add(f).unwrap();
    }
    println!("Database information: {:#?}", db);

    // Query every image. The best match is always the image itself, because
    // it was added to the database. The second best should be a neighbour.
    let mut neighbour_hits = 0;
    for (i, f) in features.iter().enumerate() {
        let ret = db.query(f, 4).unwrap();
        let shown: Vec<String> = ret.iter().map(|r| r.to_string()).collect();
        println!("Searching for Image {}. {}", i, shown.join(" "));
        if ret.get(1).map_or(false, |r| (r.id as i64 - i as i64).abs() <= 5) {
            neighbour_hits += 1;
        }
    }
    println!(
        "\nSecond best within 5 frames for {}/{} queries",
        neighbour_hits, NIMAGES
    );

    std::fs::create_dir_all("vocabs").unwrap();
    db.save_text("vocabs/demo_db.txt").unwrap();
    let db2 = Database::<Orb>::load_text("vocabs/demo_db.txt").unwrap();
    println!("Reloaded database with {} entries", db2.size());
}
