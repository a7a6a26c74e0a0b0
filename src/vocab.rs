use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{collections::BTreeSet, fmt};

use crate::*;

/// Construction parameters of a [`Vocabulary`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct VocabularyParams {
    /// Branching factor.
    pub k: usize,
    /// Depth of the tree (number of levels below the root).
    pub l: usize,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
    /// Upper bound on Lloyd iterations per k-means step.
    pub max_iterations: usize,
    /// Seed of the k-means++ initialization.
    pub seed: u64,
}

impl Default for VocabularyParams {
    fn default() -> Self {
        Self {
            k: 10,
            l: 5,
            weighting: WeightingType::TfIdf,
            scoring: ScoringType::L1,
            max_iterations: 100,
            seed: 0,
        }
    }
}

impl VocabularyParams {
    pub fn new(k: usize, l: usize) -> Self {
        Self {
            k,
            l,
            ..Self::default()
        }
    }

    pub fn weighting(mut self, weighting: WeightingType) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn scoring(mut self, scoring: ScoringType) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn kind(&self) -> BowKind {
        BowKind {
            weighting: self.weighting,
            scoring: self.scoring,
        }
    }

    pub fn validate(&self) -> BowResult<()> {
        validate_shape(self.k, self.l)?;
        if self.max_iterations == 0 {
            return Err(BowErr::InvalidParameter(
                "max_iterations must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_shape(k: usize, l: usize) -> BowResult<()> {
    if !(2..=64).contains(&k) {
        return Err(BowErr::InvalidParameter(format!(
            "branching factor must be in [2, 64], got {}",
            k
        )));
    }
    if !(1..=16).contains(&l) {
        return Err(BowErr::InvalidParameter(format!(
            "depth must be in [1, 16], got {}",
            l
        )));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Created from training images with [`Vocabulary::build`].
/// 2. Saved to a file & loaded from a file, as text (see [`crate::text`]) or
///    with bincode (requires bincode feature, enabled by default).
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get the direct index from features to nodes).
///
/// A built vocabulary is never mutated, so it can be shared between threads
/// and databases freely.
pub struct Vocabulary<D> {
    k: usize,
    l: usize,
    weighting: WeightingType,
    scoring: ScoringType,
    dimension: usize,
    nodes: Vec<Node<D>>,
    /// Node id of every word, indexed by word id.
    words: Vec<NodeId>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
/// A node of the tree. Node 0 is the root, the only node without a centroid.
pub(crate) struct Node<D> {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) descriptor: Option<D>,
    pub(crate) weight: f64,
    pub(crate) word_id: Option<WordId>,
}

/// Node ids visited below the root while quantizing one descriptor.
type Path = SmallVec<[NodeId; 16]>;

/// Vocabulary API
impl<D: Descriptor> Vocabulary<D> {
    /// Build a vocabulary by hierarchical k-means over the descriptors of all
    /// `images`, then weight its words from their presence in those images.
    ///
    /// Nodes holding `k` descriptors or fewer are not clustered: each distinct
    /// descriptor becomes a child, and a child holding a single distinct
    /// descriptor is a leaf even above depth `l`. Lloyd clusters that end up
    /// empty are dropped, so some nodes may have fewer than `k` children.
    pub fn build(images: &[Vec<D>], params: VocabularyParams) -> BowResult<Self> {
        params.validate()?;
        let features: Vec<&D> = images.iter().flatten().collect();
        let first = features.first().ok_or(BowErr::EmptyInput)?;
        if features.len() < params.k {
            return Err(BowErr::InsufficientData {
                required: params.k,
                available: features.len(),
            });
        }
        let dimension = first.dimension();
        check_dimensions(dimension, features.iter().copied())?;

        info!(
            "Creating a {}^{} vocabulary from {} descriptors in {} images",
            params.k,
            params.l,
            features.len(),
            images.len()
        );

        // Start with root of tree
        let mut v = Self::empty(&params, dimension);
        let mut rng = StdRng::seed_from_u64(params.seed);

        // Build with recursive k-means clustering of features
        v.cluster(&features, 0, 1, &params, &mut rng)?;
        v.create_words();
        v.set_node_weights(images);

        info!(
            "Vocabulary created with {} words and {} nodes",
            v.num_words(),
            v.num_nodes()
        );
        Ok(v)
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary. An empty set gives an empty vector.
    pub fn transform(&self, features: &[D]) -> BowResult<BowVector> {
        self.transform_generic(features, None).map(|(bow, _)| bow)
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary.
    ///
    /// Also provides the "direct index" from vocabulary nodes to the features
    /// that went through them. Nodes are taken `levels_up` levels above the
    /// leaves: `0` indexes by word, `l` or more puts every feature under the root.
    /// Features reaching a leaf above the stop level are indexed by that leaf.
    pub fn transform_with_direct_index(
        &self,
        features: &[D],
        levels_up: usize,
    ) -> BowResult<(BowVector, FeatureVector)> {
        self.transform_generic(features, Some(levels_up))
    }

    /// Similarity of two vectors under the scoring mode of the vocabulary.
    pub fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        self.scoring.score(a, b)
    }

    /// Word a single descriptor quantizes to, with its weight.
    pub fn quantize(&self, feature: &D) -> BowResult<(WordId, f64)> {
        check_dimensions(self.dimension, std::iter::once(feature))?;
        let (word, _) = self.descend(feature).ok_or(BowErr::EmptyInput)?;
        Ok((word, self.nodes[self.words[word]].weight))
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn l(&self) -> usize {
        self.l
    }

    pub fn weighting(&self) -> WeightingType {
        self.weighting
    }

    pub fn scoring(&self) -> ScoringType {
        self.scoring
    }

    pub fn kind(&self) -> BowKind {
        BowKind {
            weighting: self.weighting,
            scoring: self.scoring,
        }
    }

    /// Dimension every descriptor given to this vocabulary must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn word_weight(&self, word: WordId) -> Option<f64> {
        self.words.get(word).map(|&n| self.nodes[n].weight)
    }

    pub fn word_descriptor(&self, word: WordId) -> Option<&D> {
        self.words
            .get(word)
            .and_then(|&n| self.nodes[n].descriptor.as_ref())
    }

    /// Node id of the leaf holding `word`.
    pub fn word_node(&self, word: WordId) -> Option<NodeId> {
        self.words.get(word).copied()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Depth of `node` below the root.
    pub fn node_level(&self, node: NodeId) -> Option<usize> {
        let mut n = self.nodes.get(node)?;
        let mut level = 0;
        while let Some(p) = n.parent {
            n = &self.nodes[p];
            level += 1;
        }
        Some(level)
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

fn check_dimensions<'a, D: Descriptor + 'a>(
    expected: usize,
    features: impl IntoIterator<Item = &'a D>,
) -> BowResult<()> {
    for f in features {
        if f.dimension() != expected {
            return Err(BowErr::DimensionMismatch {
                expected,
                found: f.dimension(),
            });
        }
    }
    Ok(())
}

/// Index of the centroid closest to `feature`. Ties go to the lowest index.
fn nearest<D: Descriptor>(feature: &D, centroids: &[D]) -> usize {
    let mut best: (usize, f64) = (0, f64::INFINITY);
    for (j, c) in centroids.iter().enumerate() {
        let d = feature.distance(c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best.0
}

impl<D: Descriptor> Vocabulary<D> {
    fn empty(params: &VocabularyParams, dimension: usize) -> Self {
        Self {
            k: params.k,
            l: params.l,
            weighting: params.weighting,
            scoring: params.scoring,
            dimension,
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                descriptor: None,
                weight: 0.,
                word_id: None,
            }],
            words: Vec::new(),
        }
    }

    /// Assemble a vocabulary from nodes listed in id order, root first.
    /// Word ids are given to the leaves in node id order.
    pub(crate) fn from_nodes(
        k: usize,
        l: usize,
        kind: BowKind,
        mut nodes: Vec<Node<D>>,
    ) -> BowResult<Self> {
        let dimension = nodes
            .iter()
            .find_map(|n| n.descriptor.as_ref())
            .map(|d| d.dimension())
            .ok_or_else(|| BowErr::corrupt(0, "vocabulary has no nodes"))?;
        for n in nodes.iter_mut() {
            n.word_id = None;
        }
        let mut v = Self {
            k,
            l,
            weighting: kind.weighting,
            scoring: kind.scoring,
            dimension,
            nodes,
            words: Vec::new(),
        };
        v.create_words();
        v.check_structure()?;
        Ok(v)
    }

    /// Verify that the arena forms a tree every lookup can walk without
    /// leaving it. Data read from a file goes through here before use.
    pub(crate) fn check_structure(&self) -> BowResult<()> {
        let bad = |reason: String| Err(BowErr::corrupt(0, reason));
        validate_shape(self.k, self.l).map_err(|e| BowErr::corrupt(0, e.to_string()))?;

        let root = match self.nodes.first() {
            Some(root) => root,
            None => return bad("vocabulary has no root".into()),
        };
        if root.parent.is_some() || root.descriptor.is_some() {
            return bad("node 0 is not a root".into());
        }
        if root.children.is_empty() {
            return bad("vocabulary has no nodes".into());
        }

        let mut listed = vec![false; self.nodes.len()];
        let mut levels = vec![0usize; self.nodes.len()];
        let mut leaves: Vec<NodeId> = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if id > 0 {
                let parent = match node.parent {
                    Some(p) if p < id => p,
                    p => return bad(format!("node {} has parent {:?}", id, p)),
                };
                if !listed[id] {
                    return bad(format!("node {} is not a child of {}", id, parent));
                }
                levels[id] = levels[parent] + 1;
                if levels[id] > self.l {
                    return bad(format!("node {} is deeper than {}", id, self.l));
                }
                match &node.descriptor {
                    Some(d) if d.dimension() == self.dimension => {}
                    Some(d) => {
                        return bad(format!(
                            "node {} has dimension {}, expected {}",
                            id,
                            d.dimension(),
                            self.dimension
                        ))
                    }
                    None => return bad(format!("node {} has no descriptor", id)),
                }
                if !node.weight.is_finite() || node.weight < 0. {
                    return bad(format!("node {} has weight {}", id, node.weight));
                }
                if node.children.is_empty() {
                    leaves.push(id);
                }
            }

            if node.children.len() > self.k {
                return bad(format!("node {} has too many children", id));
            }
            for &c in node.children.iter() {
                let child = match self.nodes.get(c) {
                    Some(child) => child,
                    None => return bad(format!("node {} has unknown child {}", id, c)),
                };
                if child.parent != Some(id) || listed[c] {
                    return bad(format!("node {} is listed under {}", c, id));
                }
                listed[c] = true;
            }
        }

        if self.words != leaves {
            return bad("word table does not match the leaves".into());
        }
        let mut next_word = 0;
        for (id, node) in self.nodes.iter().enumerate() {
            let expected = if id > 0 && node.children.is_empty() {
                next_word += 1;
                Some(next_word - 1)
            } else {
                None
            };
            if node.word_id != expected {
                return bad(format!("node {} has word {:?}", id, node.word_id));
            }
        }
        Ok(())
    }

    pub(crate) fn nodes(&self) -> &[Node<D>] {
        &self.nodes
    }

    fn cluster(
        &mut self,
        features: &[&D],
        parent: NodeId,
        curr_level: usize,
        params: &VocabularyParams,
        rng: &mut StdRng,
    ) -> BowResult<()> {
        debug!(
            "KMeans step with {} features. parent: {}, level {}",
            features.len(),
            parent,
            curr_level
        );
        if features.is_empty() {
            return Ok(());
        }
        let mut clusters: Vec<D> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();

        if features.len() <= self.k {
            // One cluster per distinct feature
            for (i, &f) in features.iter().enumerate() {
                match clusters.iter().position(|c| c == f) {
                    Some(j) => groups[j].push(i),
                    None => {
                        clusters.push(f.clone());
                        groups.push(vec![i]);
                    }
                }
            }
        } else {
            // Proceed with kmeans clustering
            clusters = self.initialize_clusters(features, rng);
            let mut iteration = 0;

            loop {
                let assignments: Vec<usize> = features
                    .par_iter()
                    .map(|f| nearest(*f, &clusters))
                    .collect();
                let mut new_groups: Vec<Vec<usize>> = vec![Vec::new(); clusters.len()];
                for (i, &c) in assignments.iter().enumerate() {
                    new_groups[c].push(i);
                }

                if groups == new_groups {
                    break; // converged
                }

                let before = new_groups.len();
                new_groups.retain(|g| !g.is_empty());
                if new_groups.len() < before {
                    warn!(
                        "Dropping {} empty clusters under node {}",
                        before - new_groups.len(),
                        parent
                    );
                }

                // update clusters
                clusters = new_groups
                    .iter()
                    .map(|group| {
                        let desc: Vec<&D> = group.iter().map(|&i| features[i]).collect();
                        D::mean(&desc)
                    })
                    .collect::<BowResult<_>>()?;
                groups = new_groups;

                iteration += 1;
                if iteration >= params.max_iterations {
                    debug!("KMeans stopped after {} iterations", iteration);
                    break;
                }
            }
        }

        // Create children
        let first_child = self.nodes.len();
        for c in clusters {
            self.nodes.push(Node {
                parent: Some(parent),
                children: Vec::new(),
                descriptor: Some(c),
                weight: 0.,
                word_id: None,
            });
        }
        let ids: Vec<NodeId> = (first_child..self.nodes.len()).collect();
        self.nodes[parent].children = ids.clone();

        // Recurse
        if curr_level < self.l {
            for (id, group) in ids.into_iter().zip(groups) {
                let child_features: Vec<&D> = group.iter().map(|&j| features[j]).collect();
                let splittable = child_features.iter().any(|&f| f != child_features[0]);
                if splittable {
                    self.cluster(&child_features, id, curr_level + 1, params, rng)?;
                }
            }
        }
        Ok(())
    }

    /// Initialize clusters for kmeans with the k-means++ seeding. Fewer than
    /// `k` centroids are returned when the features hold fewer distinct values.
    fn initialize_clusters(&self, features: &[&D], rng: &mut StdRng) -> Vec<D> {
        let mut clusters: Vec<D> = Vec::with_capacity(self.k);
        let first = features[rng.gen_range(0..features.len())];
        clusters.push(first.clone());

        let mut min_dists: Vec<f64> = features.par_iter().map(|f| f.distance(first)).collect();

        while clusters.len() < self.k {
            let total: f64 = min_dists.iter().sum();
            if total.is_nan() || total <= 0. {
                break;
            }
            let cut = rng.gen::<f64>() * total;
            let mut acc = 0.;
            let mut chosen = None;
            for (i, &d) in min_dists.iter().enumerate() {
                acc += d;
                if d > 0. && acc >= cut {
                    chosen = Some(i);
                    break;
                }
            }
            let i = match chosen.or_else(|| min_dists.iter().rposition(|&d| d > 0.)) {
                Some(i) => i,
                None => break,
            };
            let c = features[i];
            clusters.push(c.clone());
            min_dists
                .par_iter_mut()
                .zip(features.par_iter())
                .for_each(|(m, f)| {
                    let d = f.distance(c);
                    if d < *m {
                        *m = d;
                    }
                });
        }
        clusters
    }

    /// Give word ids to the leaves in node id order.
    fn create_words(&mut self) {
        self.words.clear();
        for (id, node) in self.nodes.iter_mut().enumerate().skip(1) {
            if node.children.is_empty() {
                node.word_id = Some(self.words.len());
                self.words.push(id);
            }
        }
    }

    /// Set word weights from the training images. IDF weights are
    /// `ln(N / n_i)`, 0 for words no training image contains.
    fn set_node_weights(&mut self, images: &[Vec<D>]) {
        if !self.weighting.uses_idf() {
            for &n in self.words.iter() {
                self.nodes[n].weight = 1.;
            }
            return;
        }

        let image_words: Vec<BTreeSet<WordId>> = images
            .par_iter()
            .map(|img| {
                img.iter()
                    .filter_map(|f| self.descend(f).map(|(w, _)| w))
                    .collect()
            })
            .collect();
        let mut counts = vec![0usize; self.words.len()];
        for words in image_words.iter() {
            for &w in words {
                counts[w] += 1;
            }
        }

        let n_images = images.len() as f64;
        for (w, &c) in counts.iter().enumerate() {
            let node = self.words[w];
            self.nodes[node].weight = if c > 0 {
                (n_images / c as f64).ln()
            } else {
                0.
            };
        }
    }

    /// Walk down the tree from the root, always taking the closest child.
    fn descend(&self, feature: &D) -> Option<(WordId, Path)> {
        let mut path = Path::new();
        let mut node = 0;
        loop {
            let children = &self.nodes[node].children;
            if children.is_empty() {
                break;
            }
            let mut best: (NodeId, f64) = (children[0], f64::INFINITY);
            for &c in children {
                if let Some(centroid) = &self.nodes[c].descriptor {
                    let d = feature.distance(centroid);
                    if d < best.1 {
                        best = (c, d);
                    }
                }
            }
            node = best.0;
            path.push(node);
        }
        self.nodes[node].word_id.map(|w| (w, path))
    }

    fn transform_generic(
        &self,
        features: &[D],
        levels_up: Option<usize>,
    ) -> BowResult<(BowVector, FeatureVector)> {
        let mut bow = BowVector::new();
        let mut fv = FeatureVector::new();
        if features.is_empty() {
            return Ok((bow, fv));
        }
        check_dimensions(self.dimension, features.iter())?;

        let quantized: Vec<Option<(WordId, Path)>> =
            features.par_iter().map(|f| self.descend(f)).collect();

        let stop_level = levels_up.map(|up| self.l.saturating_sub(up));
        let tf = self.weighting.uses_tf();
        for (i, q) in quantized.into_iter().enumerate() {
            let (word, path) = match q {
                Some(q) => q,
                None => continue,
            };
            if let Some(level) = stop_level {
                let node = match level {
                    0 => 0,
                    _ => path
                        .get(level - 1)
                        .or_else(|| path.last())
                        .copied()
                        .unwrap_or(0),
                };
                fv.add_feature(node, i);
            }
            let weight = self.nodes[self.words[word]].weight;
            if weight > 0. {
                if tf {
                    bow.add_weight(word, weight);
                } else {
                    bow.add_if_not_exist(word, weight);
                }
            }
        }
        bow.retain_positive();

        match self.scoring.norm() {
            Some(norm) => bow.normalize(norm),
            None if tf => bow.scale(1. / features.len() as f64),
            None => {}
        }

        Ok((bow, fv))
    }
}

/// Binary (de)serialization
#[cfg(feature = "bincode")]
impl<D> Vocabulary<D>
where
    D: Descriptor + Serialize + serde::de::DeserializeOwned,
{
    /// Load a vocabulary saved with [`Vocabulary::save`].
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let v: Self = bincode::deserialize(&buffer)?;
        v.check_structure()?;
        Ok(v)
    }

    /// Save vocabulary to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

impl<D: Descriptor> fmt::Debug for Vocabulary<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depths: Vec<usize> = self
            .words
            .iter()
            .filter_map(|&n| self.node_level(n))
            .collect();
        let zero_weight = self
            .words
            .iter()
            .filter(|&&n| self.nodes[n].weight <= 0.)
            .count();
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &self.words.len())
            .field("Other Nodes", &(self.nodes.len() - self.words.len()))
            .field("Levels", &self.l)
            .field("Branching Factor", &self.k)
            .field("Weighting", &self.weighting)
            .field("Scoring", &self.scoring)
            .field("Descriptor Dimension", &self.dimension)
            .field("Min Word Depth", &depths.iter().min())
            .field("Max Word Depth", &depths.iter().max())
            .field("Zero Weight Words", &zero_weight)
            .finish()
    }
}
