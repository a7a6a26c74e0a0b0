use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

use crate::*;

/// Construction parameters of a [`Database`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseParams {
    /// Keep a [`FeatureVector`] per entry.
    pub direct_index: bool,
    /// Levels above the leaves the direct index is taken at.
    pub direct_index_levels: usize,
}

impl DatabaseParams {
    pub fn with_direct_index(levels: usize) -> Self {
        Self {
            direct_index: true,
            direct_index_levels: levels,
        }
    }
}

/// One ranked answer of [`Database::query`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub id: EntryId,
    pub score: f64,
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<EntryId: {}, Score: {}>", self.id, self.score)
    }
}

/// An entry of a posting list: an image containing the word, and the weight
/// of the word in that image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Posting {
    pub entry: EntryId,
    pub weight: f64,
}

/// Inverted-file image database.
///
/// Entries are appended by [`Database::add`] and never change afterwards.
/// Queries only score entries sharing at least one word with the query;
/// the others would score 0 under every [`ScoringType`].
///
/// `add` takes `&mut self` and `query` takes `&self`, so sharing a database
/// between threads means wrapping it in a lock such as `std::sync::RwLock`.
#[derive(Clone, PartialEq)]
pub struct Database<D> {
    vocab: Arc<Vocabulary<D>>,
    params: DatabaseParams,
    entries: Vec<BowVector>,
    /// One posting list per word, in entry order.
    inverted_file: Vec<Vec<Posting>>,
    /// Feature vector per entry, empty unless the direct index is on.
    direct_index: Vec<FeatureVector>,
}

impl<D: Descriptor> Database<D> {
    /// Create an empty database owning `vocab`.
    pub fn new(vocab: Vocabulary<D>, params: DatabaseParams) -> Self {
        Self::with_shared(Arc::new(vocab), params)
    }

    /// Create an empty database over a vocabulary shared with other databases.
    pub fn with_shared(vocab: Arc<Vocabulary<D>>, params: DatabaseParams) -> Self {
        let words = vocab.num_words();
        Self {
            vocab,
            params,
            entries: Vec::new(),
            inverted_file: vec![Vec::new(); words],
            direct_index: Vec::new(),
        }
    }

    /// Transform `features` and index the result as a new entry.
    pub fn add(&mut self, features: &[D]) -> BowResult<EntryId> {
        let (bow, fv) = if self.params.direct_index {
            let (bow, fv) = self
                .vocab
                .transform_with_direct_index(features, self.params.direct_index_levels)?;
            (bow, Some(fv))
        } else {
            (self.vocab.transform(features)?, None)
        };
        Ok(self.insert(bow, fv))
    }

    /// Index a vector transformed elsewhere. `kind` must match the
    /// vocabulary of this database.
    pub fn add_bow(
        &mut self,
        bow: BowVector,
        kind: BowKind,
        fv: Option<FeatureVector>,
    ) -> BowResult<EntryId> {
        self.check_kind(kind)?;
        self.check_words(&bow)?;
        Ok(self.insert(bow, fv))
    }

    /// Up to `max_results` entries most similar to `features`, best first.
    /// Equal scores are ordered by entry id. `max_results == 0` returns every
    /// entry sharing a word with the query.
    pub fn query(&self, features: &[D], max_results: usize) -> BowResult<Vec<QueryResult>> {
        let bow = self.vocab.transform(features)?;
        Ok(self.query_vector(&bow, max_results))
    }

    /// Like [`Database::query`], for a vector transformed elsewhere.
    pub fn query_bow(
        &self,
        bow: &BowVector,
        kind: BowKind,
        max_results: usize,
    ) -> BowResult<Vec<QueryResult>> {
        self.check_kind(kind)?;
        Ok(self.query_vector(bow, max_results))
    }

    /// Number of indexed entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: EntryId) -> Option<&BowVector> {
        self.entries.get(id)
    }

    /// Direct index of an entry. `None` when the direct index is off.
    pub fn feature_vector(&self, id: EntryId) -> Option<&FeatureVector> {
        self.direct_index.get(id)
    }

    /// Entries containing `word`, in insertion order.
    pub fn postings(&self, word: WordId) -> &[Posting] {
        self.inverted_file
            .get(word)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary<D>> {
        &self.vocab
    }

    pub fn params(&self) -> DatabaseParams {
        self.params
    }

    pub(crate) fn entries(&self) -> &[BowVector] {
        &self.entries
    }

    /// Rebuild a database from its stored entries. Entries without a feature
    /// vector get an empty one.
    pub(crate) fn from_parts(
        vocab: Vocabulary<D>,
        params: DatabaseParams,
        entries: Vec<BowVector>,
        direct_index: Vec<FeatureVector>,
    ) -> BowResult<Self> {
        let mut db = Self::new(vocab, params);
        let mut fvs = direct_index.into_iter();
        for bow in entries {
            db.check_words(&bow)?;
            db.insert(bow, fvs.next());
        }
        Ok(db)
    }

    fn check_kind(&self, kind: BowKind) -> BowResult<()> {
        let expected = self.vocab.kind();
        if kind != expected {
            return Err(BowErr::ScoringModeMismatch {
                expected,
                found: kind,
            });
        }
        Ok(())
    }

    fn check_words(&self, bow: &BowVector) -> BowResult<()> {
        match bow.words().find(|&w| w >= self.inverted_file.len()) {
            Some(w) => Err(BowErr::InvalidParameter(format!(
                "word {} is not in a vocabulary of {} words",
                w,
                self.inverted_file.len()
            ))),
            None => Ok(()),
        }
    }

    fn insert(&mut self, bow: BowVector, fv: Option<FeatureVector>) -> EntryId {
        let entry = self.entries.len();
        for (word, weight) in bow.iter() {
            if weight > 0. {
                self.inverted_file[word].push(Posting { entry, weight });
            }
        }
        if self.params.direct_index {
            self.direct_index.push(fv.unwrap_or_default());
        }
        debug!("Added entry {} with {} words", entry, bow.len());
        self.entries.push(bow);
        entry
    }

    fn query_vector(&self, bow: &BowVector, max_results: usize) -> Vec<QueryResult> {
        let mut candidates: Vec<EntryId> = bow
            .iter()
            .filter(|&(_, weight)| weight > 0.)
            .flat_map(|(word, _)| self.postings(word).iter().map(|p| p.entry))
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut results: Vec<QueryResult> = candidates
            .par_iter()
            .map(|&id| QueryResult {
                id,
                score: self.vocab.score(bow, &self.entries[id]),
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        if max_results > 0 {
            results.truncate(max_results);
        }
        results
    }
}

#[cfg(feature = "bincode")]
#[derive(Serialize)]
struct DatabaseRef<'a, D> {
    vocab: &'a Vocabulary<D>,
    params: DatabaseParams,
    entries: &'a [BowVector],
    direct_index: &'a [FeatureVector],
}

#[cfg(feature = "bincode")]
#[derive(Deserialize)]
struct DatabaseOwned<D> {
    vocab: Vocabulary<D>,
    params: DatabaseParams,
    entries: Vec<BowVector>,
    direct_index: Vec<FeatureVector>,
}

/// Binary (de)serialization
#[cfg(feature = "bincode")]
impl<D> Database<D>
where
    D: Descriptor + Serialize + serde::de::DeserializeOwned,
{
    /// Load a database saved with [`Database::save`].
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let owned: DatabaseOwned<D> = bincode::deserialize(&buffer)?;
        owned.vocab.check_structure()?;
        if owned.params.direct_index && owned.direct_index.len() != owned.entries.len() {
            return Err(BowErr::corrupt(
                0,
                format!(
                    "{} entries but {} feature vectors",
                    owned.entries.len(),
                    owned.direct_index.len()
                ),
            ));
        }
        let num_words = owned.vocab.num_words();
        if let Some(w) = owned.entries.iter().flat_map(|e| e.words()).find(|&w| w >= num_words) {
            return Err(BowErr::corrupt(0, format!("unknown word {}", w)));
        }
        let db = Self::from_parts(owned.vocab, owned.params, owned.entries, owned.direct_index)?;
        log::info!("Loaded database with {} entries", db.size());
        Ok(db)
    }

    /// Save the database, vocabulary included, to a file.
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        let serialized = bincode::serialize(&DatabaseRef {
            vocab: self.vocab.as_ref(),
            params: self.params,
            entries: &self.entries,
            direct_index: &self.direct_index,
        })?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        log::info!("Saved database with {} entries", self.size());
        Ok(())
    }
}

impl<D: Descriptor> fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let postings: usize = self.inverted_file.iter().map(|p| p.len()).sum();
        f.debug_struct("Database")
            .field("Entries", &self.entries.len())
            .field("Postings", &postings)
            .field("Direct Index", &self.params.direct_index)
            .field("Direct Index Levels", &self.params.direct_index_levels)
            .field("Vocabulary", &self.vocab)
            .finish()
    }
}
