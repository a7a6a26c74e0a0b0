use thiserror::Error;

/// Descriptor spaces the vocabulary can be built over.
pub mod descriptor;
pub use descriptor::{BinaryDescriptor, Descriptor, Embedding, FloatDescriptor, Orb};

/// Sparse bag-of-words vectors, feature vectors and weighting modes.
pub mod bow;
pub use bow::{BowKind, BowVector, FeatureVector, LNorm, WeightingType};

/// Similarity functions between bag-of-words vectors.
pub mod scoring;
pub use scoring::ScoringType;

/// Implementation of a hierarchical visual vocabulary,
/// which provides the main functionality of this crate.
pub mod vocab;
pub use vocab::{Vocabulary, VocabularyParams};

/// Inverted-file image database built on top of a vocabulary.
pub mod database;
pub use database::{Database, DatabaseParams, QueryResult};

/// Stable text encoding of vocabularies and databases.
pub mod text;

/// Index of a node in the vocabulary tree. The root is always node 0.
pub type NodeId = usize;

/// Index of a visual word (a leaf of the vocabulary tree).
pub type WordId = usize;

/// Sequential identifier of an image added to a [`Database`].
pub type EntryId = usize;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Binary Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[error("Empty descriptor input")]
    EmptyInput,
    #[error("Not enough training descriptors: need at least {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("Descriptor dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    /// `line` is the 1-based line of a text file, or 0 for binary files.
    #[error("Corrupt file at line {line}: {reason}")]
    CorruptFormat { line: usize, reason: String },
    #[error("Scoring mode mismatch: database uses {expected}, got {found}")]
    ScoringModeMismatch { expected: BowKind, found: BowKind },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl BowErr {
    pub(crate) fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        BowErr::CorruptFormat {
            line,
            reason: reason.into(),
        }
    }

    /// Attach a line number to a format error raised without one.
    pub(crate) fn at_line(self, line: usize) -> Self {
        match self {
            BowErr::CorruptFormat { reason, .. } => BowErr::CorruptFormat { line, reason },
            other => other,
        }
    }
}
