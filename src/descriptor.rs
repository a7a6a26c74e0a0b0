use bitvec::{order::Msb0, view::BitView};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{convert::TryInto, fmt};

use crate::{BowErr, BowResult};

/// Capabilities the vocabulary needs from a keypoint descriptor type.
///
/// Nothing outside of the implementations in this module assumes a concrete
/// representation: clustering only ever measures distances and takes means,
/// and the text format only ever goes through [`Descriptor::to_text`] and
/// [`Descriptor::from_text`].
pub trait Descriptor: Clone + PartialEq + fmt::Debug + Send + Sync {
    /// Distance between two descriptors. Symmetric and non-negative.
    fn distance(&self, other: &Self) -> f64;

    /// Centroid of a non-empty set of descriptors.
    fn mean(descriptors: &[&Self]) -> BowResult<Self>;

    /// Whitespace separated text form, without a trailing newline.
    fn to_text(&self) -> String;

    /// Inverse of [`Descriptor::to_text`].
    fn from_text(s: &str) -> BowResult<Self>;

    /// Number of components (bytes for binary descriptors).
    fn dimension(&self) -> usize;
}

/////////////////////                 Binary                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

/// Binary descriptor of `N` bytes compared with the Hamming distance.
///
/// This is the most commonly used keypoint descriptor data type.
/// It is used by ORB and BRIEF, for example.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryDescriptor<const N: usize>(pub [u8; N]);

/// 256-bit ORB / BRIEF descriptor.
pub type Orb = BinaryDescriptor<32>;

impl<const N: usize> BinaryDescriptor<N> {
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    /// Hamming distance between two binary arrays.
    pub fn hamming(&self, other: &Self) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0, |a, (b, c)| a + (*b ^ *c).count_ones())
    }
}

impl<const N: usize> Default for BinaryDescriptor<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> From<[u8; N]> for BinaryDescriptor<N> {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes)
    }
}

impl<const N: usize> Descriptor for BinaryDescriptor<N> {
    fn distance(&self, other: &Self) -> f64 {
        self.hamming(other) as f64
    }

    /// Bitwise majority vote. A bit is set when strictly more than half of the
    /// descriptors have it set.
    fn mean(descriptors: &[&Self]) -> BowResult<Self> {
        if descriptors.is_empty() {
            return Err(BowErr::EmptyInput);
        }
        let n2 = descriptors.len() / 2;
        let mut counts = vec![0usize; N * 8];
        for d in descriptors {
            for (i, b) in d.0[..].view_bits::<Msb0>().iter().enumerate() {
                if *b {
                    counts[i] += 1;
                }
            }
        }
        let mut result = [0u8; N];
        let result_bits = result[..].view_bits_mut::<Msb0>();
        for (i, &c) in counts.iter().enumerate() {
            if c > n2 {
                result_bits.set(i, true);
            }
        }
        Ok(Self(result))
    }

    fn to_text(&self) -> String {
        self.0
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn from_text(s: &str) -> BowResult<Self> {
        let bytes = s
            .split_whitespace()
            .map(|t| {
                t.parse::<u8>()
                    .map_err(|_| BowErr::corrupt(0, format!("bad descriptor byte {:?}", t)))
            })
            .collect::<BowResult<Vec<u8>>>()?;
        let found = bytes.len();
        let bytes: [u8; N] = bytes.try_into().map_err(|_| {
            BowErr::corrupt(0, format!("expected {} descriptor bytes, found {}", N, found))
        })?;
        Ok(Self(bytes))
    }

    fn dimension(&self) -> usize {
        N
    }
}

impl<const N: usize> fmt::Debug for BinaryDescriptor<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryDescriptor<{}>(", N)?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

// serde only covers arrays up to 32 elements, so go through a byte vector.
impl<const N: usize> Serialize for BinaryDescriptor<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0[..].serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BinaryDescriptor<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let len = bytes.len();
        let bytes: [u8; N] = bytes
            .try_into()
            .map_err(|_| de::Error::invalid_length(len, &"a binary descriptor"))?;
        Ok(Self(bytes))
    }
}

/////////////////////                 Dense                  ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

/// Dense floating point descriptor (SURF, SIFT, ...) compared with the
/// Euclidean distance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FloatDescriptor(pub Vec<f32>);

/// High dimensional learned embedding (CNN features) compared with the
/// squared Euclidean distance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

macro_rules! dense_descriptor {
    ($name:ident, $distance:expr) => {
        impl $name {
            pub fn new(values: Vec<f32>) -> Self {
                Self(values)
            }

            pub fn as_slice(&self) -> &[f32] {
                &self.0
            }
        }

        impl From<Vec<f32>> for $name {
            fn from(values: Vec<f32>) -> Self {
                Self(values)
            }
        }

        impl Descriptor for $name {
            fn distance(&self, other: &Self) -> f64 {
                $distance(squared_l2(&self.0, &other.0))
            }

            fn mean(descriptors: &[&Self]) -> BowResult<Self> {
                let rows: Vec<&[f32]> = descriptors.iter().map(|d| d.0.as_slice()).collect();
                dense_mean(&rows).map(Self)
            }

            fn to_text(&self) -> String {
                dense_to_text(&self.0)
            }

            fn from_text(s: &str) -> BowResult<Self> {
                dense_from_text(s).map(Self)
            }

            fn dimension(&self) -> usize {
                self.0.len()
            }
        }
    };
}

dense_descriptor!(FloatDescriptor, f64::sqrt);
dense_descriptor!(Embedding, std::convert::identity);

#[inline]
fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum()
}

fn dense_mean(rows: &[&[f32]]) -> BowResult<Vec<f32>> {
    let first = rows.first().ok_or(BowErr::EmptyInput)?;
    let dim = first.len();
    let mut acc = vec![0f64; dim];
    for row in rows {
        if row.len() != dim {
            return Err(BowErr::DimensionMismatch {
                expected: dim,
                found: row.len(),
            });
        }
        for (a, v) in acc.iter_mut().zip(row.iter()) {
            *a += *v as f64;
        }
    }
    let n = rows.len() as f64;
    Ok(acc.into_iter().map(|a| (a / n) as f32).collect())
}

fn dense_to_text(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn dense_from_text(s: &str) -> BowResult<Vec<f32>> {
    let values = s
        .split_whitespace()
        .map(|t| match t.parse::<f32>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(BowErr::corrupt(0, format!("bad descriptor value {:?}", t))),
        })
        .collect::<BowResult<Vec<f32>>>()?;
    if values.is_empty() {
        return Err(BowErr::corrupt(0, "empty descriptor"));
    }
    Ok(values)
}
