//! Order-preserving key encoders.
//!
//! Every encoder turns a typed [`KeyValue`] into a byte sequence whose
//! lexicographic order matches the domain order of the value. Indexes only
//! ever compare encoded bytes, through [`KeyEncoder::compare_bytes`].
//!
//! # Byte layouts
//!
//! | Encoder | Layout |
//! |---|---|
//! | Integer | 8 bytes big-endian, sign bit flipped |
//! | Real / Numeric | 8 bytes big-endian IEEE-754, sign-transformed |
//! | Text | raw UTF-8 |
//! | Blob | raw bytes |
//! | Compound | per column: 2-byte big-endian length, then the payload |

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

const SIGN_BIT: u64 = 1 << 63;

/// Width of the fixed-size numeric encodings.
pub const FIXED_WIDTH: usize = 8;

/// Size of the per-column length prefix in a compound key.
pub const COLUMN_PREFIX_SIZE: usize = 2;

/// A typed key value.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Numeric(f64),
    Compound(Vec<KeyValue>),
}

impl KeyValue {
    /// Short name of the value's type, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::Numeric(_) => "numeric",
            Self::Compound(_) => "compound",
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Converts typed values to comparable byte sequences and back.
pub trait KeyEncoder: Send + Sync + fmt::Debug {
    /// Encode a value.
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError>;

    /// Decode bytes produced by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError>;

    /// Compare two encoded keys. Lexicographic, shorter prefix first.
    fn compare_bytes(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

fn fixed_bytes(bytes: &[u8]) -> Result<[u8; FIXED_WIDTH], EncodingError> {
    bytes
        .try_into()
        .map_err(|_| EncodingError::InvalidLength {
            expected: FIXED_WIDTH,
            actual: bytes.len(),
        })
}

fn encode_f64(value: f64) -> [u8; FIXED_WIDTH] {
    // -0.0 and 0.0 must produce the same key.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits & SIGN_BIT == 0 {
        bits ^ SIGN_BIT
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn decode_f64(bytes: [u8; FIXED_WIDTH]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & SIGN_BIT == 0 {
        !ordered
    } else {
        ordered ^ SIGN_BIT
    };
    f64::from_bits(bits)
}

/// Fixed 8-byte big-endian encoding of `i64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerEncoder;

impl KeyEncoder for IntegerEncoder {
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        match value {
            KeyValue::Integer(n) => {
                let flipped = u64::from_be_bytes(n.to_be_bytes()) ^ SIGN_BIT;
                Ok(flipped.to_be_bytes().to_vec())
            }
            other => Err(EncodingError::TypeMismatch {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        let raw = u64::from_be_bytes(fixed_bytes(bytes)?) ^ SIGN_BIT;
        Ok(KeyValue::Integer(i64::from_be_bytes(raw.to_be_bytes())))
    }
}

/// Fixed 8-byte encoding of IEEE-754 doubles.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealEncoder;

impl KeyEncoder for RealEncoder {
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        match value {
            KeyValue::Real(n) => Ok(encode_f64(*n).to_vec()),
            other => Err(EncodingError::TypeMismatch {
                expected: "real",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        Ok(KeyValue::Real(decode_f64(fixed_bytes(bytes)?)))
    }
}

/// UTF-8 text keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextEncoder;

impl KeyEncoder for TextEncoder {
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        match value {
            KeyValue::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(EncodingError::TypeMismatch {
                expected: "text",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        String::from_utf8(bytes.to_vec())
            .map(KeyValue::Text)
            .map_err(|_| EncodingError::InvalidUtf8)
    }
}

/// Raw byte keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobEncoder;

impl KeyEncoder for BlobEncoder {
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        match value {
            KeyValue::Blob(bytes) => Ok(bytes.clone()),
            other => Err(EncodingError::TypeMismatch {
                expected: "blob",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        Ok(KeyValue::Blob(bytes.to_vec()))
    }
}

/// Numeric keys. Uses the same layout as [`RealEncoder`] so that keys stay
/// ordered numerically rather than by their decimal text.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericEncoder;

impl KeyEncoder for NumericEncoder {
    #[allow(clippy::cast_precision_loss)] // integers beyond 2^53 lose precision as numerics
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        match value {
            KeyValue::Numeric(n) | KeyValue::Real(n) => Ok(encode_f64(*n).to_vec()),
            KeyValue::Integer(n) => Ok(encode_f64(*n as f64).to_vec()),
            other => Err(EncodingError::TypeMismatch {
                expected: "numeric",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        Ok(KeyValue::Numeric(decode_f64(fixed_bytes(bytes)?)))
    }
}

/// Multi-column keys.
///
/// Each column is stored as a 2-byte big-endian length followed by the
/// column's own encoding. Comparison walks the columns in order and returns
/// on the first column that differs.
#[derive(Debug, Clone)]
pub struct CompoundEncoder {
    encoders: Vec<Arc<dyn KeyEncoder>>,
}

impl CompoundEncoder {
    #[must_use]
    pub const fn new(encoders: Vec<Arc<dyn KeyEncoder>>) -> Self {
        Self { encoders }
    }

    /// Number of columns in the key.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.encoders.len()
    }

    /// Read the column starting at `offset`. Returns the payload and the
    /// offset just past it, or `None` if the prefix is truncated.
    fn read_column(bytes: &[u8], offset: usize) -> Option<(&[u8], usize)> {
        let prefix = bytes.get(offset..offset + COLUMN_PREFIX_SIZE)?;
        let len = usize::from(u16::from_be_bytes([prefix[0], prefix[1]]));
        let start = offset + COLUMN_PREFIX_SIZE;
        let end = (start + len).min(bytes.len());
        Some((&bytes[start..end], start + len))
    }
}

impl KeyEncoder for CompoundEncoder {
    fn encode(&self, value: &KeyValue) -> Result<Vec<u8>, EncodingError> {
        let KeyValue::Compound(values) = value else {
            return Err(EncodingError::TypeMismatch {
                expected: "compound",
                found: value.type_name(),
            });
        };
        if values.len() != self.encoders.len() {
            return Err(EncodingError::ArityMismatch {
                expected: self.encoders.len(),
                actual: values.len(),
            });
        }

        let mut bytes = Vec::new();
        for (encoder, value) in self.encoders.iter().zip(values) {
            let encoded = encoder.encode(value)?;
            let len = u16::try_from(encoded.len())
                .map_err(|_| EncodingError::ColumnTooLong(encoded.len()))?;
            bytes.extend_from_slice(&len.to_be_bytes());
            bytes.extend_from_slice(&encoded);
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<KeyValue, EncodingError> {
        let mut offset = 0;
        let mut values = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let (payload, next) =
                Self::read_column(bytes, offset).ok_or(EncodingError::Truncated)?;
            if next > bytes.len() {
                return Err(EncodingError::Truncated);
            }
            values.push(encoder.decode(payload)?);
            offset = next;
        }
        Ok(KeyValue::Compound(values))
    }

    fn compare_bytes(&self, a: &[u8], b: &[u8]) -> Ordering {
        let mut offset_a = 0;
        let mut offset_b = 0;

        for encoder in &self.encoders {
            let Some((slice_a, next_a)) = Self::read_column(a, offset_a) else {
                return Ordering::Less;
            };
            let Some((slice_b, next_b)) = Self::read_column(b, offset_b) else {
                return Ordering::Greater;
            };

            let ordering = encoder.compare_bytes(slice_a, slice_b);
            if ordering != Ordering::Equal {
                return ordering;
            }
            offset_a = next_a;
            offset_b = next_b;
        }

        // Equal on every column: the side with residual bytes sorts last.
        (a.len().saturating_sub(offset_a)).cmp(&b.len().saturating_sub(offset_b))
    }
}

/// Errors that can occur while encoding or decoding keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The value's type does not match the encoder.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// A compound value has the wrong number of columns.
    ArityMismatch { expected: usize, actual: usize },
    /// A fixed-width encoding had the wrong number of bytes.
    InvalidLength { expected: usize, actual: usize },
    /// A compound column does not fit in a 2-byte length prefix.
    ColumnTooLong(usize),
    /// A compound key ended in the middle of a column.
    Truncated,
    /// Text bytes are not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, found } => {
                write!(f, "expected {expected} key, found {found}")
            }
            Self::ArityMismatch { expected, actual } => {
                write!(f, "compound key expects {expected} columns, got {actual}")
            }
            Self::InvalidLength { expected, actual } => {
                write!(f, "expected {expected} key bytes, got {actual}")
            }
            Self::ColumnTooLong(len) => write!(f, "compound column of {len} bytes is too long"),
            Self::Truncated => write!(f, "compound key is truncated"),
            Self::InvalidUtf8 => write!(f, "text key is not valid UTF-8"),
        }
    }
}

impl std::error::Error for EncodingError {}
