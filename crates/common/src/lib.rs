
use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::{TypeId, Value};

/// Fixed size of every on-disk page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Default number of pages the buffer pool keeps resident.
pub const DEFAULT_POOL_SIZE: usize = 256;

/// The reserved header page holding the file's page count.
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Logical identifier for a page in the database file.
/// Examples:
/// - `let header = PageId(0);`
/// - `let data_page = PageId(42);`
/// - `let none = PageId::INVALID;`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel meaning "no page".
    pub const INVALID: PageId = PageId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != PageId::INVALID
    }

    /// Byte offset of this page within the database file.
    pub fn file_offset(self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// Record identifier: a page id plus a slot number within that page.
///
/// Stable across in-page compaction; only the slot number identifies the
/// record once placed. Encodes to 8 little-endian bytes on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Rid {
        Rid { page_id, slot }
    }

    /// The sentinel RID, distinguishable from any live record.
    pub fn invalid() -> Rid {
        Rid {
            page_id: PageId::INVALID,
            slot: u32::MAX,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_id.is_valid() && self.slot != u32::MAX
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Canonical error type shared across the storage subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("no database file is open")]
    NotOpen,
    #[error("{what} {index} out of range ({limit} available)")]
    OutOfRange {
        what: &'static str,
        index: u64,
        limit: u64,
    },
    #[error("page {0} is not in the buffer pool")]
    NotInPool(PageId),
    #[error("buffer pool full: every frame is pinned")]
    PoolFull,
    #[error("page {0} is not pinned")]
    NotPinned(PageId),
    #[error("page {0} is still pinned")]
    Pinned(PageId),
    #[error("invalid rid {0}")]
    InvalidRid(Rid),
    #[error("page full: {needed} bytes needed, {free} free")]
    PageFull { needed: usize, free: usize },
    #[error("type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: TypeId, actual: TypeId },
    #[error("duplicate key: {0}")]
    DuplicateKey(Value),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("corrupted data: {0}")]
    Corrupted(String),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Ordered sequence of values, optionally tied to its on-disk location.
///
/// This is the record shape exchanged with the executor; inside a page a
/// tuple is just the opaque byte string produced by [`Tuple::to_bytes`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    values: Vec<Value>,
    #[serde(skip)]
    #[serde(default)]
    rid: Option<Rid>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Tuple {
        Tuple { values, rid: None }
    }

    pub fn empty() -> Tuple {
        Tuple::new(Vec::new())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    pub fn value_at(&self, index: usize) -> DbResult<&Value> {
        self.values.get(index).ok_or(DbError::OutOfRange {
            what: "tuple index",
            index: index as u64,
            limit: self.values.len() as u64,
        })
    }

    pub fn rid(&self) -> Option<Rid> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Option<Rid>) {
        self.rid = rid;
    }

    pub fn with_rid(mut self, rid: Rid) -> Tuple {
        self.rid = Some(rid);
        self
    }

    /// Self-describing byte encoding: a `u16` value count, then one `u8`
    /// type tag and payload per value. The rid is runtime state and is not
    /// part of the encoding.
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + self.values.len() * 8);
        let count = u16::try_from(self.values.len()).map_err(|_| DbError::OutOfRange {
            what: "tuple index",
            index: self.values.len() as u64,
            limit: u16::MAX as u64,
        })?;
        out.extend_from_slice(&count.to_le_bytes());
        for value in &self.values {
            out.push(value.type_id().as_u8());
            if value.is_invalid() {
                continue;
            }
            let start = out.len();
            out.resize(start + value.encoded_len(), 0);
            value
                .encode_into(&mut out[start..])
                .ok_or_else(|| DbError::Corrupted(format!("unencodable value {value}")))?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> DbResult<Tuple> {
        let malformed = |why: &str| DbError::Corrupted(format!("tuple bytes: {why}"));
        let raw: [u8; 2] = bytes
            .get(..2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed("missing value count"))?;
        let count = u16::from_le_bytes(raw) as usize;

        let mut values = Vec::with_capacity(count);
        let mut pos = 2;
        for _ in 0..count {
            let tag = *bytes.get(pos).ok_or_else(|| malformed("missing type tag"))?;
            let ty = TypeId::from_u8(tag).ok_or_else(|| malformed("unknown type tag"))?;
            pos += 1;
            if ty == TypeId::Invalid {
                values.push(Value::Invalid);
                continue;
            }
            let (value, used) = Value::decode(ty, &bytes[pos..])
                .ok_or_else(|| malformed("truncated value payload"))?;
            values.push(value);
            pos += used;
        }
        Ok(Tuple::new(values))
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Tuple {
        Tuple::new(values)
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Runtime configuration for assembling the storage stack.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .db_path(PathBuf::from("./my.db"))
///     .pool_size(64)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Path of the single database file.
    #[builder(default = PathBuf::from("./data.db"))]
    pub db_path: PathBuf,
    /// Number of pages the buffer pool keeps resident.
    #[builder(default = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data.db"),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}
