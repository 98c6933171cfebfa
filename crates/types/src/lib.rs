use std::cmp::Ordering;
use std::fmt;

/// Type tag for a [`Value`], matching the one-byte tag stored on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TypeId {
    Invalid = 0,
    Boolean = 1,
    Integer = 2,
    Varchar = 3,
}

impl TypeId {
    pub fn from_u8(tag: u8) -> Option<TypeId> {
        match tag {
            0 => Some(TypeId::Invalid),
            1 => Some(TypeId::Boolean),
            2 => Some(TypeId::Integer),
            3 => Some(TypeId::Varchar),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// On-disk key width for fixed-size types; `None` for varchar, which is
    /// length-prefixed.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            TypeId::Boolean => Some(1),
            TypeId::Integer => Some(4),
            TypeId::Invalid | TypeId::Varchar => None,
        }
    }
}

/// A single typed database value.
/// Examples:
/// - `let v = Value::Integer(42);`
/// - `let v = Value::Varchar("alice".into());`
/// - `let v = Value::Boolean(true);`
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Invalid,
    Boolean(bool),
    Integer(i32),
    Varchar(String),
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Invalid => TypeId::Invalid,
            Value::Boolean(_) => TypeId::Boolean,
            Value::Integer(_) => TypeId::Integer,
            Value::Varchar(_) => TypeId::Varchar,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Value::Invalid)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Varchar(s) => Some(s),
            _ => None,
        }
    }

    /// Integer addition; `None` for any other operand types or on
    /// overflow.
    pub fn add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.checked_add(*b).map(Value::Integer),
            _ => None,
        }
    }

    /// Integer subtraction; `None` for any other operand types or on
    /// overflow.
    pub fn subtract(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.checked_sub(*b).map(Value::Integer),
            _ => None,
        }
    }

    /// Total order within one type; comparing across types yields `None`.
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Varchar(a), Value::Varchar(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn eq_same_type(&self, other: &Value) -> Option<bool> {
        self.cmp_same_type(other).map(|ord| ord == Ordering::Equal)
    }

    /// Number of bytes [`Value::encode_into`] writes for this value.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Invalid => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 4,
            Value::Varchar(s) => 2 + s.len(),
        }
    }

    /// Write the on-disk representation into the front of `buf`.
    ///
    /// Booleans are one byte, integers 4-byte little-endian two's
    /// complement, varchars a `u16` length followed by UTF-8 bytes.
    /// Returns the number of bytes written, or `None` if `buf` is too
    /// short, the value is `Invalid`, or a varchar exceeds `u16::MAX`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return None;
        }
        match self {
            Value::Invalid => return None,
            Value::Boolean(b) => buf[0] = *b as u8,
            Value::Integer(i) => buf[..4].copy_from_slice(&i.to_le_bytes()),
            Value::Varchar(s) => {
                let n = u16::try_from(s.len()).ok()?;
                buf[..2].copy_from_slice(&n.to_le_bytes());
                buf[2..2 + s.len()].copy_from_slice(s.as_bytes());
            }
        }
        Some(len)
    }

    /// Decode a value of type `ty` from the front of `buf`, returning the
    /// value and the number of bytes consumed. `None` on truncation,
    /// non-UTF-8 varchar bytes, or an undecodable type.
    pub fn decode(ty: TypeId, buf: &[u8]) -> Option<(Value, usize)> {
        match ty {
            TypeId::Invalid => None,
            TypeId::Boolean => {
                let b = *buf.first()?;
                Some((Value::Boolean(b != 0), 1))
            }
            TypeId::Integer => {
                let raw: [u8; 4] = buf.get(..4)?.try_into().ok()?;
                Some((Value::Integer(i32::from_le_bytes(raw)), 4))
            }
            TypeId::Varchar => {
                let raw: [u8; 2] = buf.get(..2)?.try_into().ok()?;
                let n = u16::from_le_bytes(raw) as usize;
                let bytes = buf.get(2..2 + n)?;
                let s = std::str::from_utf8(bytes).ok()?;
                Some((Value::Varchar(s.to_owned()), 2 + n))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Varchar(s) => write!(f, "{s}"),
        }
    }
}
