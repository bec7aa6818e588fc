//! Boxed scalar values for the slow paths: debug accessors, constants handed
//! to kernels, and test assertions. The hot kernels never touch these.

use super::{Date, Timestamp, TypeId};

#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Date(Date),
    Timestamp(Timestamp),
    Varchar(String),
    Hash(u64),
    Pointer(usize),
}

impl Val {
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    /// The type this value stores into, if it is non-null.
    pub fn type_id(&self) -> Option<TypeId> {
        Some(match self {
            Val::Null => return None,
            Val::Boolean(_) => TypeId::Boolean,
            Val::TinyInt(_) => TypeId::TinyInt,
            Val::SmallInt(_) => TypeId::SmallInt,
            Val::Integer(_) => TypeId::Integer,
            Val::BigInt(_) => TypeId::BigInt,
            Val::Float(_) => TypeId::Float,
            Val::Double(_) => TypeId::Double,
            Val::Date(_) => TypeId::Date,
            Val::Timestamp(_) => TypeId::Timestamp,
            Val::Varchar(_) => TypeId::Varchar,
            Val::Hash(_) => TypeId::Hash,
            Val::Pointer(_) => TypeId::Pointer,
        })
    }

    /// Widens any integral value to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::TinyInt(v) => Some(i64::from(*v)),
            Val::SmallInt(v) => Some(i64::from(*v)),
            Val::Integer(v) => Some(i64::from(*v)),
            Val::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Float(v) => Some(f64::from(*v)),
            Val::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }
}

impl std::fmt::Display for Val {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Val::Null => write!(f, "NULL"),
            Val::Boolean(v) => write!(f, "{v}"),
            Val::TinyInt(v) => write!(f, "{v}"),
            Val::SmallInt(v) => write!(f, "{v}"),
            Val::Integer(v) => write!(f, "{v}"),
            Val::BigInt(v) => write!(f, "{v}"),
            Val::Float(v) => write!(f, "{v}"),
            Val::Double(v) => write!(f, "{v}"),
            Val::Date(v) => write!(f, "date({})", v.0),
            Val::Timestamp(v) => write!(f, "timestamp({})", v.0),
            Val::Varchar(v) => write!(f, "'{v}'"),
            Val::Hash(v) => write!(f, "hash({v:#x})"),
            Val::Pointer(v) => write!(f, "ptr({v:#x})"),
        }
    }
}
