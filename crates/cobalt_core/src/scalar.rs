use std::fmt;

use cobalt_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use crate::codegen::types::TypeId;

/// A single owned scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    /// Days since epoch.
    Date32(i32),
    /// Microseconds since epoch.
    Timestamp(i64),
    Utf8(String),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// The type id this value maps to, `None` for NULL.
    pub fn type_id(&self) -> Option<TypeId> {
        Some(match self {
            ScalarValue::Null => return None,
            ScalarValue::Boolean(_) => TypeId::Boolean,
            ScalarValue::Int8(_) => TypeId::TinyInt,
            ScalarValue::Int16(_) => TypeId::SmallInt,
            ScalarValue::Int32(_) => TypeId::Integer,
            ScalarValue::Int64(_) => TypeId::BigInt,
            ScalarValue::Float64(_) => TypeId::Double,
            ScalarValue::Date32(_) => TypeId::Date,
            ScalarValue::Timestamp(_) => TypeId::Timestamp,
            ScalarValue::Utf8(_) => TypeId::Varchar,
        })
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        match self {
            ScalarValue::Boolean(b) => Ok(*b),
            other => Err(DbError::new(format!("Not a bool: {other}"))),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            ScalarValue::Int8(v) => Ok(*v as i64),
            ScalarValue::Int16(v) => Ok(*v as i64),
            ScalarValue::Int32(v) => Ok(*v as i64),
            ScalarValue::Int64(v) => Ok(*v),
            other => Err(DbError::new(format!("Not an integer: {other}"))),
        }
    }

    pub fn try_as_usize(&self) -> Result<usize> {
        let v = self.try_as_i64()?;
        usize::try_from(v).map_err(|_| DbError::new("Integer out of range for usize").with_field("value", v))
    }

    pub fn try_as_str(&self) -> Result<&str> {
        match self {
            ScalarValue::Utf8(s) => Ok(s),
            other => Err(DbError::new(format!("Not a string: {other}"))),
        }
    }

    /// Bit pattern used when passing this value into generated code.
    ///
    /// Integers are sign extended, doubles are passed as their raw bits.
    /// Returns an error for strings and NULL which don't fit in a single
    /// register.
    pub fn try_as_raw_bits(&self) -> Result<i64> {
        Ok(match self {
            ScalarValue::Boolean(b) => *b as i64,
            ScalarValue::Int8(v) => *v as i64,
            ScalarValue::Int16(v) => *v as i64,
            ScalarValue::Int32(v) | ScalarValue::Date32(v) => *v as i64,
            ScalarValue::Int64(v) | ScalarValue::Timestamp(v) => *v,
            ScalarValue::Float64(v) => v.to_bits() as i64,
            other => return Err(DbError::new(format!("Scalar has no fixed width representation: {other}"))),
        })
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Date32(v) => write!(f, "date({v})"),
            Self::Timestamp(v) => write!(f, "timestamp({v})"),
            Self::Utf8(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<i8> for ScalarValue {
    fn from(value: i8) -> Self {
        ScalarValue::Int8(value)
    }
}

impl From<i16> for ScalarValue {
    fn from(value: i16) -> Self {
        ScalarValue::Int16(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Int32(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => ScalarValue::Null,
        }
    }
}
