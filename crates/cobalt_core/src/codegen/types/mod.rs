//! SQL types as seen by code generation.

pub mod double;
pub mod integer;
pub mod registry;
pub mod type_system;
pub mod varchar;

use std::fmt;

use cobalt_error::{DbError, Result};
use serde::{Deserialize, Serialize};

pub use registry::{CodeContextFactory, Registry};
pub use type_system::{BinaryOp, ComparisonOp, TypeSystem};

use super::PrimitiveType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeId {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Double,
    /// Days since epoch.
    Date,
    /// Microseconds since epoch.
    Timestamp,
    Varchar,
}

/// How a value of a type is held in registers. Variable length types carry
/// a separate length component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Materialization {
    pub value: PrimitiveType,
    pub length: Option<PrimitiveType>,
}

impl TypeId {
    pub const ALL: [TypeId; 9] = [
        TypeId::Boolean,
        TypeId::TinyInt,
        TypeId::SmallInt,
        TypeId::Integer,
        TypeId::BigInt,
        TypeId::Double,
        TypeId::Date,
        TypeId::Timestamp,
        TypeId::Varchar,
    ];

    pub const fn materialization(&self) -> Materialization {
        let value = match self {
            TypeId::Boolean => PrimitiveType::Bool,
            TypeId::TinyInt => PrimitiveType::Int8,
            TypeId::SmallInt => PrimitiveType::Int16,
            TypeId::Integer | TypeId::Date => PrimitiveType::Int32,
            TypeId::BigInt | TypeId::Timestamp => PrimitiveType::Int64,
            TypeId::Double => PrimitiveType::Double,
            TypeId::Varchar => PrimitiveType::CharPtr,
        };
        let length = match self {
            TypeId::Varchar => Some(PrimitiveType::Int32),
            _ => None,
        };
        Materialization { value, length }
    }

    /// Size of the materialized value, including the length component.
    pub const fn size_in_bytes(&self) -> usize {
        let m = self.materialization();
        let len = match m.length {
            Some(l) => l.size_in_bytes(),
            None => 0,
        };
        m.value.size_in_bytes() + len
    }

    pub const fn is_variable_length(&self) -> bool {
        matches!(self, TypeId::Varchar)
    }

    pub const fn is_integral(&self) -> bool {
        matches!(
            self,
            TypeId::TinyInt | TypeId::SmallInt | TypeId::Integer | TypeId::BigInt
        )
    }

    pub const fn is_numeric(&self) -> bool {
        self.is_integral() || matches!(self, TypeId::Double)
    }

    /// Position of the type in `ALL`.
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Type both operands are converted to before a comparison or
    /// arithmetic operation.
    pub fn common_type(left: TypeId, right: TypeId) -> Result<TypeId> {
        if left == right {
            return Ok(left);
        }
        if left.is_integral() && right.is_integral() {
            let wider = if left.size_in_bytes() >= right.size_in_bytes() {
                left
            } else {
                right
            };
            return Ok(wider);
        }
        if left.is_numeric() && right.is_numeric() {
            return Ok(TypeId::Double);
        }
        Err(DbError::new("No common type")
            .with_field("left", left)
            .with_field("right", right))
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeId::Boolean => write!(f, "BOOLEAN"),
            TypeId::TinyInt => write!(f, "TINYINT"),
            TypeId::SmallInt => write!(f, "SMALLINT"),
            TypeId::Integer => write!(f, "INTEGER"),
            TypeId::BigInt => write!(f, "BIGINT"),
            TypeId::Double => write!(f, "DOUBLE"),
            TypeId::Date => write!(f, "DATE"),
            TypeId::Timestamp => write!(f, "TIMESTAMP"),
            TypeId::Varchar => write!(f, "VARCHAR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type {
    pub type_id: TypeId,
    pub nullable: bool,
}

impl Type {
    pub const fn new(type_id: TypeId, nullable: bool) -> Self {
        Type { type_id, nullable }
    }

    pub const fn not_null(type_id: TypeId) -> Self {
        Self::new(type_id, false)
    }

    pub const fn nullable(type_id: TypeId) -> Self {
        Self::new(type_id, true)
    }

    pub const fn as_nullable(self) -> Self {
        Self::new(self.type_id, true)
    }

    pub const fn as_not_null(self) -> Self {
        Self::new(self.type_id, false)
    }

    pub const fn materialization(&self) -> Materialization {
        self.type_id.materialization()
    }

    pub const fn is_variable_length(&self) -> bool {
        self.type_id.is_variable_length()
    }

    pub const fn size_in_bytes(&self) -> usize {
        self.type_id.size_in_bytes()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{} NULL", self.type_id)
        } else {
            write!(f, "{} NOT NULL", self.type_id)
        }
    }
}
