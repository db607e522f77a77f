use std::fmt;

use cobalt_error::{DbError, Result};
use cranelift_codegen::ir;
use serde::{Deserialize, Serialize};

use super::TypeId;
use crate::codegen::{CodeGen, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::NotEq => write!(f, "<>"),
            Self::Lt => write!(f, "<"),
            Self::LtEq => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::GtEq => write!(f, ">="),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "+"),
            Self::Sub => write!(f, "-"),
            Self::Mul => write!(f, "*"),
            Self::Div => write!(f, "/"),
            Self::Mod => write!(f, "%"),
        }
    }
}

/// Operator table for a single type.
///
/// Operands are always of the implementing type, and only their value and
/// length components are used. Null handling happens in `Value`.
pub trait TypeSystem: fmt::Debug + Sync + Send {
    fn type_id(&self) -> TypeId;

    /// Compare two values, returning an i8 boolean.
    fn compare(&self, cg: &mut CodeGen, op: ComparisonOp, left: &Value, right: &Value) -> ir::Value;

    /// Three way comparison returning an i32 that's negative, zero or
    /// positive.
    fn compare_for_sort(&self, cg: &mut CodeGen, left: &Value, right: &Value) -> ir::Value;

    fn supports_binary_op(&self, _op: BinaryOp) -> bool {
        false
    }

    /// Apply a binary operator, returning the value component of the
    /// result. Errors raised at runtime (overflow, division by zero) branch
    /// to the function's error blocks.
    fn binary_op(&self, _cg: &mut CodeGen, op: BinaryOp, _left: &Value, _right: &Value) -> Result<ir::Value> {
        Err(DbError::new("Binary operator not supported")
            .with_field("op", op)
            .with_field("type", self.type_id()))
    }

    /// Cast the value component to another type.
    fn cast(&self, _cg: &mut CodeGen, value: ir::Value, to: TypeId) -> Result<ir::Value> {
        if to == self.type_id() {
            return Ok(value);
        }
        Err(DbError::new("Unsupported cast")
            .with_field("from", self.type_id())
            .with_field("to", to))
    }
}
