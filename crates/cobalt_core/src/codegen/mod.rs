//! Code generation on top of cranelift.

pub mod code_context;
pub mod codegen;
pub mod compact_storage;
pub mod function_builder;
pub mod hash;
pub mod hash_table;
pub mod lang;
pub mod runtime_functions;
pub mod sorter;
pub mod types;
pub mod value;

use std::fmt;

use cranelift_codegen::ir;

pub use code_context::{CodeContext, CodegenOptions, FunctionDeclaration};
pub use codegen::CodeGen;
pub use function_builder::FunctionBuilder;
pub use value::Value;

/// Primitive types generated code deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Double,
    Void,
    VoidPtr,
    CharPtr,
}

impl PrimitiveType {
    /// The cranelift type used to hold this type, `None` for void.
    pub const fn ir_type(&self) -> Option<ir::Type> {
        match self {
            Self::Bool | Self::Int8 => Some(ir::types::I8),
            Self::Int16 => Some(ir::types::I16),
            Self::Int32 => Some(ir::types::I32),
            Self::Int64 => Some(ir::types::I64),
            Self::Double => Some(ir::types::F64),
            Self::Void => None,
            Self::VoidPtr | Self::CharPtr => Some(ir::types::I64),
        }
    }

    /// Size in bytes. Void reports a size of one so it can still be
    /// addressed.
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::Void => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 | Self::Double | Self::VoidPtr | Self::CharPtr => 8,
        }
    }

    pub const fn is_pointer(&self) -> bool {
        matches!(self, Self::VoidPtr | Self::CharPtr)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int8 => write!(f, "i8"),
            Self::Int16 => write!(f, "i16"),
            Self::Int32 => write!(f, "i32"),
            Self::Int64 => write!(f, "i64"),
            Self::Double => write!(f, "double"),
            Self::Void => write!(f, "void"),
            Self::VoidPtr => write!(f, "void*"),
            Self::CharPtr => write!(f, "char*"),
        }
    }
}
