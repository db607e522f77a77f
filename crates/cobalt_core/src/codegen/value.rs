use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::{self, InstBuilder};

use super::types::{BinaryOp, ComparisonOp, Type, TypeId};
use super::CodeGen;
use crate::scalar::ScalarValue;

/// A SQL value during code generation.
///
/// `length` is present iff the type is variable length, `null` is present
/// iff the type is nullable. The value and length registers of a NULL value
/// are unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    ty: Type,
    value: ir::Value,
    length: Option<ir::Value>,
    null: Option<ir::Value>,
}

impl Value {
    pub fn new(ty: Type, value: ir::Value, length: Option<ir::Value>, null: Option<ir::Value>) -> Self {
        assert_eq!(
            ty.is_variable_length(),
            length.is_some(),
            "length must be present iff {ty} is variable length"
        );
        assert_eq!(
            ty.nullable,
            null.is_some(),
            "null must be present iff {ty} is nullable"
        );
        Value {
            ty,
            value,
            length,
            null,
        }
    }

    /// Non-nullable fixed length value.
    pub fn not_null(type_id: TypeId, value: ir::Value) -> Self {
        Self::new(Type::not_null(type_id), value, None, None)
    }

    /// A NULL of the given type.
    pub fn null_of(cg: &mut CodeGen, type_id: TypeId) -> Self {
        let (value, length) = zero_components(cg, type_id);
        let null = cg.const_bool(true);
        Self::new(Type::nullable(type_id), value, length, Some(null))
    }

    pub fn from_scalar(cg: &mut CodeGen, scalar: &ScalarValue) -> Result<Self> {
        let value = match scalar {
            ScalarValue::Null => return Ok(Self::null_of(cg, TypeId::Integer)),
            ScalarValue::Boolean(v) => Self::not_null(TypeId::Boolean, cg.const_bool(*v)),
            ScalarValue::Int8(v) => Self::not_null(TypeId::TinyInt, cg.const8(*v)),
            ScalarValue::Int16(v) => Self::not_null(TypeId::SmallInt, cg.const16(*v)),
            ScalarValue::Int32(v) => Self::not_null(TypeId::Integer, cg.const32(*v)),
            ScalarValue::Int64(v) => Self::not_null(TypeId::BigInt, cg.const64(*v)),
            ScalarValue::Float64(v) => Self::not_null(TypeId::Double, cg.const_double(*v)),
            ScalarValue::Date32(v) => Self::not_null(TypeId::Date, cg.const32(*v)),
            ScalarValue::Timestamp(v) => Self::not_null(TypeId::Timestamp, cg.const64(*v)),
            ScalarValue::Utf8(v) => {
                if v.len() > i32::MAX as usize {
                    return Err(DbError::new("String constant too long").with_field("len", v.len()));
                }
                let (ptr, len) = cg.const_string(v);
                Self::new(Type::not_null(TypeId::Varchar), ptr, Some(len), None)
            }
        };
        Ok(value)
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn type_id(&self) -> TypeId {
        self.ty.type_id
    }

    pub fn value(&self) -> ir::Value {
        self.value
    }

    pub fn length(&self) -> Option<ir::Value> {
        self.length
    }

    pub fn null(&self) -> Option<ir::Value> {
        self.null
    }

    pub fn is_nullable(&self) -> bool {
        self.ty.nullable
    }

    pub fn length_or_zero(&self, cg: &mut CodeGen) -> ir::Value {
        match self.length {
            Some(len) => len,
            None => cg.const32(0),
        }
    }

    /// i8 boolean that's set if this value is NULL.
    pub fn is_null(&self, cg: &mut CodeGen) -> ir::Value {
        match self.null {
            Some(null) => null,
            None => cg.const_bool(false),
        }
    }

    pub fn is_not_null(&self, cg: &mut CodeGen) -> ir::Value {
        let null = self.is_null(cg);
        cg.cursor().ins().bxor_imm(null, 1)
    }

    /// Mark the value as nullable, with `null` OR'ed into the existing null
    /// flag.
    pub fn with_null(&self, cg: &mut CodeGen, null: ir::Value) -> Self {
        let null = match self.null {
            Some(existing) => cg.cursor().ins().bor(existing, null),
            None => null,
        };
        Self::new(self.ty.as_nullable(), self.value, self.length, Some(null))
    }

    pub fn cast_to(&self, cg: &mut CodeGen, to: TypeId) -> Result<Self> {
        if to == self.type_id() {
            return Ok(*self);
        }
        let value = cg
            .registry()
            .type_system(self.type_id())
            .cast(cg, self.value, to)?;
        Ok(Self::new(Type::new(to, self.ty.nullable), value, None, self.null))
    }

    /// Null flag that's set if either value is NULL, `None` if neither value
    /// is nullable.
    fn combined_null(&self, cg: &mut CodeGen, other: &Value) -> Option<ir::Value> {
        match (self.null, other.null) {
            (Some(a), Some(b)) => Some(cg.cursor().ins().bor(a, b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    fn coerce(&self, cg: &mut CodeGen, other: &Value) -> Result<(Value, Value)> {
        let common = TypeId::common_type(self.type_id(), other.type_id())?;
        Ok((self.cast_to(cg, common)?, other.cast_to(cg, common)?))
    }

    /// SQL comparison. The result is NULL if either side is NULL.
    pub fn compare(&self, cg: &mut CodeGen, op: ComparisonOp, other: &Value) -> Result<Self> {
        let (left, right) = self.coerce(cg, other)?;
        let result = cg
            .registry()
            .type_system(left.type_id())
            .compare(cg, op, &left, &right);
        let null = self.combined_null(cg, other);
        Ok(Self::new(
            Type::new(TypeId::Boolean, null.is_some()),
            result,
            None,
            null,
        ))
    }

    /// Equality where NULL equals NULL, returning a non-null i8 boolean.
    pub fn test_equality(&self, cg: &mut CodeGen, other: &Value) -> Result<ir::Value> {
        let (left, right) = self.coerce(cg, other)?;
        let eq = cg
            .registry()
            .type_system(left.type_id())
            .compare(cg, ComparisonOp::Eq, &left, &right);

        if !self.is_nullable() && !other.is_nullable() {
            return Ok(eq);
        }

        let l_null = self.is_null(cg);
        let r_null = other.is_null(cg);
        let mut pos = cg.cursor();
        let both_null = pos.ins().band(l_null, r_null);
        let any_null = pos.ins().bor(l_null, r_null);
        let neither_null = pos.ins().bxor_imm(any_null, 1);
        let eq_not_null = pos.ins().band(eq, neither_null);
        Ok(pos.ins().bor(both_null, eq_not_null))
    }

    /// Three way comparison with NULLs sorting after everything else.
    /// Returns an i32.
    pub fn compare_for_sort(&self, cg: &mut CodeGen, other: &Value) -> Result<ir::Value> {
        let (left, right) = self.coerce(cg, other)?;
        let cmp = cg
            .registry()
            .type_system(left.type_id())
            .compare_for_sort(cg, &left, &right);

        if !self.is_nullable() && !other.is_nullable() {
            return Ok(cmp);
        }

        let l_null = self.is_null(cg);
        let r_null = other.is_null(cg);
        let mut pos = cg.cursor();
        let any_null = pos.ins().bor(l_null, r_null);
        let l = pos.ins().uextend(ir::types::I32, l_null);
        let r = pos.ins().uextend(ir::types::I32, r_null);
        let null_cmp = pos.ins().isub(l, r);
        Ok(pos.ins().select(any_null, null_cmp, cmp))
    }

    /// Arithmetic. The result is NULL if either side is NULL.
    pub fn binary_op(&self, cg: &mut CodeGen, op: BinaryOp, other: &Value) -> Result<Self> {
        let (mut left, mut right) = self.coerce(cg, other)?;
        let type_id = left.type_id();
        let null = self.combined_null(cg, other);

        // NULL operands never take part in the computation, replace them
        // with values that can't raise errors.
        if let Some(null) = null {
            let (zero, _) = zero_components(cg, type_id);
            let one = match type_id {
                TypeId::Double => cg.const_double(1.0),
                _ => {
                    let ty = cg.value_type(right.value);
                    cg.const_int(ty, 1)
                }
            };
            let substitute = match op {
                BinaryOp::Div | BinaryOp::Mod => one,
                _ => zero,
            };
            let mut pos = cg.cursor();
            left.value = pos.ins().select(null, zero, left.value);
            right.value = pos.ins().select(null, substitute, right.value);
        }

        let result = cg
            .registry()
            .type_system(type_id)
            .binary_op(cg, op, &left, &right)?;

        Ok(Self::new(Type::new(type_id, null.is_some()), result, None, null))
    }

    /// Select between two values of the same type.
    pub fn select(cg: &mut CodeGen, cond: ir::Value, a: &Value, b: &Value) -> Self {
        assert_eq!(a.type_id(), b.type_id(), "select between different types");
        let mut pos = cg.cursor();
        let value = pos.ins().select(cond, a.value, b.value);
        let length = match (a.length, b.length) {
            (Some(la), Some(lb)) => Some(pos.ins().select(cond, la, lb)),
            _ => None,
        };
        let nullable = a.is_nullable() || b.is_nullable();
        let null = if nullable {
            let an = a.is_null(cg);
            let bn = b.is_null(cg);
            Some(cg.cursor().ins().select(cond, an, bn))
        } else {
            None
        };
        Self::new(Type::new(a.type_id(), nullable), value, length, null)
    }

    /// Smaller of two non-null values.
    pub fn min(&self, cg: &mut CodeGen, other: &Value) -> Result<Self> {
        let (left, right) = self.coerce(cg, other)?;
        let lt = cg
            .registry()
            .type_system(left.type_id())
            .compare(cg, ComparisonOp::Lt, &left, &right);
        Ok(Self::select(cg, lt, &left, &right))
    }

    /// Larger of two non-null values.
    pub fn max(&self, cg: &mut CodeGen, other: &Value) -> Result<Self> {
        let (left, right) = self.coerce(cg, other)?;
        let gt = cg
            .registry()
            .type_system(left.type_id())
            .compare(cg, ComparisonOp::Gt, &left, &right);
        Ok(Self::select(cg, gt, &left, &right))
    }

    fn check_boolean(&self) -> Result<()> {
        if self.type_id() != TypeId::Boolean {
            return Err(DbError::new("Expected boolean value").with_field("type", self.ty));
        }
        Ok(())
    }

    /// Boolean AND with three valued logic. FALSE AND NULL is FALSE.
    pub fn logical_and(&self, cg: &mut CodeGen, other: &Value) -> Result<Self> {
        self.check_boolean()?;
        other.check_boolean()?;

        let value = cg.cursor().ins().band(self.value, other.value);
        let null = match self.combined_null(cg, other) {
            Some(any_null) => {
                let l_false = self.is_definitely(cg, false);
                let r_false = other.is_definitely(cg, false);
                let mut pos = cg.cursor();
                let some_false = pos.ins().bor(l_false, r_false);
                let not_false = pos.ins().bxor_imm(some_false, 1);
                Some(pos.ins().band(any_null, not_false))
            }
            None => None,
        };
        Ok(Self::new(
            Type::new(TypeId::Boolean, null.is_some()),
            value,
            None,
            null,
        ))
    }

    /// Boolean OR with three valued logic. TRUE OR NULL is TRUE.
    pub fn logical_or(&self, cg: &mut CodeGen, other: &Value) -> Result<Self> {
        self.check_boolean()?;
        other.check_boolean()?;

        let value = cg.cursor().ins().bor(self.value, other.value);
        let null = match self.combined_null(cg, other) {
            Some(any_null) => {
                let l_true = self.is_definitely(cg, true);
                let r_true = other.is_definitely(cg, true);
                let mut pos = cg.cursor();
                let some_true = pos.ins().bor(l_true, r_true);
                let not_true = pos.ins().bxor_imm(some_true, 1);
                Some(pos.ins().band(any_null, not_true))
            }
            None => None,
        };
        Ok(Self::new(
            Type::new(TypeId::Boolean, null.is_some()),
            value,
            None,
            null,
        ))
    }

    pub fn logical_not(&self, cg: &mut CodeGen) -> Result<Self> {
        self.check_boolean()?;
        let value = cg.cursor().ins().bxor_imm(self.value, 1);
        Ok(Self::new(self.ty, value, None, self.null))
    }

    /// i8 boolean set if this boolean value is non-null and equal to
    /// `expected`.
    fn is_definitely(&self, cg: &mut CodeGen, expected: bool) -> ir::Value {
        let not_null = self.is_not_null(cg);
        let mut pos = cg.cursor();
        let v = if expected {
            self.value
        } else {
            pos.ins().bxor_imm(self.value, 1)
        };
        pos.ins().band(v, not_null)
    }

    /// i8 boolean set if the value is a non-null TRUE. Used for filtering.
    pub fn is_true(&self, cg: &mut CodeGen) -> Result<ir::Value> {
        self.check_boolean()?;
        Ok(self.is_definitely(cg, true))
    }
}

/// AND together boolean flags pairwise, keeping the dependency chain short.
pub fn logical_and_all(cg: &mut CodeGen, flags: &[ir::Value]) -> ir::Value {
    if flags.is_empty() {
        return cg.const_bool(true);
    }
    let mut level = flags.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [a, b] => next.push(cg.cursor().ins().band(*a, *b)),
                [a] => next.push(*a),
                _ => unreachable!("chunks of two"),
            }
        }
        level = next;
    }
    level[0]
}

/// Zero value and length registers for a type.
fn zero_components(cg: &mut CodeGen, type_id: TypeId) -> (ir::Value, Option<ir::Value>) {
    let m = type_id.materialization();
    let value = match m.value.ir_type() {
        Some(ir::types::F64) => cg.const_double(0.0),
        Some(ty) => cg.const_int(ty, 0),
        None => unreachable!("sql types have a value register"),
    };
    let length = m.length.map(|_| cg.const32(0));
    (value, length)
}
