use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use super::type_system::{BinaryOp, ComparisonOp, TypeSystem};
use super::TypeId;
use crate::codegen::{CodeGen, Value};

/// Integer backed types.
///
/// Arithmetic is only available for the integral types, dates and
/// timestamps only compare.
#[derive(Debug)]
pub struct IntegerTypeSystem {
    type_id: TypeId,
}

impl IntegerTypeSystem {
    pub const fn new(type_id: TypeId) -> Self {
        IntegerTypeSystem { type_id }
    }

    fn ir_type(&self) -> ir::Type {
        match self.type_id.materialization().value.ir_type() {
            Some(ty) => ty,
            None => unreachable!("integer types materialize to a register"),
        }
    }

    fn min_value(&self) -> i64 {
        match self.type_id {
            TypeId::TinyInt => i8::MIN as i64,
            TypeId::SmallInt => i16::MIN as i64,
            TypeId::Integer => i32::MIN as i64,
            _ => i64::MIN,
        }
    }

    fn int_cc(&self, op: ComparisonOp) -> IntCC {
        let unsigned = self.type_id == TypeId::Boolean;
        match (op, unsigned) {
            (ComparisonOp::Eq, _) => IntCC::Equal,
            (ComparisonOp::NotEq, _) => IntCC::NotEqual,
            (ComparisonOp::Lt, false) => IntCC::SignedLessThan,
            (ComparisonOp::LtEq, false) => IntCC::SignedLessThanOrEqual,
            (ComparisonOp::Gt, false) => IntCC::SignedGreaterThan,
            (ComparisonOp::GtEq, false) => IntCC::SignedGreaterThanOrEqual,
            (ComparisonOp::Lt, true) => IntCC::UnsignedLessThan,
            (ComparisonOp::LtEq, true) => IntCC::UnsignedLessThanOrEqual,
            (ComparisonOp::Gt, true) => IntCC::UnsignedGreaterThan,
            (ComparisonOp::GtEq, true) => IntCC::UnsignedGreaterThanOrEqual,
        }
    }
}

impl TypeSystem for IntegerTypeSystem {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn compare(&self, cg: &mut CodeGen, op: ComparisonOp, left: &Value, right: &Value) -> ir::Value {
        let cc = self.int_cc(op);
        cg.cursor().ins().icmp(cc, left.value(), right.value())
    }

    fn compare_for_sort(&self, cg: &mut CodeGen, left: &Value, right: &Value) -> ir::Value {
        let gt_cc = self.int_cc(ComparisonOp::Gt);
        let lt_cc = self.int_cc(ComparisonOp::Lt);
        let mut pos = cg.cursor();
        let gt = pos.ins().icmp(gt_cc, left.value(), right.value());
        let lt = pos.ins().icmp(lt_cc, left.value(), right.value());
        let gt = pos.ins().uextend(ir::types::I32, gt);
        let lt = pos.ins().uextend(ir::types::I32, lt);
        pos.ins().isub(gt, lt)
    }

    fn supports_binary_op(&self, _op: BinaryOp) -> bool {
        self.type_id.is_integral()
    }

    fn binary_op(&self, cg: &mut CodeGen, op: BinaryOp, left: &Value, right: &Value) -> Result<ir::Value> {
        if !self.supports_binary_op(op) {
            return Err(DbError::new("Binary operator not supported")
                .with_field("op", op)
                .with_field("type", self.type_id));
        }

        let ty = self.ir_type();
        let (lhs, rhs) = (left.value(), right.value());

        let result = match op {
            BinaryOp::Add => {
                let (r, overflow) = cg.call_add_with_overflow(lhs, rhs);
                cg.throw_if_overflow(overflow);
                r
            }
            BinaryOp::Sub => {
                let (r, overflow) = cg.call_sub_with_overflow(lhs, rhs);
                cg.throw_if_overflow(overflow);
                r
            }
            BinaryOp::Mul => {
                let (r, overflow) = cg.call_mul_with_overflow(lhs, rhs);
                cg.throw_if_overflow(overflow);
                r
            }
            BinaryOp::Div => {
                let is_zero = cg.cursor().ins().icmp_imm(IntCC::Equal, rhs, 0);
                cg.throw_if_divide_by_zero(is_zero);

                // MIN / -1 doesn't fit.
                let min = cg.const_int(ty, self.min_value());
                let neg_one = cg.const_int(ty, -1);
                let mut pos = cg.cursor();
                let is_min = pos.ins().icmp(IntCC::Equal, lhs, min);
                let is_neg_one = pos.ins().icmp(IntCC::Equal, rhs, neg_one);
                let overflow = pos.ins().band(is_min, is_neg_one);
                cg.throw_if_overflow(overflow);

                cg.cursor().ins().sdiv(lhs, rhs)
            }
            BinaryOp::Mod => {
                let is_zero = cg.cursor().ins().icmp_imm(IntCC::Equal, rhs, 0);
                cg.throw_if_divide_by_zero(is_zero);

                // x % -1 is always zero, avoid MIN % -1.
                let neg_one = cg.const_int(ty, -1);
                let one = cg.const_int(ty, 1);
                let mut pos = cg.cursor();
                let is_neg_one = pos.ins().icmp(IntCC::Equal, rhs, neg_one);
                let divisor = pos.ins().select(is_neg_one, one, rhs);
                pos.ins().srem(lhs, divisor)
            }
        };

        Ok(result)
    }

    fn cast(&self, cg: &mut CodeGen, value: ir::Value, to: TypeId) -> Result<ir::Value> {
        if to == self.type_id {
            return Ok(value);
        }
        if !self.type_id.is_integral() {
            return Err(DbError::new("Unsupported cast")
                .with_field("from", self.type_id)
                .with_field("to", to));
        }

        if to == TypeId::Double {
            let wide = if self.ir_type() == ir::types::I64 {
                value
            } else {
                cg.cursor().ins().sextend(ir::types::I64, value)
            };
            return Ok(cg.cursor().ins().fcvt_from_sint(ir::types::F64, wide));
        }

        if !to.is_integral() {
            return Err(DbError::new("Unsupported cast")
                .with_field("from", self.type_id)
                .with_field("to", to));
        }

        let target = IntegerTypeSystem::new(to).ir_type();
        let from_bits = self.ir_type().bits();
        let to_bits = target.bits();

        if to_bits > from_bits {
            return Ok(cg.cursor().ins().sextend(target, value));
        }

        // Narrowing, overflow if the value doesn't survive a round trip.
        let mut pos = cg.cursor();
        let narrow = pos.ins().ireduce(target, value);
        let back = pos.ins().sextend(self.ir_type(), narrow);
        let overflow = pos.ins().icmp(IntCC::NotEqual, back, value);
        cg.throw_if_overflow(overflow);

        Ok(narrow)
    }
}
