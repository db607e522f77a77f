use cobalt_error::{DbError, Result};
use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{self, InstBuilder};

use super::type_system::{BinaryOp, ComparisonOp, TypeSystem};
use super::TypeId;
use crate::codegen::{CodeGen, Value};

#[derive(Debug)]
pub struct DoubleTypeSystem;

fn float_cc(op: ComparisonOp) -> FloatCC {
    match op {
        ComparisonOp::Eq => FloatCC::Equal,
        ComparisonOp::NotEq => FloatCC::NotEqual,
        ComparisonOp::Lt => FloatCC::LessThan,
        ComparisonOp::LtEq => FloatCC::LessThanOrEqual,
        ComparisonOp::Gt => FloatCC::GreaterThan,
        ComparisonOp::GtEq => FloatCC::GreaterThanOrEqual,
    }
}

impl TypeSystem for DoubleTypeSystem {
    fn type_id(&self) -> TypeId {
        TypeId::Double
    }

    fn compare(&self, cg: &mut CodeGen, op: ComparisonOp, left: &Value, right: &Value) -> ir::Value {
        cg.cursor().ins().fcmp(float_cc(op), left.value(), right.value())
    }

    /// Total order with NaN after every other value and equal to itself.
    fn compare_for_sort(&self, cg: &mut CodeGen, left: &Value, right: &Value) -> ir::Value {
        let (lhs, rhs) = (left.value(), right.value());
        let mut pos = cg.cursor();
        let gt = pos.ins().fcmp(FloatCC::GreaterThan, lhs, rhs);
        let lt = pos.ins().fcmp(FloatCC::LessThan, lhs, rhs);
        let l_nan = pos.ins().fcmp(FloatCC::Unordered, lhs, lhs);
        let r_nan = pos.ins().fcmp(FloatCC::Unordered, rhs, rhs);
        let only_l_nan = pos.ins().band_not(l_nan, r_nan);
        let only_r_nan = pos.ins().band_not(r_nan, l_nan);
        let gt = pos.ins().bor(gt, only_l_nan);
        let lt = pos.ins().bor(lt, only_r_nan);
        let gt = pos.ins().uextend(ir::types::I32, gt);
        let lt = pos.ins().uextend(ir::types::I32, lt);
        pos.ins().isub(gt, lt)
    }

    fn supports_binary_op(&self, _op: BinaryOp) -> bool {
        true
    }

    fn binary_op(&self, cg: &mut CodeGen, op: BinaryOp, left: &Value, right: &Value) -> Result<ir::Value> {
        let (lhs, rhs) = (left.value(), right.value());

        let result = match op {
            BinaryOp::Add => cg.cursor().ins().fadd(lhs, rhs),
            BinaryOp::Sub => cg.cursor().ins().fsub(lhs, rhs),
            BinaryOp::Mul => cg.cursor().ins().fmul(lhs, rhs),
            BinaryOp::Div | BinaryOp::Mod => {
                let zero = cg.const_double(0.0);
                let is_zero = cg.cursor().ins().fcmp(FloatCC::Equal, rhs, zero);
                cg.throw_if_divide_by_zero(is_zero);

                let mut pos = cg.cursor();
                let quot = pos.ins().fdiv(lhs, rhs);
                if op == BinaryOp::Div {
                    quot
                } else {
                    let trunc = pos.ins().trunc(quot);
                    let prod = pos.ins().fmul(trunc, rhs);
                    pos.ins().fsub(lhs, prod)
                }
            }
        };

        Ok(result)
    }

    fn cast(&self, _cg: &mut CodeGen, value: ir::Value, to: TypeId) -> Result<ir::Value> {
        if to == TypeId::Double {
            return Ok(value);
        }
        Err(DbError::new("Unsupported cast")
            .with_field("from", TypeId::Double)
            .with_field("to", to))
    }
}
