use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use super::type_system::{ComparisonOp, TypeSystem};
use super::TypeId;
use crate::codegen::runtime_functions::RuntimeFunction;
use crate::codegen::{CodeGen, Value};

/// Strings compare byte-wise through the runtime.
#[derive(Debug)]
pub struct VarcharTypeSystem;

impl TypeSystem for VarcharTypeSystem {
    fn type_id(&self) -> TypeId {
        TypeId::Varchar
    }

    fn compare(&self, cg: &mut CodeGen, op: ComparisonOp, left: &Value, right: &Value) -> ir::Value {
        let cmp = self.compare_for_sort(cg, left, right);
        let cc = match op {
            ComparisonOp::Eq => IntCC::Equal,
            ComparisonOp::NotEq => IntCC::NotEqual,
            ComparisonOp::Lt => IntCC::SignedLessThan,
            ComparisonOp::LtEq => IntCC::SignedLessThanOrEqual,
            ComparisonOp::Gt => IntCC::SignedGreaterThan,
            ComparisonOp::GtEq => IntCC::SignedGreaterThanOrEqual,
        };
        cg.cursor().ins().icmp_imm(cc, cmp, 0)
    }

    fn compare_for_sort(&self, cg: &mut CodeGen, left: &Value, right: &Value) -> ir::Value {
        let args = [
            left.value(),
            left.length_or_zero(cg),
            right.value(),
            right.length_or_zero(cg),
        ];
        cg.call_runtime_value(RuntimeFunction::CompareStrings, &args)
    }
}
