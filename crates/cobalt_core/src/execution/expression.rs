use cobalt_error::{DbError, Result};

use crate::codegen::types::TypeId;
use crate::codegen::{CodeGen, Value};
use crate::planner::Expression;

/// Generate code computing `expr` over `row`.
pub fn derive_value(cg: &mut CodeGen, expr: &Expression, row: &[Value]) -> Result<Value> {
    match expr {
        Expression::Column(idx) => row.get(*idx).copied().ok_or_else(|| {
            DbError::new("Column reference out of range")
                .with_field("column", idx)
                .with_field("num_columns", row.len())
        }),
        Expression::Constant(scalar) => Value::from_scalar(cg, scalar),
        Expression::Comparison { op, left, right } => {
            let left = derive_value(cg, left, row)?;
            let right = derive_value(cg, right, row)?;
            left.compare(cg, *op, &right)
        }
        Expression::Arithmetic { op, left, right } => {
            let left = derive_value(cg, left, row)?;
            let right = derive_value(cg, right, row)?;
            left.binary_op(cg, *op, &right)
        }
        Expression::And(left, right) => {
            let left = derive_value(cg, left, row)?;
            let right = derive_value(cg, right, row)?;
            left.logical_and(cg, &right)
        }
        Expression::Or(left, right) => {
            let left = derive_value(cg, left, row)?;
            let right = derive_value(cg, right, row)?;
            left.logical_or(cg, &right)
        }
        Expression::Not(expr) => derive_value(cg, expr, row)?.logical_not(cg),
        Expression::IsNull(expr) => {
            let value = derive_value(cg, expr, row)?;
            let null = value.is_null(cg);
            Ok(Value::not_null(TypeId::Boolean, null))
        }
    }
}

/// Generate code computing all expressions over `row`.
pub fn derive_values(cg: &mut CodeGen, exprs: &[Expression], row: &[Value]) -> Result<Vec<Value>> {
    exprs.iter().map(|expr| derive_value(cg, expr, row)).collect()
}

/// i8 flag set if the predicate holds for `row`. NULL counts as false.
pub fn evaluate_predicate(cg: &mut CodeGen, predicate: &Expression, row: &[Value]) -> Result<cranelift_codegen::ir::Value> {
    derive_value(cg, predicate, row)?.is_true(cg)
}

#[cfg(test)]
mod tests {
    use cranelift_codegen::ir;

    use super::*;
    use crate::codegen::types::{BinaryOp, Registry, Type};
    use crate::codegen::{CodeContext, CodegenOptions, FunctionBuilder, PrimitiveType};
    use crate::runtime::error::take_pending_error;
    use crate::scalar::ScalarValue;

    /// Compile `f(a, b, b_null) -> i8` for a predicate over an INTEGER NOT
    /// NULL column and a nullable BIGINT column.
    fn compile_predicate(expr: &Expression) -> (CodeContext, crate::codegen::FunctionDeclaration) {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);

        let func = FunctionBuilder::new(
            &mut cg,
            "predicate",
            &[PrimitiveType::Int32, PrimitiveType::Int64, PrimitiveType::Bool],
            PrimitiveType::Bool,
        )
        .unwrap();
        let row = [
            Value::not_null(TypeId::Integer, func.argument(&cg, 0)),
            Value::new(
                Type::nullable(TypeId::BigInt),
                func.argument(&cg, 1),
                None,
                Some(func.argument(&cg, 2)),
            ),
        ];

        let result = evaluate_predicate(&mut cg, expr, &row).unwrap();
        assert_eq!(ir::types::I8, cg.value_type(result));
        let decl = func.return_and_finish(&mut cg, Some(result));
        cc.compile().unwrap();
        (cc, decl)
    }

    #[test]
    fn predicate_with_nulls() {
        // a + 1 > b OR b IS NULL
        let expr = Expression::or(
            Expression::gt(
                Expression::arith(BinaryOp::Add, Expression::column(0), Expression::constant(1)),
                Expression::column(1),
            ),
            Expression::is_null(Expression::column(1)),
        );
        let (cc, decl) = compile_predicate(&expr);
        let f: extern "C" fn(i32, i64, u8) -> u8 = unsafe { std::mem::transmute(cc.get_function_pointer(&decl).unwrap()) };

        assert_eq!(1, f(5, 4, 0));
        assert_eq!(0, f(5, 6, 0));
        assert_eq!(1, f(5, 100, 1));
        assert!(take_pending_error().is_none());
    }

    #[test]
    fn null_comparison_filters_out() {
        let expr = Expression::not(Expression::eq(Expression::column(1), Expression::constant(3i64)));
        let (cc, decl) = compile_predicate(&expr);
        let f: extern "C" fn(i32, i64, u8) -> u8 = unsafe { std::mem::transmute(cc.get_function_pointer(&decl).unwrap()) };

        assert_eq!(1, f(0, 4, 0));
        assert_eq!(0, f(0, 3, 0));
        // NOT NULL is NULL, which doesn't pass.
        assert_eq!(0, f(0, 4, 1));
    }

    #[test]
    fn overflow_in_predicate() {
        let expr = Expression::gt(
            Expression::arith(BinaryOp::Mul, Expression::column(0), Expression::constant(2)),
            Expression::constant(ScalarValue::Int32(0)),
        );
        let (cc, decl) = compile_predicate(&expr);
        let f: extern "C" fn(i32, i64, u8) -> u8 = unsafe { std::mem::transmute(cc.get_function_pointer(&decl).unwrap()) };

        assert_eq!(1, f(4, 0, 0));
        assert!(take_pending_error().is_none());
        f(i32::MAX, 0, 0);
        let err = take_pending_error().unwrap();
        assert_eq!("Numeric value out of range", err.get_msg());
    }

    #[test]
    fn column_out_of_range() {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);
        let func = FunctionBuilder::new(&mut cg, "f", &[], PrimitiveType::Void).unwrap();
        assert!(derive_value(&mut cg, &Expression::column(1), &[]).is_err());
        func.return_and_finish(&mut cg, None);
    }
}
