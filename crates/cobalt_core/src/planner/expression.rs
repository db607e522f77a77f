use std::fmt;

use cobalt_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use crate::codegen::types::{BinaryOp, ComparisonOp, Type, TypeId};
use crate::scalar::ScalarValue;

/// Scalar expression evaluated against a single input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Reference to a column in the input row.
    Column(usize),
    Constant(ScalarValue),
    Comparison {
        op: ComparisonOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Arithmetic {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    IsNull(Box<Expression>),
}

impl Expression {
    pub fn column(idx: usize) -> Self {
        Expression::Column(idx)
    }

    pub fn constant(value: impl Into<ScalarValue>) -> Self {
        Expression::Constant(value.into())
    }

    pub fn compare(op: ComparisonOp, left: Expression, right: Expression) -> Self {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::compare(ComparisonOp::Eq, left, right)
    }

    pub fn lt(left: Expression, right: Expression) -> Self {
        Self::compare(ComparisonOp::Lt, left, right)
    }

    pub fn gt(left: Expression, right: Expression) -> Self {
        Self::compare(ComparisonOp::Gt, left, right)
    }

    pub fn arith(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expression) -> Self {
        Expression::Not(Box::new(expr))
    }

    pub fn is_null(expr: Expression) -> Self {
        Expression::IsNull(Box::new(expr))
    }

    /// Type this expression produces for rows of the given input types.
    ///
    /// Matches the type of the value generated code produces for the
    /// expression, nullability included.
    pub fn output_type(&self, input: &[Type]) -> Result<Type> {
        Ok(match self {
            Self::Column(idx) => *input.get(*idx).ok_or_else(|| {
                DbError::new("Column reference out of range")
                    .with_field("column", idx)
                    .with_field("num_columns", input.len())
            })?,
            Self::Constant(scalar) => match scalar.type_id() {
                Some(type_id) => Type::not_null(type_id),
                None => Type::nullable(TypeId::Integer),
            },
            Self::Comparison { left, right, .. } => {
                let left = left.output_type(input)?;
                let right = right.output_type(input)?;
                TypeId::common_type(left.type_id, right.type_id)?;
                Type::new(TypeId::Boolean, left.nullable || right.nullable)
            }
            Self::Arithmetic { op, left, right } => {
                let left = left.output_type(input)?;
                let right = right.output_type(input)?;
                let common = TypeId::common_type(left.type_id, right.type_id)?;
                if !common.is_numeric() {
                    return Err(DbError::new("Arithmetic requires numeric operands")
                        .with_field("op", op)
                        .with_field("type", common));
                }
                Type::new(common, left.nullable || right.nullable)
            }
            Self::And(left, right) | Self::Or(left, right) => {
                let left = check_boolean(left.output_type(input)?)?;
                let right = check_boolean(right.output_type(input)?)?;
                Type::new(TypeId::Boolean, left.nullable || right.nullable)
            }
            Self::Not(expr) => check_boolean(expr.output_type(input)?)?,
            Self::IsNull(expr) => {
                expr.output_type(input)?;
                Type::not_null(TypeId::Boolean)
            }
        })
    }
}

fn check_boolean(ty: Type) -> Result<Type> {
    if ty.type_id != TypeId::Boolean {
        return Err(DbError::new("Expected boolean expression").with_field("type", ty));
    }
    Ok(ty)
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(idx) => write!(f, "#{idx}"),
            Self::Constant(v) => write!(f, "{v}"),
            Self::Comparison { op, left, right } => write!(f, "({left} {op} {right})"),
            Self::Arithmetic { op, left, right } => write!(f, "({left} {op} {right})"),
            Self::And(left, right) => write!(f, "({left} AND {right})"),
            Self::Or(left, right) => write!(f, "({left} OR {right})"),
            Self::Not(expr) => write!(f, "NOT {expr}"),
            Self::IsNull(expr) => write!(f, "{expr} IS NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountStar | Self::Count => write!(f, "count"),
            Self::Sum => write!(f, "sum"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Avg => write!(f, "avg"),
        }
    }
}

/// An aggregate over a column of the group by input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    /// Input column, `None` only for `COUNT(*)`.
    pub column: Option<usize>,
}

impl AggregateExpr {
    pub fn count_star() -> Self {
        AggregateExpr {
            function: AggregateFunction::CountStar,
            column: None,
        }
    }

    pub fn new(function: AggregateFunction, column: usize) -> Self {
        AggregateExpr {
            function,
            column: Some(column),
        }
    }

    /// Type of the argument column, `None` for `COUNT(*)`.
    pub fn input_type(&self, input: &[Type]) -> Result<Option<Type>> {
        match (self.function, self.column) {
            (AggregateFunction::CountStar, _) => Ok(None),
            (_, None) => Err(DbError::new("Aggregate requires an input column").with_field("function", self.function)),
            (_, Some(col)) => Expression::Column(col).output_type(input).map(Some),
        }
    }

    pub fn output_type(&self, input: &[Type]) -> Result<Type> {
        let arg = self.input_type(input)?;
        Ok(match (self.function, arg) {
            (AggregateFunction::CountStar | AggregateFunction::Count, _) => Type::not_null(TypeId::BigInt),
            (AggregateFunction::Sum, Some(arg)) => match arg.type_id {
                TypeId::Double => Type::nullable(TypeId::Double),
                id if id.is_integral() => Type::nullable(TypeId::BigInt),
                other => {
                    return Err(DbError::new("SUM requires a numeric input").with_field("type", other));
                }
            },
            (AggregateFunction::Avg, Some(arg)) => {
                if !arg.type_id.is_numeric() {
                    return Err(DbError::new("AVG requires a numeric input").with_field("type", arg.type_id));
                }
                Type::nullable(TypeId::Double)
            }
            (AggregateFunction::Min | AggregateFunction::Max, Some(arg)) => {
                if arg.type_id == TypeId::Boolean {
                    return Err(DbError::new("MIN/MAX not supported for booleans"));
                }
                arg.as_nullable()
            }
            (_, None) => unreachable!("input type checked above"),
        })
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}(#{col})", self.function),
            None => write!(f, "{}(*)", self.function),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_types() {
        let input = [Type::not_null(TypeId::Integer), Type::nullable(TypeId::BigInt)];

        let expr = Expression::arith(BinaryOp::Add, Expression::column(0), Expression::column(1));
        assert_eq!(Type::nullable(TypeId::BigInt), expr.output_type(&input).unwrap());

        let expr = Expression::gt(Expression::column(0), Expression::constant(3.5));
        assert_eq!(Type::not_null(TypeId::Boolean), expr.output_type(&input).unwrap());

        let expr = Expression::is_null(Expression::column(1));
        assert_eq!(Type::not_null(TypeId::Boolean), expr.output_type(&input).unwrap());

        let expr = Expression::constant(ScalarValue::Null);
        assert_eq!(Type::nullable(TypeId::Integer), expr.output_type(&input).unwrap());
    }

    #[test]
    fn output_type_errors() {
        let input = [Type::not_null(TypeId::Varchar), Type::not_null(TypeId::Integer)];

        assert!(Expression::column(2).output_type(&input).is_err());
        assert!(
            Expression::arith(BinaryOp::Add, Expression::column(0), Expression::column(0))
                .output_type(&input)
                .is_err()
        );
        assert!(Expression::not(Expression::column(1)).output_type(&input).is_err());
        assert!(
            Expression::eq(Expression::column(0), Expression::column(1))
                .output_type(&input)
                .is_err()
        );
    }

    #[test]
    fn aggregate_types() {
        let input = [Type::not_null(TypeId::SmallInt), Type::not_null(TypeId::Varchar)];

        assert_eq!(
            Type::not_null(TypeId::BigInt),
            AggregateExpr::count_star().output_type(&input).unwrap()
        );
        assert_eq!(
            Type::nullable(TypeId::BigInt),
            AggregateExpr::new(AggregateFunction::Sum, 0).output_type(&input).unwrap()
        );
        assert_eq!(
            Type::nullable(TypeId::Double),
            AggregateExpr::new(AggregateFunction::Avg, 0).output_type(&input).unwrap()
        );
        assert_eq!(
            Type::nullable(TypeId::Varchar),
            AggregateExpr::new(AggregateFunction::Max, 1).output_type(&input).unwrap()
        );
        assert!(AggregateExpr::new(AggregateFunction::Sum, 1).output_type(&input).is_err());
    }

    #[test]
    fn display() {
        let expr = Expression::and(
            Expression::lt(Expression::column(0), Expression::constant(4)),
            Expression::not(Expression::is_null(Expression::column(1))),
        );
        assert_eq!("((#0 < 4) AND NOT #1 IS NULL)", expr.to_string());
    }
}
