use std::fmt;

use cobalt_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use super::expression::{AggregateExpr, Expression};
use crate::codegen::types::{Type, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Column of the input to sort on.
    pub column: usize,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        SortKey {
            column,
            descending: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        SortKey {
            column,
            descending: true,
        }
    }
}

/// Physical plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanNode {
    /// Sequential scan over a catalog table.
    SeqScan {
        table_id: u32,
        /// Schema of the table.
        schema: Vec<Type>,
        /// Table columns produced by the scan, in output order.
        columns: Vec<usize>,
        /// Filter applied to the produced columns.
        predicate: Option<Expression>,
    },
    Projection {
        input: Box<PlanNode>,
        exprs: Vec<Expression>,
    },
    /// Block nested loop join. Output is the left row followed by the right
    /// row.
    NestedLoopJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        /// Evaluated against the combined row.
        predicate: Option<Expression>,
    },
    /// Inner equi-join. The left side builds the hash table, the right side
    /// probes it. Output is the left row followed by the right row.
    HashJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        left_keys: Vec<Expression>,
        right_keys: Vec<Expression>,
    },
    /// Output is the group values followed by the aggregate results.
    HashGroupBy {
        input: Box<PlanNode>,
        group_by: Vec<Expression>,
        aggregates: Vec<AggregateExpr>,
    },
    OrderBy {
        input: Box<PlanNode>,
        keys: Vec<SortKey>,
    },
}

impl PlanNode {
    pub fn scan(table_id: u32, schema: Vec<Type>) -> Self {
        let columns = (0..schema.len()).collect();
        PlanNode::SeqScan {
            table_id,
            schema,
            columns,
            predicate: None,
        }
    }

    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            Self::SeqScan { .. } => Vec::new(),
            Self::Projection { input, .. } | Self::HashGroupBy { input, .. } | Self::OrderBy { input, .. } => {
                vec![input.as_ref()]
            }
            Self::NestedLoopJoin { left, right, .. } | Self::HashJoin { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SeqScan { .. } => "SeqScan",
            Self::Projection { .. } => "Projection",
            Self::NestedLoopJoin { .. } => "NestedLoopJoin",
            Self::HashJoin { .. } => "HashJoin",
            Self::HashGroupBy { .. } => "HashGroupBy",
            Self::OrderBy { .. } => "OrderBy",
        }
    }

    /// Types of the rows this node produces. Errors if the node's
    /// expressions don't type check against its inputs.
    pub fn output_schema(&self) -> Result<Vec<Type>> {
        match self {
            Self::SeqScan {
                schema,
                columns,
                predicate,
                ..
            } => {
                let output = columns
                    .iter()
                    .map(|col| Expression::Column(*col).output_type(schema))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(predicate) = predicate {
                    check_predicate(predicate, &output)?;
                }
                Ok(output)
            }
            Self::Projection { input, exprs } => {
                let input = input.output_schema()?;
                exprs.iter().map(|expr| expr.output_type(&input)).collect()
            }
            Self::NestedLoopJoin { left, right, predicate } => {
                let mut output = left.output_schema()?;
                output.extend(right.output_schema()?);
                if let Some(predicate) = predicate {
                    check_predicate(predicate, &output)?;
                }
                Ok(output)
            }
            Self::HashJoin {
                left,
                right,
                left_keys,
                right_keys,
            } => {
                let left = left.output_schema()?;
                let right = right.output_schema()?;
                join_key_types(left_keys, &left, right_keys, &right)?;
                let mut output = left;
                output.extend(right);
                Ok(output)
            }
            Self::HashGroupBy {
                input,
                group_by,
                aggregates,
            } => {
                let input = input.output_schema()?;
                let mut output = group_by
                    .iter()
                    .map(|expr| expr.output_type(&input))
                    .collect::<Result<Vec<_>>>()?;
                for agg in aggregates {
                    output.push(agg.output_type(&input)?);
                }
                Ok(output)
            }
            Self::OrderBy { input, keys } => {
                let input = input.output_schema()?;
                for key in keys {
                    if key.column >= input.len() {
                        return Err(DbError::new("Sort key out of range")
                            .with_field("column", key.column)
                            .with_field("num_columns", input.len()));
                    }
                }
                Ok(input)
            }
        }
    }

    fn explain(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.name(), indent = indent * 2)?;
        match self {
            Self::SeqScan {
                table_id,
                columns,
                predicate,
                ..
            } => {
                write!(f, " (table: {table_id}, columns: {columns:?}")?;
                if let Some(predicate) = predicate {
                    write!(f, ", predicate: {predicate}")?;
                }
                write!(f, ")")?;
            }
            Self::Projection { exprs, .. } => write!(f, " ({})", join_display(exprs))?,
            Self::NestedLoopJoin { predicate, .. } => {
                if let Some(predicate) = predicate {
                    write!(f, " ({predicate})")?;
                }
            }
            Self::HashJoin {
                left_keys, right_keys, ..
            } => write!(f, " ([{}] = [{}])", join_display(left_keys), join_display(right_keys))?,
            Self::HashGroupBy {
                group_by, aggregates, ..
            } => write!(f, " (keys: [{}], aggregates: [{}])", join_display(group_by), join_display(aggregates))?,
            Self::OrderBy { keys, .. } => {
                let keys: Vec<_> = keys
                    .iter()
                    .map(|k| format!("#{} {}", k.column, if k.descending { "DESC" } else { "ASC" }))
                    .collect();
                write!(f, " ({})", keys.join(", "))?;
            }
        }
        writeln!(f)?;
        for child in self.children() {
            child.explain(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.explain(f, 0)
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|item| item.to_string()).collect::<Vec<_>>().join(", ")
}

fn check_predicate(predicate: &Expression, input: &[Type]) -> Result<()> {
    let ty = predicate.output_type(input)?;
    if ty.type_id != TypeId::Boolean {
        return Err(DbError::new("Predicate must be a boolean expression")
            .with_field("predicate", predicate)
            .with_field("type", ty));
    }
    Ok(())
}

/// Types join keys are converted to before hashing and comparing. Each key
/// is nullable if either side is.
pub fn join_key_types(
    left_keys: &[Expression],
    left: &[Type],
    right_keys: &[Expression],
    right: &[Type],
) -> Result<Vec<Type>> {
    if left_keys.is_empty() || left_keys.len() != right_keys.len() {
        return Err(DbError::new("Hash join requires the same non-zero number of keys on each side")
            .with_field("left", left_keys.len())
            .with_field("right", right_keys.len()));
    }
    left_keys
        .iter()
        .zip(right_keys)
        .map(|(l, r)| {
            let l = l.output_type(left)?;
            let r = r.output_type(right)?;
            let common = TypeId::common_type(l.type_id, r.type_id)?;
            Ok(Type::new(common, l.nullable || r.nullable))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::expression::AggregateFunction;
    use crate::scalar::ScalarValue;

    fn scan() -> PlanNode {
        PlanNode::scan(
            0,
            vec![Type::not_null(TypeId::Integer), Type::nullable(TypeId::Varchar)],
        )
    }

    #[test]
    fn join_schema() {
        let plan = PlanNode::HashJoin {
            left: Box::new(scan()),
            right: Box::new(PlanNode::scan(1, vec![Type::nullable(TypeId::BigInt)])),
            left_keys: vec![Expression::column(0)],
            right_keys: vec![Expression::column(0)],
        };
        assert_eq!(
            vec![
                Type::not_null(TypeId::Integer),
                Type::nullable(TypeId::Varchar),
                Type::nullable(TypeId::BigInt),
            ],
            plan.output_schema().unwrap()
        );
    }

    #[test]
    fn join_keys_must_match() {
        let left = [Type::not_null(TypeId::Integer)];
        let right = [Type::not_null(TypeId::Varchar)];
        assert!(join_key_types(&[Expression::column(0)], &left, &[Expression::column(0)], &right).is_err());
        assert!(join_key_types(&[], &left, &[], &right).is_err());

        let types = join_key_types(
            &[Expression::column(0)],
            &left,
            &[Expression::constant(ScalarValue::Null)],
            &right,
        )
        .unwrap();
        assert_eq!(vec![Type::nullable(TypeId::Integer)], types);
    }

    #[test]
    fn group_by_schema() {
        let plan = PlanNode::HashGroupBy {
            input: Box::new(scan()),
            group_by: vec![Expression::column(1)],
            aggregates: vec![
                AggregateExpr::count_star(),
                AggregateExpr::new(AggregateFunction::Min, 0),
            ],
        };
        assert_eq!(
            vec![
                Type::nullable(TypeId::Varchar),
                Type::not_null(TypeId::BigInt),
                Type::nullable(TypeId::Integer),
            ],
            plan.output_schema().unwrap()
        );
    }

    #[test]
    fn predicate_must_be_boolean() {
        let plan = PlanNode::SeqScan {
            table_id: 0,
            schema: vec![Type::not_null(TypeId::Integer)],
            columns: vec![0],
            predicate: Some(Expression::column(0)),
        };
        assert!(plan.output_schema().is_err());
    }

    #[test]
    fn explain() {
        let plan = PlanNode::OrderBy {
            input: Box::new(scan()),
            keys: vec![SortKey::desc(0)],
        };
        assert_eq!(
            "OrderBy (#0 DESC)\n  SeqScan (table: 0, columns: [0, 1])\n",
            plan.to_string()
        );
    }

    #[test]
    fn plans_from_json() {
        let plan = PlanNode::HashGroupBy {
            input: Box::new(scan()),
            group_by: vec![Expression::is_null(Expression::column(1))],
            aggregates: vec![AggregateExpr::new(AggregateFunction::Sum, 0)],
        };
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("HashGroupBy"));

        let decoded: PlanNode = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, decoded);
        assert_eq!(plan.output_schema().unwrap(), decoded.output_schema().unwrap());
    }
}
