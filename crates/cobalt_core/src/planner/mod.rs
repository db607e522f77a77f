//! Physical plans handed to the query compiler.

pub mod expression;
pub mod plan;

pub use expression::{AggregateExpr, AggregateFunction, Expression};
pub use plan::{PlanNode, SortKey};
