//! Translation of physical plans into native query functions.

pub mod aggregation;
pub mod compilation_context;
pub mod compiler;
pub mod consumer;
pub mod expression;
pub mod operators;
pub mod pipeline;
pub mod query_statement;
pub mod runtime_state;
pub mod translator;

pub use aggregation::AggregateLayout;
pub use compilation_context::{ActivePipeline, CompilationContext, QueryFunctions, TableAccess};
pub use compiler::{CompileStats, QueryCompiler};
pub use consumer::{BufferingConsumer, CountingConsumer, QueryResultConsumer};
pub use pipeline::{Pipeline, PipelineId, TranslatorId};
pub use query_statement::{QueryStatement, RuntimeStats};
pub use runtime_state::{RuntimeState, StateId};
pub use translator::OperatorTranslator;
