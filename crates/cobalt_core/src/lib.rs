pub mod codegen;
pub mod config;
pub mod execution;
pub mod planner;
pub mod runtime;
pub mod scalar;
