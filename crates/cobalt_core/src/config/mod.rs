//! Compiler configuration.

pub mod settings;

pub use settings::CompilerSetting;

use cobalt_error::{DbError, Result};

use crate::codegen::CodegenOptions;
use crate::scalar::ScalarValue;

pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_HASH_TABLE_CAPACITY: usize = 256;
pub const DEFAULT_NESTED_LOOP_BLOCK_SIZE: usize = 4096;

/// Tunables for query compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Rows per scan batch, also the capacity of selection vectors.
    pub batch_size: usize,
    /// Initial directory capacity for hash tables built eagerly.
    pub hash_table_initial_capacity: usize,
    /// Rows buffered from the left side of a nested loop join before the
    /// right side is scanned.
    pub nested_loop_block_size: usize,
    /// Workers used for pipelines that can run in parallel.
    pub parallel_workers: usize,
    pub optimize: bool,
    pub verify_ir: bool,
    pub dump_ir: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            hash_table_initial_capacity: DEFAULT_HASH_TABLE_CAPACITY,
            nested_loop_block_size: DEFAULT_NESTED_LOOP_BLOCK_SIZE,
            parallel_workers: 1,
            optimize: true,
            verify_ir: true,
            dump_ir: false,
        }
    }
}

impl CompilerConfig {
    /// Use one worker per available core for parallel pipelines.
    pub fn with_all_cores(mut self) -> Self {
        self.parallel_workers = num_cpus::get().max(1);
        self
    }

    pub fn codegen_options(&self) -> CodegenOptions {
        CodegenOptions {
            optimize: self.optimize,
            verify: self.verify_ir,
            dump_ir: self.dump_ir,
        }
    }

    pub fn set_from_scalar(&mut self, name: &str, value: &ScalarValue) -> Result<()> {
        let func = settings::lookup(name)?;
        (func.set)(value, self)
    }

    pub fn get_as_scalar(&self, name: &str) -> Result<ScalarValue> {
        let func = settings::lookup(name)?;
        Ok((func.get)(self))
    }

    /// Reset a single setting to its default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let func = settings::lookup(name)?;
        let default = (func.get)(&Self::default());
        (func.set)(&default, self)
    }

    pub fn reset_all(&mut self) {
        *self = Self::default();
    }
}

pub(crate) fn missing_setting(name: &str) -> DbError {
    DbError::new(format!("Missing setting for '{name}'"))
}
