use std::sync::atomic::{AtomicU64, Ordering};

use cobalt_error::Result;

use super::double::DoubleTypeSystem;
use super::integer::IntegerTypeSystem;
use super::type_system::TypeSystem;
use super::varchar::VarcharTypeSystem;
use super::TypeId;
use crate::codegen::{CodeContext, CodegenOptions};

/// Hands out code contexts with unique ids.
#[derive(Debug, Default)]
pub struct CodeContextFactory {
    next_id: AtomicU64,
}

impl CodeContextFactory {
    pub fn create(&self, options: CodegenOptions) -> Result<CodeContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        CodeContext::try_new(id, options)
    }
}

/// Process wide tables needed during code generation.
///
/// Built once and passed by reference to everything generating code.
#[derive(Debug)]
pub struct Registry {
    /// Indexed by `TypeId::index`.
    type_systems: Vec<Box<dyn TypeSystem>>,
    code_context_factory: CodeContextFactory,
}

impl Registry {
    pub fn new() -> Self {
        let type_systems = TypeId::ALL
            .iter()
            .map(|type_id| -> Box<dyn TypeSystem> {
                match type_id {
                    TypeId::Double => Box::new(DoubleTypeSystem),
                    TypeId::Varchar => Box::new(VarcharTypeSystem),
                    other => Box::new(IntegerTypeSystem::new(*other)),
                }
            })
            .collect();

        Registry {
            type_systems,
            code_context_factory: CodeContextFactory::default(),
        }
    }

    pub fn type_system(&self, type_id: TypeId) -> &dyn TypeSystem {
        self.type_systems[type_id.index()].as_ref()
    }

    pub fn code_context_factory(&self) -> &CodeContextFactory {
        &self.code_context_factory
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
