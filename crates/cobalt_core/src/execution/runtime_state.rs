use cranelift_codegen::ir;
use tracing::trace;

use crate::codegen::CodeGen;

pub type StateId = usize;

#[derive(Debug, Clone)]
struct StateEntry {
    name: String,
    offset: usize,
    size: usize,
}

/// Layout of the parameter block passed to every query function.
///
/// The first two pointer slots hold the catalog and the consumer's state.
/// Operators register whatever state they need on top of that and get back
/// an id to find its offset later. Every entry is 8 byte aligned.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    entries: Vec<StateEntry>,
    size: usize,
}

impl RuntimeState {
    pub const CATALOG_OFFSET: usize = 0;
    pub const CONSUMER_STATE_OFFSET: usize = 8;

    const RESERVED_SIZE: usize = 16;

    pub fn new() -> Self {
        RuntimeState {
            entries: Vec::new(),
            size: Self::RESERVED_SIZE,
        }
    }

    pub fn register(&mut self, name: &str, size: usize) -> StateId {
        let offset = self.size;
        self.size += size.max(1).next_multiple_of(8);
        trace!(%name, %offset, %size, "registered runtime state");
        self.entries.push(StateEntry {
            name: name.to_string(),
            offset,
            size,
        });
        self.entries.len() - 1
    }

    pub fn offset(&self, id: StateId) -> usize {
        self.entries[id].offset
    }

    pub fn entry_size(&self, id: StateId) -> usize {
        self.entries[id].size
    }

    pub fn name(&self, id: StateId) -> &str {
        &self.entries[id].name
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Total size of the parameter block, always a multiple of 8.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer to a registered entry given the pointer to the parameter
    /// block.
    pub fn state_ptr(&self, cg: &mut CodeGen, runtime_state: ir::Value, id: StateId) -> ir::Value {
        cg.ptr_add(runtime_state, self.offset(id) as i64)
    }

    pub fn load_catalog(cg: &mut CodeGen, runtime_state: ir::Value) -> ir::Value {
        cg.load(ir::types::I64, runtime_state, Self::CATALOG_OFFSET as i32)
    }

    pub fn load_consumer_state(cg: &mut CodeGen, runtime_state: ir::Value) -> ir::Value {
        cg.load(ir::types::I64, runtime_state, Self::CONSUMER_STATE_OFFSET as i32)
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
