use cranelift_codegen::ir::{self, InstBuilder};

use crate::codegen::{CodeGen, PrimitiveType};

/// Stack allocated array of u32 indices, used as a selection vector.
#[derive(Debug, Clone, Copy)]
pub struct Vector {
    ptr: ir::Value,
    capacity: u32,
}

impl Vector {
    pub fn new(cg: &mut CodeGen, capacity: u32, name: &str) -> Self {
        let ptr = cg.allocate_buffer(PrimitiveType::Int32, capacity as usize, name);
        Vector { ptr, capacity }
    }

    pub fn ptr(&self) -> ir::Value {
        self.ptr
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Load the index at position `idx` (i64), zero extended to i64.
    pub fn get_value(&self, cg: &mut CodeGen, idx: ir::Value) -> ir::Value {
        let addr = cg.ptr_index(self.ptr, idx, 4);
        let v = cg.load(ir::types::I32, addr, 0);
        cg.cursor().ins().uextend(ir::types::I64, v)
    }

    /// Store an i64 index at position `idx`.
    pub fn set_value(&self, cg: &mut CodeGen, idx: ir::Value, value: ir::Value) {
        let addr = cg.ptr_index(self.ptr, idx, 4);
        let v = cg.cursor().ins().ireduce(ir::types::I32, value);
        cg.store(v, addr, 0);
    }
}
