use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};

use super::Loop;
use crate::codegen::CodeGen;

/// Half open `[start, end)` range of i64 indices.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: ir::Value,
    pub end: ir::Value,
}

/// Iterates `[0, num_elements)` in chunks of at most `vector_size`.
#[must_use]
#[derive(Debug)]
pub struct VectorizedLoop {
    inner: Loop,
    num_elements: ir::Value,
    vector_size: u32,
}

impl VectorizedLoop {
    pub fn new(cg: &mut CodeGen, num_elements: ir::Value, vector_size: u32, vars: &[ir::Value]) -> Self {
        assert!(vector_size > 0);
        let start = cg.const64(0);
        let cond = cg.cursor().ins().icmp_imm(IntCC::SignedGreaterThan, num_elements, 0);

        let mut all_vars = Vec::with_capacity(vars.len() + 1);
        all_vars.push(start);
        all_vars.extend_from_slice(vars);

        VectorizedLoop {
            inner: Loop::new(cg, cond, &all_vars),
            num_elements,
            vector_size,
        }
    }

    pub fn vector_size(&self) -> u32 {
        self.vector_size
    }

    /// Range of elements in the current chunk.
    pub fn current_range(&self, cg: &mut CodeGen) -> Range {
        let start = self.inner.loop_var(cg, 0);
        let mut pos = cg.cursor();
        let next = pos.ins().iadd_imm(start, self.vector_size as i64);
        let end = pos.ins().smin(next, self.num_elements);
        Range { start, end }
    }

    pub fn loop_vars(&self, cg: &CodeGen) -> Vec<ir::Value> {
        self.inner.loop_vars(cg)[1..].to_vec()
    }

    pub fn loop_end(&mut self, cg: &mut CodeGen, next: &[ir::Value]) {
        let start = self.inner.loop_var(cg, 0);
        let next_start = cg.cursor().ins().iadd_imm(start, self.vector_size as i64);
        let cond = cg
            .cursor()
            .ins()
            .icmp(IntCC::SignedLessThan, next_start, self.num_elements);

        let mut all_next = Vec::with_capacity(next.len() + 1);
        all_next.push(next_start);
        all_next.extend_from_slice(next);
        self.inner.loop_end(cg, cond, &all_next);
    }

    pub fn collect_final_loop_vars(&self, cg: &CodeGen) -> Vec<ir::Value> {
        self.inner.collect_final_loop_vars(cg)[1..].to_vec()
    }
}
