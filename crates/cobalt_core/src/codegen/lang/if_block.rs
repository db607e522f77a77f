use cobalt_error::{DbError, Result};
use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{self, Block, InstBuilder};

use crate::codegen::codegen::to_block_args;
use crate::codegen::CodeGen;

/// Conditional block.
///
/// ```text
/// let mut cond = If::new(cg, flag);
/// // then
/// cond.else_block(cg);
/// // else
/// cond.end_if(cg);
/// let v = cond.build_phi(cg, then_value, else_value)?;
/// ```
#[must_use]
#[derive(Debug)]
pub struct If {
    cond: ir::Value,
    /// Block holding the conditional branch.
    branch_block: Block,
    then_block: Block,
    else_block: Option<Block>,
    merge_block: Block,
    /// Last block of each arm if it falls through to the merge block.
    then_end: Option<Block>,
    else_end: Option<Block>,
    then_phi_values: Vec<ir::Value>,
    else_phi_values: Vec<ir::Value>,
    ended: bool,
}

impl If {
    pub fn new(cg: &mut CodeGen, cond: ir::Value) -> Self {
        let branch_block = cg.current_block();
        let then_block = cg.create_block();
        let merge_block = cg.create_block();
        cg.branch_if(cond, then_block, &[], merge_block, &[]);
        cg.switch_to_block(then_block);

        If {
            cond,
            branch_block,
            then_block,
            else_block: None,
            merge_block,
            then_end: None,
            else_end: None,
            then_phi_values: Vec::new(),
            else_phi_values: Vec::new(),
            ended: false,
        }
    }

    /// Jump to the merge block from the current block unless it's already
    /// terminated. Returns the block if it falls through.
    fn close_arm(&self, cg: &mut CodeGen) -> Option<Block> {
        if cg.is_terminated() {
            return None;
        }
        let block = cg.current_block();
        cg.jump(self.merge_block, &[]);
        Some(block)
    }

    /// Finish the then arm and start the else arm.
    pub fn else_block(&mut self, cg: &mut CodeGen) {
        assert!(!self.ended, "else block after end if");
        assert!(self.else_block.is_none(), "else block opened twice");

        self.then_end = self.close_arm(cg);
        let else_block = cg.create_block();
        self.else_block = Some(else_block);

        let (cond, then_block) = (self.cond, self.then_block);
        replace_terminator(cg, self.branch_block, |pos| {
            pos.ins().brif(cond, then_block, &[], else_block, &[]);
        });

        cg.switch_to_block(else_block);
    }

    /// Close the open arm and continue in the merge block.
    pub fn end_if(&mut self, cg: &mut CodeGen) {
        assert!(!self.ended, "end if called twice");
        match self.else_block {
            Some(_) => self.else_end = self.close_arm(cg),
            None => self.then_end = self.close_arm(cg),
        }
        cg.switch_to_block(self.merge_block);
        self.ended = true;
    }

    /// Merge a value from the then arm with a value from the else arm (or
    /// from before the conditional if there's no else arm).
    ///
    /// Errors if an arm returned early instead of reaching the merge block.
    pub fn build_phi(&mut self, cg: &mut CodeGen, then_value: ir::Value, else_value: ir::Value) -> Result<ir::Value> {
        assert!(self.ended, "build phi before end if");
        let ty = cg.value_type(then_value);
        assert_eq!(ty, cg.value_type(else_value), "phi values must have the same type");

        let then_end = self
            .then_end
            .ok_or_else(|| DbError::new("Cannot merge a value from a branch arm that doesn't fall through"))?;
        let else_end = match self.else_block {
            Some(_) => Some(
                self.else_end
                    .ok_or_else(|| DbError::new("Cannot merge a value from a branch arm that doesn't fall through"))?,
            ),
            None => None,
        };
        self.then_phi_values.push(then_value);
        self.else_phi_values.push(else_value);

        let param = cg
            .code_context()
            .active_mut()
            .func
            .dfg
            .append_block_param(self.merge_block, ty);

        let merge = self.merge_block;
        let then_args = to_block_args(&self.then_phi_values);
        replace_terminator(cg, then_end, |pos| {
            pos.ins().jump(merge, &then_args);
        });

        let else_args = to_block_args(&self.else_phi_values);
        match else_end {
            Some(else_end) => {
                replace_terminator(cg, else_end, |pos| {
                    pos.ins().jump(merge, &else_args);
                });
            }
            None => {
                let (cond, then_block) = (self.cond, self.then_block);
                replace_terminator(cg, self.branch_block, |pos| {
                    pos.ins().brif(cond, then_block, &[], merge, &else_args);
                });
            }
        }

        Ok(param)
    }
}

/// Remove the terminator of `block` and emit a new one.
fn replace_terminator(cg: &mut CodeGen, block: Block, emit: impl FnOnce(&mut FuncCursor)) {
    let func = &mut cg.code_context().active_mut().func;
    let inst = match func.layout.last_inst(block) {
        Some(inst) => inst,
        None => panic!("block {block} has no terminator"),
    };
    assert!(func.dfg.insts[inst].opcode().is_terminator());
    func.layout.remove_inst(inst);
    let mut pos = FuncCursor::new(func).at_bottom(block);
    emit(&mut pos);
}
