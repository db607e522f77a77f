use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, Block, BlockArg, InstBuilder, MemFlags, StackSlotData, StackSlotKind};
use tracing::trace;

use super::code_context::{Builtin, CodeContext, FunctionDeclaration, LazyBlockKind};
use super::runtime_functions::RuntimeFunction;
use super::types::Registry;
use super::PrimitiveType;

/// Facade over the code context for emitting instructions into the active
/// function.
///
/// All emission goes to the end of the active function's current block.
/// Panics if no function is under construction.
#[derive(Debug)]
pub struct CodeGen<'a> {
    cc: &'a mut CodeContext,
    registry: &'a Registry,
}

impl<'a> AsMut<CodeGen<'a>> for CodeGen<'a> {
    fn as_mut(&mut self) -> &mut Self {
        self
    }
}

impl<'a> CodeGen<'a> {
    pub fn new(cc: &'a mut CodeContext, registry: &'a Registry) -> Self {
        CodeGen { cc, registry }
    }

    pub fn code_context(&mut self) -> &mut CodeContext {
        self.cc
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn cursor(&mut self) -> FuncCursor<'_> {
        self.cc.active_mut().cursor()
    }

    /// Depth of the active function on the function stack, 0 when no
    /// function is being built.
    pub fn function_depth(&self) -> usize {
        self.cc.active_depth()
    }

    pub fn current_function(&self) -> &FunctionDeclaration {
        &self.cc.active().decl
    }

    pub fn value_type(&self, v: ir::Value) -> ir::Type {
        self.cc.active().func.dfg.value_type(v)
    }

    /// Integer constant of the given type. The value is truncated to the
    /// type's width.
    pub fn const_int(&mut self, ty: ir::Type, v: i64) -> ir::Value {
        let bits = ty.bits();
        let imm = if bits < 64 { v & ((1i64 << bits) - 1) } else { v };
        self.cursor().ins().iconst(ty, imm)
    }

    pub fn const_bool(&mut self, v: bool) -> ir::Value {
        self.const_int(ir::types::I8, v as i64)
    }

    pub fn const8(&mut self, v: i8) -> ir::Value {
        self.const_int(ir::types::I8, v as i64)
    }

    pub fn const16(&mut self, v: i16) -> ir::Value {
        self.const_int(ir::types::I16, v as i64)
    }

    pub fn const32(&mut self, v: i32) -> ir::Value {
        self.const_int(ir::types::I32, v as i64)
    }

    pub fn const64(&mut self, v: i64) -> ir::Value {
        self.const_int(ir::types::I64, v)
    }

    pub fn const_double(&mut self, v: f64) -> ir::Value {
        self.cursor().ins().f64const(v)
    }

    pub fn const_ptr(&mut self, addr: usize) -> ir::Value {
        self.const_int(ir::types::I64, addr as i64)
    }

    pub fn null_ptr(&mut self) -> ir::Value {
        self.const_ptr(0)
    }

    /// Constant string kept alive by the code context. Returns the pointer
    /// and the i32 length.
    pub fn const_string(&mut self, s: &str) -> (ir::Value, ir::Value) {
        let (addr, len) = self.cc.intern_bytes(s.as_bytes());
        let ptr = self.const_ptr(addr);
        let len = self.const32(len as i32);
        (ptr, len)
    }

    /// Create a block that's attached to the function when first switched
    /// to.
    pub fn create_block(&mut self) -> Block {
        self.cc.active_mut().func.dfg.make_block()
    }

    pub fn create_block_with_params(&mut self, types: &[ir::Type]) -> Block {
        let state = self.cc.active_mut();
        let block = state.func.dfg.make_block();
        for ty in types {
            state.func.dfg.append_block_param(block, *ty);
        }
        block
    }

    pub fn block_params(&self, block: Block) -> Vec<ir::Value> {
        self.cc.active().func.dfg.block_params(block).to_vec()
    }

    pub fn current_block(&self) -> Block {
        self.cc.active().current
    }

    pub fn switch_to_block(&mut self, block: Block) {
        let state = self.cc.active_mut();
        if !state.func.layout.is_block_inserted(block) {
            state.func.layout.append_block(block);
        }
        state.current = block;
    }

    /// If the current block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        let state = self.cc.active();
        state.is_terminated(state.current)
    }

    pub fn jump(&mut self, block: Block, args: &[ir::Value]) {
        let args = to_block_args(args);
        self.cursor().ins().jump(block, &args);
    }

    pub fn branch_if(
        &mut self,
        cond: ir::Value,
        then_block: Block,
        then_args: &[ir::Value],
        else_block: Block,
        else_args: &[ir::Value],
    ) {
        let then_args = to_block_args(then_args);
        let else_args = to_block_args(else_args);
        self.cursor()
            .ins()
            .brif(cond, then_block, &then_args, else_block, &else_args);
    }

    /// Add two integers of the same type, returning the wrapped result and
    /// an overflow flag.
    pub fn call_add_with_overflow(&mut self, a: ir::Value, b: ir::Value) -> (ir::Value, ir::Value) {
        let mut pos = self.cursor();
        let r = pos.ins().iadd(a, b);
        let ar = pos.ins().bxor(a, r);
        let br = pos.ins().bxor(b, r);
        let both = pos.ins().band(ar, br);
        let overflow = pos.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
        (r, overflow)
    }

    pub fn call_sub_with_overflow(&mut self, a: ir::Value, b: ir::Value) -> (ir::Value, ir::Value) {
        let mut pos = self.cursor();
        let r = pos.ins().isub(a, b);
        let ab = pos.ins().bxor(a, b);
        let ar = pos.ins().bxor(a, r);
        let both = pos.ins().band(ab, ar);
        let overflow = pos.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
        (r, overflow)
    }

    pub fn call_mul_with_overflow(&mut self, a: ir::Value, b: ir::Value) -> (ir::Value, ir::Value) {
        let ty = self.value_type(a);
        let mut pos = self.cursor();
        if ty == ir::types::I64 {
            let lo = pos.ins().imul(a, b);
            let hi = pos.ins().smulhi(a, b);
            let sign = pos.ins().sshr_imm(lo, 63);
            let overflow = pos.ins().icmp(IntCC::NotEqual, hi, sign);
            (lo, overflow)
        } else {
            let wa = pos.ins().sextend(ir::types::I64, a);
            let wb = pos.ins().sextend(ir::types::I64, b);
            let wide = pos.ins().imul(wa, wb);
            let r = pos.ins().ireduce(ty, wide);
            let back = pos.ins().sextend(ir::types::I64, r);
            let overflow = pos.ins().icmp(IntCC::NotEqual, back, wide);
            (r, overflow)
        }
    }

    fn branch_to_lazy_block(&mut self, kind: LazyBlockKind, flag: ir::Value) {
        let error_block = self.cc.active_mut().lazy_block(kind);
        let cont = self.create_block();
        self.branch_if(flag, error_block, &[], cont, &[]);
        self.switch_to_block(cont);
    }

    /// Branch to the function's overflow block if `flag` is set.
    pub fn throw_if_overflow(&mut self, flag: ir::Value) {
        self.branch_to_lazy_block(LazyBlockKind::Overflow, flag);
    }

    /// Branch to the function's divide by zero block if `flag` is set.
    pub fn throw_if_divide_by_zero(&mut self, flag: ir::Value) {
        self.branch_to_lazy_block(LazyBlockKind::DivideByZero, flag);
    }

    /// Return early from the function if a callee left a pending error.
    pub fn check_pending_error(&mut self) {
        let flag = match self.call_runtime(RuntimeFunction::HasPendingError, &[]) {
            Some(flag) => flag,
            None => unreachable!("has pending error returns a value"),
        };
        self.branch_to_lazy_block(LazyBlockKind::PropagateError, flag);
    }

    /// Size in bytes of a primitive type.
    pub fn size_of(&self, ty: PrimitiveType) -> usize {
        ty.size_in_bytes()
    }

    /// Allocate `size` bytes in the active function's stack frame, returning
    /// a pointer to it.
    ///
    /// The address is computed at the start of the entry block so it
    /// dominates every use.
    pub fn allocate_bytes(&mut self, size: usize, name: &str) -> ir::Value {
        let state = self.cc.active_mut();
        let slot = state.func.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size.max(1) as u32,
            3,
        ));
        let entry = state.entry;
        let mut pos = FuncCursor::new(&mut state.func).at_first_insertion_point(entry);
        let addr = pos.ins().stack_addr(ir::types::I64, slot, 0);
        trace!(%name, %size, "allocated stack slot");
        addr
    }

    pub fn allocate_variable(&mut self, ty: PrimitiveType, name: &str) -> ir::Value {
        self.allocate_bytes(ty.size_in_bytes(), name)
    }

    /// Allocate an array of `count` elements, returning a pointer to the
    /// first element.
    pub fn allocate_buffer(&mut self, ty: PrimitiveType, count: usize, name: &str) -> ir::Value {
        self.allocate_bytes(ty.size_in_bytes() * count, name)
    }

    pub fn load(&mut self, ty: ir::Type, ptr: ir::Value, offset: i32) -> ir::Value {
        self.cursor().ins().load(ty, MemFlags::new(), ptr, offset)
    }

    pub fn store(&mut self, value: ir::Value, ptr: ir::Value, offset: i32) {
        self.cursor().ins().store(MemFlags::new(), value, ptr, offset);
    }

    pub fn ptr_add(&mut self, ptr: ir::Value, offset: i64) -> ir::Value {
        if offset == 0 {
            return ptr;
        }
        self.cursor().ins().iadd_imm(ptr, offset)
    }

    /// Compute `ptr + idx * scale` with an i64 index.
    pub fn ptr_index(&mut self, ptr: ir::Value, idx: ir::Value, scale: usize) -> ir::Value {
        let mut pos = self.cursor();
        let off = pos.ins().imul_imm(idx, scale as i64);
        pos.ins().iadd(ptr, off)
    }

    /// Argument `idx` of the active function.
    pub fn get_argument(&self, idx: usize) -> ir::Value {
        let state = self.cc.active();
        state.func.dfg.block_params(state.entry)[idx]
    }

    /// Call a generated function.
    pub fn call_func(&mut self, decl: &FunctionDeclaration, args: &[ir::Value]) -> Option<ir::Value> {
        let func_ref = self.cc.func_ref(decl.id);
        let mut pos = self.cursor();
        let inst = pos.ins().call(func_ref, args);
        pos.func.dfg.inst_results(inst).first().copied()
    }

    /// Call a generated function, returning early if it left a pending
    /// error.
    pub fn call_func_checked(&mut self, decl: &FunctionDeclaration, args: &[ir::Value]) -> Option<ir::Value> {
        let ret = self.call_func(decl, args);
        self.check_pending_error();
        ret
    }

    /// Address of a generated function.
    pub fn func_addr(&mut self, decl: &FunctionDeclaration) -> ir::Value {
        let func_ref = self.cc.func_ref(decl.id);
        self.cursor().ins().func_addr(ir::types::I64, func_ref)
    }

    pub fn call_builtin(&mut self, builtin: &Builtin, args: &[ir::Value]) -> Option<ir::Value> {
        let call_conv = self.cc.call_conv();
        self.cc.active_mut().call_indirect(call_conv, builtin, args)
    }

    pub fn call_runtime(&mut self, func: RuntimeFunction, args: &[ir::Value]) -> Option<ir::Value> {
        let builtin = self.cc.runtime_builtin(func);
        self.call_builtin(&builtin, args)
    }

    /// Call a runtime function, checking for a pending error afterwards if
    /// the function is fallible.
    pub fn call_runtime_checked(&mut self, func: RuntimeFunction, args: &[ir::Value]) -> Option<ir::Value> {
        let ret = self.call_runtime(func, args);
        if func.is_fallible() {
            self.check_pending_error();
        }
        ret
    }

    /// Call a runtime function that returns a value.
    pub fn call_runtime_value(&mut self, func: RuntimeFunction, args: &[ir::Value]) -> ir::Value {
        assert_ne!(PrimitiveType::Void, func.return_type(), "{} returns void", func.name());
        match self.call_runtime_checked(func, args) {
            Some(v) => v,
            None => unreachable!("non-void function returns a value"),
        }
    }
}

pub(crate) fn to_block_args(values: &[ir::Value]) -> Vec<BlockArg> {
    values.iter().map(|v| BlockArg::Value(*v)).collect()
}
