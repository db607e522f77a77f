use std::fmt;

use cobalt_error::{DbError, Result, ResultExt};
use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{self, AbiParam, Block, FuncRef, InstBuilder, SigRef, UserFuncName};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{Context, verify_function};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, default_libcall_names};
use hashbrown::HashMap;
use tracing::{debug, error, trace};

use super::runtime_functions::RuntimeFunction;
use super::PrimitiveType;

/// Options controlling how a code context compiles its functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Run cranelift's optimizer.
    pub optimize: bool,
    /// Verify every function before defining it in the module.
    pub verify: bool,
    /// Log the IR for every finished function.
    pub dump_ir: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            optimize: true,
            verify: true,
            dump_ir: false,
        }
    }
}

/// A native function living in the host process that generated code can
/// call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Builtin {
    pub name: String,
    pub params: Vec<PrimitiveType>,
    pub ret: PrimitiveType,
    /// Address of the function in the host process.
    pub addr: usize,
}

/// A function declared in a code context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDeclaration {
    pub(crate) id: FuncId,
    pub(crate) name: String,
    pub(crate) params: Vec<PrimitiveType>,
    pub(crate) ret: PrimitiveType,
}

impl FunctionDeclaration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[PrimitiveType] {
        &self.params
    }

    pub fn return_type(&self) -> PrimitiveType {
        self.ret
    }
}

/// Blocks that are created on first use within a function, and attached to
/// the end of the function once it's finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LazyBlockKind {
    Overflow,
    DivideByZero,
    /// Return early because some callee left a pending error.
    PropagateError,
}

/// State for a function currently under construction.
pub(crate) struct FunctionState {
    pub(crate) decl: FunctionDeclaration,
    pub(crate) func: ir::Function,
    pub(crate) entry: Block,
    /// Block we're currently emitting into.
    pub(crate) current: Block,
    pub(crate) lazy_blocks: Vec<(LazyBlockKind, Block)>,
    func_refs: HashMap<FuncId, FuncRef>,
    sig_refs: HashMap<String, SigRef>,
}

impl FunctionState {
    pub(crate) fn cursor(&mut self) -> FuncCursor<'_> {
        let block = self.current;
        FuncCursor::new(&mut self.func).at_bottom(block)
    }

    pub(crate) fn lazy_block(&mut self, kind: LazyBlockKind) -> Block {
        if let Some((_, block)) = self.lazy_blocks.iter().find(|(k, _)| *k == kind) {
            return *block;
        }
        let block = self.func.dfg.make_block();
        self.lazy_blocks.push((kind, block));
        block
    }

    /// Returns if the block ends with a terminator instruction.
    pub(crate) fn is_terminated(&self, block: Block) -> bool {
        match self.func.layout.last_inst(block) {
            Some(inst) => self.func.dfg.insts[inst].opcode().is_terminator(),
            None => false,
        }
    }

    /// Emit a call to a host function through its address.
    pub(crate) fn call_indirect(
        &mut self,
        call_conv: CallConv,
        builtin: &Builtin,
        args: &[ir::Value],
    ) -> Option<ir::Value> {
        let sig_ref = match self.sig_refs.get(&builtin.name) {
            Some(sig_ref) => *sig_ref,
            None => {
                let sig = make_signature(call_conv, &builtin.params, builtin.ret);
                let sig_ref = self.func.import_signature(sig);
                self.sig_refs.insert(builtin.name.clone(), sig_ref);
                sig_ref
            }
        };

        let mut pos = self.cursor();
        let callee = pos.ins().iconst(ir::types::I64, builtin.addr as i64);
        let inst = pos.ins().call_indirect(sig_ref, callee, args);
        pos.func.dfg.inst_results(inst).first().copied()
    }

    /// Emit a return of zero values matching the function's return type.
    fn return_default(&mut self) {
        let ret = self.decl.ret;
        let mut pos = self.cursor();
        match ret.ir_type() {
            None => {
                pos.ins().return_(&[]);
            }
            Some(ir::types::F64) => {
                let v = pos.ins().f64const(0.0);
                pos.ins().return_(&[v]);
            }
            Some(ty) => {
                let v = pos.ins().iconst(ty, 0);
                pos.ins().return_(&[v]);
            }
        }
    }
}

impl fmt::Debug for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionState")
            .field("decl", &self.decl)
            .field("entry", &self.entry)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// Owns the JIT module and everything generated into it.
///
/// A code context is used by a single compiling thread. Functions may be
/// built nested: starting a function while another is under construction
/// pushes onto a stack, and finishing it restores the enclosing function.
pub struct CodeContext {
    id: u64,
    /// Only `None` after drop released the module's memory.
    module: Option<JITModule>,
    call_conv: CallConv,
    options: CodegenOptions,
    builtins: HashMap<String, Builtin>,
    function_names: HashMap<String, usize>,
    /// Functions under construction, innermost last.
    pub(crate) functions: Vec<FunctionState>,
    /// Finished function bodies waiting to be defined in the module.
    finished: Vec<(FunctionDeclaration, ir::Function)>,
    /// Constant byte strings referenced by address from generated code.
    constants: Vec<Box<[u8]>>,
    compiled: bool,
}

impl CodeContext {
    pub fn try_new(id: u64, options: CodegenOptions) -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .context("Failed to set codegen flag")?;
        flag_builder
            .set("is_pic", "false")
            .context("Failed to set codegen flag")?;
        let opt_level = if options.optimize { "speed" } else { "none" };
        flag_builder
            .set("opt_level", opt_level)
            .context("Failed to set codegen flag")?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| DbError::new("Host machine is not supported by codegen").with_field("reason", msg))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .context("Failed to build target isa")?;

        if isa.pointer_type() != ir::types::I64 {
            return Err(DbError::new("Code generation requires a 64-bit target")
                .with_field("pointer_type", isa.pointer_type()));
        }

        let call_conv = isa.default_call_conv();
        let builder = JITBuilder::with_isa(isa, default_libcall_names());
        let module = JITModule::new(builder);

        debug!(%id, ?options, "created code context");

        Ok(CodeContext {
            id,
            module: Some(module),
            call_conv,
            options,
            builtins: HashMap::new(),
            function_names: HashMap::new(),
            functions: Vec::new(),
            finished: Vec::new(),
            constants: Vec::new(),
            compiled: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Number of functions that have been finished in this context.
    pub fn num_finished_functions(&self) -> usize {
        self.finished.len()
    }

    fn module(&self) -> &JITModule {
        match &self.module {
            Some(module) => module,
            None => unreachable!("module only taken on drop"),
        }
    }

    fn module_mut(&mut self) -> &mut JITModule {
        match &mut self.module {
            Some(module) => module,
            None => unreachable!("module only taken on drop"),
        }
    }

    /// Register a host function under a symbolic name.
    ///
    /// Registering an already registered name returns the existing
    /// registration.
    pub fn register_builtin(
        &mut self,
        name: &str,
        params: &[PrimitiveType],
        ret: PrimitiveType,
        addr: usize,
    ) -> &Builtin {
        self.builtins
            .entry(name.to_string())
            .or_insert_with(|| {
                trace!(%name, %addr, "registering builtin");
                Builtin {
                    name: name.to_string(),
                    params: params.to_vec(),
                    ret,
                    addr,
                }
            })
    }

    pub fn lookup_builtin(&self, name: &str) -> Option<&Builtin> {
        self.builtins.get(name)
    }

    /// Get the builtin for a runtime function, registering it on first use.
    pub(crate) fn runtime_builtin(&mut self, func: RuntimeFunction) -> Builtin {
        if let Some(builtin) = self.lookup_builtin(func.name()) {
            return builtin.clone();
        }
        self.register_builtin(func.name(), func.params(), func.return_type(), func.address())
            .clone()
    }

    /// Keep a copy of `bytes` alive for the lifetime of this context,
    /// returning a stable pointer to it.
    pub(crate) fn intern_bytes(&mut self, bytes: &[u8]) -> (usize, usize) {
        let boxed: Box<[u8]> = bytes.into();
        let addr = boxed.as_ptr() as usize;
        let len = boxed.len();
        self.constants.push(boxed);
        (addr, len)
    }

    /// Declare a function in the module without building its body.
    pub fn declare_function(
        &mut self,
        name: &str,
        params: &[PrimitiveType],
        ret: PrimitiveType,
    ) -> Result<FunctionDeclaration> {
        assert!(!self.compiled, "cannot declare functions after compilation");
        assert!(
            params.iter().all(|p| *p != PrimitiveType::Void),
            "void is not a valid parameter type"
        );

        let base = format!("_{}_{}", self.id, name);
        let count = self.function_names.entry(base.clone()).or_insert(0);
        let full_name = if *count == 0 {
            base
        } else {
            format!("{base}_{count}")
        };
        *count += 1;

        let sig = make_signature(self.call_conv, params, ret);
        let id = self
            .module_mut()
            .declare_function(&full_name, Linkage::Local, &sig)
            .context("Failed to declare function")?;

        Ok(FunctionDeclaration {
            id,
            name: full_name,
            params: params.to_vec(),
            ret,
        })
    }

    /// Start building the body of a declared function, making it the active
    /// function. Returns the depth of the new function on the function stack.
    pub(crate) fn begin_function(&mut self, decl: FunctionDeclaration) -> usize {
        let sig = make_signature(self.call_conv, &decl.params, decl.ret);
        let mut func = ir::Function::with_name_signature(UserFuncName::user(0, decl.id.as_u32()), sig);

        let entry = func.dfg.make_block();
        for param in &decl.params {
            // Params are never void, asserted on declare.
            if let Some(ty) = param.ir_type() {
                func.dfg.append_block_param(entry, ty);
            }
        }
        func.layout.append_block(entry);

        trace!(name = %decl.name, depth = self.functions.len(), "beginning function");

        self.functions.push(FunctionState {
            decl,
            func,
            entry,
            current: entry,
            lazy_blocks: Vec::new(),
            func_refs: HashMap::new(),
            sig_refs: HashMap::new(),
        });

        self.functions.len()
    }

    pub(crate) fn active(&self) -> &FunctionState {
        match self.functions.last() {
            Some(state) => state,
            None => panic!("No function under construction"),
        }
    }

    pub(crate) fn active_mut(&mut self) -> &mut FunctionState {
        match self.functions.last_mut() {
            Some(state) => state,
            None => panic!("No function under construction"),
        }
    }

    pub(crate) fn active_depth(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    /// Get a reference to a declared function usable from the active
    /// function.
    pub(crate) fn func_ref(&mut self, id: FuncId) -> FuncRef {
        let module = match &mut self.module {
            Some(module) => module,
            None => unreachable!("module only taken on drop"),
        };
        let state = match self.functions.last_mut() {
            Some(state) => state,
            None => panic!("No function under construction"),
        };
        if let Some(func_ref) = state.func_refs.get(&id) {
            return *func_ref;
        }
        let func_ref = module.declare_func_in_func(id, &mut state.func);
        state.func_refs.insert(id, func_ref);
        func_ref
    }

    /// Finish the active function, returning `ret` from the current block.
    pub(crate) fn finish_function(&mut self, ret: Option<ir::Value>) -> FunctionDeclaration {
        let call_conv = self.call_conv;

        let kinds: Vec<_> = self.active().lazy_blocks.iter().map(|(kind, _)| *kind).collect();
        let mut lazy_calls = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match kind {
                LazyBlockKind::Overflow => {
                    lazy_calls.push(Some(self.runtime_builtin(RuntimeFunction::ThrowOverflow)))
                }
                LazyBlockKind::DivideByZero => {
                    lazy_calls.push(Some(self.runtime_builtin(RuntimeFunction::ThrowDivideByZero)))
                }
                LazyBlockKind::PropagateError => lazy_calls.push(None),
            }
        }

        let mut state = match self.functions.pop() {
            Some(state) => state,
            None => panic!("No function under construction"),
        };

        let current = state.current;
        if !state.is_terminated(current) {
            let mut pos = state.cursor();
            match ret {
                Some(v) => pos.ins().return_(&[v]),
                None => pos.ins().return_(&[]),
            };
        }

        let lazy_blocks = std::mem::take(&mut state.lazy_blocks);
        for ((_, block), raiser) in lazy_blocks.into_iter().zip(lazy_calls) {
            state.func.layout.append_block(block);
            state.current = block;
            if let Some(raiser) = raiser {
                state.call_indirect(call_conv, &raiser, &[]);
            }
            state.return_default();
        }

        if self.options.dump_ir {
            debug!(name = %state.decl.name, ir = %state.func.display(), "finished function");
        } else {
            trace!(name = %state.decl.name, "finished function");
        }

        let decl = state.decl.clone();
        self.finished.push((state.decl, state.func));
        decl
    }

    /// Verify, optimize and JIT all finished functions.
    pub fn compile(&mut self) -> Result<()> {
        if self.compiled {
            return Ok(());
        }
        if !self.functions.is_empty() {
            return Err(DbError::new("Cannot compile with functions still under construction")
                .with_field("unfinished", self.functions.len()));
        }

        let finished = std::mem::take(&mut self.finished);
        let verify = self.options.verify;
        let module = self.module_mut();

        for (decl, func) in &finished {
            if verify {
                if let Err(e) = verify_function(func, module.isa()) {
                    error!(name = %decl.name, ir = %func.display(), %e, "function failed verification");
                    return Err(DbError::with_source("Generated function failed verification", Box::new(e))
                        .with_field("function", &decl.name));
                }
            }

            let mut ctx = Context::for_function(func.clone());
            module
                .define_function(decl.id, &mut ctx)
                .context_fn(|| format!("Failed to define function '{}'", decl.name))?;
        }

        module
            .finalize_definitions()
            .context("Failed to finalize function definitions")?;

        debug!(id = %self.id, functions = finished.len(), "compiled code context");

        self.finished = finished;
        self.compiled = true;

        Ok(())
    }

    /// Get a pointer to the compiled code for a function.
    pub fn get_function_pointer(&self, decl: &FunctionDeclaration) -> Result<*const u8> {
        if !self.compiled {
            return Err(DbError::new("Code context not yet compiled")
                .with_field("function", &decl.name));
        }
        Ok(self.module().get_finalized_function(decl.id))
    }

    /// Textual IR for every finished function.
    pub fn dump_ir(&self) -> String {
        let mut out = String::new();
        for (decl, func) in &self.finished {
            out.push_str(&format!("; {}\n{}\n", decl.name, func.display()));
        }
        out
    }
}

impl fmt::Debug for CodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeContext")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("num_builtins", &self.builtins.len())
            .field("functions", &self.functions)
            .field("num_finished", &self.finished.len())
            .field("compiled", &self.compiled)
            .finish_non_exhaustive()
    }
}

impl Drop for CodeContext {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: Compiled function pointers are only handed out through
            // the query statement owning this context, which doesn't outlive
            // it.
            unsafe { module.free_memory() };
        }
    }
}

fn make_signature(call_conv: CallConv, params: &[PrimitiveType], ret: PrimitiveType) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    for param in params {
        if let Some(ty) = param.ir_type() {
            sig.params.push(AbiParam::new(ty));
        }
    }
    if let Some(ty) = ret.ir_type() {
        sig.returns.push(AbiParam::new(ty));
    }
    sig
}
