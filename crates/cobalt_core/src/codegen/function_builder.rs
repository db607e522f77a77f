use cobalt_error::Result;
use cranelift_codegen::ir;
use tracing::error;

use super::code_context::FunctionDeclaration;
use super::{CodeGen, PrimitiveType};

/// Builds the body of one generated function.
///
/// Creating a builder while another function is being built suspends the
/// enclosing function. Finishing the inner function resumes the enclosing
/// function where it left off.
#[derive(Debug)]
pub struct FunctionBuilder {
    decl: FunctionDeclaration,
    /// Position on the code context's function stack.
    depth: usize,
    finished: bool,
}

impl FunctionBuilder {
    /// Declare a new function and start building it.
    pub fn new(cg: &mut CodeGen, name: &str, params: &[PrimitiveType], ret: PrimitiveType) -> Result<Self> {
        let decl = cg.code_context().declare_function(name, params, ret)?;
        Ok(Self::begin(cg, decl))
    }

    /// Start building a previously declared function.
    pub fn begin(cg: &mut CodeGen, decl: FunctionDeclaration) -> Self {
        let depth = cg.code_context().begin_function(decl.clone());
        FunctionBuilder {
            decl,
            depth,
            finished: false,
        }
    }

    pub fn declaration(&self) -> &FunctionDeclaration {
        &self.decl
    }

    pub fn argument(&self, cg: &CodeGen, idx: usize) -> ir::Value {
        assert_eq!(
            self.depth,
            cg.function_depth(),
            "function '{}' is not the active function",
            self.decl.name()
        );
        cg.get_argument(idx)
    }

    /// Return `ret` from the current block and finish the function.
    pub fn return_and_finish(mut self, cg: &mut CodeGen, ret: Option<ir::Value>) -> FunctionDeclaration {
        assert_eq!(
            self.depth,
            cg.function_depth(),
            "function '{}' is not the innermost function",
            self.decl.name()
        );
        assert_eq!(
            ret.is_some(),
            self.decl.return_type() != PrimitiveType::Void,
            "return value doesn't match return type of '{}'",
            self.decl.name()
        );
        self.finished = true;
        cg.code_context().finish_function(ret)
    }
}

impl Drop for FunctionBuilder {
    fn drop(&mut self) {
        if !self.finished && !std::thread::panicking() {
            error!(name = %self.decl.name(), "function dropped without being finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use cranelift_codegen::ir::InstBuilder;

    use super::*;
    use crate::codegen::types::Registry;
    use crate::codegen::{CodeContext, CodegenOptions};

    #[test]
    fn nested_function_restores_insertion_point() {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);

        let outer = FunctionBuilder::new(&mut cg, "outer", &[PrimitiveType::Int32], PrimitiveType::Int32).unwrap();
        let arg = outer.argument(&cg, 0);
        let block_before = cg.current_block();

        let inner = FunctionBuilder::new(&mut cg, "inner", &[], PrimitiveType::Int32).unwrap();
        assert_eq!("_0_inner", cg.current_function().name());
        let two = cg.const32(2);
        let inner = inner.return_and_finish(&mut cg, Some(two));

        assert_eq!("_0_outer", cg.current_function().name());
        assert_eq!(block_before, cg.current_block());

        let marker = cg.const32(3);
        {
            let func = &cg.code_context().active().func;
            let inst = func.dfg.value_def(marker).unwrap_inst();
            assert_eq!(Some(block_before), func.layout.inst_block(inst));
        }

        let called = cg.call_func(&inner, &[]).unwrap();
        let sum = cg.cursor().ins().iadd(called, marker);
        let sum = cg.cursor().ins().iadd(sum, arg);
        let outer = outer.return_and_finish(&mut cg, Some(sum));
        assert_eq!(0, cg.function_depth());

        cc.compile().unwrap();
        let ptr = cc.get_function_pointer(&outer).unwrap();
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(15, f(10));
    }

    #[test]
    #[should_panic]
    fn finish_outer_before_inner_panics() {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);

        let outer = FunctionBuilder::new(&mut cg, "outer", &[], PrimitiveType::Void).unwrap();
        let _inner = FunctionBuilder::new(&mut cg, "inner", &[], PrimitiveType::Void).unwrap();
        outer.return_and_finish(&mut cg, None);
    }
}
