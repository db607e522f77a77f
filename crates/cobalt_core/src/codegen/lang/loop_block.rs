use cranelift_codegen::ir::{self, Block};

use crate::codegen::CodeGen;

/// Loop with loop carried variables.
///
/// Variables are passed as block parameters of the loop header. The loop is
/// only entered if the initial condition holds.
#[must_use]
#[derive(Debug)]
pub struct Loop {
    header: Block,
    exit: Block,
    ended: bool,
}

impl Loop {
    pub fn new(cg: &mut CodeGen, cond: ir::Value, vars: &[ir::Value]) -> Self {
        let types: Vec<_> = vars.iter().map(|v| cg.value_type(*v)).collect();
        let header = cg.create_block_with_params(&types);
        let exit = cg.create_block_with_params(&types);
        cg.branch_if(cond, header, vars, exit, vars);
        cg.switch_to_block(header);

        Loop {
            header,
            exit,
            ended: false,
        }
    }

    /// Current values of the loop variables. Valid anywhere in the body.
    pub fn loop_vars(&self, cg: &CodeGen) -> Vec<ir::Value> {
        cg.block_params(self.header)
    }

    pub fn loop_var(&self, cg: &CodeGen, idx: usize) -> ir::Value {
        cg.block_params(self.header)[idx]
    }

    /// Continue with the next iteration if `cond` holds, otherwise leave the
    /// loop.
    pub fn loop_end(&mut self, cg: &mut CodeGen, cond: ir::Value, next: &[ir::Value]) {
        assert!(!self.ended, "loop already ended");
        cg.branch_if(cond, self.header, next, self.exit, next);
        cg.switch_to_block(self.exit);
        self.ended = true;
    }

    /// Values of the loop variables after the loop.
    pub fn collect_final_loop_vars(&self, cg: &CodeGen) -> Vec<ir::Value> {
        assert!(self.ended, "loop not yet ended");
        cg.block_params(self.exit)
    }
}

#[cfg(test)]
mod tests {
    use cranelift_codegen::ir::condcodes::IntCC;
    use cranelift_codegen::ir::InstBuilder;

    use super::*;
    use crate::codegen::types::Registry;
    use crate::codegen::{CodeContext, CodegenOptions, FunctionBuilder, PrimitiveType};

    #[test]
    fn sum_to_n() {
        let registry = Registry::new();
        let mut cc = CodeContext::try_new(0, CodegenOptions::default()).unwrap();
        let mut cg = CodeGen::new(&mut cc, &registry);

        let func = FunctionBuilder::new(&mut cg, "sum", &[PrimitiveType::Int64], PrimitiveType::Int64).unwrap();
        let n = func.argument(&cg, 0);
        let zero = cg.const64(0);
        let cond = cg.cursor().ins().icmp(IntCC::SignedLessThan, zero, n);

        let mut lp = Loop::new(&mut cg, cond, &[zero, zero]);
        let vars = lp.loop_vars(&cg);
        let (i, acc) = (vars[0], vars[1]);
        let acc = cg.cursor().ins().iadd(acc, i);
        let i = cg.cursor().ins().iadd_imm(i, 1);
        let cond = cg.cursor().ins().icmp(IntCC::SignedLessThan, i, n);
        lp.loop_end(&mut cg, cond, &[i, acc]);
        let result = lp.collect_final_loop_vars(&cg)[1];

        let decl = func.return_and_finish(&mut cg, Some(result));
        cc.compile().unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(cc.get_function_pointer(&decl).unwrap()) };
        assert_eq!(45, f(10));
        assert_eq!(0, f(0));
        assert_eq!(0, f(-3));
    }
}
