//! The compiler driver: one function per pipeline cut.
//!
//! Source text flows through the lexer, the Earley parser, AST construction
//! with type deduction, AST constant folding, IR lowering, the optimization
//! pipeline (memory promotion, SSA, value numbering, inlining), SSA exit,
//! and finally register allocation and MIPS emission.

use crate::backend::mips::MipsCodeGenerator;
use crate::common::error::Result;
use crate::frontend::ast;
use crate::frontend::parser::{self, ContextFreeGrammar};
use crate::ir::cfg::Program;
use crate::ir::lowering::Lowerer;
use crate::passes;

/// Everything up to and including the middle end. The returned program is in
/// SSA form wherever memory allowed the conversion.
pub fn compile_to_cfg(source: &str, optimize: bool) -> Result<Program> {
    let grammar = ContextFreeGrammar::default_grammar();
    let tree = parser::parse(&grammar, source)?;
    let mut program = ast::build_ast(&tree)?;
    ast::fold::fold_constants(&mut program);
    let mut program = Lowerer::new().lower(&program);
    if optimize {
        passes::optimize(&mut program);
    }
    Ok(program)
}

/// Full compilation to assembly text.
pub fn compile(source: &str, optimize: bool) -> Result<String> {
    let mut program = compile_to_cfg(source, optimize)?;
    for function in program.functions.values_mut() {
        function.convert_from_ssa();
    }
    Ok(MipsCodeGenerator::generate(&program).render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_minimal_program() {
        let text = compile("int wain(int a, int b) { return a + b; }", true).unwrap();
        assert!(text.contains("jr $31"));
    }

    #[test]
    fn test_frontend_errors_propagate() {
        assert!(compile("int wain(int a, int b) { return c; }", true).is_err());
        assert!(compile("int wain(int a, int b) { return a + ; }", true).is_err());
        assert!(compile("int wain(int a, int b) { return a @ b; }", true).is_err());
    }
}
