//! The optimization pipeline.
//!
//! Every pass maps a program (or one function) to a removed-instruction
//! count; the driver repeats the whole sequence until an iteration removes
//! nothing. Inlining sits outside the core loop: it walks the call graph and
//! re-runs the driver after splicing bodies in.

pub mod alias;
pub mod data_flow;
pub mod dce;
pub mod gvn;
pub mod inline;
pub mod liveness;
pub mod lvn;
pub mod mem2reg;

use log::debug;

use crate::ir::cfg::{ControlFlowGraph, Program};

fn apply_to_functions(
    program: &mut Program,
    pass: fn(&mut ControlFlowGraph) -> usize,
) -> usize {
    program.functions.values_mut().map(pass).sum()
}

/// One round of the core passes, repeated to a joint fixpoint on the
/// removed-instruction count.
pub fn run_optimization_passes(program: &mut Program) -> usize {
    debug!("starting optimization passes with {} instructions", program.num_instructions());
    let mut removed = 0;
    loop {
        let before = removed;
        removed += dce::remove_unused_functions(program);
        removed += apply_to_functions(program, mem2reg::promote_memory_to_registers);
        removed += apply_to_functions(program, dce::remove_global_unused_assignments);
        removed += apply_to_functions(program, dce::remove_local_unused_assignments);
        removed += apply_to_functions(program, lvn::local_value_numbering);
        removed += apply_to_functions(program, gvn::global_value_numbering);
        removed += apply_to_functions(program, dce::remove_trivial_phis);
        removed += dce::remove_unused_parameters(program);
        removed += apply_to_functions(program, dce::combine_extended_blocks);
        removed += apply_to_functions(program, dce::remove_unused_blocks);
        if removed == before {
            break;
        }
        debug!("removed {} instructions this round", removed - before);
    }
    debug!("finished optimization passes with {} instructions", program.num_instructions());
    removed
}

/// The whole middle end: promote memory, enter SSA, optimize to fixpoint,
/// inline across the call graph.
pub fn optimize(program: &mut Program) -> usize {
    let mut removed = 0;

    // Promote what mem2reg can and sweep the dead address-ofs it leaves, so
    // as many functions as possible shed their memory instructions before the
    // SSA gate.
    loop {
        let promoted = apply_to_functions(program, mem2reg::promote_memory_to_registers);
        removed += promoted + apply_to_functions(program, dce::remove_global_unused_assignments);
        if promoted == 0 {
            break;
        }
    }

    for function in program.functions.values_mut() {
        function.convert_to_ssa();
    }

    removed += run_optimization_passes(program);
    removed += inline::optimize_call_graph(program);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::build_ast;
    use crate::frontend::parser::{parse, ContextFreeGrammar};
    use crate::ir::interp::run_with_ints;
    use crate::ir::lowering::Lowerer;

    fn lower(source: &str) -> Program {
        let grammar = ContextFreeGrammar::default_grammar();
        let program = build_ast(&parse(&grammar, source).unwrap()).unwrap();
        Lowerer::new().lower(&program)
    }

    #[test]
    fn test_optimizer_preserves_semantics() {
        let source = "
            int square(int n) { return n * n; }
            int wain(int a, int b) {
                int total = 0;
                int i = 0;
                while (i < a) {
                    total = total + square(i) + 0;
                    i = i + 1;
                }
                return total * 1;
            }
        ";
        let mut program = lower(source);
        let (unoptimized, _) = run_with_ints(&program, 5, 0).unwrap();
        optimize(&mut program);
        let (optimized, _) = run_with_ints(&program, 5, 0).unwrap();
        assert_eq!(unoptimized.return_value, optimized.return_value);
        assert!(
            optimized.num_dynamic_instructions < unoptimized.num_dynamic_instructions,
            "optimization should shorten the dynamic trace ({} -> {})",
            unoptimized.num_dynamic_instructions,
            optimized.num_dynamic_instructions
        );
    }

    #[test]
    fn test_optimizer_is_idempotent() {
        let source = "
            int wain(int a, int b) {
                int x = 0;
                if (a < b) { x = a; } else { x = b; }
                return x + a;
            }
        ";
        let mut program = lower(source);
        optimize(&mut program);
        let first = format!("{program}");
        let removed = optimize(&mut program);
        let second = format!("{program}");
        assert_eq!(removed, 0, "a second run should find nothing to do");
        assert_eq!(first, second);
    }

    #[test]
    fn test_dead_function_and_parameter_elimination() {
        let source = "
            int unusedHelper(int n) { return n; }
            int addFirst(int x, int ignored) { return x; }
            int wain(int a, int b) { return addFirst(a, b); }
        ";
        let mut program = lower(source);
        optimize(&mut program);
        assert!(!program.functions.contains_key("unusedHelper"));
        // addFirst is tiny, so inlining may remove it entirely; if it
        // survives, its dead parameter must be gone.
        if let Some(add_first) = program.functions.get("addFirst") {
            assert_eq!(add_first.parameters.len(), 1);
        }
        let (result, _) = run_with_ints(&program, 7, 3).unwrap();
        assert_eq!(result.return_value, 7);
    }

    #[test]
    fn test_constant_program_collapses() {
        let mut program = lower(
            "int wain(int a, int b) {
                int x = 6;
                int y = 7;
                if (x < y) { x = x * y; } else { x = 0; }
                return x;
            }",
        );
        optimize(&mut program);
        let (result, _) = run_with_ints(&program, 0, 0).unwrap();
        assert_eq!(result.return_value, 42);
        // Constant folding plus branch resolution should leave a single
        // block returning a constant.
        assert_eq!(program.wain().num_blocks(), 1);
    }

    #[test]
    fn test_division_by_zero_survives_optimization() {
        let mut program = lower("int wain(int a, int b) { return a + 1 / 0; }");
        optimize(&mut program);
        assert!(run_with_ints(&program, 1, 1).is_err(), "1/0 must still trap at runtime");
    }
}
