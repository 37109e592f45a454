//! Dead-code elimination and the structural cleanup passes.
//!
//! Each pass returns the number of instructions it removed; the driver runs
//! them until a full round removes nothing.

use std::collections::BTreeSet;

use log::debug;

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::cfg::{ControlFlowGraph, Program, MAIN_FUNCTION};
use crate::ir::ir::{Instruction, Opcode};

/// Remove pure assignments whose destination is never read anywhere in the
/// function. Variables that are address-taken stay: their storage is live
/// even when no direct read exists.
pub fn remove_global_unused_assignments(function: &mut ControlFlowGraph) -> usize {
    let mut used: FxHashSet<String> = FxHashSet::default();
    let mut addressed: FxHashSet<String> = FxHashSet::default();
    function.for_each_instruction(|instruction| {
        used.extend(instruction.arguments.iter().cloned());
        if matches!(instruction.opcode, Opcode::AddressOf | Opcode::Load) {
            addressed.extend(instruction.arguments.iter().cloned());
        }
    });

    let mut removed = 0;
    for label in function.block_labels.clone() {
        let block = function.get_block_mut(&label);
        block.instructions.retain(|instruction| {
            let dead = instruction.is_pure()
                && instruction.destination.as_ref().is_some_and(|destination| {
                    !used.contains(destination) && !addressed.contains(destination)
                });
            if dead {
                removed += 1;
            }
            !dead
        });
    }
    removed
}

/// Within each block, remove a write that is overwritten before any read.
/// Memory instructions pessimistically invalidate all tracking, and writes
/// still pending at the end of an exit block are dead too.
pub fn remove_local_unused_assignments(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();

    // When a local's address has escaped, a call may read any variable, so
    // calls invalidate the tracking just like memory instructions do.
    let mut has_escaped_locals = false;
    function.for_each_instruction(|instruction| {
        has_escaped_locals |= instruction.opcode == Opcode::AddressOf;
    });

    let mut removed = 0;
    for label in function.block_labels.clone() {
        let is_exit = function.exiting_blocks.contains(&label);
        let block = function.get_block_mut(&label);

        let mut to_delete: BTreeSet<usize> = BTreeSet::new();
        let mut last_def: FxHashMap<String, usize> = FxHashMap::default();
        for (idx, instruction) in block.instructions.iter().enumerate() {
            for argument in &instruction.arguments {
                last_def.remove(argument);
            }
            if instruction.uses_memory() || (has_escaped_locals && instruction.opcode == Opcode::Call)
            {
                last_def.clear();
            }
            if let Some(destination) = &instruction.destination {
                if let Some(previous) = last_def.remove(destination) {
                    to_delete.insert(previous);
                }
                if instruction.is_pure() {
                    last_def.insert(destination.clone(), idx);
                }
            }
        }
        if is_exit {
            to_delete.extend(last_def.into_values());
        }

        for idx in to_delete.into_iter().rev() {
            block.instructions.remove(idx);
            removed += 1;
        }
    }
    removed
}

/// A phi whose incoming list, filtered to the block's actual predecessors,
/// carries a single distinct value becomes a plain copy.
pub fn remove_trivial_phis(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();
    let mut removed = 0;
    for label in function.block_labels.clone() {
        let predecessors = function.get_block(&label).incoming_blocks.clone();
        for instruction in &mut function.get_block_mut(&label).instructions {
            if instruction.opcode != Opcode::Phi {
                continue;
            }
            let mut kept_arguments = Vec::new();
            let mut kept_labels = Vec::new();
            for (argument, phi_label) in instruction.arguments.iter().zip(&instruction.labels) {
                if predecessors.contains(phi_label) {
                    kept_arguments.push(argument.clone());
                    kept_labels.push(phi_label.clone());
                }
            }
            let distinct: BTreeSet<&String> = kept_arguments.iter().collect();
            if distinct.len() == 1 {
                let destination = instruction.destination.clone().unwrap();
                *instruction =
                    Instruction::id(destination, kept_arguments.pop().unwrap(), instruction.ty);
                removed += 1;
            } else {
                instruction.arguments = kept_arguments;
                instruction.labels = kept_labels;
            }
        }
    }
    removed
}

/// Remove non-entry blocks that lost every predecessor.
pub fn remove_unused_blocks(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();
    let mut removed = 0;
    let candidates: Vec<String> = function
        .block_labels
        .iter()
        .filter(|label| {
            **label != function.entry_label
                && function.get_block(label).incoming_blocks.is_empty()
        })
        .cloned()
        .collect();
    for label in candidates {
        removed += function.get_block(&label).instructions.len();
        function.remove_block(&label);
    }
    if removed > 0 {
        function.recompute_graph();
    }
    removed
}

/// Merge single-successor/single-predecessor block pairs.
pub fn combine_extended_blocks(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();
    let mut removed = 0;
    loop {
        let mut candidate = None;
        for label in &function.block_labels {
            let block = function.get_block(label);
            if block.outgoing_blocks.len() != 1 {
                continue;
            }
            let successor = block.outgoing_blocks.iter().next().unwrap();
            if successor == label {
                continue;
            }
            if function.get_block(successor).incoming_blocks.len() != 1 {
                continue;
            }
            // A same-target conditional branch also has one successor but is
            // not a mergeable fallthrough until it is rewritten to a jump.
            if block.instructions.last().unwrap().opcode != Opcode::Jmp {
                continue;
            }
            candidate = Some((label.clone(), successor.clone()));
            break;
        }
        let Some((source, target)) = candidate else {
            break;
        };
        function.combine_blocks(&source, &target);
        removed += 1;
    }
    removed
}

/// Delete functions `wain` cannot reach through calls.
pub fn remove_unused_functions(program: &mut Program) -> usize {
    let mut reachable: FxHashSet<String> = FxHashSet::default();
    let mut worklist = vec![MAIN_FUNCTION.to_string()];
    while let Some(name) = worklist.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        program.get_function(&name).for_each_instruction(|instruction| {
            if instruction.opcode == Opcode::Call {
                worklist.push(instruction.funcs[0].clone());
            }
        });
    }

    let unused: Vec<String> =
        program.functions.keys().filter(|name| !reachable.contains(*name)).cloned().collect();
    let mut removed = 0;
    for name in unused {
        debug!("removing unreachable function {name}");
        removed += program.get_function(&name).num_instructions();
        program.functions.remove(&name);
    }
    removed
}

/// Drop parameters that are never read, rewriting every call site in
/// lock-step. `wain`'s signature is fixed by the runtime.
pub fn remove_unused_parameters(program: &mut Program) -> usize {
    let mut unused_indices: FxHashMap<String, Vec<usize>> = FxHashMap::default();
    for (name, function) in &program.functions {
        if name == MAIN_FUNCTION {
            continue;
        }
        let mut read: FxHashSet<String> = FxHashSet::default();
        function.for_each_instruction(|instruction| {
            read.extend(instruction.arguments.iter().cloned());
        });
        let indices: Vec<usize> = function
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, parameter)| !read.contains(&parameter.name))
            .map(|(idx, _)| idx)
            .collect();
        if !indices.is_empty() {
            unused_indices.insert(name.clone(), indices);
        }
    }
    if unused_indices.is_empty() {
        return 0;
    }

    let mut removed = 0;
    for (name, indices) in &unused_indices {
        let function = program.get_function_mut(name);
        for idx in indices.iter().rev() {
            debug!("removing unused parameter {} of {name}", function.parameters[*idx].name);
            function.parameters.remove(*idx);
            removed += 1;
        }
    }

    for function in program.functions.values_mut() {
        function.for_each_instruction_mut(|instruction| {
            if instruction.opcode != Opcode::Call {
                return;
            }
            if let Some(indices) = unused_indices.get(&instruction.funcs[0]) {
                for idx in indices.iter().rev() {
                    instruction.arguments.remove(*idx);
                    removed += 1;
                }
            }
        });
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::{Function, Type, Variable};

    fn int_params(names: &[&str]) -> Vec<Variable> {
        names.iter().map(|name| Variable::new(*name, Type::Int)).collect()
    }

    #[test]
    fn test_global_unused_assignment_removed() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::add("dead", "a", "a"),
            Instruction::add("live", "a", "a"),
            Instruction::ret("live"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_global_unused_assignments(&mut cfg), 1);
        assert_eq!(cfg.get_block("entry").instructions.len(), 3);
    }

    #[test]
    fn test_impure_unused_assignment_kept() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::call("dead", "g", vec!["a".to_string()], Type::Int),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_global_unused_assignments(&mut cfg), 0);
    }

    #[test]
    fn test_address_taken_variable_kept() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::add("x", "a", "a"),
            Instruction::addressof("p", "x"),
            Instruction::load("y", "p"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_global_unused_assignments(&mut cfg), 0);
    }

    #[test]
    fn test_local_overwrite_removed() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::constant("x", 1, Type::Int),
            Instruction::constant("x", 2, Type::Int),
            Instruction::ret("x"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_local_unused_assignments(&mut cfg), 1);
        let block = cfg.get_block("entry");
        assert_eq!(block.instructions[1].value, 2);
    }

    #[test]
    fn test_local_read_between_writes_kept() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::constant("x", 1, Type::Int),
            Instruction::add("y", "x", "a"),
            Instruction::constant("x", 2, Type::Int),
            Instruction::add("z", "y", "x"),
            Instruction::ret("z"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_local_unused_assignments(&mut cfg), 0);
    }

    #[test]
    fn test_memory_instruction_clears_tracking() {
        let mut function = Function::new(
            "f",
            vec![Variable::new("p", Type::IntStar), Variable::new("a", Type::Int)],
            Type::Int,
        );
        // x's first write may be observed through the store's pointer.
        let mut instructions = vec![
            Instruction::constant("x", 1, Type::Int),
            Instruction::store("p", "a"),
            Instruction::constant("x", 2, Type::Int),
            Instruction::ret("x"),
        ];
        function.instructions = std::mem::take(&mut instructions);
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(remove_local_unused_assignments(&mut cfg), 0);
    }

    #[test]
    fn test_dangling_write_in_exit_block_removed() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::add("x", "a", "a"),
            Instruction::add("x", "x", "a"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        // The second write is dangling at the exit; removing it exposes the
        // first on the next round.
        assert_eq!(remove_local_unused_assignments(&mut cfg), 1);
        assert_eq!(remove_local_unused_assignments(&mut cfg), 1);
        assert_eq!(cfg.get_block("entry").instructions.len(), 2);
    }

    #[test]
    fn test_trivial_phi_becomes_copy() {
        let mut function = Function::new("f", int_params(&["a", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::br("c", "left", "right"),
            Instruction::label("left"),
            Instruction::jmp("join"),
            Instruction::label("right"),
            Instruction::jmp("join"),
            Instruction::label("join"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.get_block_mut("join").prepend(Instruction::phi(
            "m",
            Type::Int,
            vec!["a".into(), "a".into()],
            vec!["left".into(), "right".into()],
        ));
        assert_eq!(remove_trivial_phis(&mut cfg), 1);
        let phi = &cfg.get_block("join").instructions[1];
        assert_eq!(phi.opcode, Opcode::Id);
        assert_eq!(phi.arguments, vec!["a".to_string()]);
    }

    #[test]
    fn test_phi_filtered_to_live_predecessors() {
        // One predecessor was rewired away; the phi reduces to the survivor.
        let mut function = Function::new("f", int_params(&["a", "b", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::br("c", "left", "join"),
            Instruction::label("left"),
            Instruction::jmp("join"),
            Instruction::label("join"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.get_block_mut("join").prepend(Instruction::phi(
            "m",
            Type::Int,
            vec!["a".into(), "b".into(), "b".into()],
            vec!["entry".into(), "left".into(), "gone".into()],
        ));
        assert_eq!(remove_trivial_phis(&mut cfg), 0);
        let phi = &cfg.get_block("join").instructions[1];
        assert_eq!(phi.labels, vec!["entry".to_string(), "left".to_string()]);
    }

    #[test]
    fn test_unreachable_block_removed() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::jmp("end"),
            Instruction::label("island"),
            Instruction::add("x", "a", "a"),
            Instruction::jmp("end"),
            Instruction::label("end"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        let removed = remove_unused_blocks(&mut cfg);
        assert_eq!(removed, 3);
        assert_eq!(cfg.block_labels, vec!["entry", "end"]);
    }

    #[test]
    fn test_combine_extended_blocks_folds_chain() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::add("x", "a", "a"),
            Instruction::jmp("middle"),
            Instruction::label("middle"),
            Instruction::add("y", "x", "a"),
            Instruction::jmp("end"),
            Instruction::label("end"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(combine_extended_blocks(&mut cfg), 2);
        assert_eq!(cfg.block_labels, vec!["entry"]);
        assert!(cfg.exiting_blocks.contains("entry"));
    }

    fn two_function_program() -> Program {
        let mut wain = Function::new(MAIN_FUNCTION, int_params(&["a", "b"]), Type::Int);
        wain.instructions = vec![
            Instruction::call("x", "helper", vec!["a".to_string(), "b".to_string()], Type::Int),
            Instruction::ret("x"),
        ];
        let mut helper = Function::new("helper", int_params(&["x", "unused"]), Type::Int);
        helper.instructions = vec![Instruction::ret("x")];
        let mut orphan = Function::new("orphan", int_params(&["n"]), Type::Int);
        orphan.instructions = vec![Instruction::ret("n")];

        let mut program = Program::default();
        for function in [wain, helper, orphan] {
            program
                .functions
                .insert(function.name.clone(), ControlFlowGraph::new(function));
        }
        program
    }

    #[test]
    fn test_unreachable_function_removed() {
        let mut program = two_function_program();
        let removed = remove_unused_functions(&mut program);
        assert!(removed > 0);
        assert!(!program.functions.contains_key("orphan"));
        assert!(program.functions.contains_key("helper"));
    }

    #[test]
    fn test_unused_parameter_removed_in_lockstep() {
        let mut program = two_function_program();
        let removed = remove_unused_parameters(&mut program);
        assert_eq!(removed, 2);
        assert_eq!(program.get_function("helper").parameters.len(), 1);
        let mut call_arguments = None;
        program.wain().for_each_instruction(|instruction| {
            if instruction.opcode == Opcode::Call {
                call_arguments = Some(instruction.arguments.clone());
            }
        });
        assert_eq!(call_arguments.unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_wain_parameters_never_removed() {
        let mut wain = Function::new(MAIN_FUNCTION, int_params(&["a", "b"]), Type::Int);
        wain.instructions = vec![
            Instruction::constant("z", 0, Type::Int),
            Instruction::ret("z"),
        ];
        let mut program = Program::default();
        program.functions.insert(wain.name.clone(), ControlFlowGraph::new(wain));
        assert_eq!(remove_unused_parameters(&mut program), 0);
        assert_eq!(program.wain().parameters.len(), 2);
    }
}
