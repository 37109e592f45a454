//! Conversion into and out of SSA form.
//!
//! Into SSA: phi placement at iterated dominance frontiers for every variable
//! with more than one definition, then a dominator-tree walk renaming each
//! definition to a fresh `name.k` and rewriting uses from per-variable stacks.
//! Functions that still touch memory are left alone; mem2reg is expected to
//! have removed what it can first.
//!
//! Out of SSA: each phi is replaced by copies of its incoming values into a
//! shuttle variable at the tail of every predecessor, then a single copy from
//! the shuttle into the phi's destination. The common intermediate makes
//! parallel phi semantics (including swap cycles) safe to serialize.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::{ControlFlowGraph, DominatorInfo};
use crate::ir::ir::{Instruction, Opcode, Type};

/// The placeholder for a phi argument along a path with no definition.
/// Such a path cannot be taken in a well-formed program.
pub const UNDEFINED: &str = "__undefined";

impl ControlFlowGraph {
    pub fn convert_to_ssa(&mut self) {
        if self.uses_memory() {
            return;
        }
        // Already single-assignment (including a previous conversion):
        // nothing to merge, and re-renaming would only churn names.
        if self.is_in_ssa_form() {
            return;
        }
        self.recompute_graph();
        let dominators = self.dominator_info();

        // Gather every variable's defining blocks, definition count, and type.
        let mut defs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut num_defs: FxHashMap<String, usize> = FxHashMap::default();
        let mut types: FxHashMap<String, Type> = FxHashMap::default();
        for label in &self.block_labels {
            for instruction in &self.get_block(label).instructions {
                if let Some(destination) = &instruction.destination {
                    defs.entry(destination.clone()).or_default().insert(label.clone());
                    *num_defs.entry(destination.clone()).or_default() += 1;
                    types.insert(destination.clone(), instruction.ty);
                }
            }
        }
        for parameter in &self.parameters {
            defs.entry(parameter.name.clone()).or_default().insert(self.entry_label.clone());
            *num_defs.entry(parameter.name.clone()).or_default() += 1;
            types.insert(parameter.name.clone(), parameter.ty);
        }

        // Phi placement: iterate each variable's defining set through the
        // dominance frontier until no new frontier block appears.
        for (variable, defining_blocks) in &defs {
            if num_defs[variable] <= 1 {
                continue;
            }
            let mut queue: BTreeSet<String> = defining_blocks.clone();
            let mut has_phi: BTreeSet<String> = BTreeSet::new();
            while let Some(block_label) = queue.pop_first() {
                for frontier_label in dominators.dominance_frontier(&block_label) {
                    if !has_phi.insert(frontier_label.clone()) {
                        continue;
                    }
                    let frontier_block = self.get_block_mut(&frontier_label);
                    let predecessors: Vec<String> =
                        frontier_block.incoming_blocks.iter().cloned().collect();
                    let arguments = vec![variable.clone(); predecessors.len()];
                    frontier_block.prepend(Instruction::phi(
                        variable.clone(),
                        types[variable],
                        arguments,
                        predecessors,
                    ));
                    queue.insert(frontier_label);
                }
            }
        }

        // Renaming walk from the entry.
        let mut definitions: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for parameter in &self.parameters {
            definitions.insert(parameter.name.clone(), vec![parameter.name.clone()]);
        }
        let mut next_idx: FxHashMap<String, usize> = FxHashMap::default();
        let entry = self.entry_label.clone();
        self.rename_variables(&entry, definitions, &mut next_idx, &dominators);
    }

    /// Rename definitions and uses within `block_label`, patch the phi slots
    /// of its successors, then recurse into the blocks it immediately
    /// dominates. `definitions` is passed by value: unwinding restores the
    /// scopes of sibling subtrees.
    fn rename_variables(
        &mut self,
        block_label: &str,
        mut definitions: FxHashMap<String, Vec<String>>,
        next_idx: &mut FxHashMap<String, usize>,
        dominators: &DominatorInfo,
    ) {
        let mut fresh = |name: &str, definitions: &mut FxHashMap<String, Vec<String>>| {
            let idx = next_idx.entry(name.to_string()).or_default();
            let new_name = format!("{name}.{idx}");
            *idx += 1;
            definitions.entry(name.to_string()).or_default().push(new_name.clone());
            new_name
        };

        // Phi destinations first: their values are conceptually chosen on
        // block entry, before any ordinary instruction executes.
        let block = self.get_block_mut(block_label);
        for instruction in &mut block.instructions {
            if instruction.opcode != Opcode::Phi {
                continue;
            }
            let destination = instruction.destination.clone().unwrap();
            instruction.destination = Some(fresh(&destination, &mut definitions));
        }

        for instruction in &mut block.instructions {
            if instruction.opcode == Opcode::Phi {
                continue;
            }
            for argument in &mut instruction.arguments {
                let stack = definitions
                    .get(argument.as_str())
                    .unwrap_or_else(|| panic!("variable {argument} used before definition"));
                *argument = stack.last().unwrap().clone();
            }
            if let Some(destination) = instruction.destination.clone() {
                instruction.destination = Some(fresh(&destination, &mut definitions));
            }
        }

        // Patch this block's slot in each successor's phis.
        let successors: Vec<String> =
            self.get_block(block_label).outgoing_blocks.iter().cloned().collect();
        for successor in successors {
            for instruction in &mut self.get_block_mut(&successor).instructions {
                if instruction.opcode != Opcode::Phi {
                    continue;
                }
                let idx = instruction
                    .labels
                    .iter()
                    .position(|label| label == block_label)
                    .unwrap_or_else(|| panic!("phi in {successor} has no slot for {block_label}"));
                let argument = instruction.arguments[idx].clone();
                instruction.arguments[idx] = match definitions.get(argument.as_str()) {
                    Some(stack) if !stack.is_empty() => stack.last().unwrap().clone(),
                    _ => UNDEFINED.to_string(),
                };
            }
        }

        for child in dominators.children(block_label) {
            self.rename_variables(&child, definitions.clone(), next_idx, dominators);
        }
    }

    /// Replace every phi by predecessor-side copies through a shuttle
    /// variable.
    pub fn convert_from_ssa(&mut self) {
        for label in self.block_labels.clone() {
            for idx in 0..self.get_block(&label).instructions.len() {
                let instruction = self.get_block(&label).instructions[idx].clone();
                if instruction.opcode != Opcode::Phi {
                    continue;
                }
                let destination = instruction.destination.clone().unwrap();
                let shuttle = format!("shuttle.{destination}");
                for (argument, predecessor) in
                    instruction.arguments.iter().zip(&instruction.labels)
                {
                    let predecessor_block = self.get_block_mut(predecessor);
                    let insert_at = predecessor_block.instructions.len() - 1;
                    debug_assert!(predecessor_block.instructions[insert_at].is_jump());
                    predecessor_block.instructions.insert(
                        insert_at,
                        Instruction::id(shuttle.clone(), argument.clone(), instruction.ty),
                    );
                }
                self.get_block_mut(&label).instructions[idx] =
                    Instruction::id(destination, shuttle, instruction.ty);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fx_hash::FxHashSet;
    use crate::ir::ir::{Function, Variable};

    fn diamond_with_redefinition() -> ControlFlowGraph {
        // x is defined in both branches, merged at the join.
        let mut function = Function::new(
            "f",
            vec![Variable::new("c", Type::Int), Variable::new("x", Type::Int)],
            Type::Int,
        );
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::constant("x", 1, Type::Int),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::constant("x", 2, Type::Int),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::ret("x"),
        ];
        ControlFlowGraph::new(function)
    }

    #[test]
    fn test_ssa_inserts_phi_at_join() {
        let mut cfg = diamond_with_redefinition();
        cfg.convert_to_ssa();
        assert!(cfg.is_in_ssa_form());

        let join = cfg.get_block("joinLbl");
        let phi = &join.instructions[1];
        assert_eq!(phi.opcode, Opcode::Phi);
        assert_eq!(phi.labels.len(), 2);
        let labels: FxHashSet<&str> = phi.labels.iter().map(String::as_str).collect();
        assert_eq!(labels, FxHashSet::from_iter(["thenLbl", "elseLbl"]));
        // The return must read the phi's destination.
        let ret = join.instructions.last().unwrap();
        assert_eq!(ret.arguments[0], *phi.destination.as_ref().unwrap());
    }

    #[test]
    fn test_ssa_every_variable_defined_once() {
        let mut cfg = diamond_with_redefinition();
        cfg.convert_to_ssa();
        let mut seen: FxHashSet<String> =
            cfg.parameters.iter().map(|p| p.name.clone()).collect();
        for label in &cfg.block_labels {
            for instruction in &cfg.get_block(label).instructions {
                if let Some(destination) = &instruction.destination {
                    assert!(seen.insert(destination.clone()), "{destination} defined twice");
                }
            }
        }
    }

    #[test]
    fn test_ssa_no_undefined_arguments() {
        let mut cfg = diamond_with_redefinition();
        cfg.convert_to_ssa();
        cfg.for_each_instruction(|instruction| {
            for argument in &instruction.arguments {
                assert_ne!(argument, UNDEFINED);
            }
        });
    }

    #[test]
    fn test_phi_labels_match_predecessors() {
        let mut cfg = diamond_with_redefinition();
        cfg.convert_to_ssa();
        for label in cfg.block_labels.clone() {
            let predecessors = cfg.get_block(&label).incoming_blocks.clone();
            for instruction in &cfg.get_block(&label).instructions {
                if instruction.opcode == Opcode::Phi {
                    let mut labels: Vec<&String> = instruction.labels.iter().collect();
                    labels.sort();
                    let mut expected: Vec<&String> = predecessors.iter().collect();
                    expected.sort();
                    assert_eq!(labels, expected);
                }
            }
        }
    }

    #[test]
    fn test_memory_functions_are_skipped() {
        let mut function = Function::new("f", vec![Variable::new("p", Type::IntStar)], Type::Int);
        function.instructions = vec![
            Instruction::load("x", "p"),
            Instruction::load("x", "p"),
            Instruction::ret("x"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.convert_to_ssa();
        assert!(!cfg.is_in_ssa_form(), "functions touching memory must not be converted");
    }

    #[test]
    fn test_from_ssa_removes_phis_and_preserves_flow() {
        let mut cfg = diamond_with_redefinition();
        cfg.convert_to_ssa();
        cfg.convert_from_ssa();
        cfg.for_each_instruction(|instruction| {
            assert_ne!(instruction.opcode, Opcode::Phi);
        });
        // Each predecessor of the join now writes the shuttle just before its
        // jump.
        for predecessor in ["thenLbl", "elseLbl"] {
            let block = cfg.get_block(predecessor);
            let n = block.instructions.len();
            let copy = &block.instructions[n - 2];
            assert_eq!(copy.opcode, Opcode::Id);
            assert!(copy.destination.as_ref().unwrap().starts_with("shuttle."));
        }
    }

    #[test]
    fn test_loop_variable_gets_phi_in_header() {
        // i is redefined in the loop body; the header needs a phi.
        let mut function = Function::new("f", vec![Variable::new("n", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::constant("i", 0, Type::Int),
            Instruction::label("loop"),
            Instruction::lt("c", "i", "n"),
            Instruction::br("c", "body", "done"),
            Instruction::label("body"),
            Instruction::constant("one", 1, Type::Int),
            Instruction::add("i", "i", "one"),
            Instruction::jmp("loop"),
            Instruction::label("done"),
            Instruction::ret("i"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.convert_to_ssa();
        assert!(cfg.is_in_ssa_form());
        let header = cfg.get_block("loop");
        let phis: Vec<_> = header
            .instructions
            .iter()
            .filter(|instruction| instruction.opcode == Opcode::Phi)
            .collect();
        assert!(
            phis.iter().any(|phi| phi.destination.as_ref().unwrap().starts_with("i.")),
            "loop header should merge i"
        );
    }
}
