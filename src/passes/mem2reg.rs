//! Memory-to-register promotion.
//!
//! Using the may-alias origin sets, a load or store through a pointer whose
//! only possible origin is the storage of a named variable is rewritten into
//! a direct copy of that variable. A pointer copy with such a singleton
//! origin is canonicalized back to an `addressof`, which keeps the address
//! identity explicit for later iterations without guessing at its uses.
//! Allocation origins are never promoted.

use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::{Instruction, Opcode};
use crate::passes::alias::{MayAliasAnalysis, MemoryLocation};

pub fn promote_memory_to_registers(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();
    let alias_data = MayAliasAnalysis::run_on(function);

    let mut result = 0;
    for label in function.block_labels.clone() {
        let block = function.blocks.get_mut(&label).unwrap();
        for (idx, instruction) in block.instructions.iter_mut().enumerate() {
            match instruction.opcode {
                Opcode::Load => {
                    let locations = &alias_data.after(&label, idx)[&instruction.arguments[0]];
                    if let Some(MemoryLocation::AddressOf(variable)) = singleton(locations) {
                        let destination = instruction.destination.clone().unwrap();
                        *instruction =
                            Instruction::id(destination, variable.clone(), instruction.ty);
                        result += 1;
                    }
                }
                Opcode::Store => {
                    let locations = &alias_data.before(&label, idx)[&instruction.arguments[0]];
                    if let Some(MemoryLocation::AddressOf(variable)) = singleton(locations) {
                        let variable = variable.clone();
                        let value = instruction.arguments[1].clone();
                        *instruction = Instruction::id(variable, value, crate::ir::ir::Type::Int);
                        result += 1;
                    }
                }
                Opcode::Id => {
                    let Some(locations) =
                        alias_data.after(&label, idx).get(&instruction.arguments[0])
                    else {
                        continue;
                    };
                    if let Some(MemoryLocation::AddressOf(variable)) = singleton(locations) {
                        if instruction.arguments[0] != *variable {
                            let destination = instruction.destination.clone().unwrap();
                            *instruction = Instruction::addressof(destination, variable.clone());
                            result += 1;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    result
}

fn singleton(locations: &std::collections::BTreeSet<MemoryLocation>) -> Option<&MemoryLocation> {
    if locations.len() == 1 {
        locations.iter().next()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::{Function, Type, Variable};

    #[test]
    fn test_load_store_through_known_address_promoted() {
        // p = &x; *p = y; z = *p  becomes  x = y; z = x
        let mut function = Function::new(
            "f",
            vec![Variable::new("x", Type::Int), Variable::new("y", Type::Int)],
            Type::Int,
        );
        function.instructions = vec![
            Instruction::addressof("p", "x"),
            Instruction::store("p", "y"),
            Instruction::load("z", "p"),
            Instruction::ret("z"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        let promoted = promote_memory_to_registers(&mut cfg);
        assert_eq!(promoted, 2);

        let block = cfg.get_block("entry");
        let store = &block.instructions[2];
        assert_eq!(store.opcode, Opcode::Id);
        assert_eq!(store.destination.as_deref(), Some("x"));
        assert_eq!(store.arguments, vec!["y".to_string()]);
        let load = &block.instructions[3];
        assert_eq!(load.opcode, Opcode::Id);
        assert_eq!(load.arguments, vec!["x".to_string()]);
    }

    #[test]
    fn test_allocation_origins_not_promoted() {
        let mut function = Function::new("f", vec![Variable::new("n", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::alloc("p", "n"),
            Instruction::store("p", "n"),
            Instruction::load("z", "p"),
            Instruction::free("p"),
            Instruction::ret("z"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(promote_memory_to_registers(&mut cfg), 0);
        let block = cfg.get_block("entry");
        assert_eq!(block.instructions[2].opcode, Opcode::Store);
        assert_eq!(block.instructions[3].opcode, Opcode::Load);
    }

    #[test]
    fn test_ambiguous_origin_not_promoted() {
        let mut function = Function::new(
            "f",
            vec![
                Variable::new("c", Type::Int),
                Variable::new("x", Type::Int),
            ],
            Type::Int,
        );
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::addressof("p", "x"),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::addressof("p", "c"),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::load("z", "p"),
            Instruction::ret("z"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(promote_memory_to_registers(&mut cfg), 0);
    }

    #[test]
    fn test_pointer_copy_canonicalized_to_addressof() {
        let mut function = Function::new("f", vec![Variable::new("x", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::addressof("p", "x"),
            Instruction::id("q", "p", Type::IntStar),
            Instruction::load("z", "q"),
            Instruction::ret("z"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        let promoted = promote_memory_to_registers(&mut cfg);
        assert!(promoted >= 2);
        let block = cfg.get_block("entry");
        assert_eq!(block.instructions[2].opcode, Opcode::AddressOf);
        assert_eq!(block.instructions[3].opcode, Opcode::Id);
        assert_eq!(block.instructions[3].arguments, vec!["x".to_string()]);
    }
}
