//! Intra-procedural may-alias analysis.
//!
//! A forward dataflow pass tracks, for each pointer-typed variable, the set
//! of memory origins it may refer to: the storage of an address-taken
//! variable, the result of a particular allocation site, an opaque parameter,
//! or a raw constant pointer. Pointer arithmetic preserves origin; anything
//! producing an integer clears it; phis union their incoming sets.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::{Instruction, Opcode, Type};
use crate::passes::data_flow::{DataFlowResult, ForwardAnalysis, InstructionLocation};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLocation {
    /// The storage of a named variable, produced by `addressof`.
    AddressOf(String),
    /// The result of the allocation at (block label, instruction index).
    Allocation(String, usize),
    /// The i-th parameter; opaque storage from the caller.
    Parameter(usize),
    /// A pointer-typed constant.
    RawPointer(i64),
}

pub type LocationSet = BTreeSet<MemoryLocation>;
/// Pointer variable name to its possible origins.
pub type AliasValue = BTreeMap<String, LocationSet>;

pub struct MayAliasAnalysis {
    initial: AliasValue,
}

impl MayAliasAnalysis {
    pub fn new(function: &ControlFlowGraph) -> Self {
        let mut initial = AliasValue::new();
        for (idx, parameter) in function.parameters.iter().enumerate() {
            if parameter.ty == Type::IntStar {
                initial.insert(
                    parameter.name.clone(),
                    BTreeSet::from([MemoryLocation::Parameter(idx)]),
                );
            }
        }
        Self { initial }
    }

    pub fn run_on(function: &ControlFlowGraph) -> DataFlowResult<AliasValue> {
        Self::new(function).run(function)
    }
}

impl ForwardAnalysis for MayAliasAnalysis {
    type Value = AliasValue;

    fn init(&self) -> AliasValue {
        self.initial.clone()
    }

    fn merge(&self, values: Vec<&AliasValue>) -> AliasValue {
        let mut result = AliasValue::new();
        for value in values {
            for (variable, locations) in value {
                result.entry(variable.clone()).or_default().extend(locations.iter().cloned());
            }
        }
        result
    }

    fn transfer(
        &self,
        value: &AliasValue,
        location: InstructionLocation<'_>,
        instruction: &Instruction,
    ) -> AliasValue {
        let Some(destination) = &instruction.destination else {
            return value.clone();
        };

        let mut result = value.clone();

        // An integer-producing instruction cannot leave a pointer behind.
        if instruction.ty != Type::IntStar {
            result.insert(destination.clone(), LocationSet::new());
            return result;
        }

        let locations = match instruction.opcode {
            Opcode::Const => BTreeSet::from([MemoryLocation::RawPointer(instruction.value)]),
            // Calls and allocations both produce storage nothing else aliases.
            Opcode::Call | Opcode::Alloc => BTreeSet::from([MemoryLocation::Allocation(
                location.label.to_string(),
                location.instruction_idx,
            )]),
            Opcode::Id | Opcode::PtrAdd | Opcode::PtrSub => {
                result.get(&instruction.arguments[0]).cloned().unwrap_or_default()
            }
            Opcode::AddressOf => {
                BTreeSet::from([MemoryLocation::AddressOf(instruction.arguments[0].clone())])
            }
            Opcode::Phi => {
                let mut union = LocationSet::new();
                for argument in &instruction.arguments {
                    if let Some(locations) = result.get(argument) {
                        union.extend(locations.iter().cloned());
                    }
                }
                union
            }
            opcode => panic!("opcode {opcode} cannot produce a pointer"),
        };
        result.insert(destination.clone(), locations);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::{Function, Variable};

    #[test]
    fn test_addressof_and_copies_track_origin() {
        let mut function = Function::new("f", vec![Variable::new("x", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::addressof("p", "x"),
            Instruction::id("q", "p", Type::IntStar),
            Instruction::constant("one", 1, Type::Int),
            Instruction::ptradd("r", "q", "one"),
            Instruction::ret("x"),
        ];
        let cfg = ControlFlowGraph::new(function);
        let result = MayAliasAnalysis::run_on(&cfg);
        let out = result.block_out("entry");
        let expected = BTreeSet::from([MemoryLocation::AddressOf("x".to_string())]);
        assert_eq!(out["p"], expected);
        assert_eq!(out["q"], expected);
        assert_eq!(out["r"], expected, "pointer arithmetic preserves origin");
    }

    #[test]
    fn test_parameters_are_opaque() {
        let function = Function::new(
            "f",
            vec![Variable::new("a", Type::IntStar), Variable::new("n", Type::Int)],
            Type::Int,
        );
        let mut function = function;
        function.instructions = vec![Instruction::ret("n")];
        let cfg = ControlFlowGraph::new(function);
        let result = MayAliasAnalysis::run_on(&cfg);
        assert_eq!(
            result.block_in("entry")["a"],
            BTreeSet::from([MemoryLocation::Parameter(0)])
        );
    }

    #[test]
    fn test_merge_unions_branches() {
        let mut function = Function::new(
            "f",
            vec![Variable::new("c", Type::Int), Variable::new("x", Type::Int)],
            Type::Int,
        );
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::addressof("p", "x"),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::constant("n", 8, Type::Int),
            Instruction::alloc("p", "n"),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::ret("x"),
        ];
        let cfg = ControlFlowGraph::new(function);
        let result = MayAliasAnalysis::run_on(&cfg);
        let join_in = result.block_in("joinLbl");
        assert_eq!(join_in["p"].len(), 2, "join should see both possible origins");
    }

    #[test]
    fn test_integer_results_clear_origin() {
        let mut function = Function::new("f", vec![Variable::new("x", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::addressof("p", "x"),
            Instruction::addressof("q", "x"),
            Instruction::ptrdiff("d", "p", "q"),
            Instruction::ret("d"),
        ];
        let cfg = ControlFlowGraph::new(function);
        let result = MayAliasAnalysis::run_on(&cfg);
        assert!(result.block_out("entry")["d"].is_empty());
    }
}
