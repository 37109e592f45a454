//! Liveness analysis.
//!
//! Backward dataflow whose value is the set of live variable names. Nothing
//! is live out of an exit block; a block's out-set is the union of its
//! successors' in-sets; walking instructions in reverse, the destination dies
//! and the arguments become live. The per-instruction live-before sets drive
//! the register allocator's interference graph and its call-site save sets.

use std::collections::BTreeSet;

use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::Instruction;
use crate::passes::data_flow::{BackwardAnalysis, DataFlowResult, InstructionLocation};

pub type LiveSet = BTreeSet<String>;

pub struct LivenessAnalysis;

impl BackwardAnalysis for LivenessAnalysis {
    type Value = LiveSet;

    fn init(&self) -> LiveSet {
        LiveSet::new()
    }

    fn merge(&self, values: Vec<&LiveSet>) -> LiveSet {
        let mut result = LiveSet::new();
        for value in values {
            result.extend(value.iter().cloned());
        }
        result
    }

    fn transfer(
        &self,
        value: &LiveSet,
        _location: InstructionLocation<'_>,
        instruction: &Instruction,
    ) -> LiveSet {
        let mut result = value.clone();
        // The destination dies first: an instruction reading its own
        // destination still needs the old value live before it.
        if let Some(destination) = &instruction.destination {
            result.remove(destination);
        }
        result.extend(instruction.arguments.iter().cloned());
        result
    }
}

pub fn liveness(function: &ControlFlowGraph) -> DataFlowResult<LiveSet> {
    LivenessAnalysis.run(function)
}
