//! A generic worklist solver for per-instruction dataflow analyses.
//!
//! An analysis supplies an initial value for the boundary blocks, a merge
//! over neighbor values, and a per-instruction transfer function. The solver
//! records the value at every instruction boundary: index `i` is the value
//! just before instruction `i`, index `len` the value after the last one.

use std::collections::VecDeque;

use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::Instruction;

#[derive(Debug, Clone, Copy)]
pub struct InstructionLocation<'a> {
    pub label: &'a str,
    pub instruction_idx: usize,
}

/// Per-block vectors of dataflow values, one per instruction boundary.
#[derive(Debug, Clone)]
pub struct DataFlowResult<T> {
    data: FxHashMap<String, Vec<T>>,
}

impl<T> DataFlowResult<T> {
    pub fn block_in(&self, label: &str) -> &T {
        self.data[label].first().expect("blocks are never empty")
    }

    pub fn block_out(&self, label: &str) -> &T {
        self.data[label].last().expect("blocks are never empty")
    }

    /// The value just before instruction `idx`.
    pub fn before(&self, label: &str, idx: usize) -> &T {
        &self.data[label][idx]
    }

    /// The value just after instruction `idx`.
    pub fn after(&self, label: &str, idx: usize) -> &T {
        &self.data[label][idx + 1]
    }
}

/// Forward analysis: values flow from a block's predecessors through its
/// instructions in order.
pub trait ForwardAnalysis {
    type Value: Clone + PartialEq;

    /// The value entering the function's entry block.
    fn init(&self) -> Self::Value;

    fn merge(&self, values: Vec<&Self::Value>) -> Self::Value;

    fn transfer(
        &self,
        value: &Self::Value,
        location: InstructionLocation<'_>,
        instruction: &Instruction,
    ) -> Self::Value;

    fn run(&self, function: &ControlFlowGraph) -> DataFlowResult<Self::Value> {
        let mut data: FxHashMap<String, Vec<Self::Value>> = FxHashMap::default();
        let mut worklist: VecDeque<String> = VecDeque::new();
        for label in &function.block_labels {
            let size = function.get_block(label).instructions.len() + 1;
            data.insert(label.clone(), vec![self.init(); size]);
            worklist.push_back(label.clone());
        }

        while let Some(label) = worklist.pop_front() {
            let block = function.get_block(&label);

            let block_in = if label == function.entry_label {
                self.init()
            } else {
                self.merge(
                    block
                        .incoming_blocks
                        .iter()
                        .map(|pred| data[pred].last().unwrap())
                        .collect(),
                )
            };

            let values = data.get_mut(&label).unwrap();
            values[0] = block_in;
            let mut changed = false;
            for (idx, instruction) in block.instructions.iter().enumerate() {
                let location = InstructionLocation { label: &label, instruction_idx: idx };
                let next = self.transfer(&values[idx], location, instruction);
                if values[idx + 1] != next {
                    values[idx + 1] = next;
                    changed = true;
                }
            }

            if changed {
                for successor in &block.outgoing_blocks {
                    worklist.push_back(successor.clone());
                }
            }
        }

        DataFlowResult { data }
    }
}

/// Backward analysis: values flow from a block's successors through its
/// instructions in reverse.
pub trait BackwardAnalysis {
    type Value: Clone + PartialEq;

    /// The value leaving every exit block.
    fn init(&self) -> Self::Value;

    fn merge(&self, values: Vec<&Self::Value>) -> Self::Value;

    fn transfer(
        &self,
        value: &Self::Value,
        location: InstructionLocation<'_>,
        instruction: &Instruction,
    ) -> Self::Value;

    fn run(&self, function: &ControlFlowGraph) -> DataFlowResult<Self::Value> {
        let mut data: FxHashMap<String, Vec<Self::Value>> = FxHashMap::default();
        let mut worklist: VecDeque<String> = VecDeque::new();
        for label in &function.block_labels {
            let size = function.get_block(label).instructions.len() + 1;
            data.insert(label.clone(), vec![self.init(); size]);
            worklist.push_back(label.clone());
        }

        while let Some(label) = worklist.pop_front() {
            let block = function.get_block(&label);

            let block_out = if function.exiting_blocks.contains(&label) {
                self.init()
            } else {
                self.merge(
                    block
                        .outgoing_blocks
                        .iter()
                        .map(|succ| data[succ].first().unwrap())
                        .collect(),
                )
            };

            let values = data.get_mut(&label).unwrap();
            let last = values.len() - 1;
            values[last] = block_out;
            let mut changed = false;
            for (idx, instruction) in block.instructions.iter().enumerate().rev() {
                let location = InstructionLocation { label: &label, instruction_idx: idx };
                let next = self.transfer(&values[idx + 1], location, instruction);
                if values[idx] != next {
                    values[idx] = next;
                    changed = true;
                }
            }

            if changed {
                for predecessor in &block.incoming_blocks {
                    worklist.push_back(predecessor.clone());
                }
            }
        }

        DataFlowResult { data }
    }
}
