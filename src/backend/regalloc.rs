//! Chaitin-style graph-coloring register allocation.
//!
//! The interference graph connects any two variables simultaneously live at
//! some program point; parameters are pairwise connected so every parameter
//! has a stable location callers can target. Address-taken variables are
//! spilled up front and removed from the graph. Simplify pops lowest-degree
//! nodes onto a stack; select colors them in reverse with the lowest
//! available palette register, spilling on exhaustion. Spill slots grow
//! downward from the frame pointer in 4-byte steps.

use std::collections::BTreeSet;
use std::collections::BinaryHeap;
use std::cmp::Reverse;

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::Opcode;
use crate::passes::data_flow::DataFlowResult;
use crate::passes::liveness::{liveness, LiveSet};

/// Where a variable lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    Register(usize),
    /// Stack slot at this offset from the frame pointer.
    Memory(i32),
}

impl VariableLocation {
    pub fn in_memory(self) -> bool {
        matches!(self, VariableLocation::Memory(_))
    }
}

#[derive(Debug)]
pub struct RegisterInterferenceGraph {
    pub variable_to_index: FxHashMap<String, usize>,
    pub index_to_variable: Vec<String>,
    pub edges: Vec<BTreeSet<usize>>,
}

impl RegisterInterferenceGraph {
    pub fn new(function: &ControlFlowGraph, liveness_data: &DataFlowResult<LiveSet>) -> Self {
        let mut graph = Self {
            variable_to_index: FxHashMap::default(),
            index_to_variable: Vec::new(),
            edges: Vec::new(),
        };

        for first in &function.parameters {
            for second in &function.parameters {
                graph.add_edge(&first.name, &second.name);
            }
        }

        for label in &function.block_labels {
            let block = function.get_block(label);
            for idx in 0..=block.instructions.len() {
                let live_set = if idx < block.instructions.len() {
                    liveness_data.before(label, idx)
                } else {
                    liveness_data.block_out(label)
                };
                for first in live_set {
                    for second in live_set {
                        graph.add_edge(first, second);
                    }
                }
            }
        }

        graph
    }

    fn get_index(&mut self, variable: &str) -> usize {
        if let Some(&idx) = self.variable_to_index.get(variable) {
            return idx;
        }
        let idx = self.index_to_variable.len();
        self.variable_to_index.insert(variable.to_string(), idx);
        self.index_to_variable.push(variable.to_string());
        self.edges.push(BTreeSet::new());
        idx
    }

    fn add_edge(&mut self, first: &str, second: &str) {
        let first_idx = self.get_index(first);
        let second_idx = self.get_index(second);
        // Both ends are now nodes even when they coincide.
        if first_idx == second_idx {
            return;
        }
        self.edges[first_idx].insert(second_idx);
        self.edges[second_idx].insert(first_idx);
    }
}

#[derive(Debug)]
pub struct RegisterAllocation {
    pub registers: FxHashMap<String, usize>,
    pub spills: FxHashMap<String, i32>,
    pub liveness: DataFlowResult<LiveSet>,
    next_offset: i32,
}

impl RegisterAllocation {
    fn spill_variable(&mut self, variable: &str) {
        self.spills.insert(variable.to_string(), self.next_offset);
        self.next_offset -= 4;
    }

    pub fn in_register(&self, variable: &str) -> bool {
        self.registers.contains_key(variable)
    }

    pub fn is_spilled(&self, variable: &str) -> bool {
        self.spills.contains_key(variable)
    }

    pub fn get_register(&self, variable: &str) -> usize {
        *self
            .registers
            .get(variable)
            .unwrap_or_else(|| panic!("variable {variable} is not in a register"))
    }

    pub fn get_offset(&self, variable: &str) -> i32 {
        *self
            .spills
            .get(variable)
            .unwrap_or_else(|| panic!("variable {variable} is not spilled"))
    }

    pub fn get_location(&self, variable: &str) -> VariableLocation {
        if let Some(&register) = self.registers.get(variable) {
            VariableLocation::Register(register)
        } else {
            VariableLocation::Memory(self.get_offset(variable))
        }
    }

    pub fn num_spilled(&self) -> usize {
        self.spills.len()
    }
}

pub fn allocate_registers(
    function: &ControlFlowGraph,
    available_registers: &[usize],
) -> RegisterAllocation {
    let liveness_data = liveness(function);
    let graph = RegisterInterferenceGraph::new(function, &liveness_data);

    let mut result = RegisterAllocation {
        registers: FxHashMap::default(),
        spills: FxHashMap::default(),
        liveness: liveness_data,
        next_offset: 0,
    };

    // Address-taken variables always live in memory; they leave the graph
    // before coloring and their neighbors' degrees shrink accordingly.
    let mut addressed: FxHashSet<usize> = FxHashSet::default();
    function.for_each_instruction(|instruction| {
        if instruction.opcode == Opcode::AddressOf {
            if let Some(&idx) = graph.variable_to_index.get(&instruction.arguments[0]) {
                addressed.insert(idx);
            }
        }
    });
    let mut edges = graph.edges.clone();
    for &node in &addressed {
        for neighbor in edges[node].clone() {
            edges[neighbor].remove(&node);
        }
        edges[node].clear();
    }
    // Spill in a stable order.
    let mut addressed: Vec<usize> = addressed.into_iter().collect();
    addressed.sort_unstable();
    for node in &addressed {
        result.spill_variable(&graph.index_to_variable[*node]);
    }
    let addressed: FxHashSet<usize> = addressed.into_iter().collect();

    // Simplify: repeatedly take the lowest-degree remaining node.
    let mut queue: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();
    for idx in 0..graph.index_to_variable.len() {
        if !addressed.contains(&idx) {
            queue.push(Reverse((edges[idx].len(), idx)));
        }
    }
    let mut node_stack: Vec<usize> = Vec::new();
    let mut processed: FxHashSet<usize> = FxHashSet::default();
    while let Some(Reverse((_, node))) = queue.pop() {
        if !processed.insert(node) {
            continue;
        }
        node_stack.push(node);
        for neighbor in std::mem::take(&mut edges[node]) {
            edges[neighbor].remove(&node);
            queue.push(Reverse((edges[neighbor].len(), neighbor)));
        }
    }

    // Select: color in reverse removal order against the original edges.
    for &node in node_stack.iter().rev() {
        let variable = &graph.index_to_variable[node];
        let mut available: BTreeSet<usize> = available_registers.iter().copied().collect();
        for &neighbor in &graph.edges[node] {
            if let Some(&register) = result.registers.get(&graph.index_to_variable[neighbor]) {
                available.remove(&register);
            }
        }
        match available.first() {
            Some(&register) => {
                result.registers.insert(variable.clone(), register);
            }
            None => result.spill_variable(variable),
        }
    }

    result
}
