//! The call graph and function inlining.
//!
//! Strongly connected components of the call graph come from Tarjan's
//! algorithm; they are produced callees-first, so walking them in order lets
//! each component inline the (already optimized) functions it calls from
//! other components. A candidate is small — under 10 instructions or under 5
//! blocks — and neither self-recursive nor inside the caller's component.

use std::collections::BTreeSet;

use log::debug;

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::cfg::Program;
use crate::ir::ir::{Instruction, Opcode};
use crate::passes::run_optimization_passes;

#[derive(Debug)]
pub struct CallGraph {
    pub graph: FxHashMap<String, BTreeSet<String>>,
    pub components: Vec<BTreeSet<String>>,
    pub function_to_component: FxHashMap<String, usize>,
    /// Edges between components: caller component to callee component.
    pub component_graph: Vec<FxHashSet<usize>>,
}

impl CallGraph {
    pub fn new(program: &Program) -> Self {
        let mut graph: FxHashMap<String, BTreeSet<String>> = FxHashMap::default();
        for (name, function) in &program.functions {
            let edges = graph.entry(name.clone()).or_default();
            let mut called = BTreeSet::new();
            function.for_each_instruction(|instruction| {
                if instruction.opcode == Opcode::Call {
                    called.insert(instruction.funcs[0].clone());
                }
            });
            edges.extend(called);
        }

        let mut tarjan = Tarjan {
            graph: &graph,
            next_index: 0,
            indices: FxHashMap::default(),
            low_links: FxHashMap::default(),
            stack: Vec::new(),
            on_stack: FxHashSet::default(),
            components: Vec::new(),
            function_to_component: FxHashMap::default(),
        };
        // Deterministic root order.
        for node in program.functions.keys() {
            if !tarjan.indices.contains_key(node) {
                tarjan.visit(node);
            }
        }
        let Tarjan { components, function_to_component, .. } = tarjan;

        let mut component_graph: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); components.len()];
        for (node, edges) in &graph {
            let component = function_to_component[node];
            for next in edges {
                let next_component = function_to_component[next];
                if component != next_component {
                    component_graph[component].insert(next_component);
                }
            }
        }

        Self { graph, components, function_to_component, component_graph }
    }

    pub fn is_self_recursive(&self, name: &str) -> bool {
        self.graph.get(name).is_some_and(|edges| edges.contains(name))
    }
}

struct Tarjan<'g> {
    graph: &'g FxHashMap<String, BTreeSet<String>>,
    next_index: usize,
    indices: FxHashMap<String, usize>,
    low_links: FxHashMap<String, usize>,
    stack: Vec<String>,
    on_stack: FxHashSet<String>,
    components: Vec<BTreeSet<String>>,
    function_to_component: FxHashMap<String, usize>,
}

impl Tarjan<'_> {
    fn visit(&mut self, node: &str) {
        self.stack.push(node.to_string());
        self.on_stack.insert(node.to_string());
        self.indices.insert(node.to_string(), self.next_index);
        self.low_links.insert(node.to_string(), self.next_index);
        self.next_index += 1;

        let graph = self.graph;
        for next in &graph[node] {
            if !self.indices.contains_key(next) {
                self.visit(next);
            }
            if self.on_stack.contains(next) {
                let low = self.low_links[node].min(self.low_links[next]);
                self.low_links.insert(node.to_string(), low);
            }
        }

        if self.indices[node] == self.low_links[node] {
            let mut component = BTreeSet::new();
            loop {
                let top = self.stack.pop().unwrap();
                self.on_stack.remove(&top);
                self.function_to_component.insert(top.clone(), self.components.len());
                let done = top == node;
                component.insert(top);
                if done {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/// Splice one call to `callee_name` inside `caller_name` into the caller.
/// Returns false when the caller has no such call or the callee's shape is
/// not supported (multiple exits).
pub fn inline_function_call(program: &mut Program, caller_name: &str, callee_name: &str) -> bool {
    assert_ne!(caller_name, callee_name, "cannot inline a function into itself");

    // Find a call site.
    let caller = program.get_function(caller_name);
    let mut site = None;
    'search: for label in &caller.block_labels {
        for (idx, instruction) in caller.get_block(label).instructions.iter().enumerate() {
            if instruction.opcode == Opcode::Call && instruction.funcs[0] == callee_name {
                site = Some((label.clone(), idx));
                break 'search;
            }
        }
    }
    let Some((block_label, instruction_idx)) = site else {
        return false;
    };

    // The callee must start with its entry block and end with its single
    // exit block; anything else is left un-inlined.
    let callee = program.get_function(callee_name).clone();
    if callee.block_labels.first() != Some(&callee.entry_label) {
        return false;
    }
    if callee.exiting_blocks.len() != 1
        || callee.block_labels.last() != Some(callee.exiting_blocks.iter().next().unwrap())
    {
        return false;
    }
    let mut return_variable = None;
    let mut multiple_returns = false;
    callee.for_each_instruction(|instruction| {
        if instruction.opcode == Opcode::Ret {
            multiple_returns |= return_variable.is_some();
            return_variable = Some(instruction.arguments[0].clone());
        }
    });
    let Some(return_variable) = return_variable else {
        return false;
    };
    if multiple_returns {
        return false;
    }

    debug!("inlining a call to {callee_name} into {caller_name}");

    let caller = program.get_function_mut(caller_name);
    let call = caller.get_block(&block_label).instructions[instruction_idx].clone();
    assert_eq!(
        call.arguments.len(),
        callee.parameters.len(),
        "call to {callee_name} has the wrong number of arguments"
    );

    let exit_label =
        caller.split_block(&block_label, instruction_idx, &format!("{callee_name}InlineExit"));
    let entry_label = caller.get_fresh_label(&format!("{callee_name}InlineEntry"));

    // Fresh names for everything the callee defines, avoiding both sides.
    let mut current_variables: FxHashSet<String> = FxHashSet::default();
    let mut current_labels: FxHashSet<String> = FxHashSet::default();
    current_labels.insert(entry_label.clone());
    for function in [&*caller, &callee] {
        for parameter in &function.parameters {
            current_variables.insert(parameter.name.clone());
        }
        function.for_each_instruction(|instruction| {
            current_variables.extend(instruction.arguments.iter().cloned());
            current_variables.extend(instruction.destination.iter().cloned());
            current_labels.extend(instruction.labels.iter().cloned());
        });
    }

    let mut renamed_variables: FxHashMap<String, String> = FxHashMap::default();
    let mut renamed_labels: FxHashMap<String, String> = FxHashMap::default();
    renamed_labels.insert(callee.entry_label.clone(), entry_label.clone());

    let mut rename_variable = |name: &str| -> String {
        if let Some(renamed) = renamed_variables.get(name) {
            return renamed.clone();
        }
        for idx in 0.. {
            let candidate = format!("{name}.{idx}");
            if current_variables.insert(candidate.clone()) {
                renamed_variables.insert(name.to_string(), candidate.clone());
                return candidate;
            }
        }
        unreachable!()
    };
    let mut rename_label = |name: &str| -> String {
        if let Some(renamed) = renamed_labels.get(name) {
            return renamed.clone();
        }
        for idx in 0.. {
            let candidate = format!("{name}{idx}");
            if current_labels.insert(candidate.clone()) {
                renamed_labels.insert(name.to_string(), candidate.clone());
                return candidate;
            }
        }
        unreachable!()
    };

    // Marshal arguments into the callee's (renamed) parameters, replacing
    // the jump the split left behind.
    let call_block = caller.get_block_mut(&block_label);
    call_block.instructions.pop();
    for (parameter, argument) in callee.parameters.iter().zip(&call.arguments) {
        call_block.instructions.push(Instruction::id(
            rename_variable(&parameter.name),
            argument.clone(),
            parameter.ty,
        ));
    }
    call_block.instructions.push(Instruction::jmp(entry_label));

    // Copy the callee's blocks in, renamed, just before the continuation.
    let mut insert_at = caller
        .block_labels
        .iter()
        .position(|label| *label == exit_label)
        .expect("split created the exit block");
    for callee_label in &callee.block_labels {
        let mut block = callee.get_block(callee_label).clone();
        block.entry_label = rename_label(callee_label);
        for instruction in &mut block.instructions {
            for argument in &mut instruction.arguments {
                *argument = rename_variable(argument);
            }
            for label in &mut instruction.labels {
                *label = rename_label(label);
            }
            if let Some(destination) = &instruction.destination {
                instruction.destination = Some(rename_variable(destination));
            }
        }
        if block.instructions.last().unwrap().opcode == Opcode::Ret {
            *block.instructions.last_mut().unwrap() = Instruction::jmp(exit_label.clone());
        }
        caller.block_labels.insert(insert_at, block.entry_label.clone());
        caller.blocks.insert(block.entry_label.clone(), block);
        insert_at += 1;
    }

    // The continuation starts with the old call; it becomes a copy of the
    // callee's (renamed) return value.
    let renamed_return = renamed_variables
        .get(&return_variable)
        .expect("return variable was renamed with the callee body")
        .clone();
    let exit_block = caller.get_block_mut(&exit_label);
    let call_instruction = &mut exit_block.instructions[1];
    assert!(
        call_instruction.opcode == Opcode::Call && call_instruction.funcs[0] == callee_name,
        "continuation block must begin with the inlined call"
    );
    *call_instruction = Instruction::id(
        call.destination.clone().unwrap(),
        renamed_return,
        callee.return_type,
    );

    caller.is_graph_dirty = true;
    caller.recompute_graph();
    true
}

/// Walk the call-graph components, inlining small out-of-component callees
/// and re-running the optimization driver between rounds.
pub fn optimize_call_graph(program: &mut Program) -> usize {
    let mut removed = 0;
    let call_graph = CallGraph::new(program);

    let should_inline = |program: &Program, name: &str| {
        let Some(function) = program.functions.get(name) else {
            return false;
        };
        if call_graph.is_self_recursive(name) {
            return false;
        }
        function.num_instructions() < 10 || function.num_blocks() < 5
    };

    for component in 0..call_graph.components.len() {
        let callers = call_graph.components[component].clone();
        let mut to_inline: BTreeSet<String> = BTreeSet::new();
        for &neighbor in &call_graph.component_graph[component] {
            for callee in &call_graph.components[neighbor] {
                if should_inline(program, callee) {
                    to_inline.insert(callee.clone());
                }
            }
        }
        if to_inline.is_empty() {
            continue;
        }

        loop {
            let mut changed = false;
            for callee in &to_inline {
                for caller in &callers {
                    if !program.functions.contains_key(caller)
                        || !program.functions.contains_key(callee)
                    {
                        continue;
                    }
                    changed |= inline_function_call(program, caller, callee);
                }
                removed += run_optimization_passes(program);
            }
            if !changed {
                break;
            }
        }
        removed += run_optimization_passes(program);
    }

    removed
}
