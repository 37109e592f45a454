//! Control-flow graphs over the three-address IR.
//!
//! A function's instruction stream is sliced into basic blocks at labels and
//! jumps. Every block starts with a `label` instruction naming its entry label
//! and ends with exactly one jump (`jmp`, `br`, or `ret`). Back-to-back labels
//! are collapsed to a single canonical label, and a shim block is inserted if
//! the entry block ends up with predecessors, so SSA conversion can always
//! assume an entry with none.
//!
//! Dominator data (dominator sets, immediate dominators, dominance frontiers)
//! is cached on the graph and recomputed lazily whenever a structural edit
//! marks the graph dirty.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::{Function, Instruction, Opcode, Type, Variable};

#[derive(Debug, Clone)]
pub struct Block {
    pub entry_label: String,
    pub instructions: Vec<Instruction>,
    pub incoming_blocks: BTreeSet<String>,
    pub outgoing_blocks: BTreeSet<String>,
}

impl Block {
    /// A block containing only its leading label instruction.
    pub fn with_label(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            entry_label: label.clone(),
            instructions: vec![Instruction::label(label)],
            incoming_blocks: BTreeSet::new(),
            outgoing_blocks: BTreeSet::new(),
        }
    }

    pub fn uses_memory(&self) -> bool {
        self.instructions.iter().any(Instruction::uses_memory)
    }

    pub fn has_loads_or_stores(&self) -> bool {
        self.instructions.iter().any(Instruction::is_load_or_store)
    }

    /// Insert an instruction immediately after the leading label.
    pub fn prepend(&mut self, instruction: Instruction) {
        debug_assert!(matches!(self.instructions.first().map(|i| i.opcode), Some(Opcode::Label)));
        self.instructions.insert(1, instruction);
    }
}

/// Dominator information for one function, derived from the raw dominator
/// sets of the iterative fixpoint.
#[derive(Debug, Clone, Default)]
pub struct DominatorInfo {
    order: Vec<String>,
    dominators: FxHashMap<String, BTreeSet<String>>,
    immediate_dominators: FxHashMap<String, String>,
    dominance_frontiers: FxHashMap<String, BTreeSet<String>>,
}

impl DominatorInfo {
    /// Does every path to `target` pass through `source`?
    pub fn dominates(&self, source: &str, target: &str) -> bool {
        self.dominators.get(target).is_some_and(|set| set.contains(source))
    }

    pub fn strictly_dominates(&self, source: &str, target: &str) -> bool {
        source != target && self.dominates(source, target)
    }

    pub fn immediate_dominator(&self, label: &str) -> Option<&String> {
        self.immediate_dominators.get(label)
    }

    pub fn dominance_frontier(&self, label: &str) -> BTreeSet<String> {
        self.dominance_frontiers.get(label).cloned().unwrap_or_default()
    }

    /// Blocks whose immediate dominator is `label`, in layout order.
    pub fn children(&self, label: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|other| {
                *other != label && self.immediate_dominators.get(*other).map(String::as_str) == Some(label)
            })
            .cloned()
            .collect()
    }

    pub fn dominator_set(&self, label: &str) -> BTreeSet<String> {
        self.dominators.get(label).cloned().unwrap_or_default()
    }
}

/// The control-flow graph of a single procedure.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub name: String,
    pub parameters: Vec<Variable>,
    pub return_type: Type,

    pub blocks: FxHashMap<String, Block>,
    /// Block labels in layout (emission) order.
    pub block_labels: Vec<String>,
    pub entry_label: String,
    pub exiting_blocks: BTreeSet<String>,

    /// Set by any mutation that may change predecessor sets; forces the edges
    /// and dominators to be recomputed before the next use.
    pub is_graph_dirty: bool,
    dominators: Option<DominatorInfo>,
}

impl ControlFlowGraph {
    pub fn new(function: Function) -> Self {
        let Function { name, parameters, return_type, instructions } = function;

        let mut cfg = Self {
            name,
            parameters,
            return_type,
            blocks: FxHashMap::default(),
            block_labels: Vec::new(),
            entry_label: "entry".to_string(),
            exiting_blocks: BTreeSet::new(),
            is_graph_dirty: true,
            dominators: None,
        };

        // Slice the stream into blocks. Labels start blocks (with a
        // synthesized fallthrough jump from the previous block when needed)
        // and jumps end them. Labels that immediately follow another label are
        // merged into it via the canonicalization map.
        let mut canonical: FxHashMap<String, String> = FxHashMap::default();
        canonical.insert(cfg.entry_label.clone(), cfg.entry_label.clone());
        let mut current: Option<Block> = Some(Block::with_label(&cfg.entry_label));
        let mut next_orphan = 0usize;

        for instruction in instructions {
            match instruction.opcode {
                Opcode::Label => {
                    let label = instruction.labels[0].clone();
                    match current.as_mut() {
                        Some(block) if block.instructions.len() == 1 => {
                            // The block holds only its leading label: this
                            // label is an alias for it.
                            canonical.insert(label, block.entry_label.clone());
                        }
                        Some(block) => {
                            block.instructions.push(Instruction::jmp(label.clone()));
                            cfg.push_block(current.take().unwrap());
                            canonical.insert(label.clone(), label.clone());
                            current = Some(Block::with_label(label));
                        }
                        None => {
                            canonical.insert(label.clone(), label.clone());
                            current = Some(Block::with_label(label));
                        }
                    }
                }
                _ if instruction.is_jump() => {
                    let mut block = match current.take() {
                        Some(block) => block,
                        None => {
                            // Code after a jump with no intervening label is
                            // unreachable; give it a block of its own so the
                            // cleanup passes can delete it.
                            let label = format!("orphan{next_orphan}");
                            next_orphan += 1;
                            canonical.insert(label.clone(), label.clone());
                            Block::with_label(label)
                        }
                    };
                    block.instructions.push(instruction);
                    cfg.push_block(block);
                }
                _ => {
                    let block = current.get_or_insert_with(|| {
                        let label = format!("orphan{next_orphan}");
                        next_orphan += 1;
                        canonical.insert(label.clone(), label.clone());
                        Block::with_label(label)
                    });
                    block.instructions.push(instruction);
                }
            }
        }
        if let Some(block) = current.take() {
            assert!(
                block.instructions.len() <= 1 || block.instructions.last().unwrap().is_jump(),
                "function {} does not end in a jump",
                cfg.name
            );
            if block.instructions.len() > 1 {
                cfg.push_block(block);
            }
        }

        // Rewrite every label reference to its canonical form.
        for label in cfg.block_labels.clone() {
            let block = cfg.blocks.get_mut(&label).unwrap();
            for instruction in &mut block.instructions {
                for target in &mut instruction.labels {
                    if let Some(canonical_label) = canonical.get(target) {
                        *target = canonical_label.clone();
                    }
                }
            }
        }

        cfg.compute_edges();

        // A loop at the top of the procedure can give the entry block
        // predecessors, which SSA conversion cannot tolerate. Insert a shim
        // that unconditionally jumps to the old entry.
        if !cfg.get_block(&cfg.entry_label.clone()).incoming_blocks.is_empty() {
            let old_entry = cfg.entry_label.clone();
            let shim_label = cfg.get_fresh_label("entryShim");
            let mut shim = Block::with_label(&shim_label);
            shim.instructions.push(Instruction::jmp(old_entry.clone()));
            cfg.blocks.insert(shim_label.clone(), shim);
            cfg.block_labels.insert(0, shim_label.clone());
            cfg.entry_label = shim_label;
            cfg.compute_edges();
        }

        cfg.is_graph_dirty = true;
        cfg.recompute_graph();
        cfg
    }

    fn push_block(&mut self, block: Block) {
        if block.instructions.is_empty() {
            return;
        }
        self.block_labels.push(block.entry_label.clone());
        self.blocks.insert(block.entry_label.clone(), block);
    }

    pub fn get_block(&self, label: &str) -> &Block {
        self.blocks.get(label).unwrap_or_else(|| panic!("no block with label {label}"))
    }

    pub fn get_block_mut(&mut self, label: &str) -> &mut Block {
        self.blocks.get_mut(label).unwrap_or_else(|| panic!("no block with label {label}"))
    }

    pub fn num_instructions(&self) -> usize {
        self.block_labels.iter().map(|label| self.get_block(label).instructions.len()).sum()
    }

    pub fn num_blocks(&self) -> usize {
        self.block_labels.len()
    }

    pub fn for_each_instruction(&self, mut f: impl FnMut(&Instruction)) {
        for label in &self.block_labels {
            for instruction in &self.get_block(label).instructions {
                f(instruction);
            }
        }
    }

    pub fn for_each_instruction_mut(&mut self, mut f: impl FnMut(&mut Instruction)) {
        for label in self.block_labels.clone() {
            for instruction in &mut self.get_block_mut(&label).instructions {
                f(instruction);
            }
        }
    }

    pub fn uses_memory(&self) -> bool {
        self.block_labels.iter().any(|label| self.get_block(label).uses_memory())
    }

    /// Every variable is defined at most once, counting parameters.
    pub fn is_in_ssa_form(&self) -> bool {
        let mut seen: FxHashSet<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        for label in &self.block_labels {
            for instruction in &self.get_block(label).instructions {
                if let Some(destination) = &instruction.destination {
                    if !seen.insert(destination) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// A label unused by any block or instruction, formed from the hint plus
    /// a numeric suffix.
    pub fn get_fresh_label(&self, hint: &str) -> String {
        let mut used: FxHashSet<String> = self.block_labels.iter().cloned().collect();
        for label in &self.block_labels {
            for instruction in &self.get_block(label).instructions {
                used.extend(instruction.labels.iter().cloned());
            }
        }
        for idx in 0.. {
            let candidate = format!("{hint}{idx}");
            if !used.contains(&candidate) {
                return candidate;
            }
        }
        unreachable!()
    }

    fn add_edge(&mut self, source: &str, target: &str) {
        assert!(self.blocks.contains_key(target), "jump target {target} has no block");
        self.get_block_mut(source).outgoing_blocks.insert(target.to_string());
        self.get_block_mut(target).incoming_blocks.insert(source.to_string());
    }

    /// Rebuild predecessor/successor sets and the exit set from the jump
    /// instructions.
    pub fn compute_edges(&mut self) {
        self.exiting_blocks.clear();
        for label in self.block_labels.clone() {
            let block = self.get_block_mut(&label);
            block.incoming_blocks.clear();
            block.outgoing_blocks.clear();
        }
        for label in self.block_labels.clone() {
            let jumps: Vec<Instruction> = self
                .get_block(&label)
                .instructions
                .iter()
                .filter(|instruction| instruction.is_jump())
                .cloned()
                .collect();
            for jump in jumps {
                for target in &jump.labels {
                    self.add_edge(&label, target);
                }
                if jump.opcode == Opcode::Ret {
                    self.exiting_blocks.insert(label.clone());
                }
            }
        }
    }

    /// Recompute edges and dominators if a structural edit happened.
    pub fn recompute_graph(&mut self) {
        if !self.is_graph_dirty && self.dominators.is_some() {
            return;
        }
        self.compute_edges();
        self.dominators = Some(self.compute_dominators());
        self.is_graph_dirty = false;
    }

    pub fn dominator_info(&mut self) -> DominatorInfo {
        self.recompute_graph();
        self.dominators.clone().expect("dominators computed by recompute_graph")
    }

    /// Iterative forward dataflow: dom(entry) = {entry}, dom(b) starts at the
    /// full label set and shrinks to {b} ∪ ⋂ dom(pred).
    fn compute_dominators(&self) -> DominatorInfo {
        let all_labels: BTreeSet<String> = self.block_labels.iter().cloned().collect();
        let mut dominators: FxHashMap<String, BTreeSet<String>> = FxHashMap::default();
        for label in &self.block_labels {
            if *label == self.entry_label {
                dominators.insert(label.clone(), BTreeSet::from([label.clone()]));
            } else {
                dominators.insert(label.clone(), all_labels.clone());
            }
        }

        loop {
            let mut changed = false;
            for label in &self.block_labels {
                if *label == self.entry_label {
                    continue;
                }
                let mut new_set: Option<BTreeSet<String>> = None;
                for pred in &self.get_block(label).incoming_blocks {
                    let pred_set = &dominators[pred];
                    new_set = Some(match new_set {
                        None => pred_set.clone(),
                        Some(set) => set.intersection(pred_set).cloned().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_else(|| all_labels.clone());
                new_set.insert(label.clone());
                if new_set != dominators[label] {
                    dominators.insert(label.clone(), new_set);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let dominates = |source: &str, target: &str| dominators[target].contains(source);
        let strictly = |source: &str, target: &str| source != target && dominates(source, target);

        let mut immediate_dominators: FxHashMap<String, String> = FxHashMap::default();
        let mut dominance_frontiers: FxHashMap<String, BTreeSet<String>> = FxHashMap::default();
        for target in &self.block_labels {
            for source in &self.block_labels {
                // source immediately dominates target when no third block
                // sits strictly between them.
                if strictly(source, target)
                    && !self
                        .block_labels
                        .iter()
                        .any(|mid| strictly(source, mid) && strictly(mid, target))
                {
                    immediate_dominators.insert(target.clone(), source.clone());
                }
                // target is in source's frontier when source reaches a
                // predecessor of target but not target itself.
                if !dominates(source, target)
                    && self
                        .get_block(target)
                        .incoming_blocks
                        .iter()
                        .any(|pred| dominates(source, pred))
                {
                    dominance_frontiers.entry(source.clone()).or_default().insert(target.clone());
                }
            }
        }

        DominatorInfo {
            order: self.block_labels.clone(),
            dominators,
            immediate_dominators,
            dominance_frontiers,
        }
    }

    /// Remove a block with no predecessors. Phi instructions elsewhere lose
    /// their slot for this block.
    pub fn remove_block(&mut self, block_label: &str) {
        debug!("removing block {block_label} from {}", self.name);
        assert!(self.blocks.contains_key(block_label), "no block with label {block_label}");
        assert!(
            self.get_block(block_label).incoming_blocks.is_empty(),
            "cannot remove block {block_label} with incoming edges"
        );

        for label in self.block_labels.clone() {
            if label == block_label {
                continue;
            }
            for instruction in &mut self.get_block_mut(&label).instructions {
                if instruction.is_jump() {
                    assert!(
                        instruction.labels.iter().all(|target| target != block_label),
                        "cannot remove block {block_label}: it is a jump target"
                    );
                }
                if instruction.opcode == Opcode::Phi {
                    while let Some(idx) =
                        instruction.labels.iter().position(|label| label == block_label)
                    {
                        instruction.labels.remove(idx);
                        instruction.arguments.remove(idx);
                    }
                }
            }
        }

        let block = self.blocks.remove(block_label).unwrap();
        for outgoing in &block.outgoing_blocks {
            if let Some(successor) = self.blocks.get_mut(outgoing) {
                successor.incoming_blocks.remove(block_label);
            }
        }
        self.block_labels.retain(|label| label != block_label);
        self.exiting_blocks.remove(block_label);
        self.is_graph_dirty = true;
    }

    /// Merge `target` into `source`. Requires the unique-successor /
    /// unique-predecessor relationship; any phi in `target` must have exactly
    /// its one `source` entry and becomes a copy.
    pub fn combine_blocks(&mut self, source: &str, target: &str) {
        debug!("combining blocks {source} and {target} in {}", self.name);
        assert!(
            self.get_block(source).outgoing_blocks.len() == 1
                && self.get_block(source).outgoing_blocks.contains(target),
            "source block {source} must have {target} as its only successor"
        );
        assert!(
            self.get_block(target).incoming_blocks.len() == 1
                && self.get_block(target).incoming_blocks.contains(source),
            "target block {target} must have {source} as its only predecessor"
        );

        let target_block = self.blocks.remove(target).unwrap();
        let source_block = self.get_block_mut(source);

        let last = source_block.instructions.pop().expect("source block cannot be empty");
        assert!(
            last.opcode == Opcode::Jmp && last.labels[0] == target,
            "source block {source} must end with a jump to {target}"
        );

        for instruction in target_block.instructions {
            match instruction.opcode {
                Opcode::Label => continue,
                Opcode::Phi => {
                    assert_eq!(
                        instruction.labels,
                        vec![source.to_string()],
                        "phi in combined block must only name its predecessor"
                    );
                    let destination = instruction.destination.clone().unwrap();
                    source_block.instructions.push(Instruction::id(
                        destination,
                        instruction.arguments[0].clone(),
                        instruction.ty,
                    ));
                }
                _ => source_block.instructions.push(instruction),
            }
        }

        // Successors now receive control from `source`; their phi slots must
        // follow the edge.
        for successor in &target_block.outgoing_blocks {
            if let Some(block) = self.blocks.get_mut(successor) {
                for instruction in &mut block.instructions {
                    if instruction.opcode == Opcode::Phi {
                        for label in &mut instruction.labels {
                            if label == target {
                                *label = source.to_string();
                            }
                        }
                    }
                }
            }
        }

        if self.exiting_blocks.remove(target) {
            self.exiting_blocks.insert(source.to_string());
        }
        self.block_labels.retain(|label| label != target);
        self.is_graph_dirty = true;
        self.recompute_graph();
    }

    /// Split `block_label` so that the instruction at `instruction_idx`
    /// becomes the first real instruction of a fresh block; the original
    /// block ends with a jump to it. Returns the new block's label.
    pub fn split_block(&mut self, block_label: &str, instruction_idx: usize, label_hint: &str) -> String {
        let new_label = self.get_fresh_label(label_hint);
        let block = self.get_block_mut(block_label);
        assert!(
            instruction_idx < block.instructions.len(),
            "cannot split {block_label} beyond its last instruction"
        );

        let tail: Vec<Instruction> = block.instructions.split_off(instruction_idx);
        debug_assert!(
            tail.iter().all(|instruction| instruction.opcode != Opcode::Phi),
            "cannot split a block through its phi prefix"
        );
        block.instructions.push(Instruction::jmp(new_label.clone()));

        let mut new_block = Block::with_label(&new_label);
        new_block.instructions.extend(tail);

        // The tail's jump now leaves from the new block; phi slots in its
        // targets must follow.
        let moved_targets: Vec<String> = new_block
            .instructions
            .iter()
            .filter(|instruction| instruction.is_jump())
            .flat_map(|instruction| instruction.labels.iter().cloned())
            .collect();
        for target in moved_targets {
            if let Some(target_block) = self.blocks.get_mut(&target) {
                for instruction in &mut target_block.instructions {
                    if instruction.opcode == Opcode::Phi {
                        for label in &mut instruction.labels {
                            if label == block_label {
                                *label = new_label.clone();
                            }
                        }
                    }
                }
            }
        }
        self.blocks.insert(new_label.clone(), new_block);

        let position = self
            .block_labels
            .iter()
            .position(|label| label == block_label)
            .expect("split source must be in the layout order");
        self.block_labels.insert(position + 1, new_label.clone());

        self.is_graph_dirty = true;
        self.recompute_graph();
        new_label
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}(", self.name)?;
        for (idx, parameter) in self.parameters.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{parameter}")?;
        }
        writeln!(f, "): {} {{", self.return_type)?;
        for label in &self.block_labels {
            for instruction in &self.get_block(label).instructions {
                if instruction.opcode == Opcode::Label {
                    writeln!(f, "{instruction}")?;
                } else {
                    writeln!(f, "  {instruction}")?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

/// A whole program: one CFG per procedure, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: BTreeMap<String, ControlFlowGraph>,
}

pub const MAIN_FUNCTION: &str = "wain";

impl Program {
    pub fn wain(&self) -> &ControlFlowGraph {
        self.get_function(MAIN_FUNCTION)
    }

    pub fn get_function(&self, name: &str) -> &ControlFlowGraph {
        self.functions.get(name).unwrap_or_else(|| panic!("function {name} not found"))
    }

    pub fn get_function_mut(&mut self, name: &str) -> &mut ControlFlowGraph {
        self.functions.get_mut(name).unwrap_or_else(|| panic!("function {name} not found"))
    }

    pub fn num_instructions(&self) -> usize {
        self.functions.values().map(ControlFlowGraph::num_instructions).sum()
    }

    /// Heap support is required when anything allocates or frees, or when
    /// `wain` receives an array (the runtime's allocator must be initialized
    /// around it either way).
    pub fn uses_heap(&self) -> bool {
        let mut found = false;
        for function in self.functions.values() {
            function.for_each_instruction(|instruction| {
                found |= matches!(instruction.opcode, Opcode::Alloc | Opcode::Free);
            });
        }
        found || self.wain().parameters[0].ty == Type::IntStar
    }

    pub fn uses_print(&self) -> bool {
        let mut found = false;
        for function in self.functions.values() {
            function.for_each_instruction(|instruction| {
                found |= instruction.opcode == Opcode::Print;
            });
        }
        found
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in self.functions.values() {
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond_function() -> Function {
        // entry: br c, thenLbl, elseLbl; then/else jmp join; join: ret x
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
        function
    }

    #[test]
    fn test_block_slicing_and_edges() {
        let cfg = ControlFlowGraph::new(diamond_function());
        assert_eq!(cfg.block_labels, vec!["entry", "thenLbl", "elseLbl", "joinLbl"]);
        assert_eq!(cfg.entry_label, "entry");
        assert!(cfg.get_block("entry").incoming_blocks.is_empty());
        assert_eq!(
            cfg.get_block("joinLbl").incoming_blocks,
            BTreeSet::from(["thenLbl".to_string(), "elseLbl".to_string()])
        );
        assert_eq!(cfg.exiting_blocks, BTreeSet::from(["joinLbl".to_string()]));

        // Symmetry: successors and predecessors agree.
        for label in &cfg.block_labels {
            for successor in &cfg.get_block(label).outgoing_blocks {
                assert!(cfg.get_block(successor).incoming_blocks.contains(label));
            }
            for predecessor in &cfg.get_block(label).incoming_blocks {
                assert!(cfg.get_block(predecessor).outgoing_blocks.contains(label));
            }
        }
    }

    #[test]
    fn test_dominators_diamond() {
        let mut cfg = ControlFlowGraph::new(diamond_function());
        let info = cfg.dominator_info();
        assert!(info.dominates("entry", "joinLbl"));
        assert!(!info.dominates("thenLbl", "joinLbl"));
        assert_eq!(info.immediate_dominator("joinLbl"), Some(&"entry".to_string()));
        assert_eq!(info.immediate_dominator("thenLbl"), Some(&"entry".to_string()));
        assert_eq!(info.immediate_dominator("entry"), None);
        assert_eq!(info.dominance_frontier("thenLbl"), BTreeSet::from(["joinLbl".to_string()]));
        assert_eq!(info.dominance_frontier("elseLbl"), BTreeSet::from(["joinLbl".to_string()]));
        assert!(info.dominance_frontier("entry").is_empty());
    }

    #[test]
    fn test_dominator_edge_property() {
        // For every edge (p, q): dom(p) ⊆ dom(q) ∪ {q}.
        let mut cfg = ControlFlowGraph::new(diamond_function());
        let info = cfg.dominator_info();
        for p in &cfg.block_labels {
            for q in &cfg.get_block(p).outgoing_blocks {
                let mut allowed = info.dominator_set(q);
                allowed.insert(q.clone());
                for dominator in info.dominator_set(p) {
                    assert!(allowed.contains(&dominator), "dom({p}) ⊄ dom({q}) ∪ {{{q}}}");
                }
            }
        }
    }

    #[test]
    fn test_redundant_labels_collapse() {
        let mut function = Function::new("f", vec![], Type::Int);
        function.instructions = vec![
            Instruction::jmp("b"),
            Instruction::label("a"),
            Instruction::label("b"),
            Instruction::constant("x", 0, Type::Int),
            Instruction::ret("x"),
        ];
        let cfg = ControlFlowGraph::new(function);
        // "b" collapsed into "a"; the jump was rewritten.
        assert_eq!(cfg.block_labels, vec!["entry", "a"]);
        let entry = cfg.get_block("entry");
        assert_eq!(entry.instructions.last().unwrap().labels[0], "a");
    }

    #[test]
    fn test_entry_shim_inserted_for_looping_entry() {
        // A while loop as the very first statement makes the first label an
        // alias of the entry block, so the loop's back edge targets the entry.
        let mut function = Function::new("f", vec![Variable::new("n", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::label("loop"),
            Instruction::lt("c", "n", "n"),
            Instruction::br("c", "body", "done"),
            Instruction::label("body"),
            Instruction::jmp("loop"),
            Instruction::label("done"),
            Instruction::ret("n"),
        ];
        let cfg = ControlFlowGraph::new(function);
        assert!(cfg.get_block(&cfg.entry_label).incoming_blocks.is_empty());
        assert_eq!(cfg.block_labels[0], cfg.entry_label);
        assert_ne!(cfg.entry_label, "entry");
    }

    #[test]
    fn test_split_block() {
        let mut cfg = ControlFlowGraph::new(diamond_function());
        let new_label = cfg.split_block("thenLbl", 1, "tail");
        let then_block = cfg.get_block("thenLbl");
        assert_eq!(then_block.instructions.len(), 2);
        assert_eq!(then_block.instructions[1].opcode, Opcode::Jmp);
        let tail_block = cfg.get_block(&new_label);
        assert_eq!(tail_block.instructions[0].opcode, Opcode::Label);
        assert_eq!(tail_block.instructions.last().unwrap().labels[0], "joinLbl");
        let position = cfg.block_labels.iter().position(|l| l == &new_label).unwrap();
        assert_eq!(cfg.block_labels[position - 1], "thenLbl");
    }

    #[test]
    fn test_combine_blocks() {
        let mut function = Function::new("f", vec![], Type::Int);
        function.instructions = vec![
            Instruction::constant("x", 1, Type::Int),
            Instruction::jmp("next"),
            Instruction::label("next"),
            Instruction::add("y", "x", "x"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.combine_blocks("entry", "next");
        assert_eq!(cfg.block_labels, vec!["entry"]);
        assert!(cfg.exiting_blocks.contains("entry"));
        let block = cfg.get_block("entry");
        assert_eq!(block.instructions.last().unwrap().opcode, Opcode::Ret);
        assert!(!block.instructions.iter().any(|i| i.opcode == Opcode::Jmp));
    }

    #[test]
    fn test_remove_block_updates_phis() {
        let mut function = Function::new("f", vec![Variable::new("c", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::br("c", "left", "join"),
            Instruction::label("left"),
            Instruction::jmp("join"),
            Instruction::label("join"),
            Instruction::ret("c"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        // Pretend an optimization rewired entry straight to join.
        cfg.get_block_mut("entry").instructions.pop();
        cfg.get_block_mut("entry").instructions.push(Instruction::jmp("join"));
        cfg.get_block_mut("join").prepend(Instruction::phi(
            "x",
            Type::Int,
            vec!["a".into(), "b".into()],
            vec!["entry".into(), "left".into()],
        ));
        cfg.is_graph_dirty = true;
        cfg.recompute_graph();
        cfg.remove_block("left");
        let phi = &cfg.get_block("join").instructions[1];
        assert_eq!(phi.opcode, Opcode::Phi);
        assert_eq!(phi.labels, vec!["entry".to_string()]);
        assert_eq!(phi.arguments, vec!["a".to_string()]);
    }
}
