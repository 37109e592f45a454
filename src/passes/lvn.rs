//! Local value numbering.
//!
//! Within a single block (skipping blocks that load or store), every computed
//! value receives a number. Instructions whose canonical form is already in
//! the table collapse to copies, constants fold, and the usual algebraic
//! identities apply. Commutative operations sort their operand numbers and
//! `gt`/`ge` rewrite to `lt`/`le` with swapped operands so syntactically
//! different but equal expressions share a row.
//!
//! Destinations that are overwritten later in the block are renamed to fresh
//! `lvnN.name` variables so earlier rows stay valid; rows whose canonical
//! variable is overwritten under its original name are tombstoned instead of
//! being allowed to serve stale replacements.

use log::debug;

use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::ir::{Instruction, Opcode, Type};

#[derive(Debug, Clone, PartialEq)]
enum LocalValue {
    Const { value: i64, ty: Type },
    Op { opcode: Opcode, arguments: Vec<usize>, ty: Type },
}

impl LocalValue {
    /// Build the canonical form for an operation.
    fn op(opcode: Opcode, mut arguments: Vec<usize>, ty: Type) -> Self {
        let mut opcode = opcode;
        match opcode {
            Opcode::Add | Opcode::Mul | Opcode::Eq | Opcode::Ne => arguments.sort_unstable(),
            Opcode::Gt => {
                opcode = Opcode::Lt;
                arguments.swap(0, 1);
            }
            Opcode::Ge => {
                opcode = Opcode::Le;
                arguments.swap(0, 1);
            }
            _ => {}
        }
        LocalValue::Op { opcode, arguments, ty }
    }

    fn as_const(&self) -> Option<i64> {
        match self {
            LocalValue::Const { value, .. } => Some(*value),
            LocalValue::Op { .. } => None,
        }
    }
}

enum Folded {
    Constant(i64),
    Row(usize),
}

#[derive(Default)]
struct LocalValueTable {
    values: Vec<LocalValue>,
    canonical_variables: Vec<String>,
    /// A tombstoned row no longer matches queries and cannot canonicalize
    /// arguments: its variable has been overwritten.
    invalidated: Vec<bool>,
    env: FxHashMap<String, usize>,
    last_write: FxHashMap<String, usize>,
}

impl LocalValueTable {
    fn push_row(&mut self, value: LocalValue, variable: String) -> usize {
        let idx = self.values.len();
        self.values.push(value);
        self.canonical_variables.push(variable.clone());
        self.invalidated.push(false);
        self.env.insert(variable, idx);
        idx
    }

    fn insert_axiom(&mut self, variable: &str, ty: Type) {
        let idx = self.values.len();
        self.push_row(LocalValue::Op { opcode: Opcode::Id, arguments: vec![idx], ty }, variable.to_string());
    }

    fn query_row(&self, value: &LocalValue) -> Option<usize> {
        if let LocalValue::Op { opcode: Opcode::Id, arguments, .. } = value {
            return Some(arguments[0]);
        }
        self.values
            .iter()
            .enumerate()
            .position(|(idx, row)| !self.invalidated[idx] && row == value)
    }

    fn row(&self, variable: &str) -> usize {
        *self
            .env
            .get(variable)
            .unwrap_or_else(|| panic!("variable {variable} was not present in the table"))
    }

    /// The name currently holding a row's value; a tombstoned row keeps the
    /// variable as written.
    fn canonical_name(&self, variable: &str) -> String {
        let idx = self.row(variable);
        if self.invalidated[idx] {
            variable.to_string()
        } else {
            self.canonical_variables[idx].clone()
        }
    }

    /// Tombstone rows whose canonical variable was just overwritten.
    fn invalidate_rows_for(&mut self, variable: &str, keep: usize) {
        for idx in 0..self.values.len() {
            if idx != keep && self.canonical_variables[idx] == variable {
                self.invalidated[idx] = true;
            }
        }
    }

    /// Constant folding and algebraic simplification over canonical forms.
    fn fold(&self, value: &LocalValue) -> Option<Folded> {
        let LocalValue::Op { opcode, arguments, ty } = value else {
            return None;
        };
        if !matches!(ty, Type::Int | Type::Bool) || arguments.len() != 2 {
            return None;
        }
        let foldable = matches!(
            opcode,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Eq
                | Opcode::Ne
        );
        if !foldable {
            return None;
        }

        let (lhs, rhs) = (arguments[0], arguments[1]);
        let lhs_const = self.values[lhs].as_const();
        let rhs_const = self.values[rhs].as_const();

        if let (Some(a), Some(b)) = (lhs_const, rhs_const) {
            let (a, b) = (a as i32, b as i32);
            let result = match opcode {
                Opcode::Add => a.wrapping_add(b) as i64,
                Opcode::Sub => a.wrapping_sub(b) as i64,
                Opcode::Mul => a.wrapping_mul(b) as i64,
                // Undefined behavior stays unsimplified.
                Opcode::Div if b == 0 => return None,
                Opcode::Div => a.wrapping_div(b) as i64,
                Opcode::Mod if b == 0 => return None,
                Opcode::Mod => a.wrapping_rem(b) as i64,
                Opcode::Lt => (a < b) as i64,
                Opcode::Le => (a <= b) as i64,
                Opcode::Gt => (a > b) as i64,
                Opcode::Ge => (a >= b) as i64,
                Opcode::Eq => (a == b) as i64,
                _ => (a != b) as i64,
            };
            return Some(Folded::Constant(result));
        }

        // f(x, x) for operations where that is a constant.
        if lhs == rhs {
            let result = match opcode {
                Opcode::Sub | Opcode::Mod | Opcode::Lt | Opcode::Gt | Opcode::Ne => 0,
                Opcode::Div | Opcode::Le | Opcode::Ge | Opcode::Eq => 1,
                _ => return None,
            };
            return Some(Folded::Constant(result));
        }

        // One-sided identities.
        match (opcode, lhs_const, rhs_const) {
            (Opcode::Add, Some(0), _) => Some(Folded::Row(rhs)),
            (Opcode::Add, _, Some(0)) => Some(Folded::Row(lhs)),
            (Opcode::Sub, _, Some(0)) => Some(Folded::Row(lhs)),
            (Opcode::Mul, Some(0), _) | (Opcode::Mul, _, Some(0)) => Some(Folded::Constant(0)),
            (Opcode::Mul, Some(1), _) => Some(Folded::Row(rhs)),
            (Opcode::Mul, _, Some(1)) => Some(Folded::Row(lhs)),
            (Opcode::Div, Some(0), _) => Some(Folded::Constant(0)),
            (Opcode::Div, _, Some(1)) => Some(Folded::Row(lhs)),
            (Opcode::Mod, Some(0), _) | (Opcode::Mod, _, Some(1)) => Some(Folded::Constant(0)),
            _ => None,
        }
    }
}

/// The next free index for `lvnN.` fresh names, past any survivor of a
/// previous run.
fn next_fresh_index(function: &ControlFlowGraph) -> usize {
    let mut next = 0;
    function.for_each_instruction(|instruction| {
        if let Some(destination) = &instruction.destination {
            if let Some(rest) = destination.strip_prefix("lvn") {
                if let Some((index, _)) = rest.split_once('.') {
                    if let Ok(index) = index.parse::<usize>() {
                        next = next.max(index + 1);
                    }
                }
            }
        }
    });
    next
}

pub fn local_value_numbering(function: &mut ControlFlowGraph) -> usize {
    function.recompute_graph();
    let mut fresh_idx = next_fresh_index(function);
    let mut dirty = false;

    // When a local's address has escaped, any call may rewrite it behind the
    // table's back; blocks with calls are then off limits too.
    let mut has_escaped_locals = false;
    function.for_each_instruction(|instruction| {
        has_escaped_locals |= instruction.opcode == Opcode::AddressOf;
    });

    for label in function.block_labels.clone() {
        let block = function.get_block(&label);
        if block.has_loads_or_stores() {
            continue;
        }
        if has_escaped_locals
            && block.instructions.iter().any(|instruction| instruction.opcode == Opcode::Call)
        {
            continue;
        }
        run_block(function, &label, &mut fresh_idx, &mut dirty);
    }

    if dirty {
        function.is_graph_dirty = true;
        function.recompute_graph();
    }
    0
}

fn run_block(
    function: &mut ControlFlowGraph,
    label: &str,
    fresh_idx: &mut usize,
    dirty: &mut bool,
) {
    let mut table = LocalValueTable::default();

    // Pre-scan: what is read before it is written, and where each
    // destination is written last.
    let block = function.get_block(label);
    let mut read_before_written: Vec<(String, Type)> = Vec::new();
    let mut types: FxHashMap<String, Type> = FxHashMap::default();
    for (idx, instruction) in block.instructions.iter().enumerate() {
        for argument in &instruction.arguments {
            if !table.last_write.contains_key(argument)
                && !read_before_written.iter().any(|(name, _)| name == argument)
            {
                read_before_written.push((argument.clone(), Type::Int));
            }
        }
        if let Some(destination) = &instruction.destination {
            table.last_write.insert(destination.clone(), idx);
            types.insert(destination.clone(), instruction.ty);
        }
    }
    for (variable, ty) in &mut read_before_written {
        if let Some(known) = types.get(variable) {
            *ty = *known;
        }
    }
    for (variable, ty) in &read_before_written {
        table.insert_axiom(variable, *ty);
    }

    let num_instructions = function.get_block(label).instructions.len();
    for idx in 0..num_instructions {
        let mut instruction = function.get_block(label).instructions[idx].clone();

        // Effect instructions and impure value producers only get their
        // arguments canonicalized; impure destinations become fresh axioms
        // (two allocations are never the same value).
        if instruction.destination.is_none() || !instruction.is_pure() {
            for argument in &mut instruction.arguments {
                *argument = table.canonical_name(argument);
            }
            if let Some(destination) = instruction.destination.clone() {
                table.insert_axiom(&destination, instruction.ty);
            }

            if instruction.opcode == Opcode::Br {
                if instruction.labels[0] == instruction.labels[1] {
                    debug!("lvn: resolving branch with equal targets in {label}");
                    instruction = Instruction::jmp(instruction.labels[0].clone());
                    *dirty = true;
                } else if let LocalValue::Const { value, .. } =
                    &table.values[table.row(&instruction.arguments[0])]
                {
                    let target = instruction.labels[if *value != 0 { 0 } else { 1 }].clone();
                    debug!("lvn: resolving constant branch in {label} to {target}");
                    instruction = Instruction::jmp(target);
                    *dirty = true;
                }
            }

            function.get_block_mut(label).instructions[idx] = instruction;
            continue;
        }

        let destination = instruction.destination.clone().unwrap();
        let value = match instruction.opcode {
            Opcode::Const => LocalValue::Const { value: instruction.value, ty: instruction.ty },
            _ => {
                let arguments = instruction.arguments.iter().map(|a| table.row(a)).collect();
                LocalValue::op(instruction.opcode, arguments, instruction.ty)
            }
        };

        // Already known: reuse the canonical variable (or literal constant).
        if let Some(found) = table.query_row(&value) {
            table.env.insert(destination.clone(), found);
            // A copy of a tombstoned row has no canonical holder left; the
            // original read stands.
            if table.invalidated[found] {
                continue;
            }
            let replacement = match &table.values[found] {
                LocalValue::Const { value, .. } => {
                    Instruction::constant(destination, *value, instruction.ty)
                }
                LocalValue::Op { .. } => Instruction::id(
                    destination,
                    table.canonical_variables[found].clone(),
                    instruction.ty,
                ),
            };
            function.get_block_mut(label).instructions[idx] = replacement;
            continue;
        }

        let overwritten_later = table.last_write.get(&destination).is_some_and(|last| *last > idx);
        let name = if overwritten_later {
            let name = format!("lvn{}.{destination}", *fresh_idx);
            *fresh_idx += 1;
            name
        } else {
            table.invalidate_rows_for(&destination, usize::MAX);
            destination.clone()
        };

        match table.fold(&value) {
            Some(Folded::Constant(constant)) => {
                let row = LocalValue::Const { value: constant, ty: instruction.ty };
                let num = table.push_row(row, name.clone());
                table.env.insert(destination, num);
                function.get_block_mut(label).instructions[idx] =
                    Instruction::constant(name, constant, instruction.ty);
            }
            Some(Folded::Row(row)) if !table.invalidated[row] => {
                table.env.insert(destination.clone(), row);
                function.get_block_mut(label).instructions[idx] = Instruction::id(
                    destination,
                    table.canonical_variables[row].clone(),
                    instruction.ty,
                );
            }
            _ => {
                let num = table.push_row(value, name.clone());
                table.env.insert(destination, num);
                instruction.destination = Some(name);
                for argument in &mut instruction.arguments {
                    *argument = table.canonical_name(argument);
                }
                function.get_block_mut(label).instructions[idx] = instruction;
            }
        }
    }
}
