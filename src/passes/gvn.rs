//! Global value numbering.
//!
//! A dominator-tree walk of a value table over a function in SSA form with no
//! memory instructions. Each block extends the table, rewrites its
//! instructions against it, patches its successors' phi slots, recurses into
//! the blocks it immediately dominates, then rolls the table back so sibling
//! subtrees cannot observe each other's numbering.
//!
//! On top of the local simplifications, the dominator scope enables
//! cross-instruction cancellation: `(a + b) - b` collapses to `a` wherever
//! the addition's row is visible, and a branch whose condition is a known
//! constant becomes a jump.

use log::debug;

use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::{ControlFlowGraph, DominatorInfo};
use crate::ir::ir::{Instruction, Opcode, Type};

#[derive(Debug, Clone, PartialEq)]
enum GvnValue {
    Const { value: i64, ty: Type },
    Op { opcode: Opcode, arguments: Vec<usize>, ty: Type },
}

impl GvnValue {
    fn constant(value: i64, ty: Type) -> Self {
        GvnValue::Const { value, ty }
    }

    fn as_const(&self) -> Option<i64> {
        match self {
            GvnValue::Const { value, .. } => Some(*value),
            GvnValue::Op { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct GvnTable {
    variable_to_value_number: FxHashMap<String, usize>,
    expressions: Vec<GvnValue>,
    canonical_variables: Vec<String>,
}

/// A phi's identity for duplicate detection: its (label, canonical argument)
/// pairs in label order.
#[derive(Debug, Clone, PartialEq)]
struct GvnPhiValue {
    pairs: Vec<(String, String)>,
}

impl GvnPhiValue {
    fn new(arguments: Vec<String>, labels: Vec<String>) -> Self {
        let mut pairs: Vec<(String, String)> = labels.into_iter().zip(arguments).collect();
        pairs.sort();
        Self { pairs }
    }
}

impl GvnTable {
    fn insert_axiom(&mut self, name: &str, ty: Type) {
        let idx = self.expressions.len();
        self.variable_to_value_number.insert(name.to_string(), idx);
        self.expressions.push(GvnValue::Op { opcode: Opcode::Id, arguments: vec![idx], ty });
        self.canonical_variables.push(name.to_string());
    }

    fn query_variable(&self, variable: &str) -> usize {
        *self
            .variable_to_value_number
            .get(variable)
            .unwrap_or_else(|| panic!("variable {variable} not in the value table"))
    }

    fn canonical_name(&self, variable: &str) -> String {
        self.canonical_variables[self.query_variable(variable)].clone()
    }

    fn create_value(&self, instruction: &Instruction) -> GvnValue {
        if instruction.opcode == Opcode::Const {
            return GvnValue::constant(instruction.value, instruction.ty);
        }
        let arguments =
            instruction.arguments.iter().map(|argument| self.query_variable(argument)).collect();
        self.simplify(GvnValue::Op {
            opcode: instruction.opcode,
            arguments,
            ty: instruction.ty,
        })
    }

    /// Constants order before computed rows, so the complexity key pushes a
    /// constant operand to the right-hand side of commutative operations.
    fn complexity_key(&self, idx: usize) -> (usize, usize) {
        let complexity = match self.expressions[idx] {
            GvnValue::Const { .. } => 0,
            GvnValue::Op { .. } => 1,
        };
        (complexity, idx)
    }

    fn simplify(&self, value: GvnValue) -> GvnValue {
        let GvnValue::Op { mut opcode, mut arguments, ty } = value else {
            return value;
        };

        match opcode {
            Opcode::Id => return self.expressions[arguments[0]].clone(),
            Opcode::Phi => {
                let mut unique = arguments.clone();
                unique.sort_unstable();
                unique.dedup();
                if unique.len() == 1 {
                    return self.expressions[unique[0]].clone();
                }
                return GvnValue::Op { opcode, arguments, ty };
            }
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

        if arguments.len() != 2 {
            return GvnValue::Op { opcode, arguments, ty };
        }

        let commutative =
            matches!(opcode, Opcode::Add | Opcode::Mul | Opcode::Eq | Opcode::Ne);
        if commutative && self.complexity_key(arguments[0]) < self.complexity_key(arguments[1]) {
            arguments.swap(0, 1);
        }

        match self.simplify_binary(ty, opcode, arguments[0], arguments[1]) {
            Some(simplified) => simplified,
            None => GvnValue::Op { opcode, arguments, ty },
        }
    }

    fn simplify_binary(
        &self,
        ty: Type,
        opcode: Opcode,
        lhs: usize,
        rhs: usize,
    ) -> Option<GvnValue> {
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

        let lhs_value = &self.expressions[lhs];
        let rhs_value = &self.expressions[rhs];

        if let (Some(a), Some(b)) = (lhs_value.as_const(), rhs_value.as_const()) {
            let (a, b) = (a as i32, b as i32);
            let value = match opcode {
                Opcode::Add => a.wrapping_add(b) as i64,
                Opcode::Sub => a.wrapping_sub(b) as i64,
                Opcode::Mul => a.wrapping_mul(b) as i64,
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
            return Some(GvnValue::constant(value, ty));
        }

        // f(x, x) with a constant result.
        if lhs == rhs {
            let value = match opcode {
                Opcode::Sub | Opcode::Mod | Opcode::Lt | Opcode::Gt | Opcode::Ne => 0,
                Opcode::Div | Opcode::Le | Opcode::Ge | Opcode::Eq => 1,
                _ => return None,
            };
            return Some(GvnValue::constant(value, ty));
        }

        // (a OP b) OP' b collapses to a when OP' undoes OP. Multiplication
        // after division does not qualify: (a / b) * b loses the remainder.
        let inverse = match opcode {
            Opcode::Add => Some(Opcode::Sub),
            Opcode::Sub => Some(Opcode::Add),
            Opcode::Div => Some(Opcode::Mul),
            _ => None,
        };
        if let Some(inverse) = inverse {
            if let GvnValue::Op { opcode: lhs_opcode, arguments, .. } = lhs_value {
                if *lhs_opcode == inverse && arguments[1] == rhs {
                    return Some(self.expressions[arguments[0]].clone());
                }
            }
        }

        // (a * b) % b is zero.
        if opcode == Opcode::Mod {
            if let GvnValue::Op { opcode: Opcode::Mul, arguments, .. } = lhs_value {
                if arguments[1] == rhs {
                    return Some(GvnValue::constant(0, ty));
                }
            }
        }

        if let Some(b) = rhs_value.as_const() {
            match (opcode, b) {
                (Opcode::Add | Opcode::Sub, 0) => return Some(lhs_value.clone()),
                (Opcode::Mul, 0) => return Some(GvnValue::constant(0, ty)),
                (Opcode::Mul | Opcode::Div, 1) => return Some(lhs_value.clone()),
                (Opcode::Mod, 1) => return Some(GvnValue::constant(0, ty)),
                _ => {}
            }
        }

        None
    }

    fn query(&self, value: &GvnValue) -> Option<usize> {
        self.expressions.iter().position(|expression| expression == value)
    }

    fn query_or_insert(&mut self, destination: &str, value: GvnValue) -> (usize, bool) {
        if let Some(idx) = self.query(&value) {
            self.variable_to_value_number.insert(destination.to_string(), idx);
            return (idx, true);
        }
        let idx = self.expressions.len();
        self.expressions.push(value);
        self.canonical_variables.push(destination.to_string());
        self.variable_to_value_number.insert(destination.to_string(), idx);
        (idx, false)
    }

    fn value_to_instruction(&self, destination: String, value: &GvnValue) -> Instruction {
        match value {
            GvnValue::Const { value, ty } => Instruction::constant(destination, *value, *ty),
            GvnValue::Op { opcode, arguments, ty } => Instruction {
                opcode: *opcode,
                ty: *ty,
                destination: Some(destination),
                value: 0,
                arguments: arguments
                    .iter()
                    .map(|&idx| self.canonical_variables[idx].clone())
                    .collect(),
                funcs: vec![],
                labels: vec![],
            },
        }
    }
}

pub fn global_value_numbering(function: &mut ControlFlowGraph) -> usize {
    if function.uses_memory() {
        return 0;
    }
    function.recompute_graph();
    if !function.is_in_ssa_form() {
        return 0;
    }
    let dominators = function.dominator_info();

    let mut table = GvnTable::default();
    for parameter in &function.parameters {
        table.insert_axiom(&parameter.name, parameter.ty);
    }

    let entry = function.entry_label.clone();
    let mut dirty = false;
    process_block(function, &entry, &mut table, &dominators, &mut dirty);

    if dirty {
        function.is_graph_dirty = true;
        function.recompute_graph();
    }
    0
}

fn process_block(
    function: &mut ControlFlowGraph,
    label: &str,
    table: &mut GvnTable,
    dominators: &DominatorInfo,
    dirty: &mut bool,
) {
    let snapshot = table.clone();

    // Phis first: each destination is an axiom (the merge itself is opaque),
    // but a phi whose canonical arguments agree collapses to a copy, and two
    // phis over the same (label, argument) pairs are the same value.
    let mut phi_values: Vec<GvnPhiValue> = Vec::new();
    let mut phi_variables: Vec<String> = Vec::new();
    for idx in 0..function.get_block(label).instructions.len() {
        let instruction = function.get_block(label).instructions[idx].clone();
        if instruction.opcode != Opcode::Phi {
            continue;
        }
        let destination = instruction.destination.clone().unwrap();
        table.insert_axiom(&destination, instruction.ty);

        // Arguments from unvisited blocks (back edges) keep their own names.
        let arguments: Vec<String> = instruction
            .arguments
            .iter()
            .map(|argument| match table.variable_to_value_number.get(argument) {
                Some(&num) => table.canonical_variables[num].clone(),
                None => argument.clone(),
            })
            .collect();

        let mut unique = arguments.clone();
        unique.sort();
        unique.dedup();
        if unique.len() == 1 {
            function.get_block_mut(label).instructions[idx] =
                Instruction::id(destination, unique.pop().unwrap(), instruction.ty);
            continue;
        }

        let value = GvnPhiValue::new(arguments, instruction.labels.clone());
        match phi_values.iter().position(|existing| *existing == value) {
            Some(found) => {
                function.get_block_mut(label).instructions[idx] = Instruction::id(
                    destination,
                    phi_variables[found].clone(),
                    instruction.ty,
                );
            }
            None => {
                phi_values.push(value);
                phi_variables.push(destination);
            }
        }
    }

    for idx in 0..function.get_block(label).instructions.len() {
        let mut instruction = function.get_block(label).instructions[idx].clone();
        if instruction.opcode == Opcode::Phi {
            continue;
        }

        if instruction.opcode == Opcode::Call {
            for argument in &mut instruction.arguments {
                *argument = table.canonical_name(argument);
            }
            let destination = instruction.destination.clone().unwrap();
            table.insert_axiom(&destination, instruction.ty);
            function.get_block_mut(label).instructions[idx] = instruction;
            continue;
        }

        if instruction.destination.is_none() {
            for argument in &mut instruction.arguments {
                *argument = table.canonical_name(argument);
            }

            if instruction.opcode == Opcode::Br {
                let condition = table.query_variable(&instruction.arguments[0]);
                if let Some(value) = table.expressions[condition].as_const() {
                    let target = instruction.labels[if value != 0 { 0 } else { 1 }].clone();
                    debug!("gvn: resolving constant branch in {label} to {target}");
                    instruction = Instruction::jmp(target);
                    *dirty = true;
                }
            }

            function.get_block_mut(label).instructions[idx] = instruction;
            continue;
        }

        let destination = instruction.destination.clone().unwrap();
        let value = table.create_value(&instruction);
        let (value_number, existed) = table.query_or_insert(&destination, value);
        let replacement = if existed {
            Instruction::id(
                destination,
                table.canonical_variables[value_number].clone(),
                instruction.ty,
            )
        } else {
            table.value_to_instruction(destination, &table.expressions[value_number])
        };
        function.get_block_mut(label).instructions[idx] = replacement;
    }

    // Patch this block's slots in successor phis.
    let successors: Vec<String> =
        function.get_block(label).outgoing_blocks.iter().cloned().collect();
    for successor in successors {
        for instruction in &mut function.get_block_mut(&successor).instructions {
            if instruction.opcode != Opcode::Phi {
                continue;
            }
            let Some(idx) = instruction.labels.iter().position(|l| l == label) else {
                continue;
            };
            let argument = instruction.arguments[idx].clone();
            if let Some(&num) = table.variable_to_value_number.get(&argument) {
                instruction.arguments[idx] = table.canonical_variables[num].clone();
            }
        }
    }

    for child in dominators.children(label) {
        process_block(function, &child, table, dominators, dirty);
    }

    *table = snapshot;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::{Function, Variable};

    fn int_params(names: &[&str]) -> Vec<Variable> {
        names.iter().map(|name| Variable::new(*name, Type::Int)).collect()
    }

    #[test]
    fn test_value_visible_across_dominated_blocks() {
        // The add in entry dominates the join; the recomputation collapses.
        let mut function = Function::new("f", int_params(&["a", "b", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::add("x", "a", "b"),
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::add("y", "a", "b"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        global_value_numbering(&mut cfg);
        let join = cfg.get_block("joinLbl");
        let y = &join.instructions[1];
        assert_eq!(y.opcode, Opcode::Id);
        assert_eq!(y.arguments, vec!["x".to_string()]);
    }

    #[test]
    fn test_sibling_blocks_do_not_share_values() {
        let mut function = Function::new("f", int_params(&["a", "b", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::add("x", "a", "b"),
            Instruction::ret("x"),
            Instruction::label("elseLbl"),
            Instruction::add("y", "a", "b"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        global_value_numbering(&mut cfg);
        let else_block = cfg.get_block("elseLbl");
        // The sibling's x is out of scope here; y must stay an add.
        assert_eq!(else_block.instructions[1].opcode, Opcode::Add);
    }

    #[test]
    fn test_inverse_operation_cancellation() {
        let mut function = Function::new("f", int_params(&["a", "b"]), Type::Int);
        function.instructions = vec![
            Instruction::add("x", "a", "b"),
            Instruction::sub("y", "x", "b"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        global_value_numbering(&mut cfg);
        let y = &cfg.get_block("entry").instructions[2];
        assert_eq!(y.opcode, Opcode::Id);
        assert_eq!(y.arguments, vec!["a".to_string()]);
    }

    #[test]
    fn test_mul_mod_cancellation() {
        let mut function = Function::new("f", int_params(&["a", "b"]), Type::Int);
        function.instructions = vec![
            Instruction::mul("x", "a", "b"),
            Instruction::modulo("y", "x", "b"),
            Instruction::ret("y"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        global_value_numbering(&mut cfg);
        let y = &cfg.get_block("entry").instructions[2];
        assert_eq!(y.opcode, Opcode::Const);
        assert_eq!(y.value, 0);
    }

    #[test]
    fn test_constant_branch_resolution() {
        let mut function = Function::new("f", int_params(&["a"]), Type::Int);
        function.instructions = vec![
            Instruction::constant("t", 3, Type::Int),
            Instruction::constant("u", 3, Type::Int),
            Instruction::eq("c", "t", "u"),
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::ret("a"),
            Instruction::label("elseLbl"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        global_value_numbering(&mut cfg);
        let entry = cfg.get_block("entry");
        let jump = entry.instructions.last().unwrap();
        assert_eq!(jump.opcode, Opcode::Jmp);
        assert_eq!(jump.labels, vec!["thenLbl".to_string()]);
    }

    #[test]
    fn test_trivial_phi_collapses_to_copy() {
        let mut function = Function::new("f", int_params(&["a", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        cfg.get_block_mut("joinLbl").prepend(Instruction::phi(
            "m",
            Type::Int,
            vec!["a".into(), "a".into()],
            vec!["thenLbl".into(), "elseLbl".into()],
        ));
        cfg.get_block_mut("joinLbl").instructions.last_mut().unwrap().arguments[0] = "m".into();
        let mut cfg2 = cfg.clone();
        global_value_numbering(&mut cfg2);
        let phi = &cfg2.get_block("joinLbl").instructions[1];
        assert_eq!(phi.opcode, Opcode::Id);
        assert_eq!(phi.arguments, vec!["a".to_string()]);
    }

    #[test]
    fn test_duplicate_phis_merge() {
        let mut function = Function::new("f", int_params(&["a", "b", "c"]), Type::Int);
        function.instructions = vec![
            Instruction::br("c", "thenLbl", "elseLbl"),
            Instruction::label("thenLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("elseLbl"),
            Instruction::jmp("joinLbl"),
            Instruction::label("joinLbl"),
            Instruction::ret("a"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        for destination in ["m", "n"] {
            cfg.get_block_mut("joinLbl").prepend(Instruction::phi(
                destination,
                Type::Int,
                vec!["a".into(), "b".into()],
                vec!["thenLbl".into(), "elseLbl".into()],
            ));
        }
        global_value_numbering(&mut cfg);
        let block = cfg.get_block("joinLbl");
        let phis: Vec<_> =
            block.instructions.iter().filter(|i| i.opcode == Opcode::Phi).collect();
        let copies: Vec<_> =
            block.instructions.iter().filter(|i| i.opcode == Opcode::Id).collect();
        assert_eq!(phis.len(), 1);
        assert_eq!(copies.len(), 1);
    }

    #[test]
    fn test_functions_with_memory_skipped() {
        let mut function = Function::new("f", vec![Variable::new("n", Type::Int)], Type::Int);
        function.instructions = vec![
            Instruction::alloc("p", "n"),
            Instruction::free("p"),
            Instruction::ret("n"),
        ];
        let mut cfg = ControlFlowGraph::new(function);
        assert_eq!(global_value_numbering(&mut cfg), 0);
        assert_eq!(cfg.get_block("entry").instructions[1].opcode, Opcode::Alloc);
    }
}
