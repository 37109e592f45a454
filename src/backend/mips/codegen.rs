//! IR to MIPS assembly.
//!
//! Each function gets a register allocation, then its blocks are walked in
//! layout order and every IR instruction lowers to a short canonical
//! sequence. Spilled operands are materialized through the scratch registers
//! `$1`/`$2` (with `$6`/`$7` for comparisons and pointer scaling); `$4` and
//! `$11` hold the constants 4 and 1 from the prologue onward.
//!
//! Calls save the live caller-saved registers plus the frame pointer,
//! marshal arguments into the callee's chosen locations with a
//! cycle-breaking copy sequencer, carve out the callee's frame, and `jalr`
//! through a scratch register. `wain` additionally receives its arguments
//! from `$1`/`$2` and runs the runtime's `init` when the heap is in play.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::backend::mips::builder::MipsBuilder;
use crate::backend::mips::instruction::{Reg, FOUR, FRAME, LINK, ONE, RESULT, STACK, ZERO};
use crate::backend::mips::peephole;
use crate::backend::regalloc::{allocate_registers, RegisterAllocation, VariableLocation};
use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::{ControlFlowGraph, Program, MAIN_FUNCTION};
use crate::ir::ir::{Instruction, Opcode, Type};
use crate::passes::liveness::LiveSet;

/// The allocatable palette; `$1`, `$2`, `$6`, `$7` stay scratch, and `$0`,
/// `$4`, `$11`, `$29`, `$30`, `$31` have fixed roles.
pub const AVAILABLE_REGISTERS: [usize; 22] =
    [3, 5, 8, 9, 10, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28];

const TMP1: Reg = Reg(1);
const TMP2: Reg = Reg(2);
const TMP3: Reg = Reg(6);
const TMP4: Reg = Reg(7);

fn reg(index: usize) -> Reg {
    Reg(index as u8)
}

/// Qualify a block label with its function so labels stay unique in the one
/// flat assembly namespace.
fn create_label(function_name: &str, label: &str) -> String {
    let mut result = String::with_capacity(function_name.len() + label.len());
    result.push_str(function_name);
    let mut chars = label.chars();
    if let Some(first) = chars.next() {
        result.extend(first.to_uppercase());
    }
    result.push_str(chars.as_str());
    result
}

pub struct MipsCodeGenerator<'p> {
    program: &'p Program,
    builder: MipsBuilder,
    allocations: FxHashMap<String, RegisterAllocation>,
}

impl<'p> MipsCodeGenerator<'p> {
    pub fn generate(program: &'p Program) -> MipsBuilder {
        let mut allocations = FxHashMap::default();
        for (name, function) in &program.functions {
            allocations.insert(name.clone(), allocate_registers(function, &AVAILABLE_REGISTERS));
        }
        let mut generator = Self { program, builder: MipsBuilder::new(), allocations };
        generator.generate_program();
        generator.builder
    }

    fn generate_program(&mut self) {
        let program = self.program;
        let uses_heap = program.uses_heap();
        let uses_print = program.uses_print();
        if uses_heap {
            self.builder.import("init");
            self.builder.import("new");
            self.builder.import("delete");
        }
        if uses_print {
            self.builder.import("print");
        }

        let wain = program.wain();
        let wain_allocation = &self.allocations[MAIN_FUNCTION];

        self.builder.init_constants();
        self.builder.sub(FRAME, STACK, FOUR);
        self.builder.annotate("initialize the frame pointer");

        // Move wain's arguments out of $1/$2 into their allocated homes.
        for (parameter, source) in wain.parameters.iter().zip([TMP1, TMP2]) {
            match wain_allocation.get_location(&parameter.name) {
                VariableLocation::Register(register) => {
                    self.builder.copy(reg(register), source);
                    self.builder.annotate(format!("{} from {source}", parameter.name));
                }
                VariableLocation::Memory(offset) => {
                    self.builder.sw(source, offset, FRAME);
                    self.builder.annotate(format!("{} from {source}", parameter.name));
                }
            }
        }

        // Drop the stack pointer past wain's spill slots before anything
        // pushes, so the init call cannot land on slot 0.
        let spill_words = wain_allocation.num_spilled() as i32;
        self.builder.add_const(STACK, STACK, -4 * spill_words, TMP3);

        if uses_heap {
            // init expects the array pointer in $1 (already there) and its
            // length in $2, zero when wain takes two integers.
            if wain.parameters[0].ty != Type::IntStar {
                self.builder.add(TMP2, ZERO, ZERO);
            }
            self.builder.push(LINK);
            self.builder.load_and_jalr(TMP3, "init");
            self.builder.pop(LINK);
        }

        self.builder.beq(ZERO, ZERO, create_label(MAIN_FUNCTION, &wain.entry_label));
        self.builder.annotate("prologue done, enter wain");

        self.generate_function(wain);
        for (name, function) in &program.functions {
            if name != MAIN_FUNCTION {
                self.generate_function(function);
            }
        }

        peephole::optimize(&mut self.builder.instructions);
        debug!("emitted {} assembly instructions", self.builder.num_assembly_instructions());
    }

    fn generate_function(&mut self, function: &ControlFlowGraph) {
        assert_eq!(
            function.block_labels.first(),
            Some(&function.entry_label),
            "function {} must lay out its entry block first",
            function.name
        );
        self.builder.comment(format!("code for function {}", function.name));
        for label in &function.block_labels {
            let block = function.get_block(label);
            for (idx, instruction) in block.instructions.iter().enumerate() {
                let live_after = self.allocations[&function.name].liveness.after(label, idx).clone();
                self.generate_instruction(&function.name, instruction, &live_after);
            }
        }
    }

    fn allocation(&self, function_name: &str) -> &RegisterAllocation {
        &self.allocations[function_name]
    }

    /// The register holding `variable`, loading spilled variables into
    /// `temp` first.
    fn load_variable(&mut self, function_name: &str, temp: Reg, variable: &str) -> Reg {
        let allocation = self.allocation(function_name);
        if allocation.in_register(variable) {
            reg(allocation.get_register(variable))
        } else {
            let offset = allocation.get_offset(variable);
            self.builder.lw(temp, offset, FRAME);
            self.builder.annotate(format!("load spilled {variable}"));
            temp
        }
    }

    /// Flush a destination register back to its spill slot when needed.
    fn store_variable(&mut self, function_name: &str, variable: &str, register: Reg) {
        let allocation = self.allocation(function_name);
        if allocation.is_spilled(variable) {
            let offset = allocation.get_offset(variable);
            self.builder.sw(register, offset, FRAME);
            self.builder.annotate(format!("store spilled {variable}"));
        }
    }

    /// The destination register for a write: the allocated register, or
    /// `temp` for spilled and unallocated destinations.
    fn get_register(&self, function_name: &str, temp: Reg, variable: &str) -> Reg {
        let allocation = self.allocation(function_name);
        if allocation.in_register(variable) {
            reg(allocation.get_register(variable))
        } else {
            temp
        }
    }

    fn generate_instruction(
        &mut self,
        function_name: &str,
        instruction: &Instruction,
        live_after: &LiveSet,
    ) {
        let destination = instruction.destination.as_deref();
        match instruction.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let lhs = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let rhs = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP1, dest);
                match instruction.opcode {
                    Opcode::Add => self.builder.add(dest_reg, lhs, rhs),
                    Opcode::Sub => self.builder.sub(dest_reg, lhs, rhs),
                    Opcode::Mul => self.builder.mult(dest_reg, lhs, rhs),
                    Opcode::Div => self.builder.div(dest_reg, lhs, rhs),
                    _ => self.builder.modulo(dest_reg, lhs, rhs),
                }
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let lhs = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let rhs = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP3, dest);
                match instruction.opcode {
                    Opcode::Lt => self.builder.slt(dest_reg, lhs, rhs),
                    Opcode::Gt => self.builder.slt(dest_reg, rhs, lhs),
                    Opcode::Le => {
                        self.builder.slt(dest_reg, rhs, lhs);
                        self.builder.sub(dest_reg, ONE, dest_reg);
                    }
                    _ => {
                        self.builder.slt(dest_reg, lhs, rhs);
                        self.builder.sub(dest_reg, ONE, dest_reg);
                    }
                }
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Eq | Opcode::Ne => {
                let lhs = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let rhs = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP3, dest);
                self.builder.slt(TMP3, lhs, rhs);
                self.builder.slt(TMP4, rhs, lhs);
                self.builder.add(dest_reg, TMP3, TMP4);
                if instruction.opcode == Opcode::Eq {
                    self.builder.sub(dest_reg, ONE, dest_reg);
                }
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Jmp => {
                self.builder.beq(ZERO, ZERO, create_label(function_name, &instruction.labels[0]));
                self.builder.annotate(instruction.to_string());
            }

            Opcode::Br => {
                let condition = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                self.builder.beq(
                    condition,
                    ZERO,
                    create_label(function_name, &instruction.labels[1]),
                );
                self.builder.annotate(instruction.to_string());
                self.builder.beq(ZERO, ZERO, create_label(function_name, &instruction.labels[0]));
            }

            Opcode::Call => self.generate_call(function_name, instruction, live_after),

            Opcode::Ret => {
                let value = self.load_variable(function_name, RESULT, &instruction.arguments[0]);
                self.builder.copy(RESULT, value);
                self.builder.annotate(instruction.to_string());
                self.builder.jr(LINK);
            }

            Opcode::Const => {
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP1, dest);
                // Wide literals truncate to the machine word.
                self.builder.load_const(dest_reg, instruction.value as i32);
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Id => {
                let source = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP1, dest);
                self.builder.copy(dest_reg, source);
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Print => {
                let value = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                self.builder.copy(TMP1, value);
                self.builder.push(LINK);
                self.builder.load_and_jalr(TMP2, "print");
                self.builder.pop(LINK);
                self.builder.annotate(instruction.to_string());
            }

            Opcode::Nop => {}

            Opcode::Alloc => {
                let size = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, RESULT, dest);
                let success = self.builder.generate_label("allocSuccess");

                // new takes the word count in $1 and answers in $3; zero
                // means failure and becomes the NULL sentinel.
                self.builder.copy(TMP1, size);
                self.builder.push(RESULT);
                self.builder.push(LINK);
                self.builder.load_and_jalr(TMP2, "new");
                self.builder.pop(LINK);
                self.builder.bne(RESULT, ZERO, success.clone());
                self.builder.add(RESULT, ONE, ZERO);
                self.builder.label(success);
                self.builder.copy(dest_reg, RESULT);
                if dest_reg != RESULT {
                    self.builder.pop(RESULT);
                } else {
                    self.builder.pop_and_discard();
                }
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Free => {
                let skip = self.builder.generate_label("deleteSkip");
                let pointer = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                self.builder.copy(TMP1, pointer);
                // delete must not see the NULL sentinel.
                self.builder.beq(TMP1, ONE, skip.clone());
                self.builder.push(LINK);
                self.builder.load_and_jalr(TMP2, "delete");
                self.builder.pop(LINK);
                self.builder.label(skip);
            }

            Opcode::Store => {
                let pointer = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let value = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                self.builder.sw(value, 0, pointer);
                self.builder.annotate(instruction.to_string());
            }

            Opcode::Load => {
                let pointer = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP2, dest);
                self.builder.lw(dest_reg, 0, pointer);
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::PtrAdd | Opcode::PtrSub => {
                let pointer = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let words = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP4, dest);
                self.builder.mult(TMP3, words, FOUR);
                if instruction.opcode == Opcode::PtrAdd {
                    self.builder.add(dest_reg, pointer, TMP3);
                } else {
                    self.builder.sub(dest_reg, pointer, TMP3);
                }
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::PtrDiff => {
                let lhs = self.load_variable(function_name, TMP1, &instruction.arguments[0]);
                let rhs = self.load_variable(function_name, TMP2, &instruction.arguments[1]);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP1, dest);
                self.builder.sub(dest_reg, lhs, rhs);
                self.builder.div(dest_reg, dest_reg, FOUR);
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::AddressOf => {
                let variable = &instruction.arguments[0];
                let allocation = self.allocation(function_name);
                assert!(
                    allocation.is_spilled(variable),
                    "address-taken variable {variable} must live in memory"
                );
                let offset = allocation.get_offset(variable);
                let dest = destination.unwrap();
                let dest_reg = self.get_register(function_name, TMP1, dest);
                self.builder.add_const(dest_reg, FRAME, offset, TMP1);
                self.builder.annotate(instruction.to_string());
                self.store_variable(function_name, dest, dest_reg);
            }

            Opcode::Label => {
                self.builder.label(create_label(function_name, &instruction.labels[0]));
            }

            Opcode::Phi => unreachable!("phis are lowered to copies before code generation"),
        }
    }

    fn generate_call(
        &mut self,
        function_name: &str,
        instruction: &Instruction,
        live_after: &LiveSet,
    ) {
        let callee_name = instruction.funcs[0].clone();
        let program = self.program;
        let callee = program.get_function(&callee_name);
        let destination = instruction.destination.clone().unwrap();

        // 1. Save the live caller-saved registers, frame pointer included.
        let mut live_registers: BTreeSet<Reg> = BTreeSet::from([FRAME]);
        for variable in live_after {
            if *variable != destination && self.allocation(function_name).in_register(variable) {
                live_registers.insert(reg(self.allocation(function_name).get_register(variable)));
            }
        }
        self.builder.comment(format!("call @{callee_name}: save live registers"));
        for register in &live_registers {
            self.builder.push(*register);
        }

        // 2. A gap word so the callee's frame-pointer slot 0 sits below the
        // saves.
        self.builder.sub(STACK, STACK, FOUR);

        // 3. Arguments into the callee's parameter locations.
        let source_locations: Vec<VariableLocation> = instruction
            .arguments
            .iter()
            .map(|argument| self.allocation(function_name).get_location(argument))
            .collect();
        let target_locations: Vec<VariableLocation> = callee
            .parameters
            .iter()
            .map(|parameter| self.allocation(&callee_name).get_location(&parameter.name))
            .collect();
        self.copy_arguments(&source_locations, &target_locations);

        // 4. The callee's frame: its frame pointer is the current stack top,
        // and the stack pointer drops past its spill slots.
        let spill_words = self.allocation(&callee_name).num_spilled() as i32;
        self.builder.add(FRAME, STACK, ZERO);
        self.builder.add_const(STACK, STACK, -4 * spill_words + 4, TMP1);

        // 5. Jump, preserving the link register.
        self.builder.push(LINK);
        self.builder.load_and_jalr(TMP2, create_label(&callee_name, &callee.entry_label));
        self.builder.annotate(format!("call @{callee_name}"));
        self.builder.pop(LINK);

        // 6. Unwind the frame and restore the saved registers.
        self.builder.add_const(STACK, STACK, 4 * spill_words, TMP1);
        for register in live_registers.iter().rev() {
            self.builder.pop(*register);
        }

        // 7. The return value.
        let dest_reg = self.get_register(function_name, TMP1, &destination);
        self.builder.copy(dest_reg, RESULT);
        self.store_variable(function_name, &destination, dest_reg);
    }

    /// Copy arguments from caller locations to callee locations without
    /// clobbering a value before it is read. Stores into the callee frame go
    /// first (the frame cannot be a source), register moves are peeled from
    /// targets whose old value nobody needs, remaining cycles rotate through
    /// a scratch register, and loads from the caller frame come last.
    fn copy_arguments(
        &mut self,
        source_locations: &[VariableLocation],
        target_locations: &[VariableLocation],
    ) {
        self.builder.comment("marshal arguments");
        let mut moves: BTreeMap<u8, u8> = BTreeMap::new();
        let mut to_memory: Vec<usize> = Vec::new();
        let mut from_memory: Vec<usize> = Vec::new();
        for (idx, (source, target)) in source_locations.iter().zip(target_locations).enumerate() {
            match (source, target) {
                (_, VariableLocation::Memory(_)) => to_memory.push(idx),
                (VariableLocation::Memory(_), VariableLocation::Register(_)) => {
                    from_memory.push(idx)
                }
                (VariableLocation::Register(source), VariableLocation::Register(target)) => {
                    if source != target {
                        let previous = moves.insert(*target as u8, *source as u8);
                        assert!(previous.is_none(), "two arguments target ${target}");
                    }
                }
            }
        }

        for &idx in &to_memory {
            let VariableLocation::Memory(target_offset) = target_locations[idx] else {
                unreachable!()
            };
            match source_locations[idx] {
                VariableLocation::Memory(source_offset) => {
                    self.builder.lw(TMP1, source_offset, FRAME);
                    self.builder.sw(TMP1, target_offset, STACK);
                    self.builder.annotate(format!("argument {idx}, frame to frame"));
                }
                VariableLocation::Register(source) => {
                    self.builder.sw(reg(source), target_offset, STACK);
                    self.builder.annotate(format!("argument {idx}, register to frame"));
                }
            }
        }

        // Peel chains: a target whose register is no pending source is safe
        // to overwrite; finishing its move may free its source in turn.
        let mut source_count: FxHashMap<u8, usize> = FxHashMap::default();
        for source in moves.values() {
            *source_count.entry(*source).or_default() += 1;
        }
        let mut ready: BTreeSet<u8> =
            moves.keys().filter(|target| !source_count.contains_key(target)).copied().collect();
        while let Some(target) = ready.pop_first() {
            let source = moves.remove(&target).expect("ready targets are pending moves");
            self.builder.copy(Reg(target), Reg(source));
            let remaining = source_count.get_mut(&source).expect("source of a pending move");
            *remaining -= 1;
            if *remaining == 0 && moves.contains_key(&source) {
                ready.insert(source);
            }
        }

        // What remains is disjoint cycles: rotate each through the scratch.
        while let Some((&start, _)) = moves.first_key_value() {
            self.builder.copy(TMP1, Reg(start));
            self.builder.annotate("break the copy cycle");
            let mut node = start;
            loop {
                let source = moves.remove(&node).expect("cycle members form pending moves");
                if source == start {
                    self.builder.copy(Reg(node), TMP1);
                    break;
                }
                self.builder.copy(Reg(node), Reg(source));
                node = source;
            }
        }

        for &idx in &from_memory {
            let VariableLocation::Register(target) = target_locations[idx] else { unreachable!() };
            let VariableLocation::Memory(source_offset) = source_locations[idx] else {
                unreachable!()
            };
            self.builder.lw(reg(target), source_offset, FRAME);
            self.builder.annotate(format!("argument {idx}, frame to register"));
        }
    }
}
