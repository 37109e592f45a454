//! An append-only assembly buffer with the emission conveniences the code
//! generator leans on: pseudo-ops (copy, three-register multiply/divide),
//! push/pop, constant materialization that exploits the always-available
//! `$4 = 4` and `$11 = 1`, and per-prefix fresh label generation.

use crate::common::fx_hash::FxHashMap;
use crate::backend::mips::instruction::{MipsInstruction, MipsOpcode, Reg, FOUR, ONE, STACK, ZERO};

#[derive(Debug, Default)]
pub struct MipsBuilder {
    pub instructions: Vec<MipsInstruction>,
    constants_init: bool,
    label_counters: FxHashMap<String, usize>,
}

impl MipsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a comment to the most recently emitted instruction.
    pub fn annotate(&mut self, comment: impl Into<String>) {
        let last = self.instructions.last_mut().expect("no instruction to annotate");
        last.comment = comment.into();
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.emit(MipsInstruction::comment(text));
    }

    pub fn generate_label(&mut self, prefix: &str) -> String {
        let counter = self.label_counters.entry(prefix.to_string()).or_insert(0);
        let idx = *counter;
        *counter += 1;
        format!("{prefix}{idx}")
    }

    /// Materialize `$4 = 4` and `$11 = 1`; everything after the prologue may
    /// rely on both.
    pub fn init_constants(&mut self) {
        if self.constants_init {
            return;
        }
        self.load_const(FOUR, 4);
        self.emit(MipsInstruction::slt(ONE, ZERO, FOUR));
        self.annotate("$11 = ($0 < $4) = 1");
        self.constants_init = true;
    }

    pub fn load_const(&mut self, reg: Reg, value: i32) {
        if value == 0 {
            self.add(reg, ZERO, ZERO);
        } else if self.constants_init {
            match value {
                1 => self.add(reg, ONE, ZERO),
                2 => self.add(reg, ONE, ONE),
                3 => self.sub(reg, FOUR, ONE),
                4 => self.add(reg, FOUR, ZERO),
                5 => self.add(reg, ONE, FOUR),
                8 => self.add(reg, FOUR, FOUR),
                -1 => self.sub(reg, ZERO, ONE),
                -3 => self.sub(reg, ONE, FOUR),
                -4 => self.sub(reg, ZERO, FOUR),
                _ => {
                    self.emit(MipsInstruction::lis(reg));
                    self.emit(MipsInstruction::word(value));
                }
            }
        } else {
            self.emit(MipsInstruction::lis(reg));
            self.emit(MipsInstruction::word(value));
        }
    }

    pub fn load_label(&mut self, reg: Reg, label: impl Into<String>) {
        self.emit(MipsInstruction::lis(reg));
        self.emit(MipsInstruction::word_label(label));
    }

    /// `reg = base + value`, materializing the addend through `scratch` when
    /// no shorter form exists.
    pub fn add_const(&mut self, reg: Reg, base: Reg, value: i32, scratch: Reg) {
        debug_assert_ne!(scratch, base, "scratch would clobber the base");
        match value {
            0 => self.copy(reg, base),
            4 => self.add(reg, base, FOUR),
            -4 => self.sub(reg, base, FOUR),
            1 => self.add(reg, base, ONE),
            -1 => self.sub(reg, base, ONE),
            _ => {
                self.load_const(scratch, value);
                self.add(reg, base, scratch);
            }
        }
    }

    pub fn load_and_jalr(&mut self, reg: Reg, label: impl Into<String>) {
        self.load_label(reg, label);
        self.emit(MipsInstruction::jalr(reg));
    }

    pub fn push(&mut self, reg: Reg) {
        self.emit(MipsInstruction::sw(reg, -4, STACK));
        self.annotate(format!("push {reg}"));
        self.sub(STACK, STACK, FOUR);
    }

    pub fn pop(&mut self, reg: Reg) {
        self.add(STACK, STACK, FOUR);
        self.emit(MipsInstruction::lw(reg, -4, STACK));
        self.annotate(format!("pop {reg}"));
    }

    pub fn pop_and_discard(&mut self) {
        self.add(STACK, STACK, FOUR);
    }

    pub fn copy(&mut self, d: Reg, s: Reg) {
        if d != s {
            self.add(d, s, ZERO);
        }
    }

    pub fn add(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::add(d, s, t));
    }

    pub fn sub(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::sub(d, s, t));
    }

    pub fn mult(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::mult(s, t));
        self.emit(MipsInstruction::mflo(d));
    }

    pub fn div(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::div(s, t));
        self.emit(MipsInstruction::mflo(d));
    }

    pub fn modulo(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::div(s, t));
        self.emit(MipsInstruction::mfhi(d));
    }

    pub fn slt(&mut self, d: Reg, s: Reg, t: Reg) {
        self.emit(MipsInstruction::slt(d, s, t));
    }

    pub fn lw(&mut self, t: Reg, i: i32, s: Reg) {
        self.emit(MipsInstruction::lw(t, i, s));
    }

    pub fn sw(&mut self, t: Reg, i: i32, s: Reg) {
        self.emit(MipsInstruction::sw(t, i, s));
    }

    pub fn beq(&mut self, s: Reg, t: Reg, label: impl Into<String>) {
        self.emit(MipsInstruction::beq(s, t, label));
    }

    pub fn bne(&mut self, s: Reg, t: Reg, label: impl Into<String>) {
        self.emit(MipsInstruction::bne(s, t, label));
    }

    pub fn jr(&mut self, s: Reg) {
        self.emit(MipsInstruction::jr(s));
    }

    pub fn label(&mut self, name: impl Into<String>) {
        self.emit(MipsInstruction::label(name));
    }

    pub fn import(&mut self, name: impl Into<String>) {
        self.emit(MipsInstruction::import(name));
    }

    pub fn emit(&mut self, instruction: MipsInstruction) {
        self.instructions.push(instruction);
    }

    /// Real instructions only: labels, directives, and comments excluded.
    pub fn num_assembly_instructions(&self) -> usize {
        self.instructions
            .iter()
            .filter(|instruction| {
                !matches!(
                    instruction.opcode,
                    MipsOpcode::Label | MipsOpcode::Comment | MipsOpcode::Import
                )
            })
            .count()
    }

    pub fn render(&self) -> String {
        let mut result = String::new();
        for instruction in &self.instructions {
            result.push_str(&instruction.to_string());
            result.push('\n');
        }
        result
    }
}
