//! The target instruction set, as assembly text.
//!
//! Instructions carry their register operands, a 16-bit-style immediate for
//! loads/stores and numeric branches, and an optional label operand (branch
//! targets, `.word` values, label definitions, imports). A comment field
//! renders after the instruction at a fixed column.

use std::collections::BTreeSet;
use std::fmt;

/// A register index, `$0` through `$31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Reg(pub u8);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

pub const ZERO: Reg = Reg(0);
/// Holds the constant 4 after the prologue.
pub const FOUR: Reg = Reg(4);
/// Holds the constant 1 (also the NULL sentinel) after the prologue.
pub const ONE: Reg = Reg(11);
/// The function return value.
pub const RESULT: Reg = Reg(3);
pub const FRAME: Reg = Reg(29);
pub const STACK: Reg = Reg(30);
pub const LINK: Reg = Reg(31);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipsOpcode {
    Add,
    Sub,
    Mult,
    Multu,
    Div,
    Divu,
    Mfhi,
    Mflo,
    Lis,
    Lw,
    Sw,
    Slt,
    Sltu,
    Beq,
    Bne,
    Jr,
    Jalr,
    Word,
    Label,
    Import,
    Comment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MipsInstruction {
    pub opcode: MipsOpcode,
    pub s: Reg,
    pub t: Reg,
    pub d: Reg,
    pub i: i32,
    pub label: Option<String>,
    pub comment: String,
}

impl MipsInstruction {
    fn new(opcode: MipsOpcode, s: Reg, t: Reg, d: Reg, i: i32, label: Option<String>) -> Self {
        Self { opcode, s, t, d, i, label, comment: String::new() }
    }

    pub fn add(d: Reg, s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Add, s, t, d, 0, None)
    }
    pub fn sub(d: Reg, s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Sub, s, t, d, 0, None)
    }
    pub fn mult(s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Mult, s, t, ZERO, 0, None)
    }
    pub fn multu(s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Multu, s, t, ZERO, 0, None)
    }
    pub fn div(s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Div, s, t, ZERO, 0, None)
    }
    pub fn divu(s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Divu, s, t, ZERO, 0, None)
    }
    pub fn mfhi(d: Reg) -> Self {
        Self::new(MipsOpcode::Mfhi, ZERO, ZERO, d, 0, None)
    }
    pub fn mflo(d: Reg) -> Self {
        Self::new(MipsOpcode::Mflo, ZERO, ZERO, d, 0, None)
    }
    pub fn lis(d: Reg) -> Self {
        Self::new(MipsOpcode::Lis, ZERO, ZERO, d, 0, None)
    }
    pub fn lw(t: Reg, i: i32, s: Reg) -> Self {
        Self::new(MipsOpcode::Lw, s, t, ZERO, i, None)
    }
    pub fn sw(t: Reg, i: i32, s: Reg) -> Self {
        Self::new(MipsOpcode::Sw, s, t, ZERO, i, None)
    }
    pub fn slt(d: Reg, s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Slt, s, t, d, 0, None)
    }
    pub fn sltu(d: Reg, s: Reg, t: Reg) -> Self {
        Self::new(MipsOpcode::Sltu, s, t, d, 0, None)
    }
    pub fn beq(s: Reg, t: Reg, label: impl Into<String>) -> Self {
        Self::new(MipsOpcode::Beq, s, t, ZERO, 0, Some(label.into()))
    }
    pub fn bne(s: Reg, t: Reg, label: impl Into<String>) -> Self {
        Self::new(MipsOpcode::Bne, s, t, ZERO, 0, Some(label.into()))
    }
    pub fn jr(s: Reg) -> Self {
        Self::new(MipsOpcode::Jr, s, ZERO, ZERO, 0, None)
    }
    pub fn jalr(s: Reg) -> Self {
        Self::new(MipsOpcode::Jalr, s, ZERO, ZERO, 0, None)
    }
    pub fn word(i: i32) -> Self {
        Self::new(MipsOpcode::Word, ZERO, ZERO, ZERO, i, None)
    }
    pub fn word_label(label: impl Into<String>) -> Self {
        Self::new(MipsOpcode::Word, ZERO, ZERO, ZERO, 0, Some(label.into()))
    }
    pub fn label(name: impl Into<String>) -> Self {
        Self::new(MipsOpcode::Label, ZERO, ZERO, ZERO, 0, Some(name.into()))
    }
    pub fn import(name: impl Into<String>) -> Self {
        Self::new(MipsOpcode::Import, ZERO, ZERO, ZERO, 0, Some(name.into()))
    }
    pub fn comment(text: impl Into<String>) -> Self {
        let mut result = Self::new(MipsOpcode::Comment, ZERO, ZERO, ZERO, 0, None);
        result.comment = text.into();
        result
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.opcode, MipsOpcode::Jr | MipsOpcode::Jalr | MipsOpcode::Beq | MipsOpcode::Bne)
    }

    pub fn read_registers(&self) -> BTreeSet<Reg> {
        match self.opcode {
            MipsOpcode::Add
            | MipsOpcode::Sub
            | MipsOpcode::Mult
            | MipsOpcode::Multu
            | MipsOpcode::Div
            | MipsOpcode::Divu
            | MipsOpcode::Slt
            | MipsOpcode::Sltu
            | MipsOpcode::Beq
            | MipsOpcode::Bne
            | MipsOpcode::Sw => BTreeSet::from([self.s, self.t]),
            MipsOpcode::Lw | MipsOpcode::Jr | MipsOpcode::Jalr => BTreeSet::from([self.s]),
            MipsOpcode::Mfhi
            | MipsOpcode::Mflo
            | MipsOpcode::Lis
            | MipsOpcode::Word
            | MipsOpcode::Label
            | MipsOpcode::Import
            | MipsOpcode::Comment => BTreeSet::new(),
        }
    }

    pub fn written_register(&self) -> Option<Reg> {
        match self.opcode {
            MipsOpcode::Add
            | MipsOpcode::Sub
            | MipsOpcode::Mfhi
            | MipsOpcode::Mflo
            | MipsOpcode::Lis
            | MipsOpcode::Slt
            | MipsOpcode::Sltu => Some(self.d),
            MipsOpcode::Lw => Some(self.t),
            // Jalr writes the link register, which is never collapsible.
            MipsOpcode::Jalr => Some(LINK),
            _ => None,
        }
    }

    /// Replace reads of `from` with `to`. Only register arguments change;
    /// the written register is left alone.
    pub fn substitute_arguments(&mut self, from: Reg, to: Reg) -> bool {
        if from == to {
            return false;
        }
        let mut changed = false;
        match self.opcode {
            MipsOpcode::Add
            | MipsOpcode::Sub
            | MipsOpcode::Mult
            | MipsOpcode::Multu
            | MipsOpcode::Div
            | MipsOpcode::Divu
            | MipsOpcode::Slt
            | MipsOpcode::Sltu
            | MipsOpcode::Beq
            | MipsOpcode::Bne
            | MipsOpcode::Sw => {
                if self.s == from {
                    self.s = to;
                    changed = true;
                }
                if self.t == from {
                    self.t = to;
                    changed = true;
                }
            }
            MipsOpcode::Lw => {
                if self.s == from {
                    self.s = to;
                    changed = true;
                }
            }
            _ => {}
        }
        changed
    }
}

impl fmt::Display for MipsInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const COMMENT_COLUMN: usize = 32;
        let text = match self.opcode {
            MipsOpcode::Add | MipsOpcode::Sub | MipsOpcode::Slt | MipsOpcode::Sltu => {
                format!(
                    "{} {}, {}, {}",
                    mnemonic(self.opcode),
                    self.d,
                    self.s,
                    self.t
                )
            }
            MipsOpcode::Mult | MipsOpcode::Multu | MipsOpcode::Div | MipsOpcode::Divu => {
                format!("{} {}, {}", mnemonic(self.opcode), self.s, self.t)
            }
            MipsOpcode::Mfhi | MipsOpcode::Mflo | MipsOpcode::Lis => {
                format!("{} {}", mnemonic(self.opcode), self.d)
            }
            MipsOpcode::Lw | MipsOpcode::Sw => {
                format!("{} {}, {}({})", mnemonic(self.opcode), self.t, self.i, self.s)
            }
            MipsOpcode::Beq | MipsOpcode::Bne => match &self.label {
                Some(label) => {
                    format!("{} {}, {}, {label}", mnemonic(self.opcode), self.s, self.t)
                }
                None => format!("{} {}, {}, {}", mnemonic(self.opcode), self.s, self.t, self.i),
            },
            MipsOpcode::Jr | MipsOpcode::Jalr => {
                format!("{} {}", mnemonic(self.opcode), self.s)
            }
            MipsOpcode::Word => match &self.label {
                Some(label) => format!(".word {label}"),
                None => format!(".word {}", self.i),
            },
            MipsOpcode::Label => format!("{}:", self.label.as_deref().unwrap_or("")),
            MipsOpcode::Import => format!(".import {}", self.label.as_deref().unwrap_or("")),
            MipsOpcode::Comment => String::new(),
        };

        if self.opcode == MipsOpcode::Comment || !self.comment.is_empty() {
            let padding = COMMENT_COLUMN.saturating_sub(text.len());
            write!(f, "{text}{}; {}", " ".repeat(padding), self.comment)
        } else {
            write!(f, "{text}")
        }
    }
}

fn mnemonic(opcode: MipsOpcode) -> &'static str {
    match opcode {
        MipsOpcode::Add => "add",
        MipsOpcode::Sub => "sub",
        MipsOpcode::Mult => "mult",
        MipsOpcode::Multu => "multu",
        MipsOpcode::Div => "div",
        MipsOpcode::Divu => "divu",
        MipsOpcode::Mfhi => "mfhi",
        MipsOpcode::Mflo => "mflo",
        MipsOpcode::Lis => "lis",
        MipsOpcode::Lw => "lw",
        MipsOpcode::Sw => "sw",
        MipsOpcode::Slt => "slt",
        MipsOpcode::Sltu => "sltu",
        MipsOpcode::Beq => "beq",
        MipsOpcode::Bne => "bne",
        MipsOpcode::Jr => "jr",
        MipsOpcode::Jalr => "jalr",
        MipsOpcode::Word | MipsOpcode::Label | MipsOpcode::Import | MipsOpcode::Comment => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendering() {
        assert_eq!(MipsInstruction::add(Reg(3), Reg(5), Reg(8)).to_string(), "add $3, $5, $8");
        assert_eq!(MipsInstruction::lw(Reg(1), -8, FRAME).to_string(), "lw $1, -8($29)");
        assert_eq!(MipsInstruction::beq(ZERO, ZERO, "fEntry").to_string(), "beq $0, $0, fEntry");
        assert_eq!(MipsInstruction::word_label("init").to_string(), ".word init");
        assert_eq!(MipsInstruction::label("wainEntry").to_string(), "wainEntry:");
        assert_eq!(MipsInstruction::import("print").to_string(), ".import print");
    }

    #[test]
    fn test_read_written_registers() {
        let add = MipsInstruction::add(Reg(3), Reg(5), Reg(8));
        assert_eq!(add.read_registers(), BTreeSet::from([Reg(5), Reg(8)]));
        assert_eq!(add.written_register(), Some(Reg(3)));

        let lw = MipsInstruction::lw(Reg(7), 0, Reg(29));
        assert_eq!(lw.read_registers(), BTreeSet::from([Reg(29)]));
        assert_eq!(lw.written_register(), Some(Reg(7)));

        let sw = MipsInstruction::sw(Reg(7), 0, Reg(29));
        assert_eq!(sw.read_registers(), BTreeSet::from([Reg(7), Reg(29)]));
        assert_eq!(sw.written_register(), None);

        assert_eq!(MipsInstruction::jalr(Reg(2)).written_register(), Some(LINK));
    }

    #[test]
    fn test_substitution() {
        let mut add = MipsInstruction::add(Reg(3), Reg(5), Reg(5));
        assert!(add.substitute_arguments(Reg(5), Reg(8)));
        assert_eq!((add.s, add.t, add.d), (Reg(8), Reg(8), Reg(3)));

        let mut lw = MipsInstruction::lw(Reg(5), 0, Reg(6));
        assert!(!lw.substitute_arguments(Reg(5), Reg(8)), "lw's t operand is a write");
        assert_eq!(lw.t, Reg(5));
    }
}
