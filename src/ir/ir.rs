//! The three-address intermediate representation.
//!
//! Instructions are a uniform record: an opcode plus parallel operand lists
//! (variable arguments, at most one callee, and block labels). The labels list
//! carries both branch targets and, for phi instructions, one predecessor
//! label per incoming value. A `const` stores its immediate in `value`.
//!
//! Variable names are plain strings; before SSA conversion several
//! definitions may share a name, afterwards every name has exactly one static
//! definition.

use std::fmt;

/// Semantic types carried on instructions and variables. `Bool` only exists
/// inside the IR as the result of comparisons; it never crosses the source
/// language boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int,
    IntStar,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::IntStar => write!(f, "int*"),
        }
    }
}

/// A named variable together with its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparisons
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    // Control
    Jmp,
    Br,
    Call,
    Ret,
    // Data
    Const,
    Id,
    Print,
    Nop,
    // Memory
    Alloc,
    Free,
    Store,
    Load,
    PtrAdd,
    PtrSub,
    PtrDiff,
    AddressOf,
    // Structure
    Label,
    Phi,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Jmp => "jmp",
            Opcode::Br => "br",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Const => "const",
            Opcode::Id => "id",
            Opcode::Print => "print",
            Opcode::Nop => "nop",
            Opcode::Alloc => "alloc",
            Opcode::Free => "free",
            Opcode::Store => "store",
            Opcode::Load => "load",
            Opcode::PtrAdd => "ptradd",
            Opcode::PtrSub => "ptrsub",
            Opcode::PtrDiff => "ptrdiff",
            Opcode::AddressOf => "addressof",
            Opcode::Label => "label",
            Opcode::Phi => "phi",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ty: Type,
    pub destination: Option<String>,
    /// Immediate operand; meaningful only for `const`.
    pub value: i64,
    pub arguments: Vec<String>,
    pub funcs: Vec<String>,
    pub labels: Vec<String>,
}

impl Instruction {
    fn new(
        opcode: Opcode,
        ty: Type,
        destination: Option<String>,
        arguments: Vec<String>,
        funcs: Vec<String>,
        labels: Vec<String>,
    ) -> Self {
        Self { opcode, ty, destination, value: 0, arguments, funcs, labels }
    }

    fn binary(opcode: Opcode, ty: Type, dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::new(opcode, ty, Some(dest.into()), vec![lhs.into(), rhs.into()], vec![], vec![])
    }

    pub fn add(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Add, Type::Int, dest, lhs, rhs)
    }
    pub fn sub(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Sub, Type::Int, dest, lhs, rhs)
    }
    pub fn mul(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Mul, Type::Int, dest, lhs, rhs)
    }
    pub fn div(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Div, Type::Int, dest, lhs, rhs)
    }
    pub fn modulo(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Mod, Type::Int, dest, lhs, rhs)
    }
    pub fn lt(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Lt, Type::Bool, dest, lhs, rhs)
    }
    pub fn le(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Le, Type::Bool, dest, lhs, rhs)
    }
    pub fn gt(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Gt, Type::Bool, dest, lhs, rhs)
    }
    pub fn ge(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Ge, Type::Bool, dest, lhs, rhs)
    }
    pub fn eq(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Eq, Type::Bool, dest, lhs, rhs)
    }
    pub fn ne(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::Ne, Type::Bool, dest, lhs, rhs)
    }

    pub fn jmp(target: impl Into<String>) -> Self {
        Self::new(Opcode::Jmp, Type::Void, None, vec![], vec![], vec![target.into()])
    }
    pub fn br(cond: impl Into<String>, true_label: impl Into<String>, false_label: impl Into<String>) -> Self {
        Self::new(
            Opcode::Br,
            Type::Void,
            None,
            vec![cond.into()],
            vec![],
            vec![true_label.into(), false_label.into()],
        )
    }
    pub fn call(dest: impl Into<String>, func: impl Into<String>, arguments: Vec<String>, ty: Type) -> Self {
        Self::new(Opcode::Call, ty, Some(dest.into()), arguments, vec![func.into()], vec![])
    }
    pub fn ret(value: impl Into<String>) -> Self {
        Self::new(Opcode::Ret, Type::Void, None, vec![value.into()], vec![], vec![])
    }

    pub fn constant(dest: impl Into<String>, value: i64, ty: Type) -> Self {
        let mut result = Self::new(Opcode::Const, ty, Some(dest.into()), vec![], vec![], vec![]);
        result.value = value;
        result
    }
    pub fn id(dest: impl Into<String>, source: impl Into<String>, ty: Type) -> Self {
        Self::new(Opcode::Id, ty, Some(dest.into()), vec![source.into()], vec![], vec![])
    }
    pub fn print(value: impl Into<String>) -> Self {
        Self::new(Opcode::Print, Type::Void, None, vec![value.into()], vec![], vec![])
    }
    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Type::Void, None, vec![], vec![], vec![])
    }

    pub fn alloc(dest: impl Into<String>, size: impl Into<String>) -> Self {
        Self::new(Opcode::Alloc, Type::IntStar, Some(dest.into()), vec![size.into()], vec![], vec![])
    }
    pub fn free(pointer: impl Into<String>) -> Self {
        Self::new(Opcode::Free, Type::Void, None, vec![pointer.into()], vec![], vec![])
    }
    pub fn store(pointer: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(Opcode::Store, Type::Void, None, vec![pointer.into(), value.into()], vec![], vec![])
    }
    pub fn load(dest: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::new(Opcode::Load, Type::Int, Some(dest.into()), vec![pointer.into()], vec![], vec![])
    }
    pub fn ptradd(dest: impl Into<String>, pointer: impl Into<String>, offset: impl Into<String>) -> Self {
        Self::binary(Opcode::PtrAdd, Type::IntStar, dest, pointer, offset)
    }
    pub fn ptrsub(dest: impl Into<String>, pointer: impl Into<String>, offset: impl Into<String>) -> Self {
        Self::binary(Opcode::PtrSub, Type::IntStar, dest, pointer, offset)
    }
    pub fn ptrdiff(dest: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Self::binary(Opcode::PtrDiff, Type::Int, dest, lhs, rhs)
    }
    pub fn addressof(dest: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::new(Opcode::AddressOf, Type::IntStar, Some(dest.into()), vec![variable.into()], vec![], vec![])
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self::new(Opcode::Label, Type::Void, None, vec![], vec![], vec![name.into()])
    }
    pub fn phi(dest: impl Into<String>, ty: Type, arguments: Vec<String>, labels: Vec<String>) -> Self {
        assert_eq!(arguments.len(), labels.len(), "phi arguments and labels must pair up");
        Self::new(Opcode::Phi, ty, Some(dest.into()), arguments, vec![], labels)
    }

    /// Every opcode except calls, prints, and the allocator/memory accesses.
    pub fn is_pure(&self) -> bool {
        !matches!(
            self.opcode,
            Opcode::Call | Opcode::Print | Opcode::Alloc | Opcode::Free | Opcode::Load | Opcode::Store
        )
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.opcode, Opcode::Jmp | Opcode::Br | Opcode::Ret)
    }

    pub fn uses_memory(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Alloc
                | Opcode::Free
                | Opcode::Store
                | Opcode::Load
                | Opcode::PtrAdd
                | Opcode::PtrSub
                | Opcode::PtrDiff
                | Opcode::AddressOf
        )
    }

    pub fn is_load_or_store(&self) -> bool {
        matches!(self.opcode, Opcode::Load | Opcode::Store)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Jmp => write!(f, "jmp {};", self.labels[0]),
            Opcode::Br => {
                write!(f, "br {} {} {};", self.arguments[0], self.labels[0], self.labels[1])
            }
            Opcode::Ret => match self.arguments.first() {
                Some(value) => write!(f, "ret {value};"),
                None => write!(f, "ret;"),
            },
            Opcode::Const => {
                let dest = self.destination.as_deref().unwrap_or("_");
                write!(f, "{dest}: {} = const {};", self.ty, self.value)
            }
            Opcode::Call => {
                let dest = self.destination.as_deref().unwrap_or("_");
                write!(f, "{dest}: {} = call @{}", self.ty, self.funcs[0])?;
                for argument in &self.arguments {
                    write!(f, " {argument}")?;
                }
                write!(f, ";")
            }
            Opcode::Print => write!(f, "print {};", self.arguments[0]),
            Opcode::Free => write!(f, "free {};", self.arguments[0]),
            Opcode::Store => write!(f, "store {} {};", self.arguments[0], self.arguments[1]),
            Opcode::Nop => write!(f, "nop;"),
            Opcode::Label => write!(f, "{}:", self.labels[0]),
            Opcode::Phi => {
                let dest = self.destination.as_deref().unwrap_or("_");
                write!(f, "{dest}: {} = phi", self.ty)?;
                for (label, argument) in self.labels.iter().zip(&self.arguments) {
                    write!(f, " {label} {argument}")?;
                }
                write!(f, ";")
            }
            _ => {
                let dest = self.destination.as_deref().unwrap_or("_");
                write!(f, "{dest}: {} = {}", self.ty, self.opcode)?;
                for argument in &self.arguments {
                    write!(f, " {argument}")?;
                }
                write!(f, ";")
            }
        }
    }
}

/// A procedure lowered to a flat instruction list, before any control-flow
/// structure is recovered.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Variable>,
    pub return_type: Type,
    pub instructions: Vec<Instruction>,
}

impl Function {
    pub fn new(name: impl Into<String>, parameters: Vec<Variable>, return_type: Type) -> Self {
        Self { name: name.into(), parameters, return_type, instructions: Vec::new() }
    }
}
