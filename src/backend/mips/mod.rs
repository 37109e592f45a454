pub mod builder;
pub mod codegen;
pub mod instruction;
pub mod peephole;

pub use codegen::MipsCodeGenerator;
