pub mod mips;
pub mod regalloc;
