pub mod ir;
pub mod cfg;
pub mod lowering;
pub mod ssa;
pub mod interp;
