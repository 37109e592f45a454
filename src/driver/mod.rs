pub mod driver;

pub use driver::{compile, compile_to_cfg};
