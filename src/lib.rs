pub mod error_handling;
pub mod expression;
pub mod generator;
pub mod grammar;
pub mod linker;
pub mod parser;
pub mod rules;

pub use error_handling::LSystemError;
pub use generator::{CompiledGrammar, GlobalParameter, LSystemState, StepOptions};
pub use grammar::{Symbol, SymbolString};
pub use linker::{compile, CompileOptions, FileSet};
