pub mod budget;
pub mod cli;
pub mod config;
pub mod context;
pub mod init;
pub mod interp;
pub mod microthread;
pub mod types;


// Re-export main types
pub use types::*;

pub use budget::{BudgetSignal, CpuBudget};
pub use context::{Context, StateError};
pub use microthread::{Microthread, ResumeError};

// Re-export init API for convenience
pub use init::{initialize, InitBuilder, InitOptions};
