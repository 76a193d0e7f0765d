//! Cross-stage handover workspace and instruction templates.

mod instructions;
mod manager;

pub use instructions::{InstructionKind, InstructionLoader, interpolate};
pub use manager::{HandoverManager, copy_dir_recursive};
