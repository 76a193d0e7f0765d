//! Stage execution: prompt assembly, runtime drive, output extraction.

mod executor;
mod extract;
mod prompt;

pub use executor::StageExecutor;
pub use extract::extract_outputs;
pub use prompt::{build_user_prompt, interpolate, previous_stages_section};
