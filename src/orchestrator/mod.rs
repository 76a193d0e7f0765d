//! Pipeline orchestration: group execution, initialisation, reduction,
//! and the top-level runner.

mod group;
mod init;
mod reducer;
mod runner;

pub use group::{GroupOrchestrator, GroupResult, aggregate_results};
pub use init::{PipelineInitializer, RunContext, RunOptions};
pub use reducer::{ContextReducer, REDUCER_STAGE};
pub use runner::{ActiveRun, PipelineRunner};
