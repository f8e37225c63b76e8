//! Application-level orchestration.
//!
//! The facade turns blur requests into named chains on the scheduler; the
//! controller drives it from UI commands; post-processing builds reports and
//! exports once a chain settles. UI/CLI layers only talk to this module.

mod controller;
pub mod facade;
mod post_process;

pub(crate) use controller::{run_controller, AppEvent, UiCommand, ViewUpdate};
pub use facade::{BlurError, BlurOrchestrator, IMAGE_MANIPULATION_WORK_NAME, TAG_OUTPUT};
pub(crate) use post_process::{export_json, ChainReport, ProcessedChain};
