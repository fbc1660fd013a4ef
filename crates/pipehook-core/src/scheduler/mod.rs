//! Dynamic step-graph scheduling.
//!
//! Provides:
//! - [`Step`] / [`StepInput`]: steps and their copy-on-write inputs
//! - [`StepHandler`] / [`HandlerRegistry`]: handlers selected by step name
//! - [`StepScheduler`]: join barrier, retries and cancellation for one build

pub mod engine;
pub mod error;
pub mod handler;
pub mod outcome;
pub mod step;

pub use engine::{Advance, BuildConclusion, BuildRun, StepScheduler, StepTable};
pub use error::{SchedulerError, SchedulerResult};
pub use handler::{HandlerRegistry, StepContext, StepHandler};
pub use outcome::{StepOutcome, StepResult};
pub use step::{StateTransition, Step, StepBuilder, StepId, StepInput, StepRecord, StepStatus};
