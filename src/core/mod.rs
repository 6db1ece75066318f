pub mod engine;
pub mod pipeline;
pub mod preflight;
pub mod probe;
pub mod run_state;

pub use engine::{Executor, RunEvent, RunHandle, RunOutcome, create_executor};
pub use pipeline::{BuildContext, PipelineSpec, Stage, build};
pub use preflight::{CheckLine, CheckStatus, PreflightReport, validate};
pub use probe::{EnvironmentProbe, SystemProbe};
pub use run_state::RunState;
