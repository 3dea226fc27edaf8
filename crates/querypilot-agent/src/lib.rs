pub mod exec_db;
pub mod executor;
pub mod oracle;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod response;
pub mod synth;

pub use executor::{ExecutedQueryRecord, ExecutionReport, Executor, StepOutcome};
pub use oracle::{HttpOracle, Oracle};
pub use pipeline::{AgentPipeline, QUERY_MAX_CHARS, QUERY_MIN_CHARS};
pub use plan::{Plan, PlanStep, StatOp};
pub use planner::{Planner, PlanOutcome};
pub use response::{AgentResponse, QueryRequest, ResponseShaper};
pub use synth::Synthesizer;
