//! Application services: scheduling, execution, evaluation and recording.

pub mod consistency;
pub mod criteria_evaluator;
pub mod dimension_provider;
pub mod result_aggregator;
pub mod retry;
pub mod spec_store;
pub mod task_queue;
pub mod test_runner;
pub mod test_state_tracker;

pub use criteria_evaluator::{CriteriaEvaluator, DimensionContext, Verdict};
pub use dimension_provider::DimensionProvider;
pub use result_aggregator::{RunAggregate, TestOutcome};
pub use retry::RetryPolicy;
pub use spec_store::{merge_tests, SaveOutcome, SpecStore};
pub use task_queue::{AdmissionGate, QueueObserver, QueueStats, QueuedTask, TaskQueue};
pub use test_runner::{RunRequest, RunSummary, RunnerContext, TestRunner};
pub use test_state_tracker::{TestStateTracker, TrackerCounts};
