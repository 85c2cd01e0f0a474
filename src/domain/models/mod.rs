pub mod config;
pub mod dimension;
pub mod entity;
pub mod eval_spec;
pub mod evaluation;
pub mod invocation;
pub mod test_unit;

pub use config::{
    AgentCommandConfig, AgentsConfig, Config, DimensionsConfig, EvaluationConfig,
    ExecutionConfig, LlmConfig, LoggingConfig, StorageConfig,
};
pub use dimension::{
    DimensionConfiguration, DimensionDefinition, DimensionMetadata, DimensionPrompts,
    MULTI_RUN_DIMENSIONS,
};
pub use entity::{EntityKind, EntityRef};
pub use eval_spec::{
    DimensionRunResults, DimensionTests, Discovered, EntitySpec, EvalSpec, EvaluationCriterion,
    MultiRunConfig, PerformanceHistoryEntry, PerformanceTracking, TestHistory,
    TestOutcomeRecord, TestRunRecord, TestSpecification, Thresholds, Trend,
};
pub use evaluation::{
    ConsistencyMethod, ConsistencyReport, CriterionEvaluation, CriterionRequest,
    DEFAULT_STRICTNESS,
};
pub use invocation::{GenerationRequest, InvocationOutput, InvocationRequest};
pub use test_unit::{TestResult, TestStatus, TestUnit, TestUnitUpdate};
