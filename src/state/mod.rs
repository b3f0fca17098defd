//! `PipelineState` and its durable store (C1, §3, §4.4).

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{
    DimensionalProfile, ExecutionPattern, FileState, FileStatus, ObjectiveLevel, ObjectiveRecord,
    ObjectiveSet, PatternKind, PhaseResult, PhaseState, PipelineState, Priority, SuccessCriterion,
    TaskError, TaskState, TaskStatus, ToolCall, ToolResult,
};
