//! Tool catalog and dispatch (C3, C4, §4.3).

pub mod dispatcher;
pub mod handlers;
pub mod registry;

pub use dispatcher::ToolDispatcher;
pub use registry::{HandlerContext, SafetyClass, ToolCategory, ToolRegistry, ToolSchema, ToolUsage};
