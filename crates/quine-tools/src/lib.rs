//! The tool dispatcher: exactly five tools, schema
//! validation, and tape-entry formatting.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use builtin::*;
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCall, ToolOutput};
