//! Tool registry and handler seam.

pub mod handler;
pub mod registry;

pub use handler::{CommandHandler, ToolHandler};
pub use registry::{ToolOutcome, ToolRegistry, ToolSchema};
