mod registry;

pub use registry::{ToolRegistry, ToolSpec};
