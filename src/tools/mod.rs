pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod validator;

pub use echo::EchoTool;
pub use executor::{ToolError, ToolExecutor};
pub use registry::{available_tools, Tool, ToolBackend, ToolCall, ToolDescriptor, ToolProvider, ToolRegistry};
pub use schema::{dynamic_tool_schema_json, ParamType, ToolParameter, ToolSchema};
pub use validator::{SchemaCheck, SchemaRejection, SchemaValidator};
