pub mod echo;
pub mod executor;
pub mod registry;
pub mod sandbox;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{preview, CallRecord, Invocation, ToolExecutor, TIMEOUT_ERROR};
pub use registry::{BanObserver, LocalTools, Tool, ToolProvider, ToolRegistry, ToolSpec, ToolStats};
pub use sandbox::{
    script_sandbox, CodeUnit, ExecutionResult, Op, Sandbox, SandboxLimits, SandboxRun, ScriptSandbox,
};
pub use schema::code_unit_schema_json;
