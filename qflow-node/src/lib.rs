//! Single-node Qflow execution engine: wires every `qflow-*` component
//! crate into the node's ingress operations and background tasks.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod tasks;

pub use config::Cli;
pub use engine::{ExecutionStatusView, QflowEngine, StepJob};
pub use error::QflowError;
pub use executor::{ActionExecutor, SandboxActionExecutor, ScriptedActionExecutor};
