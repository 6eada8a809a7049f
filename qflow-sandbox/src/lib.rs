//! WASM sandbox host for step actions — Qflow component C2.
//!
//! A step's `action` resolves (within its owning tenant's namespace) to a
//! compiled module via [`registry::ModuleRegistry`]. [`host::SandboxHost`]
//! instantiates that module behind the fixed host ABI in [`abi`] and runs
//! it under the resource caps in [`host::InvocationCaps`]: wall-clock
//! deadline, linear memory ceiling, fuel ceiling, and per-call-type host
//! call ceilings. All sandbox state — the `Store`, the ABI's accounting —
//! is dropped at the end of the invocation; nothing survives between
//! steps except what the module explicitly persisted via `write_state`.

pub mod abi;
pub mod error;
pub mod host;
pub mod registry;

pub use abi::{HostCallCeilings, StateAccess};
pub use error::SandboxError;
pub use host::{InvocationCaps, SandboxHost, SandboxResult};
pub use registry::ModuleRegistry;
