//! The seam between a step's `action` and whatever actually runs it,
//! mirroring the collaborator-trait pattern in `qflow-collaborators`
//! (external contract trait plus an in-memory reference implementation).
//! The default implementation wires the real sandbox stack; the scripted
//! one stands in for compiled WASM action modules in tests, since no
//! `.wasm` fixture bytes exist anywhere in this tree.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use qflow_common::TenantId;
use qflow_sandbox::{InvocationCaps, ModuleRegistry, SandboxError, SandboxHost, SandboxResult, StateAccess};

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        tenant: &TenantId,
        action: &str,
        payload: Vec<u8>,
        caps: InvocationCaps,
        state: Arc<dyn StateAccess>,
    ) -> Result<SandboxResult, SandboxError>;
}

/// Production path: resolves `action` in the tenant's module registry and
/// runs it through the real wasmtime-backed host.
pub struct SandboxActionExecutor {
    host: SandboxHost,
    registry: Arc<ModuleRegistry>,
}

impl SandboxActionExecutor {
    pub fn new(registry: Arc<ModuleRegistry>) -> Result<Self, SandboxError> {
        Ok(Self {
            host: SandboxHost::new()?,
            registry,
        })
    }
}

#[async_trait]
impl ActionExecutor for SandboxActionExecutor {
    async fn execute(
        &self,
        tenant: &TenantId,
        action: &str,
        payload: Vec<u8>,
        caps: InvocationCaps,
        state: Arc<dyn StateAccess>,
    ) -> Result<SandboxResult, SandboxError> {
        let (bytes, _hash) = self.registry.resolve(tenant, action)?;
        self.host.invoke(&bytes, payload, caps, state)
    }
}

type ScriptedAction = dyn Fn(&[u8], &dyn StateAccess) -> Result<SandboxResult, SandboxError> + Send + Sync;

/// Test double standing in for a compiled WASM module: `register` installs
/// a closure that receives the raw input payload and the step's scoped
/// `StateAccess`, and returns the same [`SandboxResult`] shape a real
/// invocation would.
#[derive(Default)]
pub struct ScriptedActionExecutor {
    scripts: DashMap<String, Arc<ScriptedAction>>,
}

impl ScriptedActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        action: impl Into<String>,
        script: impl Fn(&[u8], &dyn StateAccess) -> Result<SandboxResult, SandboxError> + Send + Sync + 'static,
    ) {
        self.scripts.insert(action.into(), Arc::new(script));
    }
}

#[async_trait]
impl ActionExecutor for ScriptedActionExecutor {
    async fn execute(
        &self,
        _tenant: &TenantId,
        action: &str,
        payload: Vec<u8>,
        _caps: InvocationCaps,
        state: Arc<dyn StateAccess>,
    ) -> Result<SandboxResult, SandboxError> {
        let script = self
            .scripts
            .get(action)
            .map(|s| s.clone())
            .ok_or_else(|| SandboxError::UnknownAction(action.to_string()))?;
        script(&payload, state.as_ref())
    }
}

pub fn default_caps(timeout: Duration, max_memory_mb: u64, fuel_ceiling: u64) -> InvocationCaps {
    InvocationCaps {
        max_memory_mb,
        fuel_ceiling,
        timeout,
        host_calls: Default::default(),
    }
}
