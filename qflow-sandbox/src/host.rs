//! `SandboxHost`: compiles and invokes a step's WASM module under its
//! resource caps (wall-clock deadline, linear memory ceiling, fuel
//! ceiling, host-call ceilings), and destroys all sandbox state at the
//! end of the invocation.

use std::sync::Arc;
use std::time::Duration;

use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimitsBuilder};

use crate::abi::{bind_abi, HostCallCeilings, HostState, StateAccess};
use crate::error::SandboxError;

/// Per-invocation resource caps.
#[derive(Debug, Clone, Copy)]
pub struct InvocationCaps {
    pub max_memory_mb: u64,
    pub fuel_ceiling: u64,
    pub timeout: Duration,
    pub host_calls: HostCallCeilings,
}

pub struct SandboxResult {
    pub output: Vec<u8>,
    pub emitted_events: Vec<Vec<u8>>,
    pub fuel_consumed: u64,
}

pub struct SandboxHost {
    engine: Engine,
}

impl SandboxHost {
    pub fn new() -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| SandboxError::LoadError(e.to_string()))?;
        Ok(Self { engine })
    }

    /// Compiles and runs `module_bytes`'s `run` export: modules export a
    /// single `run(ptr: i32, len: i32) -> i64` whose return value packs an
    /// output pointer/length pair (`ptr << 32 | len`) into the module's own
    /// linear memory. Input bytes are pulled via the ABI's
    /// `get_input`/`get_input_len` rather than poked in before the call, so
    /// `ptr`/`len` passed to `run` are conventionally `0, 0`.
    pub fn invoke(
        &self,
        module_bytes: &[u8],
        payload: Vec<u8>,
        caps: InvocationCaps,
        state: Arc<dyn StateAccess>,
    ) -> Result<SandboxResult, SandboxError> {
        let module = Module::new(&self.engine, module_bytes)
            .map_err(|e| SandboxError::LoadError(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        bind_abi(&mut linker)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size((caps.max_memory_mb as usize) * 1024 * 1024)
            .build();
        let host = HostState::new(payload, state, caps.host_calls, limits);
        let mut store = Store::new(&self.engine, host);
        store.limiter(|s| s);
        store
            .set_fuel(caps.fuel_ceiling)
            .map_err(|e| SandboxError::LoadError(e.to_string()))?;
        store.set_epoch_deadline(1);

        let engine = self.engine.clone();
        let timeout = caps.timeout;
        // One epoch tick after the deadline traps any invocation still
        // running; harmless if the call already returned.
        let _watchdog = std::thread::spawn(move || {
            std::thread::sleep(timeout);
            engine.increment_epoch();
        });

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(classify_instantiation_error)?;

        let run = instance
            .get_typed_func::<(u32, u32), i64>(&mut store, "run")
            .map_err(|_| {
                SandboxError::LoadError("module does not export `run(i32,i32)->i64`".into())
            })?;

        let call_result = run.call(&mut store, (0, 0));

        let packed = match call_result {
            Ok(v) => v,
            Err(trap) => return Err(classify_trap(trap, &store)),
        };

        if let Some(err) = store.data_mut().error.take() {
            return Err(err);
        }

        let fuel_consumed = caps.fuel_ceiling.saturating_sub(store.get_fuel().unwrap_or(0));
        let out_ptr = ((packed as u64) >> 32) as u32;
        let out_len = (packed as u64 & 0xFFFF_FFFF) as u32;
        let output = read_output_from_guest(&instance, &mut store, out_ptr, out_len)?;

        Ok(SandboxResult {
            output,
            emitted_events: std::mem::take(&mut store.data_mut().emitted_events),
            fuel_consumed,
        })
    }
}

fn read_output_from_guest(
    instance: &wasmtime::Instance,
    store: &mut Store<HostState>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, SandboxError> {
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| SandboxError::Trap("no exported memory".into()))?;
    let data = memory.data(&mut *store);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| SandboxError::BadResult("output pointer overflow".into()))?;
    data.get(start..end)
        .map(|s| s.to_vec())
        .ok_or_else(|| SandboxError::BadResult("output pointer out of bounds".into()))
}

fn classify_instantiation_error(e: anyhow::Error) -> SandboxError {
    let msg = e.to_string();
    if msg.contains("unknown import") {
        SandboxError::DisallowedImport(msg)
    } else {
        SandboxError::LoadError(msg)
    }
}

fn classify_trap(trap: anyhow::Error, store: &Store<HostState>) -> SandboxError {
    let msg = trap.to_string();
    if msg.contains("epoch") || msg.contains("interrupt") {
        SandboxError::Timeout
    } else if msg.contains("fuel") {
        SandboxError::FuelExceeded {
            ceiling: store.get_fuel().unwrap_or(0),
        }
    } else if msg.contains("memory") || msg.contains("out of bounds") {
        SandboxError::MemoryExceeded { limit_mb: 0 }
    } else {
        SandboxError::Trap(msg)
    }
}
