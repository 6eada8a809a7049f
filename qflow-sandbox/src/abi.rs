//! The fixed, capability-gated host ABI a module may import: `log`, `now`,
//! `get_input`, `emit_event`, `read_state`, `write_state`, and a small set
//! of numerics. Binding mirrors the `bind_syscalls(&mut linker)` pattern
//! used by comparable WASM-hosting executors.

use wasmtime::{Caller, Linker, Memory};

use crate::error::SandboxError;

/// Per-tenant persistence channel the ABI's `read_state`/`write_state`
/// calls are routed through — implemented by the isolation layer so no
/// component above it can bypass tenant/DAO-subnet enforcement. A read
/// outside the caller's own scope fails with `IsolationViolation` rather
/// than returning `None`, so a cross-tenant probe can't distinguish a
/// denied read from a legitimate miss.
pub trait StateAccess: Send + Sync {
    fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>, SandboxError>;
    fn write_state(&self, key: &str, value: Vec<u8>);
}

/// Ceilings on how many times each host call may be invoked in a single
/// step invocation.
#[derive(Debug, Clone, Copy)]
pub struct HostCallCeilings {
    pub log: u32,
    pub emit_event: u32,
    pub read_state: u32,
    pub write_state: u32,
}

impl Default for HostCallCeilings {
    fn default() -> Self {
        Self {
            log: 256,
            emit_event: 64,
            read_state: 256,
            write_state: 256,
        }
    }
}

#[derive(Default)]
struct HostCallCounts {
    log: u32,
    emit_event: u32,
    read_state: u32,
    write_state: u32,
}

/// The per-invocation state threaded through `wasmtime::Store<HostState>`.
/// Destroyed with the `Store` at the end of every invocation.
pub struct HostState {
    pub input: Vec<u8>,
    pub emitted_events: Vec<Vec<u8>>,
    pub state: std::sync::Arc<dyn StateAccess>,
    pub ceilings: HostCallCeilings,
    pub now_fn: fn() -> u64,
    counts: HostCallCounts,
    pub error: Option<SandboxError>,
    pub limits: wasmtime::StoreLimits,
}

impl HostState {
    pub fn new(
        input: Vec<u8>,
        state: std::sync::Arc<dyn StateAccess>,
        ceilings: HostCallCeilings,
        limits: wasmtime::StoreLimits,
    ) -> Self {
        Self {
            input,
            emitted_events: Vec::new(),
            state,
            ceilings,
            now_fn: qflow_common::time::now_millis,
            counts: HostCallCounts::default(),
            error: None,
            limits,
        }
    }

    fn record_fatal(&mut self, err: SandboxError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

impl wasmtime::ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        self.limits.memory_growing(current, desired, maximum)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }
}

fn memory_of(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

fn read_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, SandboxError> {
    let memory = memory_of(caller).ok_or_else(|| SandboxError::Trap("no exported memory".into()))?;
    let data = memory.data(caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| SandboxError::Trap("pointer arithmetic overflow".into()))?;
    data.get(start..end)
        .map(|s| s.to_vec())
        .ok_or_else(|| SandboxError::Trap("guest pointer out of bounds".into()))
}

fn write_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    bytes: &[u8],
) -> Result<(), SandboxError> {
    let memory = memory_of(caller).ok_or_else(|| SandboxError::Trap("no exported memory".into()))?;
    let data = memory.data_mut(caller);
    let start = ptr as usize;
    let end = start
        .checked_add(bytes.len())
        .ok_or_else(|| SandboxError::Trap("pointer arithmetic overflow".into()))?;
    let dest = data
        .get_mut(start..end)
        .ok_or_else(|| SandboxError::Trap("guest pointer out of bounds".into()))?;
    dest.copy_from_slice(bytes);
    Ok(())
}

/// Binds the fixed ABI onto `linker`. Any import a module declares that is
/// not bound here fails instantiation with `DisallowedImport`.
pub fn bind_abi(linker: &mut Linker<HostState>) -> Result<(), SandboxError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> i32 {
                let ceiling = caller.data().ceilings.log;
                if caller.data().counts.log >= ceiling {
                    caller.data_mut().record_fatal(SandboxError::HostCallLimitExceeded {
                        call: "log",
                        count: caller.data().counts.log + 1,
                        limit: ceiling,
                    });
                    return -1;
                }
                caller.data_mut().counts.log += 1;
                match read_guest_bytes(&mut caller, ptr, len) {
                    Ok(bytes) => {
                        let msg = String::from_utf8_lossy(&bytes);
                        log::trace!(target: "qflow_sandbox::guest", "{}", msg);
                        0
                    }
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        -1
                    }
                }
            },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap("env", "now", |caller: Caller<'_, HostState>| -> u64 {
            (caller.data().now_fn)()
        })
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap(
            "env",
            "get_input_len",
            |caller: Caller<'_, HostState>| -> u32 { caller.data().input.len() as u32 },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap(
            "env",
            "get_input",
            |mut caller: Caller<'_, HostState>, out_ptr: u32| -> i32 {
                let input = caller.data().input.clone();
                match write_guest_bytes(&mut caller, out_ptr, &input) {
                    Ok(()) => 0,
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        -1
                    }
                }
            },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap(
            "env",
            "emit_event",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> i32 {
                let ceiling = caller.data().ceilings.emit_event;
                if caller.data().counts.emit_event >= ceiling {
                    caller.data_mut().record_fatal(SandboxError::HostCallLimitExceeded {
                        call: "emit_event",
                        count: caller.data().counts.emit_event + 1,
                        limit: ceiling,
                    });
                    return -1;
                }
                caller.data_mut().counts.emit_event += 1;
                match read_guest_bytes(&mut caller, ptr, len) {
                    Ok(bytes) => {
                        caller.data_mut().emitted_events.push(bytes);
                        0
                    }
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        -1
                    }
                }
            },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap(
            "env",
            "read_state",
            |mut caller: Caller<'_, HostState>,
             key_ptr: u32,
             key_len: u32,
             out_ptr: u32,
             out_cap: u32|
             -> i32 {
                let ceiling = caller.data().ceilings.read_state;
                if caller.data().counts.read_state >= ceiling {
                    caller.data_mut().record_fatal(SandboxError::HostCallLimitExceeded {
                        call: "read_state",
                        count: caller.data().counts.read_state + 1,
                        limit: ceiling,
                    });
                    return -1;
                }
                caller.data_mut().counts.read_state += 1;

                let key_bytes = match read_guest_bytes(&mut caller, key_ptr, key_len) {
                    Ok(b) => b,
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        return -1;
                    }
                };
                let key = String::from_utf8_lossy(&key_bytes).to_string();
                let value = caller.data().state.read_state(&key);
                match value {
                    Ok(None) => -2, // not present
                    Ok(Some(v)) => {
                        if v.len() as u32 > out_cap {
                            return -3; // buffer too small; caller retries with get_input_len-style probe
                        }
                        match write_guest_bytes(&mut caller, out_ptr, &v) {
                            Ok(()) => v.len() as i32,
                            Err(e) => {
                                caller.data_mut().record_fatal(e);
                                -1
                            }
                        }
                    }
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        -1
                    }
                }
            },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    linker
        .func_wrap(
            "env",
            "write_state",
            |mut caller: Caller<'_, HostState>,
             key_ptr: u32,
             key_len: u32,
             val_ptr: u32,
             val_len: u32|
             -> i32 {
                let ceiling = caller.data().ceilings.write_state;
                if caller.data().counts.write_state >= ceiling {
                    caller.data_mut().record_fatal(SandboxError::HostCallLimitExceeded {
                        call: "write_state",
                        count: caller.data().counts.write_state + 1,
                        limit: ceiling,
                    });
                    return -1;
                }
                caller.data_mut().counts.write_state += 1;

                let key_bytes = match read_guest_bytes(&mut caller, key_ptr, key_len) {
                    Ok(b) => b,
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        return -1;
                    }
                };
                let value = match read_guest_bytes(&mut caller, val_ptr, val_len) {
                    Ok(b) => b,
                    Err(e) => {
                        caller.data_mut().record_fatal(e);
                        return -1;
                    }
                };
                let key = String::from_utf8_lossy(&key_bytes).to_string();
                caller.data().state.write_state(&key, value);
                0
            },
        )
        .map_err(|e| SandboxError::LoadError(e.to_string()))?;

    Ok(())
}
