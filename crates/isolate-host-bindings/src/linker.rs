//! Host function registration for the main instance's linker.

use isolate_host_common::RuntimeError;
use isolate_host_core::EnvironmentContext;
use isolate_host_core::isolate_data::MEMORY_EXPORT;
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::logging::{LoggingHost, level_from_i32};

/// Register all host functions on `linker`.
///
/// - `env::log` - Logging function for guest code
pub fn register_all(linker: &mut Linker<EnvironmentContext>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    Ok(())
}

/// Register `env::log(level: i32, ptr: i32, len: i32)`.
///
/// `ptr` and `len` locate a UTF-8 message in the guest's exported memory.
/// Malformed calls are dropped with a warning instead of trapping the guest.
pub fn register_logging(linker: &mut Linker<EnvironmentContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, EnvironmentContext>, level: i32, ptr: i32, len: i32| {
                let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
                    warn!(ptr, len, "Invalid pointer or length (negative value)");
                    return;
                };

                let Some(memory) = caller
                    .get_export(MEMORY_EXPORT)
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    warn!("Memory export not found in guest module");
                    return;
                };

                let message = {
                    let data = memory.data(&caller);
                    let Some(bytes) = start
                        .checked_add(len)
                        .and_then(|end| data.get(start..end))
                    else {
                        warn!(
                            start,
                            len,
                            memory_size = data.len(),
                            "Memory access out of bounds"
                        );
                        return;
                    };

                    String::from_utf8_lossy(bytes).into_owned()
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_host_common::IsolateConfig;
    use isolate_host_core::Isolate;

    #[test]
    fn test_register_all() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let mut linker = Linker::new(isolate.engine());

        assert!(register_all(&mut linker).is_ok());
    }

    #[test]
    fn test_register_twice_fails() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let mut linker = Linker::new(isolate.engine());

        register_logging(&mut linker).unwrap();
        assert!(register_logging(&mut linker).is_err());
    }
}
