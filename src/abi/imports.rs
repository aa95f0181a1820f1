//! Import table
//!
//! Every host function a module may import, keyed by `(module, name)`.
//! Handlers unpack the raw arguments and forward to the syscall layer, so
//! an engine only needs to route each imported call through
//! [`ImportTable::call`].
//!
//! Calls that take C varargs (`openat`, `ioctl`, `fcntl64`) receive a
//! pointer to the argument block and read the optional argument from it.

use super::{Signature, ValType, Value};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;
use std::collections::HashMap;

/// Namespace of the libc-level imports
pub const ENV: &str = "env";

/// Namespace of the WASI imports
pub const WASI: &str = "wasi_snapshot_preview1";

/// Name of an imported linear memory
pub const MEMORY: &str = "memory";

type Handler = fn(&mut Runtime, &[Value]) -> RuntimeResult<Option<Value>>;

/// One host function offered to the module
#[derive(Clone)]
pub struct Import {
    pub module: &'static str,
    pub name: &'static str,
    pub signature: Signature,
    handler: Handler,
}

impl Import {
    pub fn call(&self, runtime: &mut Runtime, args: &[Value]) -> RuntimeResult<Option<Value>> {
        self.signature.check_args(self.name, args)?;
        (self.handler)(runtime, args)
    }
}

impl std::fmt::Debug for Import {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Import")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

fn int(args: &[Value], index: usize) -> i32 {
    args[index].as_i32().unwrap_or_default()
}

fn ptr(args: &[Value], index: usize) -> u32 {
    int(args, index) as u32
}

fn long(args: &[Value], index: usize) -> i64 {
    args[index].as_i64().unwrap_or_default()
}

fn ret(value: i32) -> RuntimeResult<Option<Value>> {
    Ok(Some(Value::I32(value)))
}

/// Optional `int` stored behind a varargs pointer
fn vararg(runtime: &Runtime, varargs: u32) -> RuntimeResult<i32> {
    if varargs == 0 {
        return Ok(0);
    }
    runtime.memory().read_i32(varargs)
}

pub struct ImportTable {
    /// Namespace -> name -> import
    imports: HashMap<&'static str, HashMap<&'static str, Import>>,
}

impl ImportTable {
    /// The full set of runtime imports
    pub fn standard() -> Self {
        use ValType::{F64, I32, I64};

        let mut table = Self {
            imports: HashMap::new(),
        };

        // Descriptors
        table.add(ENV, "__syscall_openat", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            let mode = vararg(rt, ptr(a, 3))?;
            ret(rt.sys_openat(int(a, 0), ptr(a, 1), int(a, 2), mode as u32))
        });
        table.add(ENV, "__syscall_dup", &[I32], Some(I32), |rt, a| {
            ret(rt.sys_dup(int(a, 0)))
        });
        table.add(ENV, "__syscall_ioctl", &[I32, I32, I32], Some(I32), |rt, a| {
            let arg = vararg(rt, ptr(a, 2))?;
            ret(rt.sys_ioctl(int(a, 0), ptr(a, 1), arg as u32))
        });
        table.add(ENV, "__syscall_fcntl64", &[I32, I32, I32], Some(I32), |rt, a| {
            let arg = vararg(rt, ptr(a, 2))?;
            ret(rt.sys_fcntl(int(a, 0), int(a, 1), arg))
        });
        table.add(ENV, "__syscall_ftruncate64", &[I32, I64], Some(I32), |rt, a| {
            ret(rt.sys_ftruncate(int(a, 0), long(a, 1)))
        });

        // Metadata
        table.add(ENV, "__syscall_fstat64", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_fstat(int(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_stat64", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_stat(ptr(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_lstat64", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_lstat(ptr(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_newfstatat", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_newfstatat(int(a, 0), ptr(a, 1), ptr(a, 2), int(a, 3)))
        });
        table.add(ENV, "__syscall_chmod", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_chmod(ptr(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_truncate64", &[I32, I64], Some(I32), |rt, a| {
            ret(rt.sys_truncate(ptr(a, 0), long(a, 1)))
        });

        // Namespace
        table.add(ENV, "__syscall_mkdirat", &[I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_mkdirat(int(a, 0), ptr(a, 1), ptr(a, 2)))
        });
        table.add(ENV, "__syscall_rmdir", &[I32], Some(I32), |rt, a| {
            ret(rt.sys_rmdir(ptr(a, 0)))
        });
        table.add(ENV, "__syscall_unlinkat", &[I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_unlinkat(int(a, 0), ptr(a, 1), int(a, 2)))
        });
        table.add(ENV, "__syscall_renameat", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_renameat(int(a, 0), ptr(a, 1), int(a, 2), ptr(a, 3)))
        });
        table.add(ENV, "__syscall_symlink", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_symlink(ptr(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_readlinkat", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_readlinkat(int(a, 0), ptr(a, 1), ptr(a, 2), int(a, 3)))
        });
        table.add(ENV, "__syscall_getcwd", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.sys_getcwd(ptr(a, 0), ptr(a, 1)))
        });
        table.add(ENV, "__syscall_chdir", &[I32], Some(I32), |rt, a| {
            ret(rt.sys_chdir(ptr(a, 0)))
        });

        // Memory, clocks, traps
        table.add(ENV, "emscripten_memcpy_big", &[I32, I32, I32], None, |rt, a| {
            rt.memcpy_big(ptr(a, 0), ptr(a, 1), ptr(a, 2))?;
            Ok(None)
        });
        table.add(ENV, "emscripten_resize_heap", &[I32], Some(I32), |rt, a| {
            ret(rt.resize_heap(ptr(a, 0)))
        });
        table.add(ENV, "emscripten_date_now", &[], Some(F64), |rt, _| {
            Ok(Some(Value::F64(rt.clock_now_ms())))
        });
        table.add(ENV, "emscripten_get_now", &[], Some(F64), |rt, _| {
            Ok(Some(Value::F64(rt.perf_now())))
        });
        table.add(ENV, "_emscripten_get_now_is_monotonic", &[], Some(I32), |_, _| ret(1));
        table.add(ENV, "abort", &[], None, |rt, _| Err(rt.abort("native code called abort()")));

        // libc hooks
        table.add(ENV, "__cxa_allocate_exception", &[I32], Some(I32), |rt, a| {
            let thrown = rt.cxa_allocate_exception(ptr(a, 0))?;
            ret(thrown as i32)
        });
        table.add(ENV, "__cxa_throw", &[I32, I32, I32], None, |rt, a| {
            Err(rt.cxa_throw(ptr(a, 0), ptr(a, 1), ptr(a, 2)))
        });
        table.add(ENV, "strftime", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            let written = rt.strftime(ptr(a, 0), ptr(a, 1), ptr(a, 2), ptr(a, 3))?;
            ret(written as i32)
        });

        // WASI
        table.add(WASI, "fd_read", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.fd_read(int(a, 0), ptr(a, 1), int(a, 2), ptr(a, 3)))
        });
        table.add(WASI, "fd_write", &[I32, I32, I32, I32], Some(I32), |rt, a| {
            ret(rt.fd_write(int(a, 0), ptr(a, 1), int(a, 2), ptr(a, 3)))
        });
        table.add(WASI, "fd_close", &[I32], Some(I32), |rt, a| {
            ret(rt.fd_close(int(a, 0)))
        });
        table.add(WASI, "fd_seek", &[I32, I64, I32, I32], Some(I32), |rt, a| {
            ret(rt.fd_seek(int(a, 0), long(a, 1), int(a, 2), ptr(a, 3)))
        });
        table.add(WASI, "environ_sizes_get", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.environ_sizes_get(ptr(a, 0), ptr(a, 1)))
        });
        table.add(WASI, "environ_get", &[I32, I32], Some(I32), |rt, a| {
            ret(rt.environ_get(ptr(a, 0), ptr(a, 1)))
        });
        table.add(WASI, "proc_exit", &[I32], None, |rt, a| {
            Err(rt.abort(&format!("exit({})", int(a, 0))))
        });

        table
    }

    fn add(
        &mut self,
        module: &'static str,
        name: &'static str,
        params: &[ValType],
        result: Option<ValType>,
        handler: Handler,
    ) {
        let import = Import {
            module,
            name,
            signature: Signature::new(params, result),
            handler,
        };
        self.imports.entry(module).or_default().insert(name, import);
    }

    pub fn resolve(&self, module: &str, name: &str) -> Option<&Import> {
        self.imports.get(module)?.get(name)
    }

    /// Whether a memory import `module.name` can be satisfied
    pub fn provides_memory(&self, module: &str, name: &str) -> bool {
        module == ENV && name == MEMORY
    }

    /// Route an imported call from the module
    pub fn call(
        &self,
        runtime: &mut Runtime,
        module: &str,
        name: &str,
        args: &[Value],
    ) -> RuntimeResult<Option<Value>> {
        let import = self.resolve(module, name).ok_or_else(|| RuntimeError::Trap {
            reason: format!("call to unresolved import {}.{}", module, name),
        })?;
        import.call(runtime, args)
    }

    pub fn len(&self) -> usize {
        self.imports.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::standard()
    }
}
