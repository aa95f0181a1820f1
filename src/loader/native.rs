//! Instantiation
//!
//! [`Instantiate`] is the seam between the loader and whatever executes the
//! module's code. [`NativeModule`] is the built-in implementation: its entry
//! points are Rust closures running against the same [`Runtime`] a compiled
//! module would see.

use super::validate::{ModuleInfo, WasmBuilder};
use crate::abi::imports::ImportTable;
use crate::abi::{Export, ExportTable, Signature, Value};
use crate::error::{LoadError, LoadResult, RuntimeResult};
use crate::runtime::Runtime;

/// Turns a validated module binary into callable exports
pub trait Instantiate {
    fn instantiate(
        &self,
        info: &ModuleInfo,
        bytes: &[u8],
        runtime: &mut Runtime,
        imports: &ImportTable,
    ) -> LoadResult<ExportTable>;
}

/// A module whose entry points are implemented in Rust
///
/// ```ignore
/// let module = NativeModule::new()
///     .import(WASI, "fd_write")
///     .export("Highs_create", Signature::new(&[], Some(ValType::I32)), |_, _| {
///         Ok(Some(Value::I32(1)))
///     });
/// let bytes = module.binary();
/// ```
#[derive(Debug, Clone, Default)]
pub struct NativeModule {
    exports: Vec<Export>,
    imports: Vec<(&'static str, &'static str)>,
}

impl NativeModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export<F>(self, name: &str, signature: Signature, func: F) -> Self
    where
        F: Fn(&mut Runtime, &[Value]) -> RuntimeResult<Option<Value>> + 'static,
    {
        self.export_fn(Export::new(name, signature, func))
    }

    pub fn export_fn(mut self, export: Export) -> Self {
        self.exports.retain(|e| e.name() != export.name());
        self.exports.push(export);
        self
    }

    /// Declare a runtime import the module uses
    pub fn import(mut self, module: &'static str, name: &'static str) -> Self {
        self.imports.push((module, name));
        self
    }

    /// Interface-only binary declaring this module's imports and exports
    ///
    /// Imports are declared with the signatures of the standard import
    /// table; names it does not know are declared as `() -> ()` and fail
    /// validation.
    pub fn binary(&self) -> Vec<u8> {
        let table = ImportTable::standard();
        let mut builder = WasmBuilder::new();
        for &(module, name) in &self.imports {
            if table.provides_memory(module, name) {
                builder = builder.import_memory(module, name);
                continue;
            }
            let signature = table
                .resolve(module, name)
                .map(|import| import.signature.clone())
                .unwrap_or_else(|| Signature::new(&[], None));
            builder = builder.import_func(module, name, &signature);
        }
        for export in &self.exports {
            builder = builder.export_func(export.name(), export.signature());
        }
        builder.build()
    }
}

impl Instantiate for NativeModule {
    fn instantiate(
        &self,
        info: &ModuleInfo,
        _bytes: &[u8],
        _runtime: &mut Runtime,
        _imports: &ImportTable,
    ) -> LoadResult<ExportTable> {
        let mut exports = Vec::new();
        for (name, declared) in info.function_exports() {
            let export = self
                .exports
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| LoadError::MissingExport {
                    name: name.to_string(),
                })?;
            if declared != Some(export.signature()) {
                return Err(LoadError::Instantiation {
                    reason: format!(
                        "export '{}' declared as {:?}, implemented as {:?}",
                        name,
                        declared,
                        export.signature()
                    ),
                });
            }
            exports.push(export.clone());
        }
        Ok(ExportTable::new(exports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ValType;
    use crate::abi::imports::{ENV, MEMORY, WASI};
    use crate::devices::CapturedLines;
    use crate::loader::validate::ModuleValidator;

    fn runtime() -> Runtime {
        Runtime::builder()
            .terminal_output(CapturedLines::new())
            .terminal_error(CapturedLines::new())
            .build()
            .unwrap()
    }

    fn create() -> NativeModule {
        NativeModule::new()
            .import(WASI, "fd_write")
            .import(ENV, MEMORY)
            .export("Highs_create", Signature::new(&[], Some(ValType::I32)), |_, _| {
                Ok(Some(Value::I32(7)))
            })
    }

    #[test]
    fn test_binary_validates_against_standard_imports() {
        let module = create();
        let info = ModuleValidator::validate(&module.binary(), &ImportTable::standard()).unwrap();
        assert_eq!(info.imports.len(), 2);
        assert_eq!(info.exports.len(), 1);
    }

    #[test]
    fn test_instantiate_exposes_exports() {
        let module = create();
        let imports = ImportTable::standard();
        let bytes = module.binary();
        let info = ModuleValidator::validate(&bytes, &imports).unwrap();

        let mut rt = runtime();
        let exports = module.instantiate(&info, &bytes, &mut rt, &imports).unwrap();
        let result = exports.get("Highs_create").unwrap().call(&mut rt, &[]).unwrap();
        assert_eq!(result, Some(Value::I32(7)));
    }

    #[test]
    fn test_declared_export_without_body() {
        let bytes = WasmBuilder::new()
            .export_func("Highs_run", &Signature::new(&[ValType::I32], Some(ValType::I32)))
            .build();
        let imports = ImportTable::standard();
        let info = ModuleValidator::validate(&bytes, &imports).unwrap();

        let mut rt = runtime();
        assert_eq!(
            create().instantiate(&info, &bytes, &mut rt, &imports).unwrap_err(),
            LoadError::MissingExport {
                name: "Highs_run".to_string()
            }
        );
    }

    #[test]
    fn test_export_signature_mismatch() {
        let bytes = WasmBuilder::new()
            .export_func("Highs_create", &Signature::new(&[], Some(ValType::F64)))
            .build();
        let imports = ImportTable::standard();
        let info = ModuleValidator::validate(&bytes, &imports).unwrap();

        let mut rt = runtime();
        assert!(matches!(
            create().instantiate(&info, &bytes, &mut rt, &imports),
            Err(LoadError::Instantiation { .. })
        ));
    }

    #[test]
    fn test_solver_runtime_imports_resolve() {
        let module = [
            "__cxa_allocate_exception",
            "__cxa_throw",
            "__syscall_fcntl64",
            "__syscall_ioctl",
            "__syscall_openat",
            "emscripten_date_now",
            "_emscripten_get_now_is_monotonic",
            "abort",
            "emscripten_get_now",
            "emscripten_memcpy_big",
            "emscripten_resize_heap",
            "strftime",
        ]
        .into_iter()
        .fold(create(), |module, name| module.import(ENV, name));
        let module = ["environ_get", "environ_sizes_get", "fd_close", "fd_read", "fd_seek"]
            .into_iter()
            .fold(module, |module, name| module.import(WASI, name));

        let info = ModuleValidator::validate(&module.binary(), &ImportTable::standard()).unwrap();
        assert_eq!(info.imports.len(), 19);
    }

    #[test]
    fn test_unknown_import_fails_validation() {
        let module = create().import(ENV, "__cxa_begin_catch");
        assert!(matches!(
            ModuleValidator::validate(&module.binary(), &ImportTable::standard()),
            Err(LoadError::UnresolvedImport { .. })
        ));
    }
}
