//! Module ABI
//!
//! Defines the stable interface between the runtime and a loaded module:
//!
//! - [`Value`] / [`ValType`]: the numeric values crossing the boundary
//! - [`Signature`]: parameter and result types of one entry point
//! - [`ExportTable`]: the module's callable entry points, fixed once the
//!   module is ready
//! - [`imports`]: the functions the runtime offers the module
//!
//! Pointers are plain `I32` offsets into linear memory.

pub mod imports;
pub mod marshal;

pub use imports::{Import, ImportTable};
pub use marshal::{Arg, Module, Ret, ReturnKind};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Export names the runtime looks for
pub mod exports {
    /// Static constructors, run once after instantiation
    pub const CALL_CTORS: &str = "__wasm_call_ctors";
    /// Address of the module's errno cell
    pub const ERRNO_LOCATION: &str = "__errno_location";
}

/// Value type of a parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F64,
}

impl ValType {
    pub fn name(&self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F64 => "f64",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value passed to or returned from the module
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a number, whatever its width
    pub fn to_f64(&self) -> f64 {
        match *self {
            Value::I32(v) => v as f64,
            Value::I64(v) => v as f64,
            Value::F64(v) => v,
        }
    }
}

/// Parameter and result types of an entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

impl Signature {
    pub fn new(params: &[ValType], result: Option<ValType>) -> Self {
        Self {
            params: params.to_vec(),
            result,
        }
    }

    /// Check `args` against the parameter list
    pub fn check_args(&self, name: &str, args: &[Value]) -> RuntimeResult<()> {
        if args.len() != self.params.len() {
            return Err(RuntimeError::ArityMismatch {
                name: name.to_string(),
                expected: self.params.len(),
                got: args.len(),
            });
        }
        for (index, (arg, ty)) in args.iter().zip(&self.params).enumerate() {
            if arg.ty() != *ty {
                return Err(RuntimeError::ArgumentType {
                    name: name.to_string(),
                    index,
                    expected: ty.name(),
                });
            }
        }
        Ok(())
    }

    fn check_result(&self, name: &str, result: Option<Value>) -> RuntimeResult<Option<Value>> {
        let got = result.map(|v| v.ty());
        if got != self.result {
            return Err(RuntimeError::ReturnType {
                name: name.to_string(),
                expected: self.result.map(|t| t.name()).unwrap_or("nothing"),
                got: got.map(|t| t.name()).unwrap_or("nothing"),
            });
        }
        Ok(result)
    }
}

/// Body of a host-implemented entry point
pub type HostFunc = Rc<dyn Fn(&mut Runtime, &[Value]) -> RuntimeResult<Option<Value>>>;

/// One callable entry point
#[derive(Clone)]
pub struct Export {
    name: String,
    signature: Signature,
    func: HostFunc,
}

impl Export {
    pub fn new<F>(name: &str, signature: Signature, func: F) -> Self
    where
        F: Fn(&mut Runtime, &[Value]) -> RuntimeResult<Option<Value>> + 'static,
    {
        Self {
            name: name.to_string(),
            signature,
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Call with type-checked arguments and result
    pub fn call(&self, runtime: &mut Runtime, args: &[Value]) -> RuntimeResult<Option<Value>> {
        self.signature.check_args(&self.name, args)?;
        let result = (self.func)(runtime, args)?;
        self.signature.check_result(&self.name, result)
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The module's entry points by name
///
/// There is no way to add or remove entries once built.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    exports: HashMap<String, Export>,
}

impl ExportTable {
    pub fn new(exports: impl IntoIterator<Item = Export>) -> Self {
        Self {
            exports: exports
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> RuntimeResult<&Export> {
        self.exports
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownExport {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    /// Sorted export names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::CapturedLines;

    fn runtime() -> Runtime {
        Runtime::builder()
            .terminal_output(CapturedLines::new())
            .terminal_error(CapturedLines::new())
            .build()
            .unwrap()
    }

    fn add() -> Export {
        Export::new(
            "add",
            Signature::new(&[ValType::I32, ValType::I32], Some(ValType::I32)),
            |_, args| {
                let a = args[0].as_i32().unwrap_or(0);
                let b = args[1].as_i32().unwrap_or(0);
                Ok(Some(Value::I32(a + b)))
            },
        )
    }

    #[test]
    fn test_export_call() {
        let mut rt = runtime();
        let result = add().call(&mut rt, &[Value::I32(2), Value::I32(40)]).unwrap();
        assert_eq!(result, Some(Value::I32(42)));
    }

    #[test]
    fn test_export_rejects_bad_arguments() {
        let mut rt = runtime();
        assert!(matches!(
            add().call(&mut rt, &[Value::I32(1)]),
            Err(RuntimeError::ArityMismatch {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(matches!(
            add().call(&mut rt, &[Value::I32(1), Value::F64(1.0)]),
            Err(RuntimeError::ArgumentType {
                index: 1,
                expected: "i32",
                ..
            })
        ));
    }

    #[test]
    fn test_export_result_must_match_signature() {
        let mut rt = runtime();
        let liar = Export::new("liar", Signature::new(&[], Some(ValType::F64)), |_, _| {
            Ok(Some(Value::I32(1)))
        });
        assert_eq!(
            liar.call(&mut rt, &[]),
            Err(RuntimeError::ReturnType {
                name: "liar".to_string(),
                expected: "f64",
                got: "i32",
            })
        );
    }

    #[test]
    fn test_export_table_lookup() {
        let table = ExportTable::new([add()]);
        assert_eq!(table.len(), 1);
        assert!(table.contains("add"));
        assert_eq!(table.names(), vec!["add"]);
        assert!(matches!(
            table.get("sub"),
            Err(RuntimeError::UnknownExport { .. })
        ));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::I32(3).to_f64(), 3.0);
        assert_eq!(Value::I64(-4).as_i64(), Some(-4));
        assert_eq!(Value::F64(0.5).as_i32(), None);
        assert_eq!(Value::F64(0.5).ty().to_string(), "f64");
    }
}
