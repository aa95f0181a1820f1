//! Marshalling layer
//!
//! [`Module::invoke`] turns host values into a call on one export:
//!
//! 1. Check arity and argument kinds against the export's signature.
//! 2. Save the stack mark.
//! 3. Copy text (NUL-terminated UTF-8) and byte/array arguments onto the
//!    stack; numbers pass through.
//! 4. Call the export and decode its result as requested.
//! 5. Restore the stack mark, whether the call succeeded or not.

use super::{Export, ExportTable, ValType, Value};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;

/// A host-side argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    /// Passed as whatever numeric type the parameter declares
    Number(f64),
    Int(i32),
    /// Copied in as NUL-terminated UTF-8; the callee sees a pointer
    Text(&'a str),
    /// Copied in verbatim; the callee sees a pointer
    Bytes(&'a [u8]),
    F64s(&'a [f64]),
    I32s(&'a [i32]),
}

impl Arg<'_> {
    /// Whether the argument is lowered to a pointer into the stack
    fn is_buffer(&self) -> bool {
        matches!(
            self,
            Arg::Text(_) | Arg::Bytes(_) | Arg::F64s(_) | Arg::I32s(_)
        )
    }
}

/// How to decode an export's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Number,
    /// The result is a pointer to a NUL-terminated string
    Text,
    /// Non-zero is true
    Flag,
    Void,
}

/// A decoded result
#[derive(Debug, Clone, PartialEq)]
pub enum Ret {
    Number(f64),
    Text(String),
    Flag(bool),
    Void,
}

impl Ret {
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Ret::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Ret::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            Ret::Flag(flag) => Some(flag),
            _ => None,
        }
    }
}

/// A ready module: its runtime and its export table
pub struct Module {
    runtime: Runtime,
    exports: ExportTable,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("exports", &self.exports.names())
            .finish_non_exhaustive()
    }
}

impl Module {
    pub fn new(runtime: Runtime, exports: ExportTable) -> Self {
        Self { runtime, exports }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains(name)
    }

    /// Call an export with raw values
    pub fn call(&mut self, name: &str, args: &[Value]) -> RuntimeResult<Option<Value>> {
        let export = self.exports.get(name)?;
        export.call(&mut self.runtime, args)
    }

    /// Call an export with host values, releasing every transient
    /// allocation before returning
    pub fn invoke(&mut self, name: &str, ret: ReturnKind, args: &[Arg<'_>]) -> RuntimeResult<Ret> {
        let export = self.exports.get(name)?;
        check_args(export, args)?;

        let runtime = &mut self.runtime;
        let mark = runtime.stack_save();
        let result = lower(runtime, export, args)
            .and_then(|values| export.call(runtime, &values))
            .and_then(|value| decode(runtime, name, ret, value));
        let leftover = match runtime.stack_unwind(mark) {
            Ok(leftover) => leftover,
            Err(imbalance) => return result.and(Err(imbalance)),
        };
        if leftover > 0 {
            log::warn!("{} left {} stack marks outstanding", name, leftover);
        }

        match result {
            Err(e) => Err(e),
            Ok(_) if leftover > 0 => Err(RuntimeError::StackImbalance {
                mark: mark.offset(),
                expected: None,
            }),
            Ok(ret) => Ok(ret),
        }
    }
}

/// Validate argument kinds without touching memory
fn check_args(export: &Export, args: &[Arg<'_>]) -> RuntimeResult<()> {
    let params = &export.signature().params;
    if args.len() != params.len() {
        return Err(RuntimeError::ArityMismatch {
            name: export.name().to_string(),
            expected: params.len(),
            got: args.len(),
        });
    }
    for (index, (arg, ty)) in args.iter().zip(params).enumerate() {
        let fits = match (arg, ty) {
            (_, ValType::I32) if arg.is_buffer() => true,
            (Arg::Int(_), _) => true,
            (Arg::Number(n), ValType::I32) => {
                n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= u32::MAX as f64
            }
            (Arg::Number(n), ValType::I64) => n.fract() == 0.0,
            (Arg::Number(_), ValType::F64) => true,
            _ => false,
        };
        if !fits {
            return Err(RuntimeError::ArgumentType {
                name: export.name().to_string(),
                index,
                expected: ty.name(),
            });
        }
    }
    Ok(())
}

/// Copy `data` onto the stack, returning its address as an argument
fn push(runtime: &mut Runtime, data: &[u8], terminate: bool) -> RuntimeResult<Value> {
    let size = data.len() as u64 + terminate as u64;
    let size = u32::try_from(size).map_err(|_| RuntimeError::OutOfMemory { requested: size })?;
    let at = runtime.stack_alloc(size)?;
    let memory = runtime.memory_mut();
    memory.write(at, data)?;
    if terminate {
        memory.write(at + data.len() as u32, &[0])?;
    }
    Ok(Value::I32(at as i32))
}

fn lower(runtime: &mut Runtime, export: &Export, args: &[Arg<'_>]) -> RuntimeResult<Vec<Value>> {
    let params = &export.signature().params;
    args.iter()
        .zip(params)
        .map(|(arg, ty)| match (*arg, *ty) {
            (Arg::Text(text), _) => push(runtime, text.as_bytes(), true),
            (Arg::Bytes(bytes), _) => push(runtime, bytes, false),
            (Arg::F64s(values), _) => push(runtime, bytemuck::cast_slice(values), false),
            (Arg::I32s(values), _) => push(runtime, bytemuck::cast_slice(values), false),
            (Arg::Int(n), ValType::I32) => Ok(Value::I32(n)),
            (Arg::Int(n), ValType::I64) => Ok(Value::I64(n as i64)),
            (Arg::Int(n), ValType::F64) => Ok(Value::F64(n as f64)),
            // Unsigned values above i32::MAX wrap, as pointers do
            (Arg::Number(n), ValType::I32) => Ok(Value::I32(n as i64 as i32)),
            (Arg::Number(n), ValType::I64) => Ok(Value::I64(n as i64)),
            (Arg::Number(n), ValType::F64) => Ok(Value::F64(n)),
        })
        .collect()
}

fn decode(runtime: &Runtime, name: &str, ret: ReturnKind, value: Option<Value>) -> RuntimeResult<Ret> {
    let missing = || RuntimeError::ReturnType {
        name: name.to_string(),
        expected: "a value",
        got: "nothing",
    };
    match ret {
        ReturnKind::Void => Ok(Ret::Void),
        ReturnKind::Number => Ok(Ret::Number(value.ok_or_else(missing)?.to_f64())),
        ReturnKind::Flag => Ok(Ret::Flag(value.ok_or_else(missing)?.to_f64() != 0.0)),
        ReturnKind::Text => {
            let value = value.ok_or_else(missing)?;
            let ptr = value.as_i32().ok_or_else(|| RuntimeError::ReturnType {
                name: name.to_string(),
                expected: "i32",
                got: value.ty().name(),
            })? as u32;
            if ptr == 0 {
                return Ok(Ret::Text(String::new()));
            }
            Ok(Ret::Text(runtime.memory().read_cstring(ptr)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Signature;
    use crate::devices::CapturedLines;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn runtime() -> Runtime {
        let mut rt = Runtime::builder()
            .terminal_output(CapturedLines::new())
            .terminal_error(CapturedLines::new())
            .build()
            .unwrap();
        rt.initialize().unwrap();
        rt
    }

    /// `solve(sense: *const c_char, costs: *const f64) -> i32`, recording
    /// what it saw and reporting failure
    fn solve(seen: Rc<RefCell<(String, Vec<f64>)>>) -> Export {
        Export::new(
            "solve",
            Signature::new(&[ValType::I32, ValType::I32], Some(ValType::I32)),
            move |rt, args| {
                let sense = args[0].as_i32().unwrap_or(0) as u32;
                let costs = args[1].as_i32().unwrap_or(0) as u32;
                let sense = rt.memory().read_cstring(sense)?;
                let costs = rt.memory().slice::<f64>(costs, 3)?.to_vec();
                *seen.borrow_mut() = (sense, costs);
                Ok(Some(Value::I32(-1)))
            },
        )
    }

    fn greet() -> Export {
        Export::new("greet", Signature::new(&[], Some(ValType::I32)), |rt, _| {
            let at = rt.alloc(8)?.offset;
            rt.memory_mut().write_cstring(at, "hi")?;
            Ok(Some(Value::I32(at as i32)))
        })
    }

    fn trap() -> Export {
        Export::new("trap", Signature::new(&[ValType::I32], None), |rt, _| {
            Err(rt.abort("boom"))
        })
    }

    #[test]
    fn test_invoke_releases_transient_allocations() {
        let seen = Rc::new(RefCell::new((String::new(), Vec::new())));
        let mut module = Module::new(runtime(), ExportTable::new([solve(seen.clone())]));
        let top = module.runtime().allocator().stack_top();

        let result = module
            .invoke(
                "solve",
                ReturnKind::Number,
                &[Arg::Text("maximize"), Arg::F64s(&[1.0, 2.0, 3.0])],
            )
            .unwrap();

        assert_eq!(result, Ret::Number(-1.0));
        assert_eq!(seen.borrow().0, "maximize");
        assert_eq!(seen.borrow().1, vec![1.0, 2.0, 3.0]);
        assert_eq!(module.runtime().allocator().stack_top(), top);
        assert_eq!(module.runtime().allocator().stack_depth(), 0);
    }

    #[test]
    fn test_invoke_restores_stack_on_trap() {
        let mut module = Module::new(runtime(), ExportTable::new([trap()]));
        let top = module.runtime().allocator().stack_top();

        let result = module.invoke("trap", ReturnKind::Void, &[Arg::Text("payload")]);
        assert!(matches!(result, Err(RuntimeError::Trap { .. })));
        assert_eq!(module.runtime().allocator().stack_top(), top);
    }

    fn unbalanced(fails: bool) -> Export {
        Export::new("unbalanced", Signature::new(&[ValType::I32], None), move |rt, _| {
            rt.stack_alloc(48)?;
            rt.stack_save();
            rt.stack_alloc(32)?;
            if fails {
                return Err(rt.abort("unwinding"));
            }
            Ok(None)
        })
    }

    #[test]
    fn test_invoke_unwinds_marks_left_by_callee() {
        let mut module = Module::new(runtime(), ExportTable::new([unbalanced(true)]));
        let top = module.runtime().allocator().stack_top();

        for _ in 0..3 {
            let result = module.invoke("unbalanced", ReturnKind::Void, &[Arg::Text("payload")]);
            assert!(matches!(result, Err(RuntimeError::Trap { .. })));
        }
        assert_eq!(module.runtime().allocator().stack_top(), top);
        assert_eq!(module.runtime().allocator().stack_depth(), 0);

        let mut module = Module::new(runtime(), ExportTable::new([unbalanced(false)]));
        assert!(matches!(
            module.invoke("unbalanced", ReturnKind::Void, &[Arg::Int(0)]),
            Err(RuntimeError::StackImbalance { .. })
        ));
        assert_eq!(module.runtime().allocator().stack_top(), top);
        assert_eq!(module.runtime().allocator().stack_depth(), 0);
    }

    #[test]
    fn test_invoke_checks_before_allocating() {
        let seen = Rc::new(RefCell::new((String::new(), Vec::new())));
        let mut module = Module::new(runtime(), ExportTable::new([solve(seen)]));

        assert!(matches!(
            module.invoke("solve", ReturnKind::Number, &[Arg::Text("max")]),
            Err(RuntimeError::ArityMismatch { .. })
        ));
        assert!(matches!(
            module.invoke(
                "solve",
                ReturnKind::Number,
                &[Arg::Text("max"), Arg::Number(0.5)]
            ),
            Err(RuntimeError::ArgumentType { index: 1, .. })
        ));
        assert!(matches!(
            module.invoke("missing", ReturnKind::Void, &[]),
            Err(RuntimeError::UnknownExport { .. })
        ));
        assert_eq!(module.runtime().allocator().stack_depth(), 0);
    }

    #[test]
    fn test_invoke_decodes_text_and_flag() {
        let mut module = Module::new(runtime(), ExportTable::new([greet()]));
        let text = module.invoke("greet", ReturnKind::Text, &[]).unwrap();
        assert_eq!(text.as_text(), Some("hi"));
        let flag = module.invoke("greet", ReturnKind::Flag, &[]).unwrap();
        assert_eq!(flag.as_flag(), Some(true));
    }

    #[test]
    fn test_number_lowering_follows_signature() {
        let echo = Export::new(
            "echo",
            Signature::new(&[ValType::F64, ValType::I32], Some(ValType::F64)),
            |_, args| Ok(Some(Value::F64(args[0].to_f64() + args[1].to_f64()))),
        );
        let mut module = Module::new(runtime(), ExportTable::new([echo]));
        let result = module
            .invoke("echo", ReturnKind::Number, &[Arg::Int(2), Arg::Number(3.0)])
            .unwrap();
        assert_eq!(result.as_number(), Some(5.0));
    }
}
