//! Solver facade
//!
//! Typed wrappers over the solver module's fixed entry points. Problems go
//! in as dense arrays copied onto the stack for the duration of one call;
//! results come back through durable heap buffers that are freed before
//! every wrapper returns.

use crate::abi::{Arg, Module, ReturnKind, Signature, ValType, Value};
use crate::error::{RuntimeError, RuntimeResult};

/// Entry point names
pub mod entry {
    pub const CREATE: &str = "Highs_create";
    pub const DESTROY: &str = "Highs_destroy";
    pub const RUN: &str = "Highs_run";
    pub const PASS_LP: &str = "Highs_passLp";
    pub const PASS_MIP: &str = "Highs_passMip";
    pub const SET_BOOL_OPTION: &str = "Highs_setBoolOptionValue";
    pub const SET_INT_OPTION: &str = "Highs_setIntOptionValue";
    pub const SET_DOUBLE_OPTION: &str = "Highs_setDoubleOptionValue";
    pub const SET_STRING_OPTION: &str = "Highs_setStringOptionValue";
    pub const GET_SOLUTION: &str = "Highs_getSolution";
    pub const GET_MODEL_STATUS: &str = "Highs_getModelStatus";
    pub const CHANGE_OBJECTIVE_SENSE: &str = "Highs_changeObjectiveSense";
    pub const GET_NUM_COLS: &str = "Highs_getNumCols";
    pub const GET_NUM_ROWS: &str = "Highs_getNumRows";
    pub const CALL: &str = "Highs_call";

    pub const ALL: [&str; 15] = [
        CREATE,
        DESTROY,
        RUN,
        PASS_LP,
        PASS_MIP,
        SET_BOOL_OPTION,
        SET_INT_OPTION,
        SET_DOUBLE_OPTION,
        SET_STRING_OPTION,
        GET_SOLUTION,
        GET_MODEL_STATUS,
        CHANGE_OBJECTIVE_SENSE,
        GET_NUM_COLS,
        GET_NUM_ROWS,
        CALL,
    ];
}

/// Return codes shared by the entry points
pub mod status {
    pub const ERROR: i32 = -1;
    pub const OK: i32 = 0;
    pub const WARNING: i32 = 1;
}

/// The wasm signature the module exports `name` with
pub fn signature(name: &str) -> Option<Signature> {
    use ValType::{F64, I32};

    let problem = |arrays: usize| {
        let mut params = vec![I32; 6];
        params.push(F64);
        params.extend(std::iter::repeat_n(I32, arrays));
        Signature {
            params,
            result: Some(I32),
        }
    };

    let signature = match name {
        entry::CREATE => Signature::new(&[], Some(I32)),
        entry::DESTROY => Signature::new(&[I32], None),
        entry::RUN
        | entry::GET_MODEL_STATUS
        | entry::GET_NUM_COLS
        | entry::GET_NUM_ROWS => Signature::new(&[I32], Some(I32)),
        entry::PASS_LP => problem(8),
        entry::PASS_MIP => problem(9),
        entry::SET_BOOL_OPTION | entry::SET_INT_OPTION | entry::SET_STRING_OPTION => {
            Signature::new(&[I32, I32, I32], Some(I32))
        }
        entry::SET_DOUBLE_OPTION => Signature::new(&[I32, I32, F64], Some(I32)),
        entry::GET_SOLUTION => Signature::new(&[I32; 5], Some(I32)),
        entry::CHANGE_OBJECTIVE_SENSE => Signature::new(&[I32, I32], Some(I32)),
        entry::CALL => Signature::new(&[I32; 18], Some(I32)),
        _ => return None,
    };
    Some(signature)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectiveSense {
    #[default]
    Minimize,
    Maximize,
}

impl ObjectiveSense {
    pub fn code(self) -> i32 {
        match self {
            ObjectiveSense::Minimize => 1,
            ObjectiveSense::Maximize => -1,
        }
    }
}

/// Storage order of the constraint matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixFormat {
    #[default]
    ColumnWise,
    RowWise,
}

impl MatrixFormat {
    pub fn code(self) -> i32 {
        match self {
            MatrixFormat::ColumnWise => 1,
            MatrixFormat::RowWise => 2,
        }
    }
}

/// A linear program in dense-bounds, compressed-matrix form
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearProgram {
    pub sense: ObjectiveSense,
    pub offset: f64,
    pub col_cost: Vec<f64>,
    pub col_lower: Vec<f64>,
    pub col_upper: Vec<f64>,
    pub row_lower: Vec<f64>,
    pub row_upper: Vec<f64>,
    pub format: MatrixFormat,
    pub a_start: Vec<i32>,
    pub a_index: Vec<i32>,
    pub a_value: Vec<f64>,
}

impl LinearProgram {
    pub fn num_cols(&self) -> usize {
        self.col_cost.len()
    }

    pub fn num_rows(&self) -> usize {
        self.row_lower.len()
    }

    pub fn num_nz(&self) -> usize {
        self.a_value.len()
    }

    /// Check that every array agrees with the problem dimensions
    pub fn validate(&self) -> RuntimeResult<()> {
        let (cols, rows, nz) = (self.num_cols(), self.num_rows(), self.num_nz());
        let starts = match self.format {
            MatrixFormat::ColumnWise => cols,
            MatrixFormat::RowWise => rows,
        };
        let checks = [
            ("col_lower", self.col_lower.len(), cols),
            ("col_upper", self.col_upper.len(), cols),
            ("row_upper", self.row_upper.len(), rows),
            ("a_start", self.a_start.len(), starts),
            ("a_index", self.a_index.len(), nz),
        ];
        for (name, len, expected) in checks {
            if len != expected {
                return Err(invalid(format!("{} has {} entries, expected {}", name, len, expected)));
            }
        }
        if i32::try_from(nz).is_err() {
            return Err(invalid("too many non-zeros"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> RuntimeError {
    RuntimeError::InvalidProblem {
        reason: reason.into(),
    }
}

/// Primal and dual values returned by the solver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Solution {
    pub status: i32,
    pub col_value: Vec<f64>,
    pub col_dual: Vec<f64>,
    pub row_value: Vec<f64>,
    pub row_dual: Vec<f64>,
}

/// Outcome of a one-shot [`Solver::call`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub solution: Solution,
    pub col_basis: Vec<i32>,
    pub row_basis: Vec<i32>,
    pub model_status: i32,
}

/// Opaque solver instance inside the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i32);

impl Handle {
    pub fn raw(self) -> i32 {
        self.0
    }
}

pub struct Solver {
    module: Module,
}

impl Solver {
    pub fn new(module: Module) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    /// Entry points the module does not export
    pub fn missing_entry_points(&self) -> Vec<&'static str> {
        entry::ALL
            .into_iter()
            .filter(|name| !self.module.has_export(name))
            .collect()
    }

    fn call_i32(&mut self, name: &str, args: &[Value]) -> RuntimeResult<i32> {
        match self.module.call(name, args)? {
            Some(Value::I32(v)) => Ok(v),
            other => Err(RuntimeError::ReturnType {
                name: name.to_string(),
                expected: "i32",
                got: other.map(|v| v.ty().name()).unwrap_or("nothing"),
            }),
        }
    }

    fn invoke_i32(&mut self, name: &str, args: &[Arg<'_>]) -> RuntimeResult<i32> {
        let ret = self.module.invoke(name, ReturnKind::Number, args)?;
        Ok(ret.as_number().unwrap_or_default() as i32)
    }

    pub fn create(&mut self) -> RuntimeResult<Handle> {
        match self.call_i32(entry::CREATE, &[])? {
            0 => Err(RuntimeError::Trap {
                reason: format!("{} returned a null instance", entry::CREATE),
            }),
            ptr => {
                log::debug!("created solver instance {:#x}", ptr);
                Ok(Handle(ptr))
            }
        }
    }

    pub fn destroy(&mut self, handle: Handle) -> RuntimeResult<()> {
        self.module.call(entry::DESTROY, &[Value::I32(handle.0)])?;
        Ok(())
    }

    pub fn run(&mut self, handle: Handle) -> RuntimeResult<i32> {
        self.call_i32(entry::RUN, &[Value::I32(handle.0)])
    }

    pub fn pass_lp(&mut self, handle: Handle, lp: &LinearProgram) -> RuntimeResult<i32> {
        lp.validate()?;
        let args = problem_args(handle, lp, None);
        self.invoke_i32(entry::PASS_LP, &args)
    }

    pub fn pass_mip(
        &mut self,
        handle: Handle,
        lp: &LinearProgram,
        integrality: &[i32],
    ) -> RuntimeResult<i32> {
        lp.validate()?;
        if integrality.len() != lp.num_cols() {
            return Err(invalid(format!(
                "integrality has {} entries, expected {}",
                integrality.len(),
                lp.num_cols()
            )));
        }
        let args = problem_args(handle, lp, Some(integrality));
        self.invoke_i32(entry::PASS_MIP, &args)
    }

    pub fn set_bool_option(&mut self, handle: Handle, option: &str, value: bool) -> RuntimeResult<i32> {
        let args = [Arg::Int(handle.0), Arg::Text(option), Arg::Int(value as i32)];
        self.invoke_i32(entry::SET_BOOL_OPTION, &args)
    }

    pub fn set_int_option(&mut self, handle: Handle, option: &str, value: i32) -> RuntimeResult<i32> {
        let args = [Arg::Int(handle.0), Arg::Text(option), Arg::Int(value)];
        self.invoke_i32(entry::SET_INT_OPTION, &args)
    }

    pub fn set_double_option(&mut self, handle: Handle, option: &str, value: f64) -> RuntimeResult<i32> {
        let args = [Arg::Int(handle.0), Arg::Text(option), Arg::Number(value)];
        self.invoke_i32(entry::SET_DOUBLE_OPTION, &args)
    }

    pub fn set_string_option(&mut self, handle: Handle, option: &str, value: &str) -> RuntimeResult<i32> {
        let args = [Arg::Int(handle.0), Arg::Text(option), Arg::Text(value)];
        self.invoke_i32(entry::SET_STRING_OPTION, &args)
    }

    pub fn model_status(&mut self, handle: Handle) -> RuntimeResult<i32> {
        self.call_i32(entry::GET_MODEL_STATUS, &[Value::I32(handle.0)])
    }

    pub fn change_objective_sense(&mut self, handle: Handle, sense: ObjectiveSense) -> RuntimeResult<i32> {
        let args = [Value::I32(handle.0), Value::I32(sense.code())];
        self.call_i32(entry::CHANGE_OBJECTIVE_SENSE, &args)
    }

    pub fn num_cols(&mut self, handle: Handle) -> RuntimeResult<i32> {
        self.call_i32(entry::GET_NUM_COLS, &[Value::I32(handle.0)])
    }

    pub fn num_rows(&mut self, handle: Handle) -> RuntimeResult<i32> {
        self.call_i32(entry::GET_NUM_ROWS, &[Value::I32(handle.0)])
    }

    /// Copy out the current solution for `num_cols` columns and `num_rows`
    /// rows
    pub fn get_solution(&mut self, handle: Handle, num_cols: u32, num_rows: u32) -> RuntimeResult<Solution> {
        let sizes = [
            array_bytes::<f64>(num_cols)?,
            array_bytes::<f64>(num_cols)?,
            array_bytes::<f64>(num_rows)?,
            array_bytes::<f64>(num_rows)?,
        ];
        self.with_buffers(&sizes, |solver, buffers| {
            let mut args = vec![Value::I32(handle.0)];
            args.extend(buffers.iter().map(|&b| Value::I32(b as i32)));
            let status = solver.call_i32(entry::GET_SOLUTION, &args)?;

            let memory = solver.module.runtime().memory();
            Ok(Solution {
                status,
                col_value: memory.slice::<f64>(buffers[0], num_cols)?.to_vec(),
                col_dual: memory.slice::<f64>(buffers[1], num_cols)?.to_vec(),
                row_value: memory.slice::<f64>(buffers[2], num_rows)?.to_vec(),
                row_dual: memory.slice::<f64>(buffers[3], num_rows)?.to_vec(),
            })
        })
    }

    /// Solve `lp` in one shot without creating an instance
    pub fn call(&mut self, lp: &LinearProgram) -> RuntimeResult<CallResult> {
        lp.validate()?;
        let cols = lp.num_cols() as u32;
        let rows = lp.num_rows() as u32;
        let sizes = [
            array_bytes::<f64>(cols)?,
            array_bytes::<f64>(cols)?,
            array_bytes::<f64>(rows)?,
            array_bytes::<f64>(rows)?,
            array_bytes::<i32>(cols)?,
            array_bytes::<i32>(rows)?,
            array_bytes::<i32>(1)?,
        ];
        self.with_buffers(&sizes, |solver, buffers| {
            let mut args = vec![
                Arg::Int(cols as i32),
                Arg::Int(rows as i32),
                Arg::Int(lp.num_nz() as i32),
                Arg::F64s(&lp.col_cost),
                Arg::F64s(&lp.col_lower),
                Arg::F64s(&lp.col_upper),
                Arg::F64s(&lp.row_lower),
                Arg::F64s(&lp.row_upper),
                Arg::I32s(&lp.a_start),
                Arg::I32s(&lp.a_index),
                Arg::F64s(&lp.a_value),
            ];
            args.extend(buffers.iter().map(|&b| Arg::Int(b as i32)));
            let status = solver.invoke_i32(entry::CALL, &args)?;

            let memory = solver.module.runtime().memory();
            Ok(CallResult {
                solution: Solution {
                    status,
                    col_value: memory.slice::<f64>(buffers[0], cols)?.to_vec(),
                    col_dual: memory.slice::<f64>(buffers[1], cols)?.to_vec(),
                    row_value: memory.slice::<f64>(buffers[2], rows)?.to_vec(),
                    row_dual: memory.slice::<f64>(buffers[3], rows)?.to_vec(),
                },
                col_basis: memory.slice::<i32>(buffers[4], cols)?.to_vec(),
                row_basis: memory.slice::<i32>(buffers[5], rows)?.to_vec(),
                model_status: memory.read_i32(buffers[6])?,
            })
        })
    }

    /// Run `f` with one heap buffer per entry of `sizes`, freeing all of
    /// them afterwards whatever `f` returns
    fn with_buffers<T>(
        &mut self,
        sizes: &[u32],
        f: impl FnOnce(&mut Self, &[u32]) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let mut buffers = Vec::with_capacity(sizes.len());
        let mut allocated = Ok(());
        for &size in sizes {
            match self.module.runtime_mut().alloc(size) {
                Ok(allocation) => buffers.push(allocation.offset),
                Err(e) => {
                    allocated = Err(e);
                    break;
                }
            }
        }

        let result = allocated.and_then(|()| f(self, &buffers));

        let mut freed = Ok(());
        for offset in buffers {
            if let Err(e) = self.module.runtime_mut().free(offset) {
                log::warn!("failed to free result buffer {:#x}: {}", offset, e);
                freed = freed.and(Err(e));
            }
        }
        let value = result?;
        freed?;
        Ok(value)
    }
}

/// Byte size of a buffer holding `count` values of `T`
fn array_bytes<T>(count: u32) -> RuntimeResult<u32> {
    let width = std::mem::size_of::<T>() as u32;
    count.checked_mul(width).ok_or(RuntimeError::OutOfMemory {
        requested: count as u64 * width as u64,
    })
}

fn problem_args<'a>(handle: Handle, lp: &'a LinearProgram, integrality: Option<&'a [i32]>) -> Vec<Arg<'a>> {
    let mut args = vec![
        Arg::Int(handle.0),
        Arg::Int(lp.num_cols() as i32),
        Arg::Int(lp.num_rows() as i32),
        Arg::Int(lp.num_nz() as i32),
        Arg::Int(lp.format.code()),
        Arg::Int(lp.sense.code()),
        Arg::Number(lp.offset),
        Arg::F64s(&lp.col_cost),
        Arg::F64s(&lp.col_lower),
        Arg::F64s(&lp.col_upper),
        Arg::F64s(&lp.row_lower),
        Arg::F64s(&lp.row_upper),
        Arg::I32s(&lp.a_start),
        Arg::I32s(&lp.a_index),
        Arg::F64s(&lp.a_value),
    ];
    if let Some(integrality) = integrality {
        args.push(Arg::I32s(integrality));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Export, ExportTable};
    use crate::devices::CapturedLines;
    use crate::runtime::Runtime;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn export<F>(name: &str, func: F) -> Export
    where
        F: Fn(&mut Runtime, &[Value]) -> RuntimeResult<Option<Value>> + 'static,
    {
        Export::new(name, signature(name).unwrap(), func)
    }

    fn arg(args: &[Value], i: usize) -> u32 {
        args[i].as_i32().unwrap() as u32
    }

    fn module(exports: Vec<Export>) -> Module {
        let mut runtime = Runtime::builder()
            .terminal_output(CapturedLines::new())
            .terminal_error(CapturedLines::new())
            .build()
            .unwrap();
        runtime.initialize().unwrap();
        Module::new(runtime, ExportTable::new(exports))
    }

    #[test]
    fn test_signatures_cover_every_entry_point() {
        for name in entry::ALL {
            assert!(signature(name).is_some(), "{}", name);
        }
        assert_eq!(signature(entry::PASS_LP).unwrap().params.len(), 15);
        assert_eq!(signature(entry::PASS_MIP).unwrap().params.len(), 16);
        assert_eq!(signature(entry::PASS_LP).unwrap().params[6], ValType::F64);
        assert!(signature("Highs_frobnicate").is_none());
    }

    #[test]
    fn test_get_solution_copies_and_frees() {
        let solver_module = module(vec![export(entry::GET_SOLUTION, |rt, args| {
            for (i, base) in [10.0, 20.0, 30.0, 40.0].into_iter().enumerate() {
                let ptr = arg(args, i + 1);
                let len = if i < 2 { 2 } else { 1 };
                for j in 0..len {
                    rt.memory_mut().write_f64(ptr + j * 8, base + j as f64)?;
                }
            }
            Ok(Some(Value::I32(status::OK)))
        })]);
        let mut solver = Solver::new(solver_module);
        let before = solver.module().runtime().allocator().live_allocations();

        let solution = solver.get_solution(Handle(1), 2, 1).unwrap();
        assert_eq!(solution.status, status::OK);
        assert_eq!(solution.col_value, vec![10.0, 11.0]);
        assert_eq!(solution.col_dual, vec![20.0, 21.0]);
        assert_eq!(solution.row_value, vec![30.0]);
        assert_eq!(solution.row_dual, vec![40.0]);

        let after = solver.module().runtime().allocator().live_allocations();
        assert_eq!(before, after);
    }

    #[test]
    fn test_get_solution_frees_on_trap() {
        let solver_module = module(vec![export(entry::GET_SOLUTION, |rt, _| {
            Err(rt.abort("solver crashed"))
        })]);
        let mut solver = Solver::new(solver_module);
        let before = solver.module().runtime().allocator().live_allocations();

        assert!(matches!(
            solver.get_solution(Handle(1), 3, 3),
            Err(RuntimeError::Trap { .. })
        ));
        assert_eq!(solver.module().runtime().allocator().live_allocations(), before);
    }

    #[test]
    fn test_string_option_reaches_string_entry_point() {
        let seen = Rc::new(RefCell::new(None));
        let record = seen.clone();
        let solver_module = module(vec![
            export(entry::SET_STRING_OPTION, move |rt, args| {
                let name = rt.memory().read_cstring(arg(args, 1))?;
                let value = rt.memory().read_cstring(arg(args, 2))?;
                *record.borrow_mut() = Some((name, value));
                Ok(Some(Value::I32(status::OK)))
            }),
            export(entry::SET_INT_OPTION, |_, _| Ok(Some(Value::I32(status::ERROR)))),
        ]);
        let mut solver = Solver::new(solver_module);
        let top = solver.module().runtime().allocator().stack_top();

        let result = solver.set_string_option(Handle(1), "presolve", "off").unwrap();
        assert_eq!(result, status::OK);
        assert_eq!(
            *seen.borrow(),
            Some(("presolve".to_string(), "off".to_string()))
        );
        assert_eq!(solver.module().runtime().allocator().stack_top(), top);
    }

    #[test]
    fn test_pass_lp_lowers_arrays() {
        let costs = Rc::new(RefCell::new(Vec::new()));
        let record = costs.clone();
        let solver_module = module(vec![export(entry::PASS_LP, move |rt, args| {
            let cols = arg(args, 1);
            assert_eq!(args[5], Value::I32(-1));
            assert_eq!(args[6], Value::F64(2.5));
            *record.borrow_mut() = rt.memory().slice::<f64>(arg(args, 7), cols)?.to_vec();
            let index = rt.memory().slice::<i32>(arg(args, 13), 2)?.to_vec();
            assert_eq!(index, vec![0, 0]);
            Ok(Some(Value::I32(status::OK)))
        })]);
        let mut solver = Solver::new(solver_module);

        let lp = LinearProgram {
            sense: ObjectiveSense::Maximize,
            offset: 2.5,
            col_cost: vec![1.0, 2.0],
            col_lower: vec![0.0, 0.0],
            col_upper: vec![4.0, 4.0],
            row_lower: vec![f64::NEG_INFINITY],
            row_upper: vec![5.0],
            format: MatrixFormat::ColumnWise,
            a_start: vec![0, 1],
            a_index: vec![0, 0],
            a_value: vec![1.0, 1.0],
        };
        assert_eq!(solver.pass_lp(Handle(1), &lp).unwrap(), status::OK);
        assert_eq!(*costs.borrow(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_pass_mip_checks_integrality_length() {
        let mut solver = Solver::new(module(vec![]));
        let lp = LinearProgram {
            col_cost: vec![1.0],
            col_lower: vec![0.0],
            col_upper: vec![1.0],
            a_start: vec![0],
            ..LinearProgram::default()
        };
        assert!(matches!(
            solver.pass_mip(Handle(1), &lp, &[1, 1]),
            Err(RuntimeError::InvalidProblem { .. })
        ));
    }

    #[test]
    fn test_problem_shape_validation() {
        let lp = LinearProgram {
            col_cost: vec![1.0, 1.0],
            col_lower: vec![0.0],
            ..LinearProgram::default()
        };
        assert_eq!(
            lp.validate(),
            Err(RuntimeError::InvalidProblem {
                reason: "col_lower has 1 entries, expected 2".to_string()
            })
        );
    }

    #[test]
    fn test_one_shot_call() {
        let solver_module = module(vec![export(entry::CALL, |rt, args| {
            let cols = arg(args, 0);
            let lower = rt.memory().slice::<f64>(arg(args, 4), cols)?.to_vec();
            for (i, v) in lower.iter().enumerate() {
                rt.memory_mut().write_f64(arg(args, 11) + i as u32 * 8, *v)?;
                rt.memory_mut().write_i32(arg(args, 15) + i as u32 * 4, 1)?;
            }
            rt.memory_mut().write_i32(arg(args, 17), 7)?;
            Ok(Some(Value::I32(status::OK)))
        })]);
        let mut solver = Solver::new(solver_module);
        let before = solver.module().runtime().allocator().live_allocations();

        let lp = LinearProgram {
            col_cost: vec![1.0, 1.0],
            col_lower: vec![2.0, 3.0],
            col_upper: vec![5.0, 5.0],
            a_start: vec![0, 0],
            ..LinearProgram::default()
        };
        let result = solver.call(&lp).unwrap();
        assert_eq!(result.solution.status, status::OK);
        assert_eq!(result.solution.col_value, vec![2.0, 3.0]);
        assert!(result.solution.row_value.is_empty());
        assert_eq!(result.col_basis, vec![1, 1]);
        assert_eq!(result.model_status, 7);
        assert_eq!(solver.module().runtime().allocator().live_allocations(), before);
    }

    #[test]
    fn test_buffer_sizes_follow_element_width() {
        assert_eq!(array_bytes::<f64>(3).unwrap(), 24);
        assert_eq!(array_bytes::<i32>(3).unwrap(), 12);
        assert!(matches!(
            array_bytes::<i32>(u32::MAX),
            Err(RuntimeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_create_rejects_null_instance() {
        let mut solver = Solver::new(module(vec![export(entry::CREATE, |_, _| {
            Ok(Some(Value::I32(0)))
        })]));
        assert!(matches!(solver.create(), Err(RuntimeError::Trap { .. })));
        assert_eq!(solver.missing_entry_points().len(), entry::ALL.len() - 1);
    }
}
