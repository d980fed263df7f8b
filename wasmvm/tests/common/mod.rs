#![allow(dead_code)]

pub use wasmvm::{
    FuncType, HostContext, HostFunction, Instance, Instr, ModuleBuilder, TrapKind, Value,
    ValueType, VmError, VmResult,
};

/// Build a single exported function `f` and instantiate it.
pub fn single_function(
    params: Vec<ValueType>,
    result: Option<ValueType>,
    locals: Vec<(u32, ValueType)>,
    instrs: Vec<Instr>,
) -> Instance {
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(params, result));
    let func = builder.add_function(ty, locals, instrs);
    builder.export("f", func).expect("export should register");
    Instance::new(builder.build().expect("module should build")).expect("module should compile")
}

/// Run one binary operator on two operands and return the result.
pub fn run_binop(ty: ValueType, op: Instr, lhs: Value, rhs: Value) -> Value {
    let mut instance = single_function(
        vec![lhs.ty(), rhs.ty()],
        Some(ty),
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::LocalGet { index: 1 },
            op,
            Instr::End,
        ],
    );
    instance
        .invoke_export("f", &[lhs, rhs])
        .expect("operator should not trap")
        .expect("operator should produce a value")
}

/// Run one unary operator and return the result.
pub fn run_unop(ty: ValueType, op: Instr, operand: Value) -> Value {
    let mut instance = single_function(
        vec![operand.ty()],
        Some(ty),
        vec![],
        vec![Instr::LocalGet { index: 0 }, op, Instr::End],
    );
    instance
        .invoke_export("f", &[operand])
        .expect("operator should not trap")
        .expect("operator should produce a value")
}

/// Run one binary operator expecting a trap.
pub fn trap_binop(ty: ValueType, op: Instr, lhs: Value, rhs: Value) -> TrapKind {
    let mut instance = single_function(
        vec![lhs.ty(), rhs.ty()],
        Some(ty),
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::LocalGet { index: 1 },
            op,
            Instr::End,
        ],
    );
    expect_trap(instance.invoke_export("f", &[lhs, rhs]))
}

/// Run one unary operator expecting a trap.
pub fn trap_unop(ty: ValueType, op: Instr, operand: Value) -> TrapKind {
    let mut instance = single_function(
        vec![operand.ty()],
        Some(ty),
        vec![],
        vec![Instr::LocalGet { index: 0 }, op, Instr::End],
    );
    expect_trap(instance.invoke_export("f", &[operand]))
}

pub fn expect_trap(result: VmResult<Option<Value>>) -> TrapKind {
    match result {
        Err(VmError::Trap { kind, .. }) => kind,
        other => panic!("expected a trap, got {other:?}"),
    }
}

pub fn i32_of(value: Option<Value>) -> i32 {
    value
        .and_then(Value::as_i32)
        .expect("expected an i32 result")
}

pub fn i64_of(value: Option<Value>) -> i64 {
    value
        .and_then(Value::as_i64)
        .expect("expected an i64 result")
}

pub fn f32_of(value: Option<Value>) -> f32 {
    value
        .and_then(Value::as_f32)
        .expect("expected an f32 result")
}

pub fn f64_of(value: Option<Value>) -> f64 {
    value
        .and_then(Value::as_f64)
        .expect("expected an f64 result")
}

pub struct AddOne;

impl HostFunction for AddOne {
    fn call(&mut self, _ctx: &mut HostContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
        let value = args.first().and_then(|arg| arg.as_i32()).unwrap_or(0);
        Ok(Some(Value::I32(value + 1)))
    }
}

/// Encodes its two arguments so tests can check the argument order the
/// dispatcher hands to hosts.
pub struct PackArgs;

impl HostFunction for PackArgs {
    fn call(&mut self, _ctx: &mut HostContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
        let first = args[0].as_i32().expect("first arg should be i32");
        let second = args[1].as_i32().expect("second arg should be i32");
        Ok(Some(Value::I32(first * 100 + second)))
    }
}

pub struct FailingHost;

impl HostFunction for FailingHost {
    fn call(&mut self, _ctx: &mut HostContext<'_>, _args: &[Value]) -> VmResult<Option<Value>> {
        Err(VmError::Platform("host rejected the call".to_string()))
    }
}
