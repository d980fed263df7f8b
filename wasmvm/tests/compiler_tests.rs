mod common;

use common::*;
use wasmvm::{CompileError, VmError};

#[test]
fn forward_calls_are_patched_when_the_callee_is_emitted() {
    // the caller is emitted before its callee exists in the region
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(vec![ValueType::I32], Some(ValueType::I32)));
    let caller = builder.add_function(
        ty,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::Call { func: 1 },
            Instr::End,
        ],
    );
    let _callee = builder.add_function(
        ty,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::I32Const(10),
            Instr::I32Mul,
            Instr::End,
        ],
    );
    builder.export("f", caller).expect("export");
    let mut instance =
        Instance::new(builder.build().expect("build")).expect("module should compile");
    let result = instance.invoke_export("f", &[Value::I32(7)]);
    assert_eq!(i32_of(result.expect("call should run")), 70);
}

#[test]
fn call_patching_is_order_independent() {
    // same call graph with the definitions swapped: callee first, then caller
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(vec![ValueType::I32], Some(ValueType::I32)));
    let _callee = builder.add_function(
        ty,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::I32Const(10),
            Instr::I32Mul,
            Instr::End,
        ],
    );
    let caller = builder.add_function(
        ty,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::Call { func: 0 },
            Instr::End,
        ],
    );
    builder.export("f", caller).expect("export");
    let mut instance =
        Instance::new(builder.build().expect("build")).expect("module should compile");
    let result = instance.invoke_export("f", &[Value::I32(7)]);
    assert_eq!(i32_of(result.expect("call should run")), 70);
}

#[test]
fn caller_values_below_the_arguments_survive_a_call() {
    let mut builder = ModuleBuilder::new();
    let unary = builder.add_type(FuncType::new(vec![ValueType::I32], Some(ValueType::I32)));
    let binary = builder.add_type(FuncType::new(
        vec![ValueType::I32, ValueType::I32],
        Some(ValueType::I32),
    ));
    let double = builder.add_function(
        unary,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::LocalGet { index: 0 },
            Instr::I32Add,
            Instr::End,
        ],
    );
    // a + double(b): `a` sits on the operand stack across the call
    let outer = builder.add_function(
        binary,
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::LocalGet { index: 1 },
            Instr::Call { func: double },
            Instr::I32Add,
            Instr::End,
        ],
    );
    builder.export("f", outer).expect("export");
    let mut instance =
        Instance::new(builder.build().expect("build")).expect("module should compile");
    let result = instance.invoke_export("f", &[Value::I32(1000), Value::I32(21)]);
    assert_eq!(i32_of(result.expect("call should run")), 1042);
}

#[test]
fn branch_with_a_result_discards_the_slots_beneath_it() {
    // block (result i32): three pushes, then br 0 carries only the top
    let mut instance = single_function(
        vec![],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::Block {
                result: Some(ValueType::I32),
            },
            Instr::I32Const(1),
            Instr::I32Const(2),
            Instr::I32Const(3),
            Instr::Br { depth: 0 },
            Instr::End,
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[]);
    assert_eq!(i32_of(result.expect("branch should run")), 3);
}

#[test]
fn if_else_selects_the_live_arm() {
    let mut instance = single_function(
        vec![ValueType::I32],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::If {
                result: Some(ValueType::I32),
            },
            Instr::I32Const(11),
            Instr::Else,
            Instr::I32Const(22),
            Instr::End,
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[Value::I32(5)]);
    assert_eq!(i32_of(result.expect("then arm")), 11);
    let result = instance.invoke_export("f", &[Value::I32(0)]);
    assert_eq!(i32_of(result.expect("else arm")), 22);
}

#[test]
fn else_less_if_falls_through_when_false() {
    let mut instance = single_function(
        vec![ValueType::I32],
        Some(ValueType::I32),
        vec![(1, ValueType::I32)],
        vec![
            Instr::I32Const(1),
            Instr::LocalSet { index: 1 },
            Instr::LocalGet { index: 0 },
            Instr::If { result: None },
            Instr::I32Const(99),
            Instr::LocalSet { index: 1 },
            Instr::End,
            Instr::LocalGet { index: 1 },
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[Value::I32(1)]);
    assert_eq!(i32_of(result.expect("taken if")), 99);
    let result = instance.invoke_export("f", &[Value::I32(0)]);
    assert_eq!(i32_of(result.expect("skipped if")), 1);
}

#[test]
fn code_after_an_unconditional_branch_is_dead() {
    let mut instance = single_function(
        vec![],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::Block {
                result: Some(ValueType::I32),
            },
            Instr::I32Const(42),
            Instr::Br { depth: 0 },
            // everything here is unreachable and must not execute
            Instr::I32Const(7),
            Instr::Unreachable,
            Instr::End,
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[]);
    assert_eq!(i32_of(result.expect("dead code skipped")), 42);
}

#[test]
fn early_return_skips_the_rest_of_the_body() {
    let mut instance = single_function(
        vec![ValueType::I32],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::LocalGet { index: 0 },
            Instr::If { result: None },
            Instr::I32Const(1),
            Instr::Return,
            Instr::End,
            Instr::I32Const(2),
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[Value::I32(1)]);
    assert_eq!(i32_of(result.expect("early return")), 1);
    let result = instance.invoke_export("f", &[Value::I32(0)]);
    assert_eq!(i32_of(result.expect("fall through")), 2);
}

#[test]
fn locals_are_zero_initialized_even_past_the_unroll_limit() {
    // 20 locals forces the decrement-and-push loop variant
    let mut instrs = Vec::new();
    for index in 1..=20 {
        instrs.push(Instr::LocalGet { index });
    }
    for _ in 0..19 {
        instrs.push(Instr::I64Add);
    }
    instrs.push(Instr::End);
    let mut instance = single_function(
        vec![ValueType::I64],
        Some(ValueType::I64),
        vec![(20, ValueType::I64)],
        instrs,
    );
    let result = instance.invoke_export("f", &[Value::I64(123)]);
    assert_eq!(i64_of(result.expect("locals should be zero")), 0);
}

#[test]
fn deep_nesting_resolves_every_label() {
    // br 2 from the innermost of four blocks lands two labels up; the code
    // after the bypassed outer label stays dead
    let mut instance = single_function(
        vec![],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::Block { result: None },
            Instr::Block { result: None },
            Instr::Block { result: None },
            Instr::Block { result: None },
            Instr::I32Const(5),
            Instr::Drop,
            Instr::Br { depth: 2 },
            Instr::End,
            Instr::End,
            Instr::End,
            Instr::I32Const(8),
            Instr::Return,
            Instr::End,
            Instr::I32Const(9),
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[]);
    assert_eq!(i32_of(result.expect("nested branch")), 8);
}

#[test]
fn jit_code_offsets_are_exposed_per_function() {
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(vec![], None));
    let first = builder.add_function(ty, vec![], vec![Instr::End]);
    let second = builder.add_function(ty, vec![], vec![Instr::Nop, Instr::End]);
    let instance = Instance::new(builder.build().expect("build")).expect("compile");
    let first_offset = instance.jit_code_offset(first).expect("offset");
    let second_offset = instance.jit_code_offset(second).expect("offset");
    assert!(first_offset < second_offset);
    assert!(instance.jit_code_offset(99).is_none());
}

#[test]
fn calling_an_unknown_function_is_a_compile_error() {
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(vec![], None));
    builder.add_function(ty, vec![], vec![Instr::Call { func: 9 }, Instr::End]);
    let err = Instance::new(builder.build().expect("build")).unwrap_err();
    match err {
        VmError::Compile(CompileError::InvalidModule(_)) => {}
        other => panic!("expected an invalid-module error, got {other:?}"),
    }
}

#[test]
fn missing_final_end_is_a_compile_error() {
    let mut builder = ModuleBuilder::new();
    let ty = builder.add_type(FuncType::new(vec![], None));
    builder.add_function(ty, vec![], vec![Instr::Nop]);
    let err = Instance::new(builder.build().expect("build")).unwrap_err();
    match err {
        VmError::Compile(CompileError::InvalidModule(message)) => {
            assert!(message.contains("end"), "unexpected message: {message}");
        }
        other => panic!("expected an invalid-module error, got {other:?}"),
    }
}

#[test]
fn br_table_with_a_single_default_still_dispatches() {
    let mut instance = single_function(
        vec![ValueType::I32],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::Block { result: None },
            Instr::LocalGet { index: 0 },
            Instr::BrTable {
                targets: vec![],
                default: 0,
            },
            Instr::End,
            Instr::I32Const(31),
            Instr::End,
        ],
    );
    for input in [0, 5, -1] {
        let result = instance.invoke_export("f", &[Value::I32(input)]);
        assert_eq!(i32_of(result.expect("default dispatch")), 31);
    }
}

#[test]
fn br_table_into_a_loop_branches_backward() {
    // countdown driven by br_table: case 0 exits, default re-enters the loop
    let mut instance = single_function(
        vec![ValueType::I32],
        Some(ValueType::I32),
        vec![],
        vec![
            Instr::Block { result: None },
            Instr::Loop { result: None },
            Instr::LocalGet { index: 0 },
            Instr::I32Const(1),
            Instr::I32Sub,
            Instr::LocalTee { index: 0 },
            Instr::BrTable {
                targets: vec![1],
                default: 0,
            },
            Instr::End,
            Instr::End,
            Instr::LocalGet { index: 0 },
            Instr::End,
        ],
    );
    let result = instance.invoke_export("f", &[Value::I32(10)]);
    assert_eq!(i32_of(result.expect("loop via br_table")), 0);
}
