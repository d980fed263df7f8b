//! Runtime scaffolding around the generated code: instance state, the call
//! path into the region, and the native routines generated code calls back
//! into (host dispatch, memory size/grow, trap raisers).

use std::cell::UnsafeCell;
use std::mem::offset_of;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::debug;

use crate::compiler::{self, CompileError};
use crate::module::{Module, ValueType};

pub(crate) mod jit_native;
pub mod memory;
pub(crate) mod signals;

use jit_native::CodeRegion;
use jit_native::x86_64::RuntimeHooks;
use memory::LinearMemory;

/// Matches the original engine's default call-depth budget.
const DEFAULT_CALL_DEPTH: u32 = 250;

/// A Wasm numeric value crossing the embedding boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// The value's 8-byte operand-stack representation; 32-bit values are
    /// zero-extended.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::I32(value) => value as u32 as u64,
            Value::I64(value) => value as u64,
            Value::F32(value) => value.to_bits() as u64,
            Value::F64(value) => value.to_bits(),
        }
    }

    pub fn from_bits(ty: ValueType, bits: u64) -> Self {
        match ty {
            ValueType::I32 => Value::I32(bits as u32 as i32),
            ValueType::I64 => Value::I64(bits as i64),
            ValueType::F32 => Value::F32(f32::from_bits(bits as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(bits)),
        }
    }

    pub fn as_i32(self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            Value::F32(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(value),
            _ => None,
        }
    }
}

/// The trap surface: the five named traps, CPU-derived integer traps,
/// memory-access faults, and host failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    Unreachable,
    IntegerDivide,
    FpError,
    IndirectCallRange,
    IndirectCallType,
    StackOverflow,
    MemoryOutOfBounds,
    HostError,
}

impl std::fmt::Display for TrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrapKind::Unreachable => write!(f, "unreachable"),
            TrapKind::IntegerDivide => write!(f, "integer divide error"),
            TrapKind::FpError => write!(f, "floating point error"),
            TrapKind::IndirectCallRange => write!(f, "call_indirect out of range"),
            TrapKind::IndirectCallType => write!(f, "call_indirect incorrect function type"),
            TrapKind::StackOverflow => write!(f, "stack overflow"),
            TrapKind::MemoryOutOfBounds => write!(f, "out of bounds memory access"),
            TrapKind::HostError => write!(f, "host function error"),
        }
    }
}

#[derive(Debug)]
pub enum VmError {
    /// A runtime trap terminated the invocation; the instance stays usable.
    Trap {
        kind: TrapKind,
        message: Option<String>,
    },
    Compile(CompileError),
    InvalidFunction(u32),
    UnknownExport(String),
    UnknownImport(String),
    ArgumentCount {
        expected: usize,
        got: usize,
    },
    ArgumentType {
        index: usize,
        expected: ValueType,
        got: ValueType,
    },
    UnboundImport {
        index: u32,
        name: String,
    },
    HostReturnMismatch {
        expected: Option<ValueType>,
        got: Option<ValueType>,
    },
    InvalidGlobal(u32),
    ImmutableGlobal(u32),
    Platform(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Trap { kind, message } => match message {
                Some(message) => write!(f, "wasm trap: {kind}: {message}"),
                None => write!(f, "wasm trap: {kind}"),
            },
            VmError::Compile(err) => write!(f, "compile error: {err}"),
            VmError::InvalidFunction(func) => write!(f, "invalid function index {func}"),
            VmError::UnknownExport(name) => write!(f, "unknown export '{name}'"),
            VmError::UnknownImport(name) => write!(f, "unknown import '{name}'"),
            VmError::ArgumentCount { expected, got } => {
                write!(f, "argument count mismatch: expected {expected}, got {got}")
            }
            VmError::ArgumentType {
                index,
                expected,
                got,
            } => write!(
                f,
                "argument {index} type mismatch: expected {expected:?}, got {got:?}"
            ),
            VmError::UnboundImport { index, name } => {
                write!(f, "unbound host import {index} ('{name}')")
            }
            VmError::HostReturnMismatch { expected, got } => write!(
                f,
                "host return mismatch: expected {expected:?}, got {got:?}"
            ),
            VmError::InvalidGlobal(index) => write!(f, "invalid global index {index}"),
            VmError::ImmutableGlobal(index) => write!(f, "global {index} is immutable"),
            VmError::Platform(message) => write!(f, "platform error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<CompileError> for VmError {
    fn from(err: CompileError) -> Self {
        VmError::Compile(err)
    }
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            VmError::Trap { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// What a host function sees while generated code is suspended beneath it.
pub struct HostContext<'a> {
    memory: &'a mut LinearMemory,
}

impl HostContext<'_> {
    pub fn memory(&self) -> &[u8] {
        self.memory.data()
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut()
    }

    pub fn memory_pages(&self) -> u32 {
        self.memory.page_count()
    }
}

/// A native callback backing one imported function. Arguments arrive in
/// Wasm order; errors and panics become a host trap that unwinds the whole
/// invocation.
pub trait HostFunction {
    fn call(&mut self, ctx: &mut HostContext<'_>, args: &[Value]) -> VmResult<Option<Value>>;
}

/// The state block generated code receives in rdi. The depth budget is read
/// into ebx by the invoke stub; the instance pointer routes host calls and
/// memory size/grow back into the runtime.
#[repr(C)]
pub(crate) struct ExecutionContext {
    depth_budget: u64,
    instance: *mut Instance,
}

type InvokeEntry =
    unsafe extern "sysv64" fn(*mut ExecutionContext, *mut u8, *const u64, u64, *const u8) -> u64;

/// A compiled, instantiated module: the finalized code region plus the
/// mutable state (globals, linear memory, host bindings) generated code
/// addresses directly. Instances are single-threaded by construction.
pub struct Instance {
    module: Module,
    region: CodeRegion,
    function_offsets: Vec<usize>,
    invoke_stub: usize,
    globals: Box<[UnsafeCell<u64>]>,
    memory: LinearMemory,
    hosts: Vec<Option<Box<dyn HostFunction>>>,
    call_depth_limit: u32,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    /// Compile `module` into fresh executable memory and instantiate its
    /// globals and linear memory. Global cell and memory base addresses are
    /// burned into the generated code, so they live behind stable heap
    /// allocations owned by the instance.
    pub fn new(module: Module) -> VmResult<Self> {
        let globals: Box<[UnsafeCell<u64>]> = module
            .globals
            .iter()
            .map(|global| UnsafeCell::new(global.init))
            .collect();
        let memory = LinearMemory::new(module.memory.initial_pages, module.memory.max_pages)?;

        let capacity = compiler::region_capacity(&module);
        let mut region = CodeRegion::new(capacity).map_err(VmError::Compile)?;
        let cell_addrs: Vec<usize> = globals.iter().map(|cell| cell.get() as usize).collect();
        let layout = compiler::compile_module(&module, &cell_addrs, runtime_hooks(), &mut region)?;
        region.end_code().map_err(VmError::Compile)?;
        signals::install_handlers().map_err(VmError::Platform)?;

        debug!(
            code_bytes = region.used(),
            functions = module.function_count(),
            "module instantiated"
        );

        let host_count = module.get_imported_functions_size() as usize;
        let mut hosts = Vec::with_capacity(host_count);
        hosts.resize_with(host_count, || None);
        Ok(Self {
            module,
            region,
            function_offsets: layout.function_offsets,
            invoke_stub: layout.invoke_stub,
            globals,
            memory,
            hosts,
            call_depth_limit: DEFAULT_CALL_DEPTH,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Byte offset of a function's code within the finalized region.
    pub fn jit_code_offset(&self, func: u32) -> Option<usize> {
        self.function_offsets.get(func as usize).copied()
    }

    /// Bound native recursion depth for subsequent invocations.
    pub fn set_call_depth_limit(&mut self, limit: u32) {
        self.call_depth_limit = limit.max(1);
    }

    /// Attach a host callback to the named import.
    pub fn bind_host(&mut self, name: &str, host: Box<dyn HostFunction>) -> VmResult<()> {
        let index = self
            .module
            .imports
            .iter()
            .position(|import| import.name == name)
            .ok_or_else(|| VmError::UnknownImport(name.to_string()))?;
        self.hosts[index] = Some(host);
        Ok(())
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut self.memory
    }

    pub fn global(&self, index: u32) -> Option<Value> {
        let def = self.module.globals.get(index as usize)?;
        let bits = unsafe { *self.globals[index as usize].get() };
        Some(Value::from_bits(def.ty, bits))
    }

    pub fn set_global(&mut self, index: u32, value: Value) -> VmResult<()> {
        let def = self
            .module
            .globals
            .get(index as usize)
            .ok_or(VmError::InvalidGlobal(index))?;
        if !def.mutable {
            return Err(VmError::ImmutableGlobal(index));
        }
        if value.ty() != def.ty {
            return Err(VmError::ArgumentType {
                index: index as usize,
                expected: def.ty,
                got: value.ty(),
            });
        }
        unsafe {
            *self.globals[index as usize].get() = value.to_bits();
        }
        Ok(())
    }

    pub fn invoke_export(&mut self, name: &str, args: &[Value]) -> VmResult<Option<Value>> {
        let func = self
            .module
            .export(name)
            .ok_or_else(|| VmError::UnknownExport(name.to_string()))?;
        self.invoke(func, args)
    }

    /// Call function `func` with `args`. A trap leaves globals and linear
    /// memory exactly as the generated code last wrote them; the instance
    /// remains usable for further invocations.
    pub fn invoke(&mut self, func: u32, args: &[Value]) -> VmResult<Option<Value>> {
        let offset = self
            .jit_code_offset(func)
            .ok_or(VmError::InvalidFunction(func))?;
        let ty = self.module.func_type(func).clone();
        if args.len() != ty.params.len() {
            return Err(VmError::ArgumentCount {
                expected: ty.params.len(),
                got: args.len(),
            });
        }
        for (index, (arg, param)) in args.iter().zip(&ty.params).enumerate() {
            if arg.ty() != *param {
                return Err(VmError::ArgumentType {
                    index,
                    expected: *param,
                    got: arg.ty(),
                });
            }
        }

        let raw: Vec<u64> = args.iter().map(|arg| arg.to_bits()).collect();
        let span = self.memory.reserved_span();
        let memory_base = self.memory.base();
        let entry: InvokeEntry =
            unsafe { std::mem::transmute(self.region.ptr_at(self.invoke_stub)) };
        let callee = self.region.ptr_at(offset);
        let mut context = ExecutionContext {
            depth_budget: self.call_depth_limit as u64,
            instance: self as *mut Instance,
        };

        let outcome = unsafe {
            signals::call_with_unwind(span, || unsafe {
                entry(
                    &mut context,
                    memory_base,
                    raw.as_ptr(),
                    raw.len() as u64,
                    callee,
                )
            })
        };
        match outcome {
            Ok(bits) => Ok(ty.result.map(|result| Value::from_bits(result, bits))),
            Err((kind, message)) => Err(VmError::Trap { kind, message }),
        }
    }

    /// Decode the in-stack arguments for import `index`, run the bound host
    /// function, and re-encode its result for rax.
    fn call_host(&mut self, stack: *const u64, index: u32) -> VmResult<u64> {
        let import = self
            .module
            .imports
            .get(index as usize)
            .ok_or(VmError::InvalidFunction(index))?;
        let name = import.name.clone();
        let ty = self.module.types[import.type_index as usize].clone();
        let count = ty.params.len();
        let mut args = Vec::with_capacity(count);
        for (slot, param) in ty.params.iter().enumerate() {
            // param 0 sits deepest; the stack pointer aims at the last push
            let bits = unsafe { *stack.add(count - 1 - slot) };
            args.push(Value::from_bits(*param, bits));
        }

        let hosts = &mut self.hosts;
        let memory = &mut self.memory;
        let host = hosts
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(VmError::UnboundImport { index, name })?;
        let result = host.call(&mut HostContext { memory }, &args)?;

        match (ty.result, result) {
            (Some(expected), Some(value)) if value.ty() == expected => Ok(value.to_bits()),
            (None, None) => Ok(0),
            (expected, got) => Err(VmError::HostReturnMismatch {
                expected,
                got: got.map(|value| value.ty()),
            }),
        }
    }
}

fn runtime_hooks() -> RuntimeHooks {
    RuntimeHooks {
        host_dispatch: dispatch_host_call as usize,
        current_memory: runtime_current_memory as usize,
        grow_memory: runtime_grow_memory as usize,
        on_unreachable: signals::on_unreachable as usize,
        on_fp_error: signals::on_fp_error as usize,
        on_call_indirect_range: signals::on_call_indirect_range as usize,
        on_call_indirect_type: signals::on_call_indirect_type as usize,
        on_stack_overflow: signals::on_stack_overflow as usize,
        ctx_depth_offset: offset_of!(ExecutionContext, depth_budget) as u32,
    }
}

/// C-shaped dispatcher the host trampolines call. Host errors and panics
/// must not unwind through JIT frames (they carry no exception tables), so
/// both are converted into the longjmp trap path.
unsafe extern "sysv64" fn dispatch_host_call(
    context: *mut ExecutionContext,
    stack: *const u64,
    index: u32,
) -> u64 {
    let instance = unsafe { &mut *(*context).instance };
    let outcome = catch_unwind(AssertUnwindSafe(|| instance.call_host(stack, index)));
    match outcome {
        Ok(Ok(bits)) => bits,
        Ok(Err(err)) => signals::raise_trap(TrapKind::HostError, Some(err.to_string())),
        Err(_) => signals::raise_trap(
            TrapKind::HostError,
            Some("host function panicked".to_string()),
        ),
    }
}

unsafe extern "sysv64" fn runtime_current_memory(context: *mut ExecutionContext) -> i32 {
    let instance = unsafe { &mut *(*context).instance };
    instance.memory.page_count() as i32
}

/// `memory.grow`: returns the previous page count or -1. The base address
/// never moves, so the pinned rsi in every active frame stays valid.
unsafe extern "sysv64" fn runtime_grow_memory(context: *mut ExecutionContext, pages: i32) -> i32 {
    let instance = unsafe { &mut *(*context).instance };
    instance.memory.grow(pages as u32)
}
