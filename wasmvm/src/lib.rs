pub mod compiler;
pub mod module;
pub mod vm;

pub use compiler::CompileError;
pub use module::{
    FuncType, FunctionBody, GlobalDef, ImportFunc, Instr, MemoryLimits, Module, ModuleBuilder,
    ModuleError, ValueType,
};
pub use vm::memory::{LinearMemory, WASM_PAGE_SIZE};
pub use vm::{HostContext, HostFunction, Instance, TrapKind, Value, VmError, VmResult};
