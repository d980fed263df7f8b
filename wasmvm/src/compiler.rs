//! The streaming compile driver.
//!
//! Walks every function body exactly once in parser order, maintaining the
//! control-label stack the validator implies, and invokes one writer entry
//! point per instruction. Forward labels collect their pending branch holes
//! on the frame; `end` binds them. Branch depth changes are computed from
//! the tracked operand height, with the high preserve-top bit set when the
//! target label carries a value.

use tracing::{debug, trace};

use crate::module::{Instr, Module, ValueType};
use crate::vm::jit_native::CodeRegion;
use crate::vm::jit_native::x86_64::{
    ERROR_HANDLER_SIZE, HOST_TRAMPOLINE_SIZE, INVOKE_STUB_SIZE, MachineCodeWriter, PRESERVE_TOP,
    RuntimeHooks, TABLE_ELEMENT_SIZE, function_reservation,
};

#[derive(Debug)]
pub enum CompileError {
    OutOfCodeSpace { needed: usize, available: usize },
    ReservationExceeded,
    BranchOutOfRange,
    TooManyLocals(u64),
    UnresolvedFunction(u32),
    InvalidModule(String),
    Platform(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::OutOfCodeSpace { needed, available } => {
                write!(f, "out of code space: needed {needed} bytes, {available} available")
            }
            CompileError::ReservationExceeded => {
                write!(f, "emission exceeded the artifact's code reservation")
            }
            CompileError::BranchOutOfRange => {
                write!(f, "branch displacement exceeds 32-bit range")
            }
            CompileError::TooManyLocals(count) => write!(f, "unsupported local count {count}"),
            CompileError::UnresolvedFunction(func) => {
                write!(f, "call sites for function {func} were never resolved")
            }
            CompileError::InvalidModule(message) => write!(f, "invalid module: {message}"),
            CompileError::Platform(message) => write!(f, "platform error: {message}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Offsets of everything the runtime needs out of the finalized region.
pub(crate) struct CompiledLayout {
    pub function_offsets: Vec<usize>,
    pub invoke_stub: usize,
}

/// Worst-case region size for a whole module: the fixed artifacts plus every
/// function's reservation.
pub(crate) fn region_capacity(module: &Module) -> usize {
    let mut size = 4 * ERROR_HANDLER_SIZE
        + module.get_imported_functions_size() as usize * HOST_TRAMPOLINE_SIZE
        + module.table.as_ref().map_or(0, |table| table.len()) * TABLE_ELEMENT_SIZE
        + INVOKE_STUB_SIZE;
    for body in &module.code {
        size += function_reservation(body);
    }
    size
}

pub(crate) fn compile_module(
    module: &Module,
    global_cells: &[usize],
    hooks: RuntimeHooks,
    region: &mut CodeRegion,
) -> Result<CompiledLayout, CompileError> {
    debug!(
        functions = module.function_count(),
        imports = module.get_imported_functions_size(),
        "compiling module"
    );
    let compiler = ModuleCompiler {
        module,
        writer: MachineCodeWriter::new(region, module, global_cells, hooks),
    };
    compiler.run()
}

enum FrameKind {
    /// The function body's implicit outermost label; its target is the
    /// epilogue.
    Body,
    Block,
    /// Backward label: branches jump straight to the recorded address.
    Loop(usize),
    /// Forward label holding the pending else/end hole from `emit_if`.
    If(Option<usize>),
}

struct ControlFrame {
    kind: FrameKind,
    result: Option<ValueType>,
    entry_height: u32,
    holes: Vec<usize>,
}

impl ControlFrame {
    /// Branches to a loop label carry nothing; every other label carries
    /// its result.
    fn branch_arity(&self) -> u32 {
        match self.kind {
            FrameKind::Loop(_) => 0,
            _ => self.result.is_some() as u32,
        }
    }
}

struct ModuleCompiler<'a> {
    module: &'a Module,
    writer: MachineCodeWriter<'a>,
}

impl<'a> ModuleCompiler<'a> {
    fn run(mut self) -> Result<CompiledLayout, CompileError> {
        self.writer.emit_trap_stubs()?;
        self.writer.emit_host_trampolines()?;
        self.writer.emit_jump_table()?;
        self.writer.emit_invoke_stub()?;

        let imports = self.module.get_imported_functions_size();
        for funcnum in imports..self.module.function_count() {
            self.compile_function(funcnum)?;
        }
        self.writer.verify_relocations()?;

        let function_offsets = (0..self.module.function_count())
            .map(|funcnum| {
                self.writer.function_offset(funcnum).ok_or_else(|| {
                    CompileError::InvalidModule(format!("function {funcnum} was never emitted"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledLayout {
            function_offsets,
            invoke_stub: self.writer.invoke_stub_offset(),
        })
    }

    fn compile_function(&mut self, funcnum: u32) -> Result<(), CompileError> {
        let body = self.module.body(funcnum);
        let ty = self.module.func_type(funcnum);
        let local_limit = ty.param_count() as u64 + body.local_count();

        let start = self.writer.begin_function(funcnum)?;
        let mut frames = vec![ControlFrame {
            kind: FrameKind::Body,
            result: ty.result,
            entry_height: 0,
            holes: Vec::new(),
        }];
        let mut height: u32 = 0;
        // after an unconditional transfer the stream is unreachable until the
        // matching else/end; nothing is emitted there
        let mut dead = false;
        let mut dead_nesting: u32 = 0;
        let mut finished = false;

        for instr in &body.instrs {
            if finished {
                return Err(CompileError::InvalidModule(format!(
                    "function {funcnum} has instructions after its final end"
                )));
            }

            if dead {
                match instr {
                    Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. } => {
                        dead_nesting += 1;
                    }
                    Instr::Else if dead_nesting == 0 => {
                        let frame = frames.last_mut().ok_or_else(|| {
                            CompileError::InvalidModule("else outside a frame".into())
                        })?;
                        let FrameKind::If(else_hole) = &mut frame.kind else {
                            return Err(CompileError::InvalidModule(
                                "else outside an if frame".into(),
                            ));
                        };
                        let hole = else_hole.take().ok_or_else(|| {
                            CompileError::InvalidModule("duplicate else".into())
                        })?;
                        let target = self.writer.pos();
                        self.writer.fix_branch(hole, target)?;
                        height = frame.entry_height;
                        dead = false;
                    }
                    Instr::End => {
                        if dead_nesting > 0 {
                            dead_nesting -= 1;
                        } else {
                            self.end_frame(&mut frames, &mut height, &mut dead, &mut finished)?;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match instr {
                // control
                Instr::Unreachable => {
                    self.writer.emit_unreachable()?;
                    dead = true;
                }
                Instr::Nop => self.writer.emit_nop()?,
                Instr::Block { result } => {
                    frames.push(ControlFrame {
                        kind: FrameKind::Block,
                        result: *result,
                        entry_height: height,
                        holes: Vec::new(),
                    });
                }
                Instr::Loop { result } => {
                    frames.push(ControlFrame {
                        kind: FrameKind::Loop(self.writer.pos()),
                        result: *result,
                        entry_height: height,
                        holes: Vec::new(),
                    });
                }
                Instr::If { result } => {
                    let hole = self.writer.emit_if()?;
                    height = pop_operands(height, 1)?;
                    frames.push(ControlFrame {
                        kind: FrameKind::If(Some(hole)),
                        result: *result,
                        entry_height: height,
                        holes: Vec::new(),
                    });
                }
                Instr::Else => {
                    let frame = frames.last_mut().ok_or_else(|| {
                        CompileError::InvalidModule("else outside a frame".into())
                    })?;
                    let FrameKind::If(else_hole) = &mut frame.kind else {
                        return Err(CompileError::InvalidModule(
                            "else outside an if frame".into(),
                        ));
                    };
                    let hole = else_hole
                        .take()
                        .ok_or_else(|| CompileError::InvalidModule("duplicate else".into()))?;
                    let entry_height = frame.entry_height;
                    let end_hole = self.writer.emit_else(hole)?;
                    if let Some(frame) = frames.last_mut() {
                        frame.holes.push(end_hole);
                    }
                    height = entry_height;
                }
                Instr::End => {
                    self.end_frame(&mut frames, &mut height, &mut dead, &mut finished)?;
                }
                Instr::Br { depth } => {
                    let (change, idx) = branch_depth_change(&frames, *depth, height)?;
                    let hole = self.writer.emit_br(change)?;
                    self.attach_branch(&mut frames, idx, hole)?;
                    dead = true;
                }
                Instr::BrIf { depth } => {
                    let after_cond = pop_operands(height, 1)?;
                    let (change, idx) = branch_depth_change(&frames, *depth, after_cond)?;
                    let hole = self.writer.emit_br_if(change)?;
                    self.attach_branch(&mut frames, idx, hole)?;
                    height = after_cond;
                }
                Instr::BrTable { targets, default } => {
                    let after_index = pop_operands(height, 1)?;
                    let mut state = self.writer.emit_br_table(targets.len() as u32)?;
                    for target in targets {
                        let (change, idx) = branch_depth_change(&frames, *target, after_index)?;
                        let hole = self.writer.emit_br_table_case(&mut state, change)?;
                        self.attach_branch(&mut frames, idx, hole)?;
                    }
                    let (change, idx) = branch_depth_change(&frames, *default, after_index)?;
                    let hole = self.writer.emit_br_table_default(&mut state, change)?;
                    self.attach_branch(&mut frames, idx, hole)?;
                    dead = true;
                }
                Instr::Return => {
                    let depth = (frames.len() - 1) as u32;
                    let (change, idx) = branch_depth_change(&frames, depth, height)?;
                    let hole = self.writer.emit_return(change)?;
                    self.attach_branch(&mut frames, idx, hole)?;
                    dead = true;
                }
                Instr::Call { func } => {
                    if *func >= self.module.function_count() {
                        return Err(CompileError::InvalidModule(format!(
                            "call to unknown function {func}"
                        )));
                    }
                    let callee = self.module.func_type(*func);
                    let params = callee.param_count();
                    let results = callee.return_count();
                    self.writer.emit_call(*func)?;
                    height = pop_operands(height, params)? + results;
                }
                Instr::CallIndirect { type_index } => {
                    if *type_index as usize >= self.module.types.len() {
                        return Err(CompileError::InvalidModule(format!(
                            "call_indirect with unknown type {type_index}"
                        )));
                    }
                    let callee = &self.module.types[*type_index as usize];
                    let params = callee.param_count();
                    let results = callee.return_count();
                    self.writer.emit_call_indirect(*type_index)?;
                    height = pop_operands(height, params + 1)? + results;
                }

                // parametric
                Instr::Drop => {
                    self.writer.emit_drop()?;
                    height = pop_operands(height, 1)?;
                }
                Instr::Select => {
                    self.writer.emit_select()?;
                    height = pop_operands(height, 2)?;
                }

                // locals and globals
                Instr::LocalGet { index } => {
                    check_local(*index, local_limit)?;
                    self.writer.emit_get_local(*index)?;
                    height += 1;
                }
                Instr::LocalSet { index } => {
                    check_local(*index, local_limit)?;
                    self.writer.emit_set_local(*index)?;
                    height = pop_operands(height, 1)?;
                }
                Instr::LocalTee { index } => {
                    check_local(*index, local_limit)?;
                    self.writer.emit_tee_local(*index)?;
                }
                Instr::GlobalGet { index } => {
                    check_global(*index, self.module)?;
                    self.writer.emit_get_global(*index)?;
                    height += 1;
                }
                Instr::GlobalSet { index } => {
                    check_global(*index, self.module)?;
                    self.writer.emit_set_global(*index)?;
                    height = pop_operands(height, 1)?;
                }

                // memory: loads pop an index and push a value
                Instr::I32Load { offset } => self.writer.emit_i32_load(*offset)?,
                Instr::I64Load { offset } => self.writer.emit_i64_load(*offset)?,
                Instr::F32Load { offset } => self.writer.emit_f32_load(*offset)?,
                Instr::F64Load { offset } => self.writer.emit_f64_load(*offset)?,
                Instr::I32Load8S { offset } => self.writer.emit_i32_load8_s(*offset)?,
                Instr::I32Load8U { offset } => self.writer.emit_i32_load8_u(*offset)?,
                Instr::I32Load16S { offset } => self.writer.emit_i32_load16_s(*offset)?,
                Instr::I32Load16U { offset } => self.writer.emit_i32_load16_u(*offset)?,
                Instr::I64Load8S { offset } => self.writer.emit_i64_load8_s(*offset)?,
                Instr::I64Load8U { offset } => self.writer.emit_i64_load8_u(*offset)?,
                Instr::I64Load16S { offset } => self.writer.emit_i64_load16_s(*offset)?,
                Instr::I64Load16U { offset } => self.writer.emit_i64_load16_u(*offset)?,
                Instr::I64Load32S { offset } => self.writer.emit_i64_load32_s(*offset)?,
                Instr::I64Load32U { offset } => self.writer.emit_i64_load32_u(*offset)?,
                Instr::I32Store { offset } => {
                    self.writer.emit_i32_store(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I64Store { offset } => {
                    self.writer.emit_i64_store(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::F32Store { offset } => {
                    self.writer.emit_f32_store(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::F64Store { offset } => {
                    self.writer.emit_f64_store(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I32Store8 { offset } => {
                    self.writer.emit_i32_store8(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I32Store16 { offset } => {
                    self.writer.emit_i32_store16(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I64Store8 { offset } => {
                    self.writer.emit_i64_store8(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I64Store16 { offset } => {
                    self.writer.emit_i64_store16(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::I64Store32 { offset } => {
                    self.writer.emit_i64_store32(*offset)?;
                    height = pop_operands(height, 2)?;
                }
                Instr::MemorySize => {
                    self.writer.emit_current_memory()?;
                    height += 1;
                }
                Instr::MemoryGrow => self.writer.emit_grow_memory()?,

                // constants
                Instr::I32Const(value) => {
                    self.writer.emit_i32_const(*value as u32)?;
                    height += 1;
                }
                Instr::I64Const(value) => {
                    self.writer.emit_i64_const(*value as u64)?;
                    height += 1;
                }
                Instr::F32Const(value) => {
                    self.writer.emit_f32_const(*value)?;
                    height += 1;
                }
                Instr::F64Const(value) => {
                    self.writer.emit_f64_const(*value)?;
                    height += 1;
                }

                // comparisons: eqz replaces the top, relops fold two to one
                Instr::I32Eqz => self.writer.emit_i32_eqz()?,
                Instr::I64Eqz => self.writer.emit_i64_eqz()?,
                Instr::I32Eq => self.relop(&mut height, MachineCodeWriter::emit_i32_eq)?,
                Instr::I32Ne => self.relop(&mut height, MachineCodeWriter::emit_i32_ne)?,
                Instr::I32LtS => self.relop(&mut height, MachineCodeWriter::emit_i32_lt_s)?,
                Instr::I32LtU => self.relop(&mut height, MachineCodeWriter::emit_i32_lt_u)?,
                Instr::I32GtS => self.relop(&mut height, MachineCodeWriter::emit_i32_gt_s)?,
                Instr::I32GtU => self.relop(&mut height, MachineCodeWriter::emit_i32_gt_u)?,
                Instr::I32LeS => self.relop(&mut height, MachineCodeWriter::emit_i32_le_s)?,
                Instr::I32LeU => self.relop(&mut height, MachineCodeWriter::emit_i32_le_u)?,
                Instr::I32GeS => self.relop(&mut height, MachineCodeWriter::emit_i32_ge_s)?,
                Instr::I32GeU => self.relop(&mut height, MachineCodeWriter::emit_i32_ge_u)?,
                Instr::I64Eq => self.relop(&mut height, MachineCodeWriter::emit_i64_eq)?,
                Instr::I64Ne => self.relop(&mut height, MachineCodeWriter::emit_i64_ne)?,
                Instr::I64LtS => self.relop(&mut height, MachineCodeWriter::emit_i64_lt_s)?,
                Instr::I64LtU => self.relop(&mut height, MachineCodeWriter::emit_i64_lt_u)?,
                Instr::I64GtS => self.relop(&mut height, MachineCodeWriter::emit_i64_gt_s)?,
                Instr::I64GtU => self.relop(&mut height, MachineCodeWriter::emit_i64_gt_u)?,
                Instr::I64LeS => self.relop(&mut height, MachineCodeWriter::emit_i64_le_s)?,
                Instr::I64LeU => self.relop(&mut height, MachineCodeWriter::emit_i64_le_u)?,
                Instr::I64GeS => self.relop(&mut height, MachineCodeWriter::emit_i64_ge_s)?,
                Instr::I64GeU => self.relop(&mut height, MachineCodeWriter::emit_i64_ge_u)?,
                Instr::F32Eq => self.relop(&mut height, MachineCodeWriter::emit_f32_eq)?,
                Instr::F32Ne => self.relop(&mut height, MachineCodeWriter::emit_f32_ne)?,
                Instr::F32Lt => self.relop(&mut height, MachineCodeWriter::emit_f32_lt)?,
                Instr::F32Gt => self.relop(&mut height, MachineCodeWriter::emit_f32_gt)?,
                Instr::F32Le => self.relop(&mut height, MachineCodeWriter::emit_f32_le)?,
                Instr::F32Ge => self.relop(&mut height, MachineCodeWriter::emit_f32_ge)?,
                Instr::F64Eq => self.relop(&mut height, MachineCodeWriter::emit_f64_eq)?,
                Instr::F64Ne => self.relop(&mut height, MachineCodeWriter::emit_f64_ne)?,
                Instr::F64Lt => self.relop(&mut height, MachineCodeWriter::emit_f64_lt)?,
                Instr::F64Gt => self.relop(&mut height, MachineCodeWriter::emit_f64_gt)?,
                Instr::F64Le => self.relop(&mut height, MachineCodeWriter::emit_f64_le)?,
                Instr::F64Ge => self.relop(&mut height, MachineCodeWriter::emit_f64_ge)?,

                // integer arithmetic
                Instr::I32Clz => self.writer.emit_i32_clz()?,
                Instr::I32Ctz => self.writer.emit_i32_ctz()?,
                Instr::I32Popcnt => self.writer.emit_i32_popcnt()?,
                Instr::I32Add => self.binop(&mut height, MachineCodeWriter::emit_i32_add)?,
                Instr::I32Sub => self.binop(&mut height, MachineCodeWriter::emit_i32_sub)?,
                Instr::I32Mul => self.binop(&mut height, MachineCodeWriter::emit_i32_mul)?,
                Instr::I32DivS => self.binop(&mut height, MachineCodeWriter::emit_i32_div_s)?,
                Instr::I32DivU => self.binop(&mut height, MachineCodeWriter::emit_i32_div_u)?,
                Instr::I32RemS => self.binop(&mut height, MachineCodeWriter::emit_i32_rem_s)?,
                Instr::I32RemU => self.binop(&mut height, MachineCodeWriter::emit_i32_rem_u)?,
                Instr::I32And => self.binop(&mut height, MachineCodeWriter::emit_i32_and)?,
                Instr::I32Or => self.binop(&mut height, MachineCodeWriter::emit_i32_or)?,
                Instr::I32Xor => self.binop(&mut height, MachineCodeWriter::emit_i32_xor)?,
                Instr::I32Shl => self.binop(&mut height, MachineCodeWriter::emit_i32_shl)?,
                Instr::I32ShrS => self.binop(&mut height, MachineCodeWriter::emit_i32_shr_s)?,
                Instr::I32ShrU => self.binop(&mut height, MachineCodeWriter::emit_i32_shr_u)?,
                Instr::I32Rotl => self.binop(&mut height, MachineCodeWriter::emit_i32_rotl)?,
                Instr::I32Rotr => self.binop(&mut height, MachineCodeWriter::emit_i32_rotr)?,
                Instr::I64Clz => self.writer.emit_i64_clz()?,
                Instr::I64Ctz => self.writer.emit_i64_ctz()?,
                Instr::I64Popcnt => self.writer.emit_i64_popcnt()?,
                Instr::I64Add => self.binop(&mut height, MachineCodeWriter::emit_i64_add)?,
                Instr::I64Sub => self.binop(&mut height, MachineCodeWriter::emit_i64_sub)?,
                Instr::I64Mul => self.binop(&mut height, MachineCodeWriter::emit_i64_mul)?,
                Instr::I64DivS => self.binop(&mut height, MachineCodeWriter::emit_i64_div_s)?,
                Instr::I64DivU => self.binop(&mut height, MachineCodeWriter::emit_i64_div_u)?,
                Instr::I64RemS => self.binop(&mut height, MachineCodeWriter::emit_i64_rem_s)?,
                Instr::I64RemU => self.binop(&mut height, MachineCodeWriter::emit_i64_rem_u)?,
                Instr::I64And => self.binop(&mut height, MachineCodeWriter::emit_i64_and)?,
                Instr::I64Or => self.binop(&mut height, MachineCodeWriter::emit_i64_or)?,
                Instr::I64Xor => self.binop(&mut height, MachineCodeWriter::emit_i64_xor)?,
                Instr::I64Shl => self.binop(&mut height, MachineCodeWriter::emit_i64_shl)?,
                Instr::I64ShrS => self.binop(&mut height, MachineCodeWriter::emit_i64_shr_s)?,
                Instr::I64ShrU => self.binop(&mut height, MachineCodeWriter::emit_i64_shr_u)?,
                Instr::I64Rotl => self.binop(&mut height, MachineCodeWriter::emit_i64_rotl)?,
                Instr::I64Rotr => self.binop(&mut height, MachineCodeWriter::emit_i64_rotr)?,

                // float arithmetic
                Instr::F32Abs => self.writer.emit_f32_abs()?,
                Instr::F32Neg => self.writer.emit_f32_neg()?,
                Instr::F32Ceil => self.writer.emit_f32_ceil()?,
                Instr::F32Floor => self.writer.emit_f32_floor()?,
                Instr::F32Trunc => self.writer.emit_f32_trunc()?,
                Instr::F32Nearest => self.writer.emit_f32_nearest()?,
                Instr::F32Sqrt => self.writer.emit_f32_sqrt()?,
                Instr::F32Add => self.binop(&mut height, MachineCodeWriter::emit_f32_add)?,
                Instr::F32Sub => self.binop(&mut height, MachineCodeWriter::emit_f32_sub)?,
                Instr::F32Mul => self.binop(&mut height, MachineCodeWriter::emit_f32_mul)?,
                Instr::F32Div => self.binop(&mut height, MachineCodeWriter::emit_f32_div)?,
                Instr::F32Min => self.binop(&mut height, MachineCodeWriter::emit_f32_min)?,
                Instr::F32Max => self.binop(&mut height, MachineCodeWriter::emit_f32_max)?,
                Instr::F32Copysign => {
                    self.binop(&mut height, MachineCodeWriter::emit_f32_copysign)?
                }
                Instr::F64Abs => self.writer.emit_f64_abs()?,
                Instr::F64Neg => self.writer.emit_f64_neg()?,
                Instr::F64Ceil => self.writer.emit_f64_ceil()?,
                Instr::F64Floor => self.writer.emit_f64_floor()?,
                Instr::F64Trunc => self.writer.emit_f64_trunc()?,
                Instr::F64Nearest => self.writer.emit_f64_nearest()?,
                Instr::F64Sqrt => self.writer.emit_f64_sqrt()?,
                Instr::F64Add => self.binop(&mut height, MachineCodeWriter::emit_f64_add)?,
                Instr::F64Sub => self.binop(&mut height, MachineCodeWriter::emit_f64_sub)?,
                Instr::F64Mul => self.binop(&mut height, MachineCodeWriter::emit_f64_mul)?,
                Instr::F64Div => self.binop(&mut height, MachineCodeWriter::emit_f64_div)?,
                Instr::F64Min => self.binop(&mut height, MachineCodeWriter::emit_f64_min)?,
                Instr::F64Max => self.binop(&mut height, MachineCodeWriter::emit_f64_max)?,
                Instr::F64Copysign => {
                    self.binop(&mut height, MachineCodeWriter::emit_f64_copysign)?
                }

                // conversions keep the height
                Instr::I32WrapI64 => self.writer.emit_i32_wrap_i64()?,
                Instr::I32TruncSF32 => self.writer.emit_i32_trunc_s_f32()?,
                Instr::I32TruncUF32 => self.writer.emit_i32_trunc_u_f32()?,
                Instr::I32TruncSF64 => self.writer.emit_i32_trunc_s_f64()?,
                Instr::I32TruncUF64 => self.writer.emit_i32_trunc_u_f64()?,
                Instr::I64ExtendSI32 => self.writer.emit_i64_extend_s_i32()?,
                Instr::I64ExtendUI32 => self.writer.emit_i64_extend_u_i32()?,
                Instr::I64TruncSF32 => self.writer.emit_i64_trunc_s_f32()?,
                Instr::I64TruncUF32 => self.writer.emit_i64_trunc_u_f32()?,
                Instr::I64TruncSF64 => self.writer.emit_i64_trunc_s_f64()?,
                Instr::I64TruncUF64 => self.writer.emit_i64_trunc_u_f64()?,
                Instr::F32ConvertSI32 => self.writer.emit_f32_convert_s_i32()?,
                Instr::F32ConvertUI32 => self.writer.emit_f32_convert_u_i32()?,
                Instr::F32ConvertSI64 => self.writer.emit_f32_convert_s_i64()?,
                Instr::F32ConvertUI64 => self.writer.emit_f32_convert_u_i64()?,
                Instr::F32DemoteF64 => self.writer.emit_f32_demote_f64()?,
                Instr::F64ConvertSI32 => self.writer.emit_f64_convert_s_i32()?,
                Instr::F64ConvertUI32 => self.writer.emit_f64_convert_u_i32()?,
                Instr::F64ConvertSI64 => self.writer.emit_f64_convert_s_i64()?,
                Instr::F64ConvertUI64 => self.writer.emit_f64_convert_u_i64()?,
                Instr::F64PromoteF32 => self.writer.emit_f64_promote_f32()?,
                Instr::I32ReinterpretF32
                | Instr::I64ReinterpretF64
                | Instr::F32ReinterpretI32
                | Instr::F64ReinterpretI64 => self.writer.emit_reinterpret()?,
            }
        }

        if !finished {
            return Err(CompileError::InvalidModule(format!(
                "function {funcnum} is missing its final end"
            )));
        }
        let size = self.writer.pos() - start;
        self.writer.finish_function();
        trace!(func = funcnum, offset = start, bytes = size, "emitted function");
        Ok(())
    }

    /// Binds the frame's label: every pending hole (and an else-less `if`'s
    /// false edge) lands here. The body frame's label is the epilogue.
    fn end_frame(
        &mut self,
        frames: &mut Vec<ControlFrame>,
        height: &mut u32,
        dead: &mut bool,
        finished: &mut bool,
    ) -> Result<(), CompileError> {
        let frame = frames
            .pop()
            .ok_or_else(|| CompileError::InvalidModule("end outside a frame".into()))?;
        let label = self.writer.pos();
        let mut label_referenced = !frame.holes.is_empty();
        if let FrameKind::If(Some(hole)) = frame.kind {
            self.writer.fix_branch(hole, label)?;
            label_referenced = true;
        }
        for hole in &frame.holes {
            self.writer.fix_branch(*hole, label)?;
        }

        let reachable = match frame.kind {
            // a loop's end label is only reached by falling through
            FrameKind::Loop(_) => !*dead,
            _ => !*dead || label_referenced,
        };
        if let FrameKind::Body = frame.kind {
            self.writer.emit_epilogue()?;
            *finished = true;
            *dead = false;
            return Ok(());
        }
        *height = frame.entry_height + frame.result.is_some() as u32;
        *dead = !reachable;
        Ok(())
    }

    fn attach_branch(
        &mut self,
        frames: &mut [ControlFrame],
        idx: usize,
        hole: usize,
    ) -> Result<(), CompileError> {
        match frames[idx].kind {
            FrameKind::Loop(target) => self.writer.fix_branch(hole, target),
            _ => {
                frames[idx].holes.push(hole);
                Ok(())
            }
        }
    }

    fn binop(
        &mut self,
        height: &mut u32,
        emit: fn(&mut MachineCodeWriter<'a>) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        emit(&mut self.writer)?;
        *height = pop_operands(*height, 1)?;
        Ok(())
    }

    fn relop(
        &mut self,
        height: &mut u32,
        emit: fn(&mut MachineCodeWriter<'a>) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        emit(&mut self.writer)?;
        *height = pop_operands(*height, 1)?;
        Ok(())
    }
}

fn pop_operands(height: u32, count: u32) -> Result<u32, CompileError> {
    height
        .checked_sub(count)
        .ok_or_else(|| CompileError::InvalidModule("operand stack underflow".into()))
}

fn check_local(index: u32, limit: u64) -> Result<(), CompileError> {
    if (index as u64) < limit {
        Ok(())
    } else {
        Err(CompileError::InvalidModule(format!(
            "local index {index} out of range"
        )))
    }
}

fn check_global(index: u32, module: &Module) -> Result<(), CompileError> {
    if (index as usize) < module.globals.len() {
        Ok(())
    } else {
        Err(CompileError::InvalidModule(format!(
            "global index {index} out of range"
        )))
    }
}

/// Encode a branch to the label `depth` frames up: the slot count to drop,
/// with the preserve-top bit when the label carries a value.
fn branch_depth_change(
    frames: &[ControlFrame],
    depth: u32,
    height: u32,
) -> Result<(u32, usize), CompileError> {
    let idx = frames
        .len()
        .checked_sub(1 + depth as usize)
        .ok_or_else(|| CompileError::InvalidModule(format!("branch depth {depth} out of range")))?;
    let frame = &frames[idx];
    let drop = height.checked_sub(frame.entry_height).ok_or_else(|| {
        CompileError::InvalidModule("branch below the target label's height".into())
    })?;
    let change = if frame.branch_arity() == 1 {
        drop | PRESERVE_TOP
    } else {
        drop
    };
    Ok((change, idx))
}
