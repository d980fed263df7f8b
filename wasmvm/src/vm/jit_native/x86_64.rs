//! Single-pass x86-64 machine code writer.
//!
//! The compile driver walks each function body once and calls one emission
//! method per instruction. Between any two instructions every operand lives
//! in memory on the native stack: each emitter pops its inputs, works in
//! scratch registers, and pushes its result. rdi holds the context pointer,
//! rsi the linear-memory base, and ebx the call-depth budget for the whole
//! invocation.
//!
//! Forward branches reserve a 4-byte hole via `emit_branch_target32` and are
//! patched later with `fix_branch`; backward branches are emitted directly.
//! Inter-function calls go through the relocation table, which records
//! pending call sites per callee until the callee's start offset is known.

use std::sync::OnceLock;

use crate::compiler::CompileError;
use crate::module::{Module, ValueType};
use crate::vm::jit_native::CodeRegion;

/// Addresses of the native runtime routines burned into generated code, plus
/// the context-layout facts the invoke stub needs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RuntimeHooks {
    pub host_dispatch: usize,
    pub current_memory: usize,
    pub grow_memory: usize,
    pub on_unreachable: usize,
    pub on_fp_error: usize,
    pub on_call_indirect_range: usize,
    pub on_call_indirect_type: usize,
    pub on_stack_overflow: usize,
    /// Byte offset of the depth-budget field inside the execution context.
    pub ctx_depth_offset: u32,
}

/// Branch depth-change encoding: low bits are the number of 8-byte operand
/// slots to discard; the high bit marks a branch that carries the top-of-stack
/// value to its target (the slot count then includes the carried value).
pub(crate) const PRESERVE_TOP: u32 = 0x8000_0000;

pub(crate) const MAX_PROLOGUE_SIZE: usize = 21;
pub(crate) const MAX_EPILOGUE_SIZE: usize = 10;
/// Empirical per-instruction upper bound inherited from the original design.
/// `br_table` is budgeted separately, per emitted case.
pub(crate) const MAX_INSTR_SIZE: usize = 79;
pub(crate) const MAX_BR_TABLE_CASE_SIZE: usize = 32;

pub(crate) const ERROR_HANDLER_SIZE: usize = 16;
pub(crate) const HOST_TRAMPOLINE_SIZE: usize = 40;
pub(crate) const TABLE_ELEMENT_SIZE: usize = 17;
pub(crate) const INVOKE_STUB_SIZE: usize = 64;

/// Unpatched holes read as a jump to this displacement; any branch left
/// unfixed lands far outside the region and faults loudly.
const HOLE_FILLER: u32 = 0xDEAD_BEEF;

enum FuncReloc {
    Pending(Vec<usize>),
    Resolved(usize),
}

pub(crate) struct MachineCodeWriter<'a> {
    region: &'a mut CodeRegion,
    module: &'a Module,
    global_cells: &'a [usize],
    hooks: RuntimeHooks,
    pos: usize,
    code_start: usize,
    code_end: usize,
    function_relocations: Vec<FuncReloc>,
    fpe_handler: usize,
    indirect_range_handler: usize,
    indirect_type_handler: usize,
    stack_overflow_handler: usize,
    jmp_table: usize,
    invoke_stub: usize,
    // per-function state
    param_count: u32,
    local_count: u32,
    returns_value: bool,
}

impl<'a> MachineCodeWriter<'a> {
    pub(crate) fn new(
        region: &'a mut CodeRegion,
        module: &'a Module,
        global_cells: &'a [usize],
        hooks: RuntimeHooks,
    ) -> Self {
        let function_count = module.function_count() as usize;
        let mut function_relocations = Vec::with_capacity(function_count);
        function_relocations.resize_with(function_count, || FuncReloc::Pending(Vec::new()));
        Self {
            region,
            module,
            global_cells,
            hooks,
            pos: 0,
            code_start: 0,
            code_end: 0,
            function_relocations,
            fpe_handler: 0,
            indirect_range_handler: 0,
            indirect_type_handler: 0,
            stack_overflow_handler: 0,
            jmp_table: 0,
            invoke_stub: 0,
            param_count: 0,
            local_count: 0,
            returns_value: false,
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn invoke_stub_offset(&self) -> usize {
        self.invoke_stub
    }

    /// Start offset of an already-emitted function, if it has one.
    pub(crate) fn function_offset(&self, funcnum: u32) -> Option<usize> {
        match self.function_relocations.get(funcnum as usize)? {
            FuncReloc::Resolved(start) => Some(*start),
            FuncReloc::Pending(_) => None,
        }
    }

    // ---------------- encoder primitives ----------------

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), CompileError> {
        if self.pos + bytes.len() > self.code_end {
            return Err(CompileError::ReservationExceeded);
        }
        self.region.buf_mut()[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    fn emit_u32(&mut self, value: u32) -> Result<(), CompileError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    fn emit_u64(&mut self, value: u64) -> Result<(), CompileError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    fn emit_ptr(&mut self, value: usize) -> Result<(), CompileError> {
        self.emit_u64(value as u64)
    }

    /// Reserve a 4-byte displacement hole at the cursor and return its
    /// offset for a later `fix_branch`.
    fn emit_branch_target32(&mut self) -> Result<usize, CompileError> {
        let hole = self.pos;
        self.emit_u32(HOLE_FILLER.wrapping_sub(hole as u32))?;
        Ok(hole)
    }

    /// Patch a displacement hole so the branch lands on `target`. Offsets
    /// are region-relative, so the PC-relative math is exact.
    pub(crate) fn fix_branch(&mut self, hole: usize, target: usize) -> Result<(), CompileError> {
        let relative = target as i64 - (hole as i64 + 4);
        let relative = i32::try_from(relative).map_err(|_| CompileError::BranchOutOfRange)?;
        self.region.buf_mut()[hole..hole + 4].copy_from_slice(&relative.to_le_bytes());
        Ok(())
    }

    // ---------------- relocation table ----------------

    fn register_call(&mut self, hole: usize, funcnum: u32) -> Result<(), CompileError> {
        match &mut self.function_relocations[funcnum as usize] {
            FuncReloc::Pending(holes) => {
                holes.push(hole);
                Ok(())
            }
            FuncReloc::Resolved(start) => {
                let start = *start;
                self.fix_branch(hole, start)
            }
        }
    }

    fn start_function(&mut self, start: usize, funcnum: u32) -> Result<(), CompileError> {
        let pending = std::mem::replace(
            &mut self.function_relocations[funcnum as usize],
            FuncReloc::Resolved(start),
        );
        match pending {
            FuncReloc::Pending(holes) => {
                for hole in holes {
                    self.fix_branch(hole, start)?;
                }
                Ok(())
            }
            FuncReloc::Resolved(_) => Err(CompileError::InvalidModule(format!(
                "function {funcnum} emitted twice"
            ))),
        }
    }

    /// All call sites must be resolved once every function has been emitted.
    pub(crate) fn verify_relocations(&self) -> Result<(), CompileError> {
        for (funcnum, reloc) in self.function_relocations.iter().enumerate() {
            if let FuncReloc::Pending(holes) = reloc
                && !holes.is_empty()
            {
                return Err(CompileError::UnresolvedFunction(funcnum as u32));
            }
        }
        Ok(())
    }

    // ---------------- fixed artifacts ----------------

    /// The four 16-byte trap handler stubs, emitted once before everything
    /// else so every later artifact can branch to them.
    pub(crate) fn emit_trap_stubs(&mut self) -> Result<(), CompileError> {
        let size = 4 * ERROR_HANDLER_SIZE;
        self.code_start = self.region.alloc(size)?;
        self.code_end = self.code_start + size;
        self.pos = self.code_start;
        self.fpe_handler = self.emit_error_handler(self.hooks.on_fp_error)?;
        self.indirect_range_handler =
            self.emit_error_handler(self.hooks.on_call_indirect_range)?;
        self.indirect_type_handler = self.emit_error_handler(self.hooks.on_call_indirect_type)?;
        self.stack_overflow_handler = self.emit_error_handler(self.hooks.on_stack_overflow)?;
        debug_assert_eq!(self.pos, self.code_end);
        Ok(())
    }

    /// Aligns the stack, loads the native error routine and calls it. The
    /// routine longjmps to the embedder's sentinel and never returns.
    fn emit_error_handler(&mut self, handler: usize) -> Result<usize, CompileError> {
        let start = self.pos;
        // and rsp, -16
        self.emit_bytes(&[0x48, 0x83, 0xe4, 0xf0])?;
        // movabs rax, handler
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(handler)?;
        // call rax
        self.emit_bytes(&[0xff, 0xd0])?;
        Ok(start)
    }

    /// One 40-byte trampoline per imported function. The trampoline saves the
    /// context and memory-base registers, points rsi at the arguments on the
    /// operand stack, re-aligns to 16 bytes and calls the C dispatcher.
    pub(crate) fn emit_host_trampolines(&mut self) -> Result<(), CompileError> {
        let count = self.module.get_imported_functions_size();
        let size = HOST_TRAMPOLINE_SIZE * count as usize;
        self.code_start = self.region.alloc(size)?;
        self.code_end = self.code_start + size;
        self.pos = self.code_start;
        for index in 0..count {
            let start = self.pos;
            self.start_function(start, index)?;
            self.emit_host_call(index)?;
            debug_assert_eq!(self.pos, start + HOST_TRAMPOLINE_SIZE);
        }
        debug_assert_eq!(self.pos, self.code_end);
        Ok(())
    }

    fn emit_host_call(&mut self, funcnum: u32) -> Result<(), CompileError> {
        // mov edx, funcnum
        self.emit_bytes(&[0xba])?;
        self.emit_u32(funcnum)?;
        // push rdi
        self.emit_bytes(&[0x57])?;
        // push rsi
        self.emit_bytes(&[0x56])?;
        // lea rsi, [rsp+24] ; skip saved rsi/rdi and the return address
        self.emit_bytes(&[0x48, 0x8d, 0x74, 0x24, 0x18])?;
        self.emit_align_stack()?;
        // movabs rax, host_dispatch
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(self.hooks.host_dispatch)?;
        // call rax
        self.emit_bytes(&[0xff, 0xd0])?;
        self.emit_restore_stack()?;
        // pop rsi
        self.emit_bytes(&[0x5e])?;
        // pop rdi
        self.emit_bytes(&[0x5f])?;
        // ret
        self.emit_bytes(&[0xc3])
    }

    fn emit_align_stack(&mut self) -> Result<(), CompileError> {
        // mov rcx, rsp ; and rsp, -16 ; push rcx ; push rcx
        self.emit_bytes(&[0x48, 0x89, 0xe1])?;
        self.emit_bytes(&[0x48, 0x83, 0xe4, 0xf0])?;
        self.emit_bytes(&[0x51])?;
        self.emit_bytes(&[0x51])
    }

    fn emit_restore_stack(&mut self) -> Result<(), CompileError> {
        // mov rsp, [rsp]
        self.emit_bytes(&[0x48, 0x8b, 0x24, 0x24])
    }

    /// One fixed-size slot per table entry so `call_indirect` can index the
    /// table by `base + 17·i`. Valid entries check the canonical type id in
    /// edx and jump to the callee; absent entries jump to the range trap.
    pub(crate) fn emit_jump_table(&mut self) -> Result<(), CompileError> {
        const {
            // the stride is an imul imm8 operand
            assert!(TABLE_ELEMENT_SIZE <= 127);
        }
        let Some(table) = &self.module.table else {
            self.jmp_table = self.pos;
            return Ok(());
        };
        let size = TABLE_ELEMENT_SIZE * table.len();
        self.code_start = self.region.alloc(size)?;
        self.code_end = self.code_start + size;
        self.pos = self.code_start;
        self.jmp_table = self.code_start;
        for entry in table {
            let slot_start = self.pos;
            match entry {
                Some(fn_idx) => {
                    // cmp edx, canonical type id of the callee
                    self.emit_bytes(&[0x81, 0xfa])?;
                    self.emit_u32(self.module.fast_functions[*fn_idx as usize])?;
                    // je callee
                    self.emit_bytes(&[0x0f, 0x84])?;
                    let hole = self.emit_branch_target32()?;
                    self.register_call(hole, *fn_idx)?;
                    // jmp type-mismatch trap
                    self.emit_bytes(&[0xe9])?;
                    let hole = self.emit_branch_target32()?;
                    self.fix_branch(hole, self.indirect_type_handler)?;
                }
                None => {
                    // jmp out-of-range trap
                    self.emit_bytes(&[0xe9])?;
                    let hole = self.emit_branch_target32()?;
                    self.fix_branch(hole, self.indirect_range_handler)?;
                    // trap-byte fill keeps the 17-byte stride
                    self.emit_bytes(&[0xcc; 12])?;
                }
            }
            debug_assert_eq!(self.pos, slot_start + TABLE_ELEMENT_SIZE);
        }
        debug_assert_eq!(self.pos, self.code_end);
        Ok(())
    }

    /// The module's native entry stub:
    /// `(ctx, memory_base, args_ptr, argc, callee) -> u64` in the platform
    /// C ABI. It seeds the depth budget, pushes the arguments left-to-right
    /// so param 0 lands deepest, calls the callee and drops the arguments.
    pub(crate) fn emit_invoke_stub(&mut self) -> Result<(), CompileError> {
        self.code_start = self.region.alloc(INVOKE_STUB_SIZE)?;
        self.code_end = self.code_start + INVOKE_STUB_SIZE;
        self.pos = self.code_start;
        self.invoke_stub = self.code_start;
        // push rbp ; mov rbp, rsp
        self.emit_bytes(&[0x55])?;
        self.emit_bytes(&[0x48, 0x89, 0xe5])?;
        // push rbx ; push r13
        self.emit_bytes(&[0x53])?;
        self.emit_bytes(&[0x41, 0x55])?;
        // mov rbx, [rdi + depth-budget offset]
        self.emit_bytes(&[0x48, 0x8b, 0x9f])?;
        self.emit_u32(self.hooks.ctx_depth_offset)?;
        // mov r13, rcx ; argc survives the call for the stack cleanup
        self.emit_bytes(&[0x49, 0x89, 0xcd])?;
        // test rcx, rcx ; jz CALL
        self.emit_bytes(&[0x48, 0x85, 0xc9])?;
        self.emit_bytes(&[0x0f, 0x84])?;
        let no_args = self.emit_branch_target32()?;
        // mov rax, rdx
        self.emit_bytes(&[0x48, 0x89, 0xd0])?;
        let loop_top = self.pos;
        // push qword [rax] ; add rax, 8 ; dec rcx ; jnz loop
        self.emit_bytes(&[0xff, 0x30])?;
        self.emit_bytes(&[0x48, 0x83, 0xc0, 0x08])?;
        self.emit_bytes(&[0x48, 0xff, 0xc9])?;
        self.emit_bytes(&[0x0f, 0x85])?;
        let back = self.emit_branch_target32()?;
        self.fix_branch(back, loop_top)?;
        let call_site = self.pos;
        self.fix_branch(no_args, call_site)?;
        // call r8
        self.emit_bytes(&[0x41, 0xff, 0xd0])?;
        // lea rsp, [rsp + r13*8] ; drop the pushed arguments
        self.emit_bytes(&[0x4a, 0x8d, 0x24, 0xec])?;
        // pop r13 ; pop rbx ; pop rbp ; ret
        self.emit_bytes(&[0x41, 0x5d])?;
        self.emit_bytes(&[0x5b])?;
        self.emit_bytes(&[0x5d])?;
        self.emit_bytes(&[0xc3])?;
        let unused = self.code_end - self.pos;
        self.region.reclaim(unused);
        self.code_end = self.pos;
        Ok(())
    }

    // ---------------- function framing ----------------

    /// Reserve the function's worst-case slab, resolve pending call sites
    /// pointing at it, and emit the prologue (frame setup plus
    /// zero-initialization of the declared locals).
    pub(crate) fn begin_function(&mut self, funcnum: u32) -> Result<usize, CompileError> {
        let body = self.module.body(funcnum);
        let reservation = function_reservation(body);
        self.code_start = self.region.alloc(reservation)?;
        self.code_end = self.code_start + reservation;
        self.pos = self.code_start;
        self.start_function(self.code_start, funcnum)?;

        let ty = self.module.func_type(funcnum);
        self.param_count = ty.param_count();
        self.returns_value = ty.result.is_some();
        let local_count = body.local_count();
        if local_count > 0x0FFF_FFFF {
            return Err(CompileError::TooManyLocals(local_count));
        }
        self.local_count = local_count as u32;

        let prologue_start = self.pos;
        // push rbp ; mov rbp, rsp
        self.emit_bytes(&[0x55])?;
        self.emit_bytes(&[0x48, 0x89, 0xe5])?;
        if self.local_count > 0 {
            // xor rax, rax
            self.emit_bytes(&[0x48, 0x31, 0xc0])?;
            if self.local_count > 14 {
                // a loop saves space once unrolled pushes stop paying off
                // mov ecx, local_count
                self.emit_bytes(&[0xb9])?;
                self.emit_u32(self.local_count)?;
                let loop_top = self.pos;
                // push rax ; dec ecx ; jnz loop
                self.emit_bytes(&[0x50])?;
                self.emit_bytes(&[0xff, 0xc9])?;
                self.emit_bytes(&[0x0f, 0x85])?;
                let back = self.emit_branch_target32()?;
                self.fix_branch(back, loop_top)?;
            } else {
                for _ in 0..self.local_count {
                    // push rax
                    self.emit_bytes(&[0x50])?;
                }
            }
        }
        debug_assert!(self.pos <= prologue_start + MAX_PROLOGUE_SIZE);
        Ok(self.code_start)
    }

    /// Pop the return value (if any) into rax, discard the locals, restore
    /// the caller frame and return. Emitted at the function's final `end`.
    pub(crate) fn emit_epilogue(&mut self) -> Result<(), CompileError> {
        let epilogue_start = self.pos;
        if self.returns_value {
            // pop rax
            self.emit_bytes(&[0x58])?;
        }
        self.emit_multipop(self.local_count)?;
        // pop rbp ; ret
        self.emit_bytes(&[0x5d])?;
        self.emit_bytes(&[0xc3])?;
        debug_assert!(self.pos <= epilogue_start + MAX_EPILOGUE_SIZE);
        Ok(())
    }

    /// Return the unused tail of the function's reservation to the region.
    pub(crate) fn finish_function(&mut self) {
        let unused = self.code_end - self.pos;
        self.region.reclaim(unused);
        self.code_end = self.pos;
    }

    /// Discard `count & !PRESERVE_TOP` operand slots; with the flag set the
    /// top slot's value survives the adjustment.
    fn emit_multipop(&mut self, count: u32) -> Result<(), CompileError> {
        if count == 0 || count == PRESERVE_TOP | 1 {
            return Ok(());
        }
        debug_assert_eq!(count & 0x7000_0000, 0);
        if count & PRESERVE_TOP != 0 {
            // mov rax, [rsp]
            self.emit_bytes(&[0x48, 0x8b, 0x04, 0x24])?;
        }
        // add rsp, 8 * slot count
        self.emit_bytes(&[0x48, 0x81, 0xc4])?;
        self.emit_u32((count & !PRESERVE_TOP).wrapping_mul(8))?;
        if count & PRESERVE_TOP != 0 {
            // push rax
            self.emit_bytes(&[0x50])?;
        }
        Ok(())
    }

    // ---------------- control flow ----------------

    pub(crate) fn emit_unreachable(&mut self) -> Result<(), CompileError> {
        self.emit_error_handler(self.hooks.on_unreachable)?;
        Ok(())
    }

    pub(crate) fn emit_nop(&mut self) -> Result<(), CompileError> {
        Ok(())
    }

    /// `if` pops the condition and branches to the else/end hole when zero.
    pub(crate) fn emit_if(&mut self) -> Result<usize, CompileError> {
        // pop rax ; test eax, eax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        // jz hole
        self.emit_bytes(&[0x0f, 0x84])?;
        self.emit_branch_target32()
    }

    /// End the then-arm with a jump to `end`, then land the `if` hole here.
    pub(crate) fn emit_else(&mut self, if_hole: usize) -> Result<usize, CompileError> {
        let end_hole = self.emit_br(0)?;
        self.fix_branch(if_hole, self.pos)?;
        Ok(end_hole)
    }

    pub(crate) fn emit_br(&mut self, depth_change: u32) -> Result<usize, CompileError> {
        self.emit_multipop(depth_change)?;
        // jmp hole
        self.emit_bytes(&[0xe9])?;
        self.emit_branch_target32()
    }

    pub(crate) fn emit_br_if(&mut self, depth_change: u32) -> Result<usize, CompileError> {
        // pop rax ; test eax, eax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        if depth_change == 0 || depth_change == PRESERVE_TOP | 1 {
            // jnz hole
            self.emit_bytes(&[0x0f, 0x85])?;
            self.emit_branch_target32()
        } else {
            // jz SKIP
            self.emit_bytes(&[0x0f, 0x84])?;
            let skip = self.emit_branch_target32()?;
            self.emit_multipop(depth_change)?;
            // jmp hole
            self.emit_bytes(&[0xe9])?;
            let hole = self.emit_branch_target32()?;
            self.fix_branch(skip, self.pos)?;
            Ok(hole)
        }
    }

    /// Pop the dispatch index and open a balanced binary search over
    /// `table_size + 1` contiguous index ranges (the extra one is the
    /// default, which the shared case path handles with no special code).
    pub(crate) fn emit_br_table(&mut self, table_size: u32) -> Result<BrTableState, CompileError> {
        // pop rax
        self.emit_bytes(&[0x58])?;
        Ok(BrTableState {
            stack: vec![BrTableRange {
                min: 0,
                max: table_size + 1,
                hole: None,
            }],
        })
    }

    /// Emit the search path down to the next leaf and that leaf's tail
    /// (stack adjustment plus jump). Returns the branch hole for the case's
    /// label. Ranges are kept contiguous with the lowest values at the back
    /// of the work stack, so the emitted code needs no tree back-patching.
    pub(crate) fn emit_br_table_case(
        &mut self,
        state: &mut BrTableState,
        depth_change: u32,
    ) -> Result<usize, CompileError> {
        loop {
            let item = state
                .stack
                .pop()
                .ok_or_else(|| CompileError::InvalidModule("br_table case overflow".into()))?;
            if let Some(hole) = item.hole {
                self.fix_branch(hole, self.pos)?;
            }
            if item.max - item.min > 1 {
                let mid = item.min + (item.max - item.min) / 2;
                // cmp eax, mid
                self.emit_bytes(&[0x3d])?;
                self.emit_u32(mid)?;
                // jae upper half
                self.emit_bytes(&[0x0f, 0x83])?;
                let upper = self.emit_branch_target32()?;
                state.stack.push(BrTableRange {
                    min: mid,
                    max: item.max,
                    hole: Some(upper),
                });
                state.stack.push(BrTableRange {
                    min: item.min,
                    max: mid,
                    hole: None,
                });
                continue;
            }
            return if depth_change == 0 || depth_change == PRESERVE_TOP | 1 {
                match item.hole {
                    // the pending jae can jump straight to the label
                    Some(hole) => Ok(hole),
                    None => {
                        // jmp hole
                        self.emit_bytes(&[0xe9])?;
                        self.emit_branch_target32()
                    }
                }
            } else {
                self.emit_multipop(depth_change)?;
                // jmp hole
                self.emit_bytes(&[0xe9])?;
                self.emit_branch_target32()
            };
        }
    }

    pub(crate) fn emit_br_table_default(
        &mut self,
        state: &mut BrTableState,
        depth_change: u32,
    ) -> Result<usize, CompileError> {
        let hole = self.emit_br_table_case(state, depth_change)?;
        if !state.stack.is_empty() {
            return Err(CompileError::InvalidModule(
                "br_table ranges left after default".into(),
            ));
        }
        Ok(hole)
    }

    /// `return` is a branch to the outermost label.
    pub(crate) fn emit_return(&mut self, depth_change: u32) -> Result<usize, CompileError> {
        self.emit_br(depth_change)
    }

    pub(crate) fn emit_call(&mut self, funcnum: u32) -> Result<(), CompileError> {
        let ty = self.module.func_type(funcnum);
        let params = ty.param_count();
        let returns = ty.result.is_some();
        self.emit_check_call_depth()?;
        // call hole
        self.emit_bytes(&[0xe8])?;
        let hole = self.emit_branch_target32()?;
        self.register_call(hole, funcnum)?;
        self.emit_multipop(params)?;
        if returns {
            // push rax
            self.emit_bytes(&[0x50])?;
        }
        self.emit_check_call_depth_end()
    }

    pub(crate) fn emit_call_indirect(&mut self, type_index: u32) -> Result<(), CompileError> {
        let table_size = self
            .module
            .table
            .as_ref()
            .map(|table| table.len() as u32)
            .ok_or_else(|| CompileError::InvalidModule("call_indirect without a table".into()))?;
        let canonical = self.module.type_aliases[type_index as usize];
        let ty = &self.module.types[type_index as usize];
        let params = ty.param_count();
        let returns = ty.result.is_some();
        self.emit_check_call_depth()?;
        // pop rax ; the dynamic table index
        self.emit_bytes(&[0x58])?;
        // cmp rax, table_size
        self.emit_bytes(&[0x48, 0x3d])?;
        self.emit_u32(table_size)?;
        // jae out-of-range trap
        self.emit_bytes(&[0x0f, 0x83])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.indirect_range_handler)?;
        // lea rdx, [rip + jump table]
        self.emit_bytes(&[0x48, 0x8d, 0x15])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.jmp_table)?;
        // imul eax, eax, stride
        self.emit_bytes(&[0x6b, 0xc0, TABLE_ELEMENT_SIZE as u8])?;
        // add rax, rdx
        self.emit_bytes(&[0x48, 0x01, 0xd0])?;
        // mov edx, expected canonical type id
        self.emit_bytes(&[0xba])?;
        self.emit_u32(canonical)?;
        // call rax ; through the table slot
        self.emit_bytes(&[0xff, 0xd0])?;
        self.emit_multipop(params)?;
        if returns {
            // push rax
            self.emit_bytes(&[0x50])?;
        }
        self.emit_check_call_depth_end()
    }

    fn emit_check_call_depth(&mut self) -> Result<(), CompileError> {
        // dec ebx ; jz stack-overflow trap
        self.emit_bytes(&[0xff, 0xcb])?;
        self.emit_bytes(&[0x0f, 0x84])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.stack_overflow_handler)
    }

    fn emit_check_call_depth_end(&mut self) -> Result<(), CompileError> {
        // inc ebx
        self.emit_bytes(&[0xff, 0xc3])
    }

    // ---------------- parametric ----------------

    pub(crate) fn emit_drop(&mut self) -> Result<(), CompileError> {
        // pop rax
        self.emit_bytes(&[0x58])
    }

    pub(crate) fn emit_select(&mut self) -> Result<(), CompileError> {
        // pop rax ; condition
        self.emit_bytes(&[0x58])?;
        // pop rcx ; value kept when the condition is zero
        self.emit_bytes(&[0x59])?;
        // test eax, eax
        self.emit_bytes(&[0x85, 0xc0])?;
        // cmovnz rcx, [rsp]
        self.emit_bytes(&[0x48, 0x0f, 0x45, 0x0c, 0x24])?;
        // mov [rsp], rcx
        self.emit_bytes(&[0x48, 0x89, 0x0c, 0x24])
    }

    // ---------------- locals and globals ----------------

    fn local_displacement(&self, local_idx: u32) -> u32 {
        if local_idx < self.param_count {
            // params sit above the return address and saved frame pointer
            (8 * (self.param_count - local_idx + 1)) as u32
        } else {
            (-8i32 * (local_idx - self.param_count + 1) as i32) as u32
        }
    }

    pub(crate) fn emit_get_local(&mut self, local_idx: u32) -> Result<(), CompileError> {
        // mov rax, [rbp + disp32]
        self.emit_bytes(&[0x48, 0x8b, 0x85])?;
        self.emit_u32(self.local_displacement(local_idx))?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_set_local(&mut self, local_idx: u32) -> Result<(), CompileError> {
        // pop rax
        self.emit_bytes(&[0x58])?;
        // mov [rbp + disp32], rax
        self.emit_bytes(&[0x48, 0x89, 0x85])?;
        self.emit_u32(self.local_displacement(local_idx))
    }

    pub(crate) fn emit_tee_local(&mut self, local_idx: u32) -> Result<(), CompileError> {
        // pop rax ; push rax ; peek semantics
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x50])?;
        // mov [rbp + disp32], rax
        self.emit_bytes(&[0x48, 0x89, 0x85])?;
        self.emit_u32(self.local_displacement(local_idx))
    }

    pub(crate) fn emit_get_global(&mut self, global_idx: u32) -> Result<(), CompileError> {
        let cell = self.global_cells[global_idx as usize];
        let ty = self.module.globals[global_idx as usize].ty;
        // movabs rax, cell
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(cell)?;
        match ty {
            ValueType::I32 | ValueType::F32 => {
                // mov eax, [rax] ; zero-extends into the slot
                self.emit_bytes(&[0x8b, 0x00])?;
            }
            ValueType::I64 | ValueType::F64 => {
                // mov rax, [rax]
                self.emit_bytes(&[0x48, 0x8b, 0x00])?;
            }
        }
        // push rax
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_set_global(&mut self, global_idx: u32) -> Result<(), CompileError> {
        let cell = self.global_cells[global_idx as usize];
        // pop rcx
        self.emit_bytes(&[0x59])?;
        // movabs rax, cell
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(cell)?;
        // mov [rax], rcx ; i32/f32 slots are already zero-extended
        self.emit_bytes(&[0x48, 0x89, 0x08])
    }

    // ---------------- memory ----------------

    /// `effective = memory_base + i32 index + static offset`. A static
    /// offset with the high bit set cannot ride the sign-extending `add
    /// rax, imm32`, so it takes the zero-extended register path instead.
    fn emit_load_impl(&mut self, offset: u32, loadop: &[u8]) -> Result<(), CompileError> {
        // pop rax ; the i32 index, upper half already zero
        self.emit_bytes(&[0x58])?;
        if offset & 0x8000_0000 != 0 {
            // mov ecx, offset ; add rax, rcx
            self.emit_bytes(&[0xb9])?;
            self.emit_u32(offset)?;
            self.emit_bytes(&[0x48, 0x01, 0xc8])?;
        } else if offset != 0 {
            // add rax, offset
            self.emit_bytes(&[0x48, 0x05])?;
            self.emit_u32(offset)?;
        }
        // add rax, rsi ; memory base
        self.emit_bytes(&[0x48, 0x01, 0xf0])?;
        self.emit_bytes(loadop)?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    fn emit_store_impl(&mut self, offset: u32, storeop: &[u8]) -> Result<(), CompileError> {
        // pop rcx ; the value
        self.emit_bytes(&[0x59])?;
        // pop rax ; the i32 index
        self.emit_bytes(&[0x58])?;
        if offset & 0x8000_0000 != 0 {
            // mov edx, offset ; add rax, rdx
            self.emit_bytes(&[0xba])?;
            self.emit_u32(offset)?;
            self.emit_bytes(&[0x48, 0x01, 0xd0])?;
        } else if offset != 0 {
            // add rax, offset
            self.emit_bytes(&[0x48, 0x05])?;
            self.emit_u32(offset)?;
        }
        // add rax, rsi ; memory base
        self.emit_bytes(&[0x48, 0x01, 0xf0])?;
        self.emit_bytes(storeop)
    }

    pub(crate) fn emit_i32_load(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov eax, [rax]
        self.emit_load_impl(offset, &[0x8b, 0x00])
    }

    pub(crate) fn emit_i64_load(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov rax, [rax]
        self.emit_load_impl(offset, &[0x48, 0x8b, 0x00])
    }

    pub(crate) fn emit_f32_load(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov eax, [rax]
        self.emit_load_impl(offset, &[0x8b, 0x00])
    }

    pub(crate) fn emit_f64_load(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov rax, [rax]
        self.emit_load_impl(offset, &[0x48, 0x8b, 0x00])
    }

    pub(crate) fn emit_i32_load8_s(&mut self, offset: u32) -> Result<(), CompileError> {
        // movsx eax, byte [rax]
        self.emit_load_impl(offset, &[0x0f, 0xbe, 0x00])
    }

    pub(crate) fn emit_i32_load8_u(&mut self, offset: u32) -> Result<(), CompileError> {
        // movzx eax, byte [rax]
        self.emit_load_impl(offset, &[0x0f, 0xb6, 0x00])
    }

    pub(crate) fn emit_i32_load16_s(&mut self, offset: u32) -> Result<(), CompileError> {
        // movsx eax, word [rax]
        self.emit_load_impl(offset, &[0x0f, 0xbf, 0x00])
    }

    pub(crate) fn emit_i32_load16_u(&mut self, offset: u32) -> Result<(), CompileError> {
        // movzx eax, word [rax]
        self.emit_load_impl(offset, &[0x0f, 0xb7, 0x00])
    }

    pub(crate) fn emit_i64_load8_s(&mut self, offset: u32) -> Result<(), CompileError> {
        // movsx rax, byte [rax]
        self.emit_load_impl(offset, &[0x48, 0x0f, 0xbe, 0x00])
    }

    pub(crate) fn emit_i64_load8_u(&mut self, offset: u32) -> Result<(), CompileError> {
        // movzx eax, byte [rax]
        self.emit_load_impl(offset, &[0x0f, 0xb6, 0x00])
    }

    pub(crate) fn emit_i64_load16_s(&mut self, offset: u32) -> Result<(), CompileError> {
        // movsx rax, word [rax]
        self.emit_load_impl(offset, &[0x48, 0x0f, 0xbf, 0x00])
    }

    pub(crate) fn emit_i64_load16_u(&mut self, offset: u32) -> Result<(), CompileError> {
        // movzx eax, word [rax]
        self.emit_load_impl(offset, &[0x0f, 0xb7, 0x00])
    }

    pub(crate) fn emit_i64_load32_s(&mut self, offset: u32) -> Result<(), CompileError> {
        // movsxd rax, dword [rax]
        self.emit_load_impl(offset, &[0x48, 0x63, 0x00])
    }

    pub(crate) fn emit_i64_load32_u(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov eax, [rax]
        self.emit_load_impl(offset, &[0x8b, 0x00])
    }

    pub(crate) fn emit_i32_store(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], ecx
        self.emit_store_impl(offset, &[0x89, 0x08])
    }

    pub(crate) fn emit_i64_store(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], rcx
        self.emit_store_impl(offset, &[0x48, 0x89, 0x08])
    }

    pub(crate) fn emit_f32_store(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], ecx
        self.emit_store_impl(offset, &[0x89, 0x08])
    }

    pub(crate) fn emit_f64_store(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], rcx
        self.emit_store_impl(offset, &[0x48, 0x89, 0x08])
    }

    pub(crate) fn emit_i32_store8(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], cl
        self.emit_store_impl(offset, &[0x88, 0x08])
    }

    pub(crate) fn emit_i32_store16(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], cx
        self.emit_store_impl(offset, &[0x66, 0x89, 0x08])
    }

    pub(crate) fn emit_i64_store8(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], cl
        self.emit_store_impl(offset, &[0x88, 0x08])
    }

    pub(crate) fn emit_i64_store16(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], cx
        self.emit_store_impl(offset, &[0x66, 0x89, 0x08])
    }

    pub(crate) fn emit_i64_store32(&mut self, offset: u32) -> Result<(), CompileError> {
        // mov [rax], ecx
        self.emit_store_impl(offset, &[0x89, 0x08])
    }

    pub(crate) fn emit_current_memory(&mut self) -> Result<(), CompileError> {
        // push rdi ; push rsi
        self.emit_bytes(&[0x57])?;
        self.emit_bytes(&[0x56])?;
        self.emit_align_stack()?;
        // movabs rax, current_memory
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(self.hooks.current_memory)?;
        // call rax
        self.emit_bytes(&[0xff, 0xd0])?;
        self.emit_restore_stack()?;
        // pop rsi ; pop rdi
        self.emit_bytes(&[0x5e])?;
        self.emit_bytes(&[0x5f])?;
        // mov eax, eax ; the page count is an i32, keep the slot zero-extended
        self.emit_bytes(&[0x89, 0xc0])?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_grow_memory(&mut self) -> Result<(), CompileError> {
        // pop rax ; requested page delta
        self.emit_bytes(&[0x58])?;
        // push rdi ; push rsi
        self.emit_bytes(&[0x57])?;
        self.emit_bytes(&[0x56])?;
        // mov rsi, rax ; second platform argument
        self.emit_bytes(&[0x48, 0x89, 0xc6])?;
        self.emit_align_stack()?;
        // movabs rax, grow_memory
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_ptr(self.hooks.grow_memory)?;
        // call rax
        self.emit_bytes(&[0xff, 0xd0])?;
        self.emit_restore_stack()?;
        // pop rsi ; pop rdi
        self.emit_bytes(&[0x5e])?;
        self.emit_bytes(&[0x5f])?;
        // mov eax, eax ; grow returns an i32, keep the slot zero-extended
        self.emit_bytes(&[0x89, 0xc0])?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    // ---------------- constants ----------------

    pub(crate) fn emit_i32_const(&mut self, value: u32) -> Result<(), CompileError> {
        // mov eax, value ; zero-extends
        self.emit_bytes(&[0xb8])?;
        self.emit_u32(value)?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_i64_const(&mut self, value: u64) -> Result<(), CompileError> {
        // movabs rax, value
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_u64(value)?;
        // push rax
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_f32_const(&mut self, value: f32) -> Result<(), CompileError> {
        self.emit_i32_const(value.to_bits())
    }

    pub(crate) fn emit_f64_const(&mut self, value: f64) -> Result<(), CompileError> {
        self.emit_i64_const(value.to_bits())
    }

    // ---------------- integer comparisons ----------------

    pub(crate) fn emit_i32_eqz(&mut self) -> Result<(), CompileError> {
        // pop rax ; xor rcx, rcx ; test eax, eax ; setz cl ; push rcx
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x48, 0x31, 0xc9])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x94, 0xc1])?;
        self.emit_bytes(&[0x51])
    }

    pub(crate) fn emit_i64_eqz(&mut self) -> Result<(), CompileError> {
        // pop rax ; xor rcx, rcx ; test rax, rax ; setz cl ; push rcx
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x48, 0x31, 0xc9])?;
        self.emit_bytes(&[0x48, 0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x94, 0xc1])?;
        self.emit_bytes(&[0x51])
    }

    /// All i32 relops share one shape: compare the two operands and push a
    /// 0/1 i32 via the given setcc opcode, with no sign extension.
    fn emit_i32_relop(&mut self, setcc: u8) -> Result<(), CompileError> {
        // pop rax ; pop rcx ; xor rdx, rdx
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x48, 0x31, 0xd2])?;
        // cmp ecx, eax
        self.emit_bytes(&[0x39, 0xc1])?;
        // setcc dl
        self.emit_bytes(&[0x0f, setcc, 0xc2])?;
        // push rdx
        self.emit_bytes(&[0x52])
    }

    fn emit_i64_relop(&mut self, setcc: u8) -> Result<(), CompileError> {
        // pop rax ; pop rcx ; xor rdx, rdx
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x48, 0x31, 0xd2])?;
        // cmp rcx, rax
        self.emit_bytes(&[0x48, 0x39, 0xc1])?;
        // setcc dl
        self.emit_bytes(&[0x0f, setcc, 0xc2])?;
        // push rdx
        self.emit_bytes(&[0x52])
    }

    pub(crate) fn emit_i32_eq(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x94)
    }

    pub(crate) fn emit_i32_ne(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x95)
    }

    pub(crate) fn emit_i32_lt_s(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x9c)
    }

    pub(crate) fn emit_i32_lt_u(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x92)
    }

    pub(crate) fn emit_i32_gt_s(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x9f)
    }

    pub(crate) fn emit_i32_gt_u(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x97)
    }

    pub(crate) fn emit_i32_le_s(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x9e)
    }

    pub(crate) fn emit_i32_le_u(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x96)
    }

    pub(crate) fn emit_i32_ge_s(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x9d)
    }

    pub(crate) fn emit_i32_ge_u(&mut self) -> Result<(), CompileError> {
        self.emit_i32_relop(0x93)
    }

    pub(crate) fn emit_i64_eq(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x94)
    }

    pub(crate) fn emit_i64_ne(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x95)
    }

    pub(crate) fn emit_i64_lt_s(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x9c)
    }

    pub(crate) fn emit_i64_lt_u(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x92)
    }

    pub(crate) fn emit_i64_gt_s(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x9f)
    }

    pub(crate) fn emit_i64_gt_u(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x97)
    }

    pub(crate) fn emit_i64_le_s(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x9e)
    }

    pub(crate) fn emit_i64_le_u(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x96)
    }

    pub(crate) fn emit_i64_ge_s(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x9d)
    }

    pub(crate) fn emit_i64_ge_u(&mut self) -> Result<(), CompileError> {
        self.emit_i64_relop(0x93)
    }

    // ---------------- float comparisons ----------------

    /// Ordered compare via cmpss/cmpsd predicates (0 = eq, 1 = lt, 2 = le).
    /// gt/ge switch the operand order; ne is eq with the result inverted
    /// (the inc maps the {-1, 0} mask to {0, 1}).
    fn emit_f32_relop(
        &mut self,
        predicate: u8,
        switch_params: bool,
        flip_result: bool,
    ) -> Result<(), CompileError> {
        if switch_params {
            // movss xmm0, [rsp] ; cmpss xmm0, [rsp+8], predicate
            self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf3, 0x0f, 0xc2, 0x44, 0x24, 0x08, predicate])?;
        } else {
            // movss xmm0, [rsp+8] ; cmpss xmm0, [rsp], predicate
            self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
            self.emit_bytes(&[0xf3, 0x0f, 0xc2, 0x04, 0x24, predicate])?;
        }
        // movd eax, xmm0
        self.emit_bytes(&[0x66, 0x0f, 0x7e, 0xc0])?;
        if flip_result {
            // inc eax
            self.emit_bytes(&[0xff, 0xc0])?;
        } else {
            // and eax, 1
            self.emit_bytes(&[0x83, 0xe0, 0x01])?;
        }
        // lea rsp, [rsp+16] ; push rax
        self.emit_bytes(&[0x48, 0x8d, 0x64, 0x24, 0x10])?;
        self.emit_bytes(&[0x50])
    }

    fn emit_f64_relop(
        &mut self,
        predicate: u8,
        switch_params: bool,
        flip_result: bool,
    ) -> Result<(), CompileError> {
        if switch_params {
            // movsd xmm0, [rsp] ; cmpsd xmm0, [rsp+8], predicate
            self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf2, 0x0f, 0xc2, 0x44, 0x24, 0x08, predicate])?;
        } else {
            // movsd xmm0, [rsp+8] ; cmpsd xmm0, [rsp], predicate
            self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
            self.emit_bytes(&[0xf2, 0x0f, 0xc2, 0x04, 0x24, predicate])?;
        }
        // movd eax, xmm0
        self.emit_bytes(&[0x66, 0x0f, 0x7e, 0xc0])?;
        if flip_result {
            // inc eax
            self.emit_bytes(&[0xff, 0xc0])?;
        } else {
            // and eax, 1
            self.emit_bytes(&[0x83, 0xe0, 0x01])?;
        }
        // lea rsp, [rsp+16] ; push rax
        self.emit_bytes(&[0x48, 0x8d, 0x64, 0x24, 0x10])?;
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_f32_eq(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x00, false, false)
    }

    pub(crate) fn emit_f32_ne(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x00, false, true)
    }

    pub(crate) fn emit_f32_lt(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x01, false, false)
    }

    pub(crate) fn emit_f32_gt(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x01, true, false)
    }

    pub(crate) fn emit_f32_le(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x02, false, false)
    }

    pub(crate) fn emit_f32_ge(&mut self) -> Result<(), CompileError> {
        self.emit_f32_relop(0x02, true, false)
    }

    pub(crate) fn emit_f64_eq(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x00, false, false)
    }

    pub(crate) fn emit_f64_ne(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x00, false, true)
    }

    pub(crate) fn emit_f64_lt(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x01, false, false)
    }

    pub(crate) fn emit_f64_gt(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x01, true, false)
    }

    pub(crate) fn emit_f64_le(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x02, false, false)
    }

    pub(crate) fn emit_f64_ge(&mut self) -> Result<(), CompileError> {
        self.emit_f64_relop(0x02, true, false)
    }

    // ---------------- integer arithmetic ----------------

    /// rhs lands in rcx, lhs in rax; the tail bytes include the result push.
    fn emit_i32_binop(&mut self, op: &[u8]) -> Result<(), CompileError> {
        // pop rcx ; pop rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(op)
    }

    fn emit_i64_binop(&mut self, op: &[u8]) -> Result<(), CompileError> {
        // pop rcx ; pop rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(op)
    }

    pub(crate) fn emit_i32_add(&mut self) -> Result<(), CompileError> {
        // add eax, ecx ; push rax
        self.emit_i32_binop(&[0x01, 0xc8, 0x50])
    }

    pub(crate) fn emit_i32_sub(&mut self) -> Result<(), CompileError> {
        // sub eax, ecx ; push rax
        self.emit_i32_binop(&[0x29, 0xc8, 0x50])
    }

    pub(crate) fn emit_i32_mul(&mut self) -> Result<(), CompileError> {
        // imul eax, ecx ; push rax
        self.emit_i32_binop(&[0x0f, 0xaf, 0xc1, 0x50])
    }

    /// `div_s` relies on the CPU #DE for both divide-by-zero and
    /// INT_MIN / -1; the signal handler turns it into the integer trap.
    pub(crate) fn emit_i32_div_s(&mut self) -> Result<(), CompileError> {
        // cdq ; idiv ecx ; push rax
        self.emit_i32_binop(&[0x99, 0xf7, 0xf9, 0x50])
    }

    pub(crate) fn emit_i32_div_u(&mut self) -> Result<(), CompileError> {
        // xor edx, edx ; div ecx ; push rax
        self.emit_i32_binop(&[0x31, 0xd2, 0xf7, 0xf1, 0x50])
    }

    /// `rem_s` must return 0 for INT_MIN % -1 instead of trapping, so the
    /// divisor is checked for -1 and the idiv skipped on that path.
    pub(crate) fn emit_i32_rem_s(&mut self) -> Result<(), CompileError> {
        // pop rcx ; pop rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x58])?;
        // cmp ecx, -1
        self.emit_bytes(&[0x83, 0xf9, 0xff])?;
        // je MINUS1
        self.emit_bytes(&[0x0f, 0x84])?;
        let minus1 = self.emit_branch_target32()?;
        // cdq ; idiv ecx
        self.emit_bytes(&[0x99])?;
        self.emit_bytes(&[0xf7, 0xf9])?;
        // jmp END
        self.emit_bytes(&[0xe9])?;
        let end = self.emit_branch_target32()?;
        self.fix_branch(minus1, self.pos)?;
        // xor edx, edx
        self.emit_bytes(&[0x31, 0xd2])?;
        self.fix_branch(end, self.pos)?;
        // push rdx
        self.emit_bytes(&[0x52])
    }

    pub(crate) fn emit_i32_rem_u(&mut self) -> Result<(), CompileError> {
        // xor edx, edx ; div ecx ; push rdx
        self.emit_i32_binop(&[0x31, 0xd2, 0xf7, 0xf1, 0x52])
    }

    pub(crate) fn emit_i32_and(&mut self) -> Result<(), CompileError> {
        // and eax, ecx ; push rax
        self.emit_i32_binop(&[0x21, 0xc8, 0x50])
    }

    pub(crate) fn emit_i32_or(&mut self) -> Result<(), CompileError> {
        // or eax, ecx ; push rax
        self.emit_i32_binop(&[0x09, 0xc8, 0x50])
    }

    pub(crate) fn emit_i32_xor(&mut self) -> Result<(), CompileError> {
        // xor eax, ecx ; push rax
        self.emit_i32_binop(&[0x31, 0xc8, 0x50])
    }

    pub(crate) fn emit_i32_shl(&mut self) -> Result<(), CompileError> {
        // shl eax, cl ; push rax
        self.emit_i32_binop(&[0xd3, 0xe0, 0x50])
    }

    pub(crate) fn emit_i32_shr_s(&mut self) -> Result<(), CompileError> {
        // sar eax, cl ; push rax
        self.emit_i32_binop(&[0xd3, 0xf8, 0x50])
    }

    pub(crate) fn emit_i32_shr_u(&mut self) -> Result<(), CompileError> {
        // shr eax, cl ; push rax
        self.emit_i32_binop(&[0xd3, 0xe8, 0x50])
    }

    pub(crate) fn emit_i32_rotl(&mut self) -> Result<(), CompileError> {
        // rol eax, cl ; push rax
        self.emit_i32_binop(&[0xd3, 0xc0, 0x50])
    }

    pub(crate) fn emit_i32_rotr(&mut self) -> Result<(), CompileError> {
        // ror eax, cl ; push rax
        self.emit_i32_binop(&[0xd3, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_add(&mut self) -> Result<(), CompileError> {
        // add rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x01, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_sub(&mut self) -> Result<(), CompileError> {
        // sub rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x29, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_mul(&mut self) -> Result<(), CompileError> {
        // imul rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x0f, 0xaf, 0xc1, 0x50])
    }

    pub(crate) fn emit_i64_div_s(&mut self) -> Result<(), CompileError> {
        // cqo ; idiv rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x99, 0x48, 0xf7, 0xf9, 0x50])
    }

    pub(crate) fn emit_i64_div_u(&mut self) -> Result<(), CompileError> {
        // xor rdx, rdx ; div rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x31, 0xd2, 0x48, 0xf7, 0xf1, 0x50])
    }

    pub(crate) fn emit_i64_rem_s(&mut self) -> Result<(), CompileError> {
        // pop rcx ; pop rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x58])?;
        // cmp rcx, -1
        self.emit_bytes(&[0x48, 0x83, 0xf9, 0xff])?;
        // je MINUS1
        self.emit_bytes(&[0x0f, 0x84])?;
        let minus1 = self.emit_branch_target32()?;
        // cqo ; idiv rcx
        self.emit_bytes(&[0x48, 0x99])?;
        self.emit_bytes(&[0x48, 0xf7, 0xf9])?;
        // jmp END
        self.emit_bytes(&[0xe9])?;
        let end = self.emit_branch_target32()?;
        self.fix_branch(minus1, self.pos)?;
        // xor edx, edx
        self.emit_bytes(&[0x31, 0xd2])?;
        self.fix_branch(end, self.pos)?;
        // push rdx
        self.emit_bytes(&[0x52])
    }

    pub(crate) fn emit_i64_rem_u(&mut self) -> Result<(), CompileError> {
        // xor rdx, rdx ; div rcx ; push rdx
        self.emit_i64_binop(&[0x48, 0x31, 0xd2, 0x48, 0xf7, 0xf1, 0x52])
    }

    pub(crate) fn emit_i64_and(&mut self) -> Result<(), CompileError> {
        // and rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x21, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_or(&mut self) -> Result<(), CompileError> {
        // or rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x09, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_xor(&mut self) -> Result<(), CompileError> {
        // xor rax, rcx ; push rax
        self.emit_i64_binop(&[0x48, 0x31, 0xc8, 0x50])
    }

    pub(crate) fn emit_i64_shl(&mut self) -> Result<(), CompileError> {
        // shl rax, cl ; push rax
        self.emit_i64_binop(&[0x48, 0xd3, 0xe0, 0x50])
    }

    pub(crate) fn emit_i64_shr_s(&mut self) -> Result<(), CompileError> {
        // sar rax, cl ; push rax
        self.emit_i64_binop(&[0x48, 0xd3, 0xf8, 0x50])
    }

    pub(crate) fn emit_i64_shr_u(&mut self) -> Result<(), CompileError> {
        // shr rax, cl ; push rax
        self.emit_i64_binop(&[0x48, 0xd3, 0xe8, 0x50])
    }

    pub(crate) fn emit_i64_rotl(&mut self) -> Result<(), CompileError> {
        // rol rax, cl ; push rax
        self.emit_i64_binop(&[0x48, 0xd3, 0xc0, 0x50])
    }

    pub(crate) fn emit_i64_rotr(&mut self) -> Result<(), CompileError> {
        // ror rax, cl ; push rax
        self.emit_i64_binop(&[0x48, 0xd3, 0xc8, 0x50])
    }

    // ---------------- bit counts ----------------

    /// LZCNT/TZCNT when the CPU advertises them, otherwise BSR/BSF with a
    /// conditional move supplying the Wasm-mandated zero-input result.
    pub(crate) fn emit_i32_clz(&mut self) -> Result<(), CompileError> {
        if has_lzcnt_tzcnt() {
            // pop rax ; lzcnt eax, eax ; push rax
            self.emit_bytes(&[0x58])?;
            self.emit_bytes(&[0xf3, 0x0f, 0xbd, 0xc0])?;
            self.emit_bytes(&[0x50])
        } else {
            // pop rax
            self.emit_bytes(&[0x58])?;
            // mov ecx, -1
            self.emit_bytes(&[0xb9, 0xff, 0xff, 0xff, 0xff])?;
            // bsr eax, eax ; cmovz eax, ecx
            self.emit_bytes(&[0x0f, 0xbd, 0xc0])?;
            self.emit_bytes(&[0x0f, 0x44, 0xc1])?;
            // sub eax, 31 ; neg eax
            self.emit_bytes(&[0x83, 0xe8, 0x1f])?;
            self.emit_bytes(&[0xf7, 0xd8])?;
            // push rax
            self.emit_bytes(&[0x50])
        }
    }

    pub(crate) fn emit_i32_ctz(&mut self) -> Result<(), CompileError> {
        if has_lzcnt_tzcnt() {
            // pop rax ; tzcnt eax, eax ; push rax
            self.emit_bytes(&[0x58])?;
            self.emit_bytes(&[0xf3, 0x0f, 0xbc, 0xc0])?;
            self.emit_bytes(&[0x50])
        } else {
            // pop rax
            self.emit_bytes(&[0x58])?;
            // mov ecx, 32
            self.emit_bytes(&[0xb9, 0x20, 0x00, 0x00, 0x00])?;
            // bsf eax, eax ; cmovz eax, ecx
            self.emit_bytes(&[0x0f, 0xbc, 0xc0])?;
            self.emit_bytes(&[0x0f, 0x44, 0xc1])?;
            // push rax
            self.emit_bytes(&[0x50])
        }
    }

    pub(crate) fn emit_i32_popcnt(&mut self) -> Result<(), CompileError> {
        // pop rax ; popcnt eax, eax ; push rax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0xf3, 0x0f, 0xb8, 0xc0])?;
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_i64_clz(&mut self) -> Result<(), CompileError> {
        if has_lzcnt_tzcnt() {
            // pop rax ; lzcnt rax, rax ; push rax
            self.emit_bytes(&[0x58])?;
            self.emit_bytes(&[0xf3, 0x48, 0x0f, 0xbd, 0xc0])?;
            self.emit_bytes(&[0x50])
        } else {
            // pop rax
            self.emit_bytes(&[0x58])?;
            // mov rcx, -1
            self.emit_bytes(&[0x48, 0xc7, 0xc1, 0xff, 0xff, 0xff, 0xff])?;
            // bsr rax, rax ; cmovz rax, rcx
            self.emit_bytes(&[0x48, 0x0f, 0xbd, 0xc0])?;
            self.emit_bytes(&[0x48, 0x0f, 0x44, 0xc1])?;
            // sub rax, 63 ; neg rax
            self.emit_bytes(&[0x48, 0x83, 0xe8, 0x3f])?;
            self.emit_bytes(&[0x48, 0xf7, 0xd8])?;
            // push rax
            self.emit_bytes(&[0x50])
        }
    }

    pub(crate) fn emit_i64_ctz(&mut self) -> Result<(), CompileError> {
        if has_lzcnt_tzcnt() {
            // pop rax ; tzcnt rax, rax ; push rax
            self.emit_bytes(&[0x58])?;
            self.emit_bytes(&[0xf3, 0x48, 0x0f, 0xbc, 0xc0])?;
            self.emit_bytes(&[0x50])
        } else {
            // pop rax
            self.emit_bytes(&[0x58])?;
            // mov rcx, 64
            self.emit_bytes(&[0x48, 0xc7, 0xc1, 0x40, 0x00, 0x00, 0x00])?;
            // bsf rax, rax ; cmovz rax, rcx
            self.emit_bytes(&[0x48, 0x0f, 0xbc, 0xc0])?;
            self.emit_bytes(&[0x48, 0x0f, 0x44, 0xc1])?;
            // push rax
            self.emit_bytes(&[0x50])
        }
    }

    pub(crate) fn emit_i64_popcnt(&mut self) -> Result<(), CompileError> {
        // pop rax ; popcnt rax, rax ; push rax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0xb8, 0xc0])?;
        self.emit_bytes(&[0x50])
    }

    // ---------------- float unary ----------------

    pub(crate) fn emit_f32_abs(&mut self) -> Result<(), CompileError> {
        // pop rax ; and eax, 0x7fffffff ; push rax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x25])?;
        self.emit_u32(0x7fff_ffff)?;
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_f32_neg(&mut self) -> Result<(), CompileError> {
        // pop rax ; xor eax, 0x80000000 ; push rax
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x35])?;
        self.emit_u32(0x8000_0000)?;
        self.emit_bytes(&[0x50])
    }

    fn emit_f32_round(&mut self, mode: u8) -> Result<(), CompileError> {
        // roundss xmm0, [rsp], mode ; movss [rsp], xmm0
        self.emit_bytes(&[0x66, 0x0f, 0x3a, 0x0a, 0x04, 0x24, mode])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_ceil(&mut self) -> Result<(), CompileError> {
        self.emit_f32_round(0x0a)
    }

    pub(crate) fn emit_f32_floor(&mut self) -> Result<(), CompileError> {
        self.emit_f32_round(0x09)
    }

    pub(crate) fn emit_f32_trunc(&mut self) -> Result<(), CompileError> {
        self.emit_f32_round(0x0b)
    }

    pub(crate) fn emit_f32_nearest(&mut self) -> Result<(), CompileError> {
        self.emit_f32_round(0x08)
    }

    pub(crate) fn emit_f32_sqrt(&mut self) -> Result<(), CompileError> {
        // sqrtss xmm0, [rsp] ; movss [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x0f, 0x51, 0x04, 0x24])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_abs(&mut self) -> Result<(), CompileError> {
        // pop rcx ; movabs rax, 0x7fffffffffffffff ; and rax, rcx ; push rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_u64(0x7fff_ffff_ffff_ffff)?;
        self.emit_bytes(&[0x48, 0x21, 0xc8])?;
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_f64_neg(&mut self) -> Result<(), CompileError> {
        // pop rcx ; movabs rax, 0x8000000000000000 ; xor rax, rcx ; push rax
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_u64(0x8000_0000_0000_0000)?;
        self.emit_bytes(&[0x48, 0x31, 0xc8])?;
        self.emit_bytes(&[0x50])
    }

    fn emit_f64_round(&mut self, mode: u8) -> Result<(), CompileError> {
        // roundsd xmm0, [rsp], mode ; movsd [rsp], xmm0
        self.emit_bytes(&[0x66, 0x0f, 0x3a, 0x0b, 0x04, 0x24, mode])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_ceil(&mut self) -> Result<(), CompileError> {
        self.emit_f64_round(0x0a)
    }

    pub(crate) fn emit_f64_floor(&mut self) -> Result<(), CompileError> {
        self.emit_f64_round(0x09)
    }

    pub(crate) fn emit_f64_trunc(&mut self) -> Result<(), CompileError> {
        self.emit_f64_round(0x0b)
    }

    pub(crate) fn emit_f64_nearest(&mut self) -> Result<(), CompileError> {
        self.emit_f64_round(0x08)
    }

    pub(crate) fn emit_f64_sqrt(&mut self) -> Result<(), CompileError> {
        // sqrtsd xmm0, [rsp] ; movsd [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x0f, 0x51, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    // ---------------- float binary ----------------

    fn emit_f32_binop(&mut self, op: u8) -> Result<(), CompileError> {
        // movss xmm0, [rsp+8] ; op xmm0, [rsp]
        self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
        self.emit_bytes(&[0xf3, 0x0f, op, 0x04, 0x24])?;
        // lea rsp, [rsp+8] ; movss [rsp], xmm0
        self.emit_bytes(&[0x48, 0x8d, 0x64, 0x24, 0x08])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    fn emit_f64_binop(&mut self, op: u8) -> Result<(), CompileError> {
        // movsd xmm0, [rsp+8] ; op xmm0, [rsp]
        self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
        self.emit_bytes(&[0xf2, 0x0f, op, 0x04, 0x24])?;
        // lea rsp, [rsp+8] ; movsd [rsp], xmm0
        self.emit_bytes(&[0x48, 0x8d, 0x64, 0x24, 0x08])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_add(&mut self) -> Result<(), CompileError> {
        self.emit_f32_binop(0x58)
    }

    pub(crate) fn emit_f32_sub(&mut self) -> Result<(), CompileError> {
        self.emit_f32_binop(0x5c)
    }

    pub(crate) fn emit_f32_mul(&mut self) -> Result<(), CompileError> {
        self.emit_f32_binop(0x59)
    }

    pub(crate) fn emit_f32_div(&mut self) -> Result<(), CompileError> {
        self.emit_f32_binop(0x5e)
    }

    pub(crate) fn emit_f64_add(&mut self) -> Result<(), CompileError> {
        self.emit_f64_binop(0x58)
    }

    pub(crate) fn emit_f64_sub(&mut self) -> Result<(), CompileError> {
        self.emit_f64_binop(0x5c)
    }

    pub(crate) fn emit_f64_mul(&mut self) -> Result<(), CompileError> {
        self.emit_f64_binop(0x59)
    }

    pub(crate) fn emit_f64_div(&mut self) -> Result<(), CompileError> {
        self.emit_f64_binop(0x5e)
    }

    /// min/max honor both the signed-zero rule and NaN propagation: an
    /// unordered pre-check routes NaN inputs to an add (which propagates and
    /// quiets them), and the SSE min/max runs with whichever operand order
    /// makes the hardware tie-break pick the right zero.
    fn emit_f32_min_max(&mut self, is_min: bool) -> Result<(), CompileError> {
        // movss xmm0, [rsp+8] ; the first operand
        self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
        // ucomiss xmm0, [rsp]
        self.emit_bytes(&[0x0f, 0x2e, 0x04, 0x24])?;
        // jp NAN
        self.emit_bytes(&[0x0f, 0x8a])?;
        let nan = self.emit_branch_target32()?;
        // mov eax, [rsp] ; test eax, eax ; je ZERO
        self.emit_bytes(&[0x8b, 0x04, 0x24])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x84])?;
        let zero = self.emit_branch_target32()?;
        if is_min {
            // minss xmm0, [rsp]
            self.emit_bytes(&[0xf3, 0x0f, 0x5d, 0x04, 0x24])?;
        } else {
            // movss xmm0, [rsp] ; maxss xmm0, [rsp+8]
            self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf3, 0x0f, 0x5f, 0x44, 0x24, 0x08])?;
        }
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done_main = self.emit_branch_target32()?;
        self.fix_branch(zero, self.pos)?;
        if is_min {
            // movss xmm0, [rsp] ; minss xmm0, [rsp+8]
            self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf3, 0x0f, 0x5d, 0x44, 0x24, 0x08])?;
        } else {
            // movss xmm0, [rsp+8] ; maxss xmm0, [rsp]
            self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
            self.emit_bytes(&[0xf3, 0x0f, 0x5f, 0x04, 0x24])?;
        }
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done_zero = self.emit_branch_target32()?;
        self.fix_branch(nan, self.pos)?;
        // addss xmm0, [rsp] ; propagates and quiets the NaN
        self.emit_bytes(&[0xf3, 0x0f, 0x58, 0x04, 0x24])?;
        self.fix_branch(done_main, self.pos)?;
        self.fix_branch(done_zero, self.pos)?;
        // add rsp, 8 ; movss [rsp], xmm0
        self.emit_bytes(&[0x48, 0x83, 0xc4, 0x08])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    fn emit_f64_min_max(&mut self, is_min: bool) -> Result<(), CompileError> {
        // movsd xmm0, [rsp+8]
        self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
        // ucomisd xmm0, [rsp]
        self.emit_bytes(&[0x66, 0x0f, 0x2e, 0x04, 0x24])?;
        // jp NAN
        self.emit_bytes(&[0x0f, 0x8a])?;
        let nan = self.emit_branch_target32()?;
        // mov rax, [rsp] ; test rax, rax ; je ZERO
        self.emit_bytes(&[0x48, 0x8b, 0x04, 0x24])?;
        self.emit_bytes(&[0x48, 0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x84])?;
        let zero = self.emit_branch_target32()?;
        if is_min {
            // minsd xmm0, [rsp]
            self.emit_bytes(&[0xf2, 0x0f, 0x5d, 0x04, 0x24])?;
        } else {
            // movsd xmm0, [rsp] ; maxsd xmm0, [rsp+8]
            self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf2, 0x0f, 0x5f, 0x44, 0x24, 0x08])?;
        }
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done_main = self.emit_branch_target32()?;
        self.fix_branch(zero, self.pos)?;
        if is_min {
            // movsd xmm0, [rsp] ; minsd xmm0, [rsp+8]
            self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x04, 0x24])?;
            self.emit_bytes(&[0xf2, 0x0f, 0x5d, 0x44, 0x24, 0x08])?;
        } else {
            // movsd xmm0, [rsp+8] ; maxsd xmm0, [rsp]
            self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08])?;
            self.emit_bytes(&[0xf2, 0x0f, 0x5f, 0x04, 0x24])?;
        }
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done_zero = self.emit_branch_target32()?;
        self.fix_branch(nan, self.pos)?;
        // addsd xmm0, [rsp]
        self.emit_bytes(&[0xf2, 0x0f, 0x58, 0x04, 0x24])?;
        self.fix_branch(done_main, self.pos)?;
        self.fix_branch(done_zero, self.pos)?;
        // add rsp, 8 ; movsd [rsp], xmm0
        self.emit_bytes(&[0x48, 0x83, 0xc4, 0x08])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_min(&mut self) -> Result<(), CompileError> {
        self.emit_f32_min_max(true)
    }

    pub(crate) fn emit_f32_max(&mut self) -> Result<(), CompileError> {
        self.emit_f32_min_max(false)
    }

    pub(crate) fn emit_f64_min(&mut self) -> Result<(), CompileError> {
        self.emit_f64_min_max(true)
    }

    pub(crate) fn emit_f64_max(&mut self) -> Result<(), CompileError> {
        self.emit_f64_min_max(false)
    }

    pub(crate) fn emit_f32_copysign(&mut self) -> Result<(), CompileError> {
        // pop rax ; and eax, 0x80000000 ; the sign source
        self.emit_bytes(&[0x58])?;
        self.emit_bytes(&[0x25])?;
        self.emit_u32(0x8000_0000)?;
        // pop rcx ; and ecx, 0x7fffffff ; the magnitude
        self.emit_bytes(&[0x59])?;
        self.emit_bytes(&[0x81, 0xe1])?;
        self.emit_u32(0x7fff_ffff)?;
        // or eax, ecx ; push rax
        self.emit_bytes(&[0x09, 0xc8])?;
        self.emit_bytes(&[0x50])
    }

    pub(crate) fn emit_f64_copysign(&mut self) -> Result<(), CompileError> {
        // pop rcx ; the sign source
        self.emit_bytes(&[0x59])?;
        // movabs rax, 0x8000000000000000
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_u64(0x8000_0000_0000_0000)?;
        // and rcx, rax
        self.emit_bytes(&[0x48, 0x21, 0xc1])?;
        // pop rdx ; the magnitude
        self.emit_bytes(&[0x5a])?;
        // not rax ; and rax, rdx ; or rax, rcx ; push rax
        self.emit_bytes(&[0x48, 0xf7, 0xd0])?;
        self.emit_bytes(&[0x48, 0x21, 0xd0])?;
        self.emit_bytes(&[0x48, 0x09, 0xc8])?;
        self.emit_bytes(&[0x50])
    }

    // ---------------- conversions ----------------

    pub(crate) fn emit_i32_wrap_i64(&mut self) -> Result<(), CompileError> {
        // xor eax, eax ; mov [rsp+4], eax ; zero the slot's high half
        self.emit_bytes(&[0x31, 0xc0])?;
        self.emit_bytes(&[0x89, 0x44, 0x24, 0x04])
    }

    /// Wraps a trapping conversion: MXCSR is saved with all exceptions
    /// masked and the invalid flag clear, the conversion runs, and a set
    /// invalid flag afterwards routes to the fp trap. The pushed MXCSR slot
    /// shifts rsp by 8 for the wrapped op.
    fn emit_f2i(&mut self, op: &[u8]) -> Result<(), CompileError> {
        // mov eax, 0x1f80 ; round-to-even, exceptions masked, flags clear
        self.emit_bytes(&[0xb8, 0x80, 0x1f, 0x00, 0x00])?;
        // push rax ; ldmxcsr [rsp]
        self.emit_bytes(&[0x50])?;
        self.emit_bytes(&[0x0f, 0xae, 0x14, 0x24])?;
        self.emit_bytes(op)?;
        // stmxcsr [rsp] ; pop rcx
        self.emit_bytes(&[0x0f, 0xae, 0x1c, 0x24])?;
        self.emit_bytes(&[0x59])?;
        // test cl, 1 ; the invalid-operation flag
        self.emit_bytes(&[0xf6, 0xc1, 0x01])?;
        // jnz fp trap
        self.emit_bytes(&[0x0f, 0x85])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.fpe_handler)
    }

    pub(crate) fn emit_i32_trunc_s_f32(&mut self) -> Result<(), CompileError> {
        // cvttss2si eax, [rsp+8]
        self.emit_f2i(&[0xf3, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], eax
        self.emit_bytes(&[0x89, 0x04, 0x24])
    }

    /// Unsigned 32-bit truncation converts through 64 bits; any set high
    /// bit means the value was out of u32 range.
    pub(crate) fn emit_i32_trunc_u_f32(&mut self) -> Result<(), CompileError> {
        // cvttss2si rax, [rsp+8]
        self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], eax
        self.emit_bytes(&[0x89, 0x04, 0x24])?;
        // shr rax, 32 ; test eax, eax ; jnz fp trap
        self.emit_bytes(&[0x48, 0xc1, 0xe8, 0x20])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x85])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.fpe_handler)
    }

    pub(crate) fn emit_i32_trunc_s_f64(&mut self) -> Result<(), CompileError> {
        // cvttsd2si eax, [rsp+8]
        self.emit_f2i(&[0xf2, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])
    }

    pub(crate) fn emit_i32_trunc_u_f64(&mut self) -> Result<(), CompileError> {
        // cvttsd2si rax, [rsp+8]
        self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])?;
        // shr rax, 32 ; test eax, eax ; jnz fp trap
        self.emit_bytes(&[0x48, 0xc1, 0xe8, 0x20])?;
        self.emit_bytes(&[0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x85])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.fpe_handler)
    }

    pub(crate) fn emit_i64_extend_s_i32(&mut self) -> Result<(), CompileError> {
        // movsxd rax, dword [rsp] ; mov [rsp], rax
        self.emit_bytes(&[0x48, 0x63, 0x04, 0x24])?;
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])
    }

    pub(crate) fn emit_i64_extend_u_i32(&mut self) -> Result<(), CompileError> {
        // the slot's high half is already zero
        Ok(())
    }

    pub(crate) fn emit_i64_trunc_s_f32(&mut self) -> Result<(), CompileError> {
        // cvttss2si rax, [rsp+8]
        self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])
    }

    /// The classic unsigned-64 truncation: subtract 2^63, convert both ways
    /// and select, then a carry check routes out-of-range and NaN inputs to
    /// the fp trap.
    pub(crate) fn emit_i64_trunc_u_f32(&mut self) -> Result<(), CompileError> {
        // mov eax, 0x5f000000 ; 2^63 as f32
        self.emit_bytes(&[0xb8])?;
        self.emit_u32(0x5f00_0000)?;
        // movss xmm0, [rsp]
        self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x04, 0x24])?;
        // mov [rsp], eax ; movss xmm1, [rsp] ; the slot doubles as scratch
        self.emit_bytes(&[0x89, 0x04, 0x24])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x10, 0x0c, 0x24])?;
        // movaps xmm2, xmm0 ; subss xmm2, xmm1
        self.emit_bytes(&[0x0f, 0x28, 0xd0])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x5c, 0xd1])?;
        // cvttss2si rax, xmm2
        self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0xc2])?;
        // movabs rcx, 0x8000000000000000 ; xor rcx, rax
        self.emit_bytes(&[0x48, 0xb9])?;
        self.emit_u64(0x8000_0000_0000_0000)?;
        self.emit_bytes(&[0x48, 0x31, 0xc1])?;
        // cvttss2si rax, xmm0
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0x2c, 0xc0])?;
        // xor rdx, rdx
        self.emit_bytes(&[0x48, 0x31, 0xd2])?;
        // ucomiss xmm1, xmm0
        self.emit_bytes(&[0x0f, 0x2e, 0xc8])?;
        // cmova rdx, rax ; cmovbe rax, rcx
        self.emit_bytes(&[0x48, 0x0f, 0x47, 0xd0])?;
        self.emit_bytes(&[0x48, 0x0f, 0x46, 0xc1])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])?;
        // bt rdx, 63 ; jc fp trap
        self.emit_bytes(&[0x48, 0x0f, 0xba, 0xe2, 0x3f])?;
        self.emit_bytes(&[0x0f, 0x82])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.fpe_handler)
    }

    pub(crate) fn emit_i64_trunc_s_f64(&mut self) -> Result<(), CompileError> {
        // cvttsd2si rax, [rsp+8]
        self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])
    }

    pub(crate) fn emit_i64_trunc_u_f64(&mut self) -> Result<(), CompileError> {
        // movabs rax, 0x43e0000000000000 ; 2^63 as f64
        self.emit_bytes(&[0x48, 0xb8])?;
        self.emit_u64(0x43e0_0000_0000_0000)?;
        // movsd xmm0, [rsp]
        self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x04, 0x24])?;
        // mov [rsp], rax ; movsd xmm1, [rsp]
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x10, 0x0c, 0x24])?;
        // movapd xmm2, xmm0 ; subsd xmm2, xmm1
        self.emit_bytes(&[0x66, 0x0f, 0x28, 0xd0])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x5c, 0xd1])?;
        // cvttsd2si rax, xmm2
        self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0xc2])?;
        // movabs rcx, 0x8000000000000000 ; xor rcx, rax
        self.emit_bytes(&[0x48, 0xb9])?;
        self.emit_u64(0x8000_0000_0000_0000)?;
        self.emit_bytes(&[0x48, 0x31, 0xc1])?;
        // cvttsd2si rax, xmm0
        self.emit_bytes(&[0xf2, 0x48, 0x0f, 0x2c, 0xc0])?;
        // xor rdx, rdx
        self.emit_bytes(&[0x48, 0x31, 0xd2])?;
        // ucomisd xmm1, xmm0
        self.emit_bytes(&[0x66, 0x0f, 0x2e, 0xc8])?;
        // cmova rdx, rax ; cmovbe rax, rcx
        self.emit_bytes(&[0x48, 0x0f, 0x47, 0xd0])?;
        self.emit_bytes(&[0x48, 0x0f, 0x46, 0xc1])?;
        // mov [rsp], rax
        self.emit_bytes(&[0x48, 0x89, 0x04, 0x24])?;
        // bt rdx, 63 ; jc fp trap
        self.emit_bytes(&[0x48, 0x0f, 0xba, 0xe2, 0x3f])?;
        self.emit_bytes(&[0x0f, 0x82])?;
        let hole = self.emit_branch_target32()?;
        self.fix_branch(hole, self.fpe_handler)
    }

    pub(crate) fn emit_f32_convert_s_i32(&mut self) -> Result<(), CompileError> {
        // cvtsi2ss xmm0, dword [rsp] ; movss [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x0f, 0x2a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_convert_u_i32(&mut self) -> Result<(), CompileError> {
        // cvtsi2ss xmm0, qword [rsp] ; the slot is already zero-extended
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0x2a, 0x04, 0x24])?;
        // movss [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_convert_s_i64(&mut self) -> Result<(), CompileError> {
        // cvtsi2ss xmm0, qword [rsp] ; movss [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0x2a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    /// u64 values with the top bit set halve (keeping the sticky low bit),
    /// convert signed, then double — the rounding comes out right.
    pub(crate) fn emit_f32_convert_u_i64(&mut self) -> Result<(), CompileError> {
        // mov rax, [rsp] ; test rax, rax ; js LARGE
        self.emit_bytes(&[0x48, 0x8b, 0x04, 0x24])?;
        self.emit_bytes(&[0x48, 0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x88])?;
        let large = self.emit_branch_target32()?;
        // cvtsi2ss xmm0, rax
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0x2a, 0xc0])?;
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done = self.emit_branch_target32()?;
        self.fix_branch(large, self.pos)?;
        // mov rcx, rax ; shr rax, 1 ; and ecx, 1 ; or rax, rcx
        self.emit_bytes(&[0x48, 0x89, 0xc1])?;
        self.emit_bytes(&[0x48, 0xd1, 0xe8])?;
        self.emit_bytes(&[0x83, 0xe1, 0x01])?;
        self.emit_bytes(&[0x48, 0x09, 0xc8])?;
        // cvtsi2ss xmm0, rax ; addss xmm0, xmm0
        self.emit_bytes(&[0xf3, 0x48, 0x0f, 0x2a, 0xc0])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x58, 0xc0])?;
        self.fix_branch(done, self.pos)?;
        // xor eax, eax ; mov [rsp+4], eax ; keep the f32 slot zero-extended
        self.emit_bytes(&[0x31, 0xc0])?;
        self.emit_bytes(&[0x89, 0x44, 0x24, 0x04])?;
        // movss [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f32_demote_f64(&mut self) -> Result<(), CompileError> {
        // cvtsd2ss xmm0, [rsp] ; movss [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x0f, 0x5a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf3, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_convert_s_i32(&mut self) -> Result<(), CompileError> {
        // cvtsi2sd xmm0, dword [rsp] ; movsd [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x0f, 0x2a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_convert_u_i32(&mut self) -> Result<(), CompileError> {
        // cvtsi2sd xmm0, qword [rsp] ; movsd [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x48, 0x0f, 0x2a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_convert_s_i64(&mut self) -> Result<(), CompileError> {
        // cvtsi2sd xmm0, qword [rsp] ; movsd [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x48, 0x0f, 0x2a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_convert_u_i64(&mut self) -> Result<(), CompileError> {
        // mov rax, [rsp] ; test rax, rax ; js LARGE
        self.emit_bytes(&[0x48, 0x8b, 0x04, 0x24])?;
        self.emit_bytes(&[0x48, 0x85, 0xc0])?;
        self.emit_bytes(&[0x0f, 0x88])?;
        let large = self.emit_branch_target32()?;
        // cvtsi2sd xmm0, rax
        self.emit_bytes(&[0xf2, 0x48, 0x0f, 0x2a, 0xc0])?;
        // jmp DONE
        self.emit_bytes(&[0xe9])?;
        let done = self.emit_branch_target32()?;
        self.fix_branch(large, self.pos)?;
        // mov rcx, rax ; shr rax, 1 ; and ecx, 1 ; or rax, rcx
        self.emit_bytes(&[0x48, 0x89, 0xc1])?;
        self.emit_bytes(&[0x48, 0xd1, 0xe8])?;
        self.emit_bytes(&[0x83, 0xe1, 0x01])?;
        self.emit_bytes(&[0x48, 0x09, 0xc8])?;
        // cvtsi2sd xmm0, rax ; addsd xmm0, xmm0
        self.emit_bytes(&[0xf2, 0x48, 0x0f, 0x2a, 0xc0])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x58, 0xc0])?;
        self.fix_branch(done, self.pos)?;
        // movsd [rsp], xmm0
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    pub(crate) fn emit_f64_promote_f32(&mut self) -> Result<(), CompileError> {
        // cvtss2sd xmm0, [rsp] ; movsd [rsp], xmm0
        self.emit_bytes(&[0xf3, 0x0f, 0x5a, 0x04, 0x24])?;
        self.emit_bytes(&[0xf2, 0x0f, 0x11, 0x04, 0x24])
    }

    /// Reinterprets are no-ops: the 8-byte slot already holds the pattern.
    pub(crate) fn emit_reinterpret(&mut self) -> Result<(), CompileError> {
        Ok(())
    }
}

/// Work stack for the `br_table` binary search. Ranges stay contiguous and
/// non-overlapping with the lowest values at the back.
pub(crate) struct BrTableState {
    stack: Vec<BrTableRange>,
}

struct BrTableRange {
    min: u32,
    max: u32,
    hole: Option<usize>,
}

/// Worst-case native size of one function, used both for the region
/// capacity estimate and the per-function reservation.
pub(crate) fn function_reservation(body: &crate::module::FunctionBody) -> usize {
    let mut size = MAX_PROLOGUE_SIZE + MAX_EPILOGUE_SIZE;
    for instr in &body.instrs {
        size += MAX_INSTR_SIZE;
        if let crate::module::Instr::BrTable { targets, .. } = instr {
            size += (targets.len() + 1) * MAX_BR_TABLE_CASE_SIZE;
        }
    }
    size
}

/// LZCNT and TZCNT availability, probed once. Both or neither are used:
/// the fallback pairs BSR/BSF with a cmov for the zero-input result.
pub(crate) fn has_lzcnt_tzcnt() -> bool {
    static CACHE: OnceLock<bool> = OnceLock::new();
    *CACHE.get_or_init(|| {
        let bmi1 = unsafe { std::arch::x86_64::__cpuid_count(7, 0) }.ebx & (1 << 3) != 0;
        let max_extended = unsafe { std::arch::x86_64::__cpuid(0x8000_0000) }.eax;
        let lzcnt = max_extended >= 0x8000_0001
            && unsafe { std::arch::x86_64::__cpuid(0x8000_0001) }.ecx & (1 << 5) != 0;
        if !(bmi1 && lzcnt) {
            tracing::warn!("lzcnt/tzcnt unavailable, falling back to bsr/bsf emission");
        }
        bmi1 && lzcnt
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FuncType, FunctionBody, Instr, ModuleBuilder};

    fn dummy_hooks() -> RuntimeHooks {
        RuntimeHooks {
            host_dispatch: 0x1000,
            current_memory: 0x2000,
            grow_memory: 0x3000,
            on_unreachable: 0x4000,
            on_fp_error: 0x5000,
            on_call_indirect_range: 0x6000,
            on_call_indirect_type: 0x7000,
            on_stack_overflow: 0x8000,
            ctx_depth_offset: 0,
        }
    }

    fn test_module(table: Option<Vec<Option<u32>>>, imports: u32) -> crate::module::Module {
        let mut builder = ModuleBuilder::new();
        let ty = builder.add_type(FuncType::new(vec![], None));
        for index in 0..imports {
            builder
                .add_import(format!("import_{index}"), ty)
                .expect("imports first");
        }
        builder.add_function(ty, vec![], vec![Instr::End]);
        if let Some(entries) = table {
            builder.set_table(entries);
        }
        builder.build().expect("module should build")
    }

    #[test]
    fn trap_stubs_are_sixteen_bytes_each() {
        let module = test_module(None, 0);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.emit_trap_stubs().expect("stubs should emit");
        assert_eq!(writer.fpe_handler, 0);
        assert_eq!(writer.indirect_range_handler, ERROR_HANDLER_SIZE);
        assert_eq!(writer.indirect_type_handler, 2 * ERROR_HANDLER_SIZE);
        assert_eq!(writer.stack_overflow_handler, 3 * ERROR_HANDLER_SIZE);
        assert_eq!(writer.pos(), 4 * ERROR_HANDLER_SIZE);
    }

    #[test]
    fn host_trampolines_are_forty_bytes_each() {
        let module = test_module(None, 3);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.emit_trap_stubs().expect("stubs");
        let before = writer.pos();
        writer.emit_host_trampolines().expect("trampolines");
        assert_eq!(writer.pos() - before, 3 * HOST_TRAMPOLINE_SIZE);
    }

    #[test]
    fn jump_table_keeps_a_seventeen_byte_stride() {
        let module = test_module(Some(vec![Some(0), None, Some(0)]), 0);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.emit_trap_stubs().expect("stubs");
        let before = writer.pos();
        writer.emit_jump_table().expect("table");
        assert_eq!(writer.pos() - before, 3 * TABLE_ELEMENT_SIZE);
        // absent slots are jmp + int3 padding
        let slot = &region.buf_mut()
            [before + TABLE_ELEMENT_SIZE..before + 2 * TABLE_ELEMENT_SIZE];
        assert_eq!(slot[0], 0xe9);
        assert!(slot[5..].iter().all(|&byte| byte == 0xcc));
    }

    #[test]
    fn fix_branch_writes_pc_relative_displacements() {
        let module = test_module(None, 0);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.code_end = 1 << 16;
        // jmp forward over 10 bytes
        writer.emit_bytes(&[0xe9]).expect("emit");
        let hole = writer.emit_branch_target32().expect("hole");
        let target = writer.pos() + 10;
        writer.fix_branch(hole, target).expect("fix");
        let disp =
            i32::from_le_bytes(region.buf_mut()[hole..hole + 4].try_into().unwrap());
        assert_eq!(disp, 10);
    }

    #[test]
    fn pending_calls_are_patched_when_the_callee_starts() {
        let module = test_module(None, 0);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.code_end = 1 << 16;
        writer.emit_bytes(&[0xe8]).expect("call opcode");
        let hole = writer.emit_branch_target32().expect("hole");
        writer.register_call(hole, 0).expect("register");
        assert!(writer.verify_relocations().is_err());
        let callee_start = 0x100;
        writer.start_function(callee_start, 0).expect("start");
        writer.verify_relocations().expect("resolved");
        let disp =
            i32::from_le_bytes(region.buf_mut()[hole..hole + 4].try_into().unwrap());
        assert_eq!(disp as i64, callee_start as i64 - (hole as i64 + 4));
    }

    #[test]
    fn registering_after_resolution_patches_immediately() {
        let module = test_module(None, 0);
        let mut region = CodeRegion::new(1 << 16).expect("region");
        let mut writer = MachineCodeWriter::new(&mut region, &module, &[], dummy_hooks());
        writer.code_end = 1 << 16;
        writer.start_function(0x40, 0).expect("start");
        writer.emit_bytes(&[0xe8]).expect("call opcode");
        let hole = writer.emit_branch_target32().expect("hole");
        writer.register_call(hole, 0).expect("register");
        let disp =
            i32::from_le_bytes(region.buf_mut()[hole..hole + 4].try_into().unwrap());
        assert_eq!(disp as i64, 0x40 - (hole as i64 + 4));
    }

    #[test]
    fn br_table_reservation_scales_with_target_count() {
        let small = FunctionBody {
            locals: vec![],
            instrs: vec![Instr::End],
        };
        let large = FunctionBody {
            locals: vec![],
            instrs: vec![
                Instr::BrTable {
                    targets: (0..100).map(|_| 0).collect(),
                    default: 0,
                },
                Instr::End,
            ],
        };
        let small_size = function_reservation(&small);
        let large_size = function_reservation(&large);
        assert!(large_size >= small_size + 100 * MAX_BR_TABLE_CASE_SIZE);
    }
}
