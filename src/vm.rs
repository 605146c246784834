//! Component B: the register-based fetch-decode-execute loop.
//!
//! The dispatch style — a `match` over a C-like opcode enum, one method
//! per opcode, frame bookkeeping kept in a few local variables rather
//! than heap-allocated per call — follows `emdash-udashboard`'s
//! `vm.rs` (`VM::dispatch`, `StackFrame`). The addressing model itself is
//! reworked from the teacher's value-stack (`Vec<Value>`, one slot per
//! pushed value) into the byte-addressed, explicit-frame model spec.md
//! §3/§4.4 require: every operand is a byte offset into one contiguous
//! `Vec<u8>` stack, the way `original_source/src/interp.cpp` walks a raw
//! stack pointer.

use std::convert::TryInto;

use crate::natives::{NativeRegistry, PolyFunc};
use crate::types::{Instruction, Module, Opcode, ProgramAddress, LINKAGE_SIZE, OFF_RET_ADDR, OFF_RET_STACK};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid operation")]
    InvalidOpcode,
    #[error("runoff")]
    Runoff,
    #[error("stack overflow")]
    StackOverflow,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// `interp`'s return value (spec.md §4.4): a terminate code plus, for the
/// error cases spec.md §7 allows, the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub code: i32,
    pub error: Option<RuntimeError>,
}

impl Outcome {
    fn terminate(code: i32) -> Self {
        Outcome { code, error: None }
    }

    fn error(code: i32, error: RuntimeError) -> Self {
        Outcome { code, error: Some(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Read-only view of the loaded program handed to native functions
/// (spec.md §6 "Native call ABI"). Deliberately excludes the stack buffer
/// — a native reaches the stack only through the `Frame` it's given — so
/// a native can be handed both without aliasing the same `&mut`.
pub struct HostContext<'a> {
    pub modules: &'a [Module],
}

/// A window onto the byte stack addressed relative to one frame's base,
/// matching the ABI's description of offsets as positive above the base
/// and negative below it (spec.md §6). Bounds violations panic rather
/// than corrupt memory — natives are trusted but not infallible, and
/// Rust's indexing is the only safety net a native call gets.
pub struct Frame<'a> {
    bytes: &'a mut [u8],
    base: usize,
}

impl<'a> Frame<'a> {
    fn at(&self, offset: i32) -> usize {
        (self.base as i64 + offset as i64) as usize
    }

    pub fn read_i32(&self, offset: i32) -> i32 {
        let p = self.at(offset);
        i32::from_le_bytes(self.bytes[p..p + 4].try_into().unwrap())
    }

    pub fn write_i32(&mut self, offset: i32, v: i32) {
        let p = self.at(offset);
        self.bytes[p..p + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_f32(&self, offset: i32) -> f32 {
        let p = self.at(offset);
        f32::from_le_bytes(self.bytes[p..p + 4].try_into().unwrap())
    }

    pub fn write_f32(&mut self, offset: i32, v: f32) {
        let p = self.at(offset);
        self.bytes[p..p + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_bool(&self, offset: i32) -> bool {
        self.bytes[self.at(offset)] != 0
    }

    pub fn write_bool(&mut self, offset: i32, v: bool) {
        let p = self.at(offset);
        self.bytes[p] = v as u8;
    }
}

/// A native function's signature, `(state, frame_base) -> ()` in spec.md
/// §6's terms. Arguments are laid out from `frame_base + 8` upward per
/// their declared types; the return value lives at `frame_base +
/// return_value_offset(ret_type)`, which is negative for the usual case
/// where the caller reserved room for it below the callee's base.
pub type NativeFn = fn(&HostContext, &mut Frame);

fn rel(base: usize, offset: i16) -> usize {
    (base as i64 + offset as i64) as usize
}

/// The VM/loader's shared runtime state (spec.md §3 "Runtime state",
/// §4.5): modules in load order, the registry of host-provided native
/// functions `CFCALL`/`PFCALL` can reach, and one contiguous byte-
/// addressed call stack. Never shared across threads (spec.md §5).
pub struct RuntimeState {
    pub modules: Vec<Module>,
    pub natives: NativeRegistry,
    stack: Vec<u8>,
}

impl RuntimeState {
    /// Allocates the call stack once, up front, matching
    /// `original_source/src/main.cpp`'s fixed 64 MiB allocation (spec.md
    /// §5 "Resource acquisition" — no per-call allocation in the hot
    /// path).
    pub fn new(stack_size: usize) -> Self {
        RuntimeState { modules: Vec::new(), natives: NativeRegistry::new(), stack: vec![0u8; stack_size] }
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    #[cfg(test)]
    pub fn stack_slice_for_test(&self) -> &[u8] {
        &self.stack
    }

    /// Reads back a completed call's return value from the bottom of the
    /// stack (`&S.stack[0]` in `original_source/src/main.cpp::main`).
    /// Only meaningful once `interp`/`execute` has returned successfully.
    pub fn read_result_i32(&self) -> i32 {
        self.read_i32(0)
    }

    pub fn read_result_f32(&self) -> f32 {
        self.read_f32(0)
    }

    fn read_i32(&self, off: usize) -> i32 {
        i32::from_le_bytes(self.stack[off..off + 4].try_into().unwrap())
    }

    fn write_i32(&mut self, off: usize, v: i32) {
        self.stack[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn read_f32(&self, off: usize) -> f32 {
        f32::from_le_bytes(self.stack[off..off + 4].try_into().unwrap())
    }

    fn write_f32(&mut self, off: usize, v: f32) {
        self.stack[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn read_bool(&self, off: usize) -> bool {
        self.stack[off] != 0
    }

    fn write_bool(&mut self, off: usize, v: bool) {
        self.stack[off] = v as u8;
    }

    fn write_program_address(&mut self, off: usize, addr: ProgramAddress) {
        self.stack[off..off + ProgramAddress::SIZE].copy_from_slice(&addr.to_bytes());
    }

    fn read_program_address(&self, off: usize) -> ProgramAddress {
        ProgramAddress::from_bytes(&self.stack[off..off + ProgramAddress::SIZE])
    }

    fn copy_bytes(&mut self, dest: usize, src: usize, len: usize) {
        self.stack.copy_within(src..src + len, dest);
    }

    /// Write the linkage a matching `RET` expects to find at the new
    /// frame's base (spec.md §3 invariant 5, §4.4 step 4 "For CALL").
    fn push_linkage(&mut self, new_base: usize, displacement: i16, return_to: ProgramAddress) {
        self.write_program_address(new_base + OFF_RET_ADDR, return_to);
        self.write_i32(new_base + OFF_RET_STACK, displacement as i32);
    }

    /// Guards a new frame against the preallocated stack buffer before any
    /// byte of it is written — without this, unbounded recursion (a script
    /// `fib` with no base case, say) would panic on an out-of-bounds slice
    /// write instead of reporting a runtime error.
    fn check_frame(&self, new_base: usize) -> Result<()> {
        if new_base + LINKAGE_SIZE as usize > self.stack.len() {
            Err(RuntimeError::StackOverflow)
        } else {
            Ok(())
        }
    }

    fn call_native(&mut self, id: u32, frame_base: usize) -> Result<()> {
        let f = self.natives.get(id).ok_or(RuntimeError::InvalidOpcode)?;
        let ctx = HostContext { modules: &self.modules };
        let mut frame = Frame { bytes: &mut self.stack, base: frame_base };
        f(&ctx, &mut frame);
        Ok(())
    }

    /// Runs one Moonflower function to completion (spec.md §4.4 `interp`).
    ///
    /// `module_index`/`func_offset` name the entry instruction;
    /// `retval_byte_size` is how much room the caller has reserved below
    /// the bootstrap frame for the return value (step 1: "make room below
    /// the base frame for the bootstrap's return value").
    pub fn interp(&mut self, module_index: u16, func_offset: u16, retval_byte_size: u16) -> Outcome {
        let mut cur_module = module_index;
        let mut pc = func_offset as usize;
        let mut frame_base = retval_byte_size as usize;

        self.write_program_address(frame_base + OFF_RET_ADDR, ProgramAddress::new(0, 0));
        self.write_i32(frame_base + OFF_RET_STACK, 0);

        loop {
            let text_len = self.modules[cur_module as usize].text.len();
            if pc >= text_len {
                if cfg!(debug_assertions) {
                    log::warn!("pc {} ran off the end of module {} ({} instructions)", pc, cur_module, text_len);
                }
                return Outcome::error(-2, RuntimeError::Runoff);
            }

            let instr = self.modules[cur_module as usize].text[pc];
            pc += 1;
            log::trace!("{}:{} {:?} (frame_base={})", cur_module, pc - 1, instr, frame_base);

            match self.dispatch(&mut cur_module, &mut pc, &mut frame_base, instr) {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => continue,
                Err(e) => return Outcome::error(-1, e),
            }
        }
    }

    fn dispatch(
        &mut self,
        cur_module: &mut u16,
        pc: &mut usize,
        frame_base: &mut usize,
        instr: Instruction,
    ) -> Result<Option<Outcome>> {
        use Opcode::*;

        let fb = *frame_base;
        let a = rel(fb, instr.a);

        match instr.op {
            Terminate => return Ok(Some(Outcome::terminate(instr.a as i32))),

            ISetC => self.write_i32(a, instr.di()),
            FSetC => self.write_f32(a, instr.df()),
            BSetC => self.write_bool(a, instr.db()),

            SetAdr => {
                let target = ProgramAddress::new(*cur_module, instr.di() as u16);
                self.write_program_address(a, target);
            }
            SetDat => {
                let data_off = instr.b() as usize;
                let size = instr.c() as usize;
                let bytes = self.modules[*cur_module as usize].data[data_off..data_off + size].to_vec();
                self.stack[a..a + size].copy_from_slice(&bytes);
            }
            Cpy => {
                let src = rel(fb, instr.b());
                let size = instr.c() as usize;
                self.copy_bytes(a, src, size);
            }

            IAdd => self.int_binop(a, instr, fb, |l, r| l.wrapping_add(r)),
            ISub => self.int_binop(a, instr, fb, |l, r| l.wrapping_sub(r)),
            IMul => self.int_binop(a, instr, fb, |l, r| l.wrapping_mul(r)),
            IDiv => self.int_binop(a, instr, fb, |l, r| l / r),
            IClt => {
                let b = rel(fb, instr.b());
                let c = rel(fb, instr.c());
                let v = self.read_i32(b) < self.read_i32(c);
                self.write_bool(a, v);
            }
            IAddC => {
                let b = rel(fb, instr.b());
                let v = self.read_i32(b).wrapping_add(instr.c() as i32);
                self.write_i32(a, v);
            }
            ICltC => {
                let b = rel(fb, instr.b());
                let v = self.read_i32(b) < instr.c() as i32;
                self.write_bool(a, v);
            }

            FAdd => self.float_binop(a, instr, fb, |l, r| l + r),
            FSub => self.float_binop(a, instr, fb, |l, r| l - r),
            FMul => self.float_binop(a, instr, fb, |l, r| l * r),
            FDiv => self.float_binop(a, instr, fb, |l, r| l / r),

            Jmp => {
                *pc = (*pc as i64 + instr.di() as i64) as usize;
            }
            JmpIfN => {
                if !self.read_bool(a) {
                    *pc = (*pc as i64 + instr.di() as i64) as usize;
                }
            }

            Call => {
                let t = instr.a;
                let func_slot = rel(fb, instr.b());
                let target = self.read_program_address(func_slot);
                let new_base = fb + t as usize;
                self.check_frame(new_base)?;
                self.push_linkage(new_base, t, ProgramAddress::new(*cur_module, *pc as u16));
                *cur_module = target.module_index;
                *pc = target.text_offset as usize;
                *frame_base = new_base;
            }
            Ret => {
                let ret = self.read_program_address(fb + OFF_RET_ADDR);
                let disp = self.read_i32(fb + OFF_RET_STACK) as usize;
                *cur_module = ret.module_index;
                *pc = ret.text_offset as usize;
                *frame_base = fb - disp;
            }

            CfCall => {
                let data_off = instr.a as usize;
                let id = {
                    let data = &self.modules[*cur_module as usize].data;
                    u32::from_le_bytes(data[data_off..data_off + 4].try_into().unwrap())
                };
                self.call_native(id, fb)?;
            }
            PfCall => {
                let t = instr.a;
                let slot = rel(fb, instr.b());
                let pf = PolyFunc::from_bytes(&self.stack[slot..slot + PolyFunc::SIZE]);
                match pf {
                    PolyFunc::Script(target) => {
                        let new_base = fb + t as usize;
                        self.check_frame(new_base)?;
                        self.push_linkage(new_base, t, ProgramAddress::new(*cur_module, *pc as u16));
                        *cur_module = target.module_index;
                        *pc = target.text_offset as usize;
                        *frame_base = new_base;
                    }
                    PolyFunc::Native(id) => {
                        // No bytecode runs for a native target: synthesize the
                        // call/return pair `original_source/src/main.cpp::
                        // cfunc_to_mf`'s two-instruction wrapper (`cfcall; ret`)
                        // would have produced, without the extra jump.
                        let new_base = fb + t as usize;
                        self.check_frame(new_base)?;
                        self.call_native(id, new_base)?;
                    }
                }
            }
        }

        Ok(None)
    }

    fn int_binop(&mut self, dest: usize, instr: Instruction, fb: usize, f: impl Fn(i32, i32) -> i32) {
        let b = rel(fb, instr.b());
        let c = rel(fb, instr.c());
        let v = f(self.read_i32(b), self.read_i32(c));
        self.write_i32(dest, v);
    }

    fn float_binop(&mut self, dest: usize, instr: Instruction, fb: usize, f: impl Fn(f32, f32) -> f32) {
        let b = rel(fb, instr.b());
        let c = rel(fb, instr.c());
        let v = f(self.read_f32(b), self.read_f32(c));
        self.write_f32(dest, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instruction as I, Opcode as Op};

    fn run(text: Vec<Instruction>, retsize: u16) -> (RuntimeState, Outcome) {
        let mut state = RuntimeState::new(1 << 16);
        let mut m = Module::new("test");
        m.text = text;
        state.modules.push(m);
        let outcome = state.interp(0, 0, retsize);
        (state, outcome)
    }

    #[test]
    fn arithmetic_mixes_registers_and_constants() {
        // return 2 + 3 * 4 == 14, result written to offset 0 (retsize=4).
        let text = vec![
            I::adi(Op::ISetC, 12, 3),
            I::adi(Op::ISetC, 16, 4),
            I::abc(Op::IMul, 12, 12, 16),
            I::adi(Op::ISetC, 16, 2),
            I::abc(Op::IAdd, -12, 16, 12),
            I::bare(Op::Terminate),
        ];
        let (state, outcome) = run(text, 4);
        assert_eq!(outcome, Outcome::terminate(0));
        assert_eq!(i32::from_le_bytes(state.stack[0..4].try_into().unwrap()), 14);
    }

    #[test]
    fn jmp_relative_zero_is_a_fallthrough_noop() {
        let text = vec![I::adi(Op::Jmp, 0, 0), I::a_only(Op::Terminate, 5), I::bare(Op::Terminate)];
        let (_, outcome) = run(text, 0);
        assert_eq!(outcome, Outcome::terminate(5));
    }

    #[test]
    fn jmpifn_falls_through_when_byte_is_true() {
        let text = vec![
            I::adb(Op::BSetC, 8, true),
            I::adi(Op::JmpIfN, 8, 1), // condition true: no jump
            I::a_only(Op::Terminate, 1),
            I::a_only(Op::Terminate, 2),
        ];
        let (_, outcome) = run(text, 0);
        assert_eq!(outcome, Outcome::terminate(1));
    }

    #[test]
    fn jmpifn_takes_the_branch_when_byte_is_zero() {
        let text = vec![
            I::adb(Op::BSetC, 8, false),
            I::adi(Op::JmpIfN, 8, 1), // condition false: skip next
            I::a_only(Op::Terminate, 1),
            I::a_only(Op::Terminate, 2),
        ];
        let (_, outcome) = run(text, 0);
        assert_eq!(outcome, Outcome::terminate(2));
    }

    #[test]
    fn call_and_ret_round_trip_the_frame() {
        // callee at text offset 2: arg at [8..12), return value at [-4..0).
        let text = vec![
            /*0*/ I::bare(Op::Terminate),
            /*1*/ I::bare(Op::Terminate),
            /*2*/ I::abc(Op::IAddC, -4, 8, 1),
            /*3*/ I::bare(Op::Ret),
            /*4*/ I::adi(Op::SetAdr, 16, 2), // local 16 = &callee
            /*5*/ I::adi(Op::ISetC, 24, 41), // arg
            /*6*/ I::abc(Op::Call, 16, 16, 0),
            /*7*/ I::abc(Op::Cpy, -12, 12, 4),
            /*8*/ I::bare(Op::Terminate),
        ];
        let mut state = RuntimeState::new(1 << 16);
        let mut m = Module::new("test");
        m.text = text;
        state.modules.push(m);
        let outcome = state.interp(0, 4, 4);
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert_eq!(i32::from_le_bytes(state.stack[0..4].try_into().unwrap()), 42);
    }

    #[test]
    fn running_off_the_end_reports_runoff() {
        let (_, outcome) = run(vec![I::adi(Op::Jmp, 0, 10)], 0);
        assert_eq!(outcome.error, Some(RuntimeError::Runoff));
    }

    #[test]
    fn cfcall_invokes_a_registered_native() {
        fn double_it(_: &HostContext, frame: &mut Frame) {
            let n = frame.read_i32(8);
            frame.write_i32(-4, n * 2);
        }

        let mut state = RuntimeState::new(1 << 16);
        let id = state.natives.register(double_it);

        let mut natives_module = Module::new("natives");
        natives_module.data.extend_from_slice(&id.to_le_bytes());
        natives_module.text = vec![
            /*0*/ I::bare(Op::Terminate),
            /*1*/ I::a_only(Op::CfCall, 0),
            /*2*/ I::bare(Op::Ret),
        ];
        state.modules.push(natives_module);

        // The address of natives_module's wrapper (module 0, offset 1) is
        // baked into main's data as if a loader had already resolved an
        // import (spec.md §4.5) — SETADR only ever names an address within
        // the current module, so a cross-module target has to arrive this
        // way instead.
        let mut main_module = Module::new("main");
        main_module.data.extend_from_slice(&ProgramAddress::new(0, 1).to_bytes());
        main_module.text = vec![
            /*0*/ I::bare(Op::Terminate),
            /*1*/ I::abc(Op::SetDat, 16, 0, ProgramAddress::SIZE as i16),
            /*2*/ I::adi(Op::ISetC, 24, 21),
            /*3*/ I::abc(Op::Call, 16, 16, 0),
            /*4*/ I::abc(Op::Cpy, -12, 12, 4),
            /*5*/ I::bare(Op::Terminate),
        ];
        state.modules.push(main_module);

        let outcome = state.interp(1, 1, 4);
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert_eq!(i32::from_le_bytes(state.stack[0..4].try_into().unwrap()), 42);
    }

    #[test]
    fn pfcall_dispatches_native_tag_without_executing_bytecode() {
        fn triple_it(_: &HostContext, frame: &mut Frame) {
            let n = frame.read_i32(8);
            frame.write_i32(-4, n * 3);
        }

        let mut state = RuntimeState::new(1 << 16);
        let id = state.natives.register(triple_it);
        let pf = PolyFunc::Native(id);

        // The polyfunc value (local 16, 16 bytes) and the call's own
        // frame region (starting at local 32) must not overlap — the
        // native id lives inside the polyfunc encoding and must survive
        // until PFCALL reads it.
        let mut m = Module::new("main");
        m.data.extend_from_slice(&pf.to_bytes());
        m.text = vec![
            /*0*/ I::bare(Op::Terminate),
            /*1*/ I::abc(Op::SetDat, 16, 0, PolyFunc::SIZE as i16),
            /*2*/ I::adi(Op::ISetC, 40, 7),
            /*3*/ I::abc(Op::PfCall, 32, 16, 0),
            /*4*/ I::abc(Op::Cpy, -12, 28, 4),
            /*5*/ I::bare(Op::Terminate),
        ];
        state.modules.push(m);

        let outcome = state.interp(0, 1, 4);
        assert!(outcome.is_ok(), "{:?}", outcome);
        assert_eq!(i32::from_le_bytes(state.stack[0..4].try_into().unwrap()), 21);
    }
}
