//! Component E: the module loader/linker half of `RuntimeState`.
//!
//! `vm.rs` owns the struct (it needs the private stack buffer for
//! `interp`); this file adds the loading surface, grounded on
//! `original_source/src/state.hpp`/`state.cpp` (`state::load`,
//! `state::execute`, `state::get_entry_point`) and `main.cpp`'s `$null`
//! bootstrap-module convention.

use std::io;

use crate::assembler;
use crate::binformat;
use crate::compiler;
use crate::messages::CompileMessage;
use crate::types::{Instruction, Module, Opcode};
use crate::vm::{Outcome, RuntimeState};

/// The trivial module every embedding loads first: one instruction,
/// `TERMINATE 0`, named `$null` (`original_source/src/main.cpp::main`).
/// It exists so program address `(0, 0)` is always a safe, well-defined
/// target — the zero value of a `ProgramAddress`.
pub fn bootstrap_module() -> Module {
    let mut m = Module::new("$null");
    m.text.push(Instruction::a_only(Opcode::Terminate, 0));
    m
}

pub struct LoadResult {
    pub module_index: Option<u16>,
    pub messages: Vec<CompileMessage>,
}

impl RuntimeState {
    /// Appends an already-built module (from the assembler, the
    /// compiler, or a binary file) and returns its index. Modules are
    /// never removed or replaced (spec.md §3 "Runtime state" invariant:
    /// append-only).
    pub fn load_module(&mut self, module: Module) -> u16 {
        let index = self.modules.len() as u16;
        self.modules.push(module);
        index
    }

    /// Compiles `source` as a script and loads the result, mirroring
    /// `state::load(name, istream)` (spec.md §4.5). Returns no module
    /// index when compilation produced any error-severity message.
    pub fn load_source(&mut self, name: &str, source: &str) -> LoadResult {
        let result = compiler::compile(name, source);
        if crate::messages::has_errors(&result.messages) {
            return LoadResult { module_index: None, messages: result.messages };
        }
        let index = self.load_module(result.module);
        LoadResult { module_index: Some(index), messages: result.messages }
    }

    /// Reads a module previously written by `mfasm`/`mfsc` (spec.md §6)
    /// and loads it.
    pub fn load_binary(&mut self, name: &str, bytes: &[u8]) -> io::Result<u16> {
        let module = binformat::module_from_bytes(bytes, name)?;
        Ok(self.load_module(module))
    }

    /// Assembles `source` as textual assembly and loads the result, the
    /// `mfasm`-side counterpart to `load_source`.
    pub fn load_assembly(&mut self, name: &str, source: &str) -> LoadResult {
        let result = assembler::assemble(name, source);
        if crate::messages::has_errors(&result.messages) {
            return LoadResult { module_index: None, messages: result.messages };
        }
        let index = self.load_module(result.module);
        LoadResult { module_index: Some(index), messages: result.messages }
    }

    pub fn get_entry_point(&self, module_index: u16) -> u16 {
        self.modules[module_index as usize].entry_point
    }

    /// Runs a loaded module's entry point (spec.md §4.5 `state::execute`).
    pub fn execute(&mut self, module_index: u16, retval_byte_size: u16) -> Outcome {
        let entry = self.get_entry_point(module_index);
        self.interp(module_index, entry, retval_byte_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_module_terminates_cleanly() {
        let mut state = RuntimeState::new(1 << 16);
        let idx = state.load_module(bootstrap_module());
        let outcome = state.execute(idx, 0);
        assert_eq!(outcome, Outcome { code: 0, error: None });
    }

    #[test]
    fn modules_are_assigned_sequential_indices() {
        let mut state = RuntimeState::new(1 << 16);
        let a = state.load_module(bootstrap_module());
        let b = state.load_module(bootstrap_module());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn load_source_with_a_syntax_error_reports_messages_and_no_index() {
        let mut state = RuntimeState::new(1 << 16);
        let result = state.load_source("broken", "fn main( { return }");
        assert!(result.module_index.is_none());
        assert!(!result.messages.is_empty());
    }
}
