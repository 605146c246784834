// Moonflower: a small embeddable scripting language.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Runs a compiled bytecode module, mirroring `original_source/src/
//! main.cpp`'s `$null`/`load_core`/`disass`-less steady-state path: load
//! the bootstrap module, load the `print_i` native demo module, load
//! every module named on the command line (dependencies first, the
//! entry module last), then execute the entry module's entry point.

use std::env;
use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};

use moonflower::state::bootstrap_module;
use moonflower::types::{Instruction, Module, Opcode};
use moonflower::vm::{Frame, HostContext, RuntimeState};

const STACK_SIZE: usize = 64 * 1024 * 1024;

/// `original_source/src/main.cpp::print_i`: reads its one `int` argument
/// and prints it. Native functions are infallible by ABI, so this can
/// only misbehave by panicking on a malformed frame, never by returning
/// an error.
fn print_i(_ctx: &HostContext, frame: &mut Frame) {
    println!("print_i: {}", frame.read_i32(8));
}

/// `original_source/src/main.cpp::cfunc_to_mf` packs a native function
/// pointer into a tiny wrapper module (`CFCALL; RET`) and exports it by
/// name. We do the same with a registry id instead of a raw pointer.
fn load_core(state: &mut RuntimeState) -> u16 {
    let id = state.natives.register(print_i);

    let mut m = Module::new("print");
    let data_off = m.data.len() as i16;
    m.data.extend_from_slice(&id.to_le_bytes());
    let text_loc = m.text.len() as u16;
    m.text.push(Instruction::a_only(Opcode::CfCall, data_off));
    m.text.push(Instruction::bare(Opcode::Ret));
    m.exports.insert("print_i".to_string(), text_loc);

    state.load_module(m)
}

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: mfrun <bytecode_file> [module...]");
        return Ok(ExitCode::FAILURE);
    }

    let mut state = RuntimeState::new(STACK_SIZE);
    state.load_module(bootstrap_module());
    load_core(&mut state);

    // Dependencies named after the entry file load first, so any
    // cross-module addresses the entry module's data section embeds
    // (spec.md §4.5) refer to module indices that already exist.
    for dep in &args[2..] {
        load_binary_file(&mut state, dep)?;
    }

    let entry_index = load_binary_file(&mut state, &args[1])?;
    let outcome = state.execute(entry_index, std::mem::size_of::<i32>() as u16);

    match outcome.error {
        Some(e) => {
            eprintln!("error: terminated: {}", e);
            Ok(ExitCode::FAILURE)
        }
        None => {
            println!("result (i) = {}", state.read_result_i32());
            if outcome.code != 0 {
                eprintln!("error: terminated: {}", outcome.code);
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_binary_file(state: &mut RuntimeState, path: &str) -> Result<u16> {
    let bytes = fs::read(path).with_context(|| format!("failed to open file: {}", path))?;
    state.load_binary(path, &bytes).with_context(|| format!("malformed module {}", path))
}
