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

//! Compiles a `.mf` script into the on-disk binary module format,
//! mirroring `original_source/src/mfsc.cpp`'s argument and exit-code
//! contract.

use std::env;
use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};

use moonflower::binformat;
use moonflower::compiler;

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
    if args.len() != 3 {
        eprintln!("usage: mfsc <source> <out>");
        return Ok(ExitCode::FAILURE);
    }

    let source = fs::read_to_string(&args[1])
        .with_context(|| format!("failed to open file: {}", args[1]))?;

    let name = &args[1];
    let result = compiler::compile(name, &source);
    for msg in &result.messages {
        eprintln!("{}", msg);
    }
    if moonflower::messages::has_errors(&result.messages) {
        return Ok(ExitCode::FAILURE);
    }

    let bytes = binformat::module_to_bytes(&result.module).context("failed to encode module")?;
    fs::write(&args[2], bytes).with_context(|| format!("failed to write to file: {}", args[2]))?;

    Ok(ExitCode::SUCCESS)
}
