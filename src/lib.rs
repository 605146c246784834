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

pub mod assembler;
pub mod binformat;
pub mod compiler;
pub mod messages;
pub mod natives;
pub mod state;
pub mod types;
pub mod vm;

pub use messages::{CompileMessage, Severity, SourceLocation};
pub use types::{Instruction, Module, Opcode, ProgramAddress};
pub use vm::RuntimeState;
