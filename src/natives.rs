//! Native call-out: the host-language (Rust) side of `CFCALL`/`PFCALL`.
//!
//! `original_source/src/main.cpp::cfunc_to_mf` packs a raw C function
//! pointer into a module's data section and has `CFCALL` read it back by
//! offset. A raw pointer has no stable meaning across a safe-Rust module
//! boundary (spec.md §9c flags this as an open question), so Moonflower
//! stores a `u32` index into a `NativeRegistry` owned by `RuntimeState`
//! instead — same wire shape (a fixed-width id read from `data` at a
//! fixed offset), Rust-safe implementation. See DESIGN.md.

use crate::types::ProgramAddress;
use crate::vm::NativeFn;

#[derive(Default)]
pub struct NativeRegistry {
    fns: Vec<NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry { fns: Vec::new() }
    }

    pub fn register(&mut self, f: NativeFn) -> u32 {
        self.fns.push(f);
        (self.fns.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<NativeFn> {
        self.fns.get(id as usize).copied()
    }
}

/// A callable that may be either a Moonflower function or a native one,
/// dispatched by `PFCALL` on its tag (spec.md §3 "Polyfunc", §9 "Polymorphic
/// dispatch"). Laid out in a fixed-size byte slot so it can live in module
/// data or a frame the same way any other value does.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PolyFunc {
    Script(ProgramAddress),
    Native(u32),
}

impl PolyFunc {
    /// 16 bytes: 1 tag byte (padded to 4 for alignment) + 4-byte
    /// `ProgramAddress` slot + 4-byte native id slot + padding, per the
    /// "16-byte slot" called for in spec.md §9 "Polymorphic dispatch".
    pub const SIZE: usize = 16;

    const TAG_SCRIPT: u8 = 0;
    const TAG_NATIVE: u8 = 1;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        match self {
            PolyFunc::Script(addr) => {
                out[0] = Self::TAG_SCRIPT;
                out[4..8].copy_from_slice(&addr.to_bytes());
            }
            PolyFunc::Native(id) => {
                out[0] = Self::TAG_NATIVE;
                out[8..12].copy_from_slice(&id.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes[0] {
            Self::TAG_NATIVE => {
                PolyFunc::Native(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]))
            }
            _ => PolyFunc::Script(ProgramAddress::from_bytes(&bytes[4..8])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Frame, HostContext};

    #[test]
    fn polyfunc_round_trips_script_variant() {
        let pf = PolyFunc::Script(ProgramAddress::new(2, 40));
        assert_eq!(PolyFunc::from_bytes(&pf.to_bytes()), pf);
    }

    #[test]
    fn polyfunc_round_trips_native_variant() {
        let pf = PolyFunc::Native(7);
        assert_eq!(PolyFunc::from_bytes(&pf.to_bytes()), pf);
    }

    #[test]
    fn registry_assigns_sequential_ids() {
        fn noop(_: &HostContext, _: &mut Frame) {}
        let mut reg = NativeRegistry::new();
        assert_eq!(reg.register(noop), 0);
        assert_eq!(reg.register(noop), 1);
        assert!(reg.get(0).is_some());
        assert!(reg.get(2).is_none());
    }
}
