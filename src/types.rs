//! Component A: instruction encoding, the compile-time type graph, and
//! the on-disk module record.
//!
//! Grounded on `original_source/src/types.hpp` (instruction/value layout)
//! and `original_source/src/script_context.hpp` (`expression`/`object`/
//! `binop_def`) for shape, reconciled with the final opcode set visible
//! in `original_source/src/main.cpp::disass` and `mfdisass.cpp` (the
//! `types.hpp` snapshot in the pack is an early draft per spec.md §9a/b;
//! the disassembler's `switch` is the authoritative, final opcode list).
//! The VM dispatch style (a plain `match` over a C-like enum, frame
//! bookkeeping as a small `Copy` struct) follows `emdash-udashboard`'s
//! `vm.rs` `Opcode`/`StackFrame`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::rc::Rc;

/// Size in bytes of the return-linkage block at the base of every frame:
/// a `ProgramAddress` (4 bytes) followed by a 2-byte stack displacement,
/// padded to 8 bytes (spec.md §3, "Frame layout").
pub const LINKAGE_SIZE: usize = 8;
pub const OFF_RET_ADDR: usize = 0;
pub const OFF_RET_STACK: usize = 4;

/// `(module_index, text_offset)` — identifies a single instruction,
/// possibly in another module (spec.md §3, "Program address").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProgramAddress {
    pub module_index: u16,
    pub text_offset: u16,
}

impl ProgramAddress {
    pub const SIZE: usize = 4;

    pub fn new(module_index: u16, text_offset: u16) -> Self {
        ProgramAddress { module_index, text_offset }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0..2].copy_from_slice(&self.module_index.to_le_bytes());
        out[2..4].copy_from_slice(&self.text_offset.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        ProgramAddress {
            module_index: u16::from_le_bytes([bytes[0], bytes[1]]),
            text_offset: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// The canonical opcode list (spec.md §3). Explicitly excludes `CFLOAD`:
/// spec.md §9b resolves the draft's two `CFLOAD` encodings by removing it
/// entirely — native pointers live in module data and `CFCALL`'s `A`
/// operand is the data offset directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Terminate = 0,
    ISetC = 1,
    FSetC = 2,
    BSetC = 3,
    SetAdr = 4,
    SetDat = 5,
    Cpy = 6,
    IAdd = 7,
    ISub = 8,
    IMul = 9,
    IDiv = 10,
    IClt = 11,
    IAddC = 12,
    ICltC = 13,
    FAdd = 14,
    FSub = 15,
    FMul = 16,
    FDiv = 17,
    Jmp = 18,
    JmpIfN = 19,
    Call = 20,
    Ret = 21,
    CfCall = 22,
    PfCall = 23,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        use Opcode::*;
        Ok(match v {
            0 => Terminate,
            1 => ISetC,
            2 => FSetC,
            3 => BSetC,
            4 => SetAdr,
            5 => SetDat,
            6 => Cpy,
            7 => IAdd,
            8 => ISub,
            9 => IMul,
            10 => IDiv,
            11 => IClt,
            12 => IAddC,
            13 => ICltC,
            14 => FAdd,
            15 => FSub,
            16 => FMul,
            17 => FDiv,
            18 => Jmp,
            19 => JmpIfN,
            20 => Call,
            21 => Ret,
            22 => CfCall,
            23 => PfCall,
            _ => return Err(()),
        })
    }
}

/// One payload interpretation of an instruction's trailing 32 bits
/// (spec.md §3). Constructed by whichever emitter knows the opcode's
/// shape; `Instruction` stores the raw bytes so the 8-byte, little-endian,
/// on-disk layout is exact regardless of which view was used to build it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Payload {
    Bc { b: i16, c: i16 },
    Di(i32),
    Df(f32),
    Db(bool),
}

impl Payload {
    fn to_bytes(self) -> [u8; 4] {
        match self {
            Payload::Bc { b, c } => {
                let mut out = [0u8; 4];
                out[0..2].copy_from_slice(&b.to_le_bytes());
                out[2..4].copy_from_slice(&c.to_le_bytes());
                out
            }
            Payload::Di(v) => v.to_le_bytes(),
            Payload::Df(v) => v.to_le_bytes(),
            Payload::Db(v) => {
                let mut out = [0u8; 4];
                out[0] = v as u8;
                out
            }
        }
    }
}

/// Fixed 8-byte instruction record: `(op, reserved, A, payload)`
/// (spec.md §3). Encoding is little-endian and stable on disk.
#[derive(Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: i16,
    payload: [u8; 4],
}

impl Instruction {
    pub const SIZE: usize = 8;

    pub fn new(op: Opcode, a: i16, payload: Payload) -> Self {
        Instruction { op, a, payload: payload.to_bytes() }
    }

    pub fn bare(op: Opcode) -> Self {
        Instruction::new(op, 0, Payload::Di(0))
    }

    pub fn a_only(op: Opcode, a: i16) -> Self {
        Instruction::new(op, a, Payload::Di(0))
    }

    pub fn abc(op: Opcode, a: i16, b: i16, c: i16) -> Self {
        Instruction::new(op, a, Payload::Bc { b, c })
    }

    pub fn adi(op: Opcode, a: i16, di: i32) -> Self {
        Instruction::new(op, a, Payload::Di(di))
    }

    pub fn adf(op: Opcode, a: i16, df: f32) -> Self {
        Instruction::new(op, a, Payload::Df(df))
    }

    pub fn adb(op: Opcode, a: i16, db: bool) -> Self {
        Instruction::new(op, a, Payload::Db(db))
    }

    pub fn b(&self) -> i16 {
        i16::from_le_bytes([self.payload[0], self.payload[1]])
    }

    pub fn c(&self) -> i16 {
        i16::from_le_bytes([self.payload[2], self.payload[3]])
    }

    pub fn di(&self) -> i32 {
        i32::from_le_bytes(self.payload)
    }

    pub fn df(&self) -> f32 {
        f32::from_le_bytes(self.payload)
    }

    pub fn db(&self) -> bool {
        self.payload[0] != 0
    }

    /// Overwrite the `DI` payload in place. Used by the assembler and
    /// compiler to patch forward-referenced jump targets (spec.md
    /// §4.2.3 `set_jmp`, §4.3 `add_label`).
    pub fn set_di(&mut self, di: i32) {
        self.payload = di.to_le_bytes();
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.op as u8;
        out[1] = 0; // reserved
        out[2..4].copy_from_slice(&self.a.to_le_bytes());
        out[4..8].copy_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let op = Opcode::try_from(bytes[0]).ok()?;
        let a = i16::from_le_bytes([bytes[2], bytes[3]]);
        let mut payload = [0u8; 4];
        payload.copy_from_slice(&bytes[4..8]);
        Some(Instruction { op, a, payload })
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Opcode::*;
        match self.op {
            Terminate => write!(f, "terminate {}", self.a),
            IAdd | ISub | IMul | IDiv | IClt | FAdd | FSub | FMul | FDiv | Cpy | SetDat => {
                write!(f, "{:?} {}, {}, {}", self.op, self.a, self.b(), self.c())
            }
            IAddC | ICltC => write!(f, "{:?} {}, {}, #{}", self.op, self.a, self.b(), self.c()),
            ISetC | SetAdr | JmpIfN => write!(f, "{:?} {}, {}", self.op, self.a, self.di()),
            FSetC => write!(f, "{:?} {}, {}", self.op, self.a, self.df()),
            BSetC => write!(f, "{:?} {}, {}", self.op, self.a, self.db()),
            Jmp => write!(f, "jmp {}", self.di()),
            Call | PfCall => write!(f, "{:?} {}, {}", self.op, self.a, self.b()),
            Ret => write!(f, "ret"),
            CfCall => write!(f, "cfcall {}", self.a),
        }
    }
}

/// On-disk module: name plus what the loader needs to link and the VM
/// needs to run (spec.md §3 "Module"). Import/data sections beyond what
/// the compiler itself emits are carried in memory only — the binary
/// format (spec.md §6) reserves them for a future revision, matching
/// `original_source/src/mfasm.cpp`'s writer.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub text: Vec<Instruction>,
    pub data: Vec<u8>,
    pub exports: HashMap<String, u16>,
    pub imports: HashMap<String, Vec<(String, u16)>>,
    pub entry_point: u16,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module { name: name.into(), ..Default::default() }
    }
}

// ---------------------------------------------------------------------
// Compile-time type graph (spec.md §3 "Type graph").
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionSignature {
    pub params: Vec<Type>,
    pub ret: Type,
}

/// A host-declared struct type: size, alignment, fields, and the
/// operator-overload table consulted by `Type::get_binop` (spec.md §4.1).
///
/// `binops` sits behind a `RefCell` because an operator's `rhs_type` is
/// often the very `Type::User(Rc<UserType>)` being built (`int + int`):
/// the table has to be populated after the `Rc` exists, not while it's
/// being constructed (`original_source/src/compile.cpp` does the same
/// two-step "declare the type, then register its operators" dance).
pub struct UserType {
    pub name: String,
    pub size: u16,
    pub align: u16,
    pub fields: HashMap<String, (u16, Type)>,
    pub binops: RefCell<HashMap<BinOpKind, Vec<BinOpDef>>>,
    pub copy_emitter: fn(&mut Vec<Instruction>, dest: i16, src: i16, size: u16),
    pub coerce_to_bool: Option<fn(&mut Vec<Instruction>, dest: i16, src: i16) -> ()>,
}

impl fmt::Debug for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserType").field("name", &self.name).field("size", &self.size).finish()
    }
}

/// One overload of a binary operator on a usertype: the RHS type it
/// accepts, the result type, and the code-emission thunks (spec.md §3,
/// "Type graph"; rationale for the function-pointer shape in spec.md §9,
/// "Closure-of-functor emitters").
#[derive(Clone)]
pub struct BinOpDef {
    pub rhs_type: Type,
    pub result_type: Type,
    pub emit_general: fn(&mut Vec<Instruction>, dest: i16, lhs: i16, rhs: i16),
    pub emit_const_i16: Option<fn(&mut Vec<Instruction>, dest: i16, lhs: i16, imm: i16)>,
}

/// The compile-time type tag (spec.md §3). `Nothing`/`Function` carry no
/// payload worth boxing; `FunctionPtr`/`User` are reference-shared so
/// `Type` stays cheap to clone while equality can still be structural
/// (functions) or by identity (usertypes, per spec.md §3 "Type graph").
#[derive(Clone, Debug)]
pub enum Type {
    Nothing,
    Function(Rc<FunctionSignature>),
    FunctionPtr(Rc<FunctionSignature>),
    User(Rc<UserType>),
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Nothing, Type::Nothing) => true,
            (Type::Function(a), Type::Function(b)) => a == b,
            (Type::FunctionPtr(a), Type::FunctionPtr(b)) => a == b,
            (Type::User(a), Type::User(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Type {
    /// Zero for `Nothing`/`Function`; 4 for `FunctionPtr` (a stored
    /// `ProgramAddress`); host-declared for `User` (spec.md §4.1).
    pub fn size(&self) -> u16 {
        match self {
            Type::Nothing => 0,
            Type::Function(_) => 0,
            Type::FunctionPtr(_) => ProgramAddress::SIZE as u16,
            Type::User(u) => u.size,
        }
    }

    pub fn align(&self) -> u16 {
        match self {
            Type::Nothing => 1,
            Type::Function(_) => 1,
            Type::FunctionPtr(_) => ProgramAddress::SIZE as u16,
            Type::User(u) => u.align,
        }
    }

    pub fn as_user(&self) -> Option<&Rc<UserType>> {
        match self {
            Type::User(u) => Some(u),
            _ => None,
        }
    }

    /// Linear scan of `lhs`'s overload list for the first entry whose
    /// RHS type structurally matches `rhs` (spec.md §4.1 `get_binop`).
    /// Returns an owned copy since the table lives behind a `RefCell`.
    pub fn get_binop(op: &BinOpKind, lhs: &UserType, rhs: &Type) -> Option<BinOpDef> {
        lhs.binops.borrow().get(op)?.iter().find(|def| &def.rhs_type == rhs).cloned()
    }
}

/// Whether a compile-time expression result lives at a durable address
/// (`Object`, e.g. a local) or may be relocated freely (`Expiring`, a
/// freshly produced temporary) — spec.md §3 "Compile-time expression",
/// glossary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Object,
    Expiring,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_round_trips_through_bytes() {
        let i = Instruction::abc(Opcode::IAdd, 8, 0, 4);
        let bytes = i.to_bytes();
        let back = Instruction::from_bytes(&bytes).unwrap();
        assert_eq!(i, back);
        assert_eq!(back.b(), 0);
        assert_eq!(back.c(), 4);
    }

    #[test]
    fn di_payload_round_trips_negative() {
        let mut i = Instruction::adi(Opcode::Jmp, 0, -3);
        assert_eq!(i.di(), -3);
        i.set_di(5);
        assert_eq!(i.di(), 5);
    }

    #[test]
    fn program_address_round_trips_through_bytes() {
        let addr = ProgramAddress::new(3, 1000);
        let bytes = addr.to_bytes();
        assert_eq!(ProgramAddress::from_bytes(&bytes), addr);
    }

    #[test]
    fn invalid_opcode_byte_is_rejected() {
        assert!(Opcode::try_from(200u8).is_err());
    }

    #[test]
    fn usertype_identity_equality() {
        let a = Rc::new(UserType {
            name: "int".into(),
            size: 4,
            align: 4,
            fields: HashMap::new(),
            binops: RefCell::new(HashMap::new()),
            copy_emitter: |_, _, _, _| {},
            coerce_to_bool: None,
        });
        let b = Rc::new(UserType {
            name: "int".into(),
            size: 4,
            align: 4,
            fields: HashMap::new(),
            binops: RefCell::new(HashMap::new()),
            copy_emitter: |_, _, _, _| {},
            coerce_to_bool: None,
        });
        assert_ne!(Type::User(a.clone()), Type::User(b));
        assert_eq!(Type::User(a.clone()), Type::User(a));
    }
}
