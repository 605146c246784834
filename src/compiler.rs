//! Component D: the single-pass script compiler.
//!
//! Grounded on `original_source/src/script_context.hpp`: one pass over
//! the token stream drives semantic actions directly (`push_object`,
//! `expr_binop`, `emit_if`, ...) with no intermediate AST. `ScriptContext`
//! here plays the role `script_context` plays there — it owns the
//! growing instruction buffer, the local-variable layout for whichever
//! function is currently being emitted, and the built-in `int`/`float`/
//! `bool` usertypes bootstrapped the way `original_source/src/
//! compile.cpp` wires `int`'s `+ - * /` operators to `binop_def`
//! emitters (spec.md §5 "Supplemented features").
//!
//! Register/slot reuse (the original's `local_stack`/`expr_stack`
//! push/pop discipline) is simplified here to monotonic allocation: every
//! temporary gets a fresh slot and nothing is reclaimed until the
//! function's locals are torn down. Functions stay small in practice, so
//! this trades some stack space for a much smaller, easier-to-verify
//! compiler. See DESIGN.md.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::messages::{CompileMessage, SourceLocation};
use crate::types::{
    BinOpDef, BinOpKind, FunctionSignature, Instruction as Insn, Module, Opcode, Type, UserType,
};

mod lexer;

use lexer::{Token, TokenKind};

pub struct CompileResult {
    pub module: Module,
    pub messages: Vec<CompileMessage>,
}

/// Compiles one source file into one module, the way
/// `original_source/src/state.hpp`'s `state::load(name, istream)` treats
/// a script: it always becomes exactly one module, whose `main` export
/// (if present) is the module's entry point.
pub fn compile(name: &str, source: &str) -> CompileResult {
    let mut ctx = ScriptContext::new(name);
    ctx.compile_program(source);
    ctx.finish()
}

#[derive(Clone)]
struct Local {
    offset: i16,
    ty: Type,
}

struct FunctionDecl {
    sig: Rc<FunctionSignature>,
    text_offset: Option<u16>, // known only after the function body is emitted
}

/// A deferred fixup: the instruction at `instr_index` (in the module's
/// final, concatenated text) needs its `DI` payload set to the text
/// offset `target_fn` ends up at. Mirrors `asm_context::label_todo`
/// (`original_source/src/asm_context.hpp`), applied to call targets
/// instead of assembly labels.
#[derive(Clone)]
struct CallFixup {
    instr_index: usize,
    target_fn: String,
}

struct ScriptContext {
    module_name: String,
    messages: Vec<CompileMessage>,
    int_ty: Type,
    float_ty: Type,
    bool_ty: Type,
    functions: HashMap<String, FunctionDecl>,
    function_order: Vec<String>,
    function_bodies: HashMap<String, Vec<Insn>>,
    fixups: Vec<(String, Vec<CallFixup>)>, // (function whose body holds these, fixups)
    exports: Vec<String>,
}

impl ScriptContext {
    fn new(module_name: &str) -> Self {
        let (int_ty, float_ty, bool_ty) = bootstrap_builtins();
        ScriptContext {
            module_name: module_name.to_string(),
            messages: Vec::new(),
            int_ty,
            float_ty,
            bool_ty,
            functions: HashMap::new(),
            function_order: Vec::new(),
            function_bodies: HashMap::new(),
            fixups: Vec::new(),
            exports: Vec::new(),
        }
    }

    fn error(&mut self, text: impl Into<String>, loc: SourceLocation) {
        self.messages.push(CompileMessage::error(text, loc));
    }

    fn type_named(&self, name: &str) -> Option<Type> {
        match name {
            "int" => Some(self.int_ty.clone()),
            "float" => Some(self.float_ty.clone()),
            "bool" => Some(self.bool_ty.clone()),
            "" => Some(Type::Nothing),
            _ => None,
        }
    }

    fn compile_program(&mut self, source: &str) {
        let tokens = lexer::lex(source);
        let mut p = Parser { tokens, pos: 0 };

        // Pass 1: register every function's signature up front, so a
        // call to a function defined later in the file resolves.
        let mut starts = Vec::new();
        while !p.at_eof() {
            let start = p.pos;
            if !p.eat_keyword("fn") {
                self.error("expected 'fn'", p.loc());
                break;
            }
            let name = match p.expect_ident() {
                Some(n) => n,
                None => break,
            };
            let params = self.parse_param_types(&mut p);
            let ret = if p.eat(TokenKind::Arrow) {
                let tn = p.expect_ident().unwrap_or_default();
                self.type_named(&tn).unwrap_or(Type::Nothing)
            } else {
                Type::Nothing
            };
            p.skip_balanced_block();
            if self.functions.contains_key(&name) {
                self.error(format!("function '{}' already defined", name), p.loc());
            } else {
                self.function_order.push(name.clone());
                self.functions.insert(
                    name,
                    FunctionDecl { sig: Rc::new(FunctionSignature { params, ret }), text_offset: None },
                );
            }
            starts.push(start);
        }

        // Pass 2: emit each body against the now-complete function table.
        let names = self.function_order.clone();
        for name in names {
            p.pos = starts[self.function_order.iter().position(|n| n == &name).unwrap()];
            self.compile_function(&mut p, &name);
        }
    }

    fn parse_param_types(&mut self, p: &mut Parser) -> Vec<Type> {
        let mut out = Vec::new();
        p.expect(TokenKind::LParen);
        if !p.check(TokenKind::RParen) {
            loop {
                p.expect_ident(); // param name, unused in this pass
                p.expect(TokenKind::Colon);
                let tn = p.expect_ident().unwrap_or_default();
                out.push(self.type_named(&tn).unwrap_or(Type::Nothing));
                if !p.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        p.expect(TokenKind::RParen);
        out
    }

    fn compile_function(&mut self, p: &mut Parser, name: &str) {
        p.eat_keyword("fn");
        p.expect_ident();
        p.expect(TokenKind::LParen);

        let mut locals: HashMap<String, Local> = HashMap::new();
        // `[0, LINKAGE_SIZE)` of every frame is the return-address/
        // displacement pair `push_linkage` writes (spec.md §3 invariant
        // 1); params and locals live above it, for every function
        // including the entry function (vm.rs's `interp` no longer shifts
        // the bootstrap frame separately).
        let mut top: i16 = crate::types::LINKAGE_SIZE as i16;
        if !p.check(TokenKind::RParen) {
            loop {
                let pname = p.expect_ident().unwrap_or_default();
                p.expect(TokenKind::Colon);
                let tn = p.expect_ident().unwrap_or_default();
                let ty = self.type_named(&tn).unwrap_or(Type::Nothing);
                let size = ty.size() as i16;
                locals.insert(pname, Local { offset: top, ty });
                top += size.max(1);
                if !p.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        p.expect(TokenKind::RParen);
        let ret_ty = if p.eat(TokenKind::Arrow) {
            let tn = p.expect_ident().unwrap_or_default();
            self.type_named(&tn).unwrap_or(Type::Nothing)
        } else {
            Type::Nothing
        };

        let mut body = FunctionBody { ctx: self, locals, top, ret_ty, code: Vec::new(), fixups: Vec::new() };
        body.compile_block(p);
        body.code.push(Insn::bare(Opcode::Ret));

        let code = body.code;
        let fixups = body.fixups;
        self.function_bodies.insert(name.to_string(), code);
        self.fixups.push((name.to_string(), fixups));
    }

    fn finish(mut self) -> CompileResult {
        let mut module = Module::new(self.module_name.clone());
        let mut offsets = HashMap::new();
        for name in &self.function_order {
            offsets.insert(name.clone(), module.text.len() as u16);
            if let Some(decl) = self.functions.get_mut(name) {
                decl.text_offset = Some(module.text.len() as u16);
            }
            if let Some(body) = self.function_bodies.remove(name) {
                module.text.extend(body);
            }
        }

        let all_fixups = self.fixups.clone();
        for (owner, fixups) in &all_fixups {
            let base = *offsets.get(owner).unwrap_or(&0) as usize;
            for fix in fixups {
                let abs_index = base + fix.instr_index;
                match offsets.get(&fix.target_fn) {
                    Some(target) => module.text[abs_index].set_di(*target as i32),
                    None => self.error(format!("undefined function '{}'", fix.target_fn), SourceLocation::default()),
                }
            }
        }

        for name in &self.function_order {
            if let Some(offset) = offsets.get(name) {
                module.exports.insert(name.clone(), *offset);
            }
        }
        if let Some(&main_offset) = offsets.get("main") {
            module.entry_point = main_offset;
        }

        CompileResult { module, messages: self.messages }
    }
}

// ---------------------------------------------------------------------
// Built-in usertypes (spec.md §5, grounded on
// `original_source/src/compile.cpp`'s bootstrapping of `int`).
// ---------------------------------------------------------------------

/// Builds `int`, `float`, and `bool` as two-phase usertypes: each `Rc`
/// is created with an empty operator table, then the tables are filled
/// in referencing the real, now-existing `Type::User` handles — matching
/// `original_source/src/compile.cpp`'s own "declare the type, then wire
/// its operators" order, necessary here because `int + int`'s RHS type
/// has to be `int` itself and `Type::User` equality is by `Rc` identity.
fn bootstrap_builtins() -> (Type, Type, Type) {
    let int_ut = Rc::new(UserType {
        name: "int".to_string(),
        size: 4,
        align: 4,
        fields: HashMap::new(),
        binops: RefCell::new(HashMap::new()),
        copy_emitter: |code, dest, src, size| code.push(Insn::abc(Opcode::Cpy, dest, src, size as i16)),
        coerce_to_bool: None,
    });
    let float_ut = Rc::new(UserType {
        name: "float".to_string(),
        size: 4,
        align: 4,
        fields: HashMap::new(),
        binops: RefCell::new(HashMap::new()),
        copy_emitter: |code, dest, src, size| code.push(Insn::abc(Opcode::Cpy, dest, src, size as i16)),
        coerce_to_bool: None,
    });
    let bool_ut = Rc::new(UserType {
        name: "bool".to_string(),
        size: 1,
        align: 1,
        fields: HashMap::new(),
        binops: RefCell::new(HashMap::new()),
        copy_emitter: |code, dest, src, _size| code.push(Insn::abc(Opcode::Cpy, dest, src, 1)),
        coerce_to_bool: Some(|code, dest, src| code.push(Insn::abc(Opcode::Cpy, dest, src, 1))),
    });

    let int_ty = Type::User(int_ut.clone());
    let float_ty = Type::User(float_ut.clone());
    let bool_ty = Type::User(bool_ut.clone());

    {
        let mut binops = int_ut.binops.borrow_mut();
        binops.insert(
            BinOpKind::Add,
            vec![BinOpDef {
                rhs_type: int_ty.clone(),
                result_type: int_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::IAdd, dest, lhs, rhs)),
                emit_const_i16: Some(|code, dest, lhs, imm| code.push(Insn::abc(Opcode::IAddC, dest, lhs, imm))),
            }],
        );
        binops.insert(
            BinOpKind::Sub,
            vec![BinOpDef {
                rhs_type: int_ty.clone(),
                result_type: int_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::ISub, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Mul,
            vec![BinOpDef {
                rhs_type: int_ty.clone(),
                result_type: int_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::IMul, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Div,
            vec![BinOpDef {
                rhs_type: int_ty.clone(),
                result_type: int_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::IDiv, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Lt,
            vec![BinOpDef {
                rhs_type: int_ty.clone(),
                result_type: bool_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::IClt, dest, lhs, rhs)),
                emit_const_i16: Some(|code, dest, lhs, imm| code.push(Insn::abc(Opcode::ICltC, dest, lhs, imm))),
            }],
        );
    }

    {
        let mut binops = float_ut.binops.borrow_mut();
        binops.insert(
            BinOpKind::Add,
            vec![BinOpDef {
                rhs_type: float_ty.clone(),
                result_type: float_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::FAdd, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Sub,
            vec![BinOpDef {
                rhs_type: float_ty.clone(),
                result_type: float_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::FSub, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Mul,
            vec![BinOpDef {
                rhs_type: float_ty.clone(),
                result_type: float_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::FMul, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
        binops.insert(
            BinOpKind::Div,
            vec![BinOpDef {
                rhs_type: float_ty.clone(),
                result_type: float_ty.clone(),
                emit_general: |code, dest, lhs, rhs| code.push(Insn::abc(Opcode::FDiv, dest, lhs, rhs)),
                emit_const_i16: None,
            }],
        );
    }

    (int_ty, float_ty, bool_ty)
}

// ---------------------------------------------------------------------
// Token-stream cursor.
// ---------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_eof(&self) -> bool {
        matches!(self.tokens.get(self.pos).map(|t| &t.kind), None | Some(TokenKind::Eof))
    }

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens.get(self.pos + offset).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn loc(&self) -> SourceLocation {
        self.tokens.get(self.pos).map(|t| t.loc).unwrap_or_default()
    }

    fn check(&self, kind: TokenKind) -> bool {
        *self.peek() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.eat(kind.clone()) {
            true
        } else {
            self.pos += 1;
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if let TokenKind::Ident(name) = self.peek() {
            if name == word {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_ident(&mut self) -> Option<String> {
        if let TokenKind::Ident(name) = self.peek().clone() {
            self.pos += 1;
            Some(name)
        } else {
            None
        }
    }

    /// Skips a `{ ... }` block with balanced-brace counting, used during
    /// the signature-scanning pass so the body's tokens don't confuse it.
    fn skip_balanced_block(&mut self) {
        if !self.eat(TokenKind::LBrace) {
            return;
        }
        let mut depth = 1;
        while depth > 0 && !self.at_eof() {
            match self.peek() {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }
    }
}

// ---------------------------------------------------------------------
// Per-function body emission.
// ---------------------------------------------------------------------

struct FunctionBody<'a> {
    ctx: &'a mut ScriptContext,
    locals: HashMap<String, Local>,
    top: i16,
    ret_ty: Type,
    code: Vec<Insn>,
    fixups: Vec<CallFixup>,
}

struct Value {
    offset: i16,
    ty: Type,
}

impl<'a> FunctionBody<'a> {
    fn alloc(&mut self, ty: Type) -> Value {
        let size = ty.size() as i16;
        let align = ty.align().max(1) as i16;
        let aligned = ((self.top + align - 1) / align) * align;
        self.top = aligned + size.max(1);
        Value { offset: aligned, ty }
    }

    fn compile_block(&mut self, p: &mut Parser) {
        p.expect(TokenKind::LBrace);
        while !p.check(TokenKind::RBrace) && !p.at_eof() {
            self.compile_stmt(p);
        }
        p.expect(TokenKind::RBrace);
    }

    fn compile_stmt(&mut self, p: &mut Parser) {
        if p.eat_keyword("let") {
            let name = p.expect_ident().unwrap_or_default();
            let declared_ty = if p.eat(TokenKind::Colon) {
                let tn = p.expect_ident().unwrap_or_default();
                self.ctx.type_named(&tn)
            } else {
                None
            };
            p.expect(TokenKind::Eq);
            let v = self.compile_expr(p);
            p.expect(TokenKind::Semi);
            let ty = declared_ty.unwrap_or(v.ty);
            self.locals.insert(name, Local { offset: v.offset, ty });
            return;
        }
        if p.eat_keyword("return") {
            if p.check(TokenKind::Semi) {
                p.eat(TokenKind::Semi);
                self.code.push(Insn::bare(Opcode::Ret));
                return;
            }
            let v = self.compile_expr(p);
            p.expect(TokenKind::Semi);
            let ret_size = self.ret_ty.size() as i16;
            self.code.push(Insn::abc(Opcode::Cpy, -ret_size, v.offset, ret_size));
            self.code.push(Insn::bare(Opcode::Ret));
            return;
        }
        if p.eat_keyword("if") {
            self.compile_if(p);
            return;
        }
        if p.eat_keyword("while") {
            self.compile_while(p);
            return;
        }
        if let TokenKind::Ident(name) = p.peek().clone() {
            if *p.peek_at(1) == TokenKind::Eq {
                self.compile_assignment(p, &name);
                return;
            }
        }
        let _ = self.compile_expr(p);
        p.expect(TokenKind::Semi);
    }

    /// `name = expr;` writes into the variable's existing slot with `CPY`
    /// rather than allocating a fresh one — the only way a `while` loop's
    /// condition can ever change between iterations, since locals are
    /// otherwise bound once by `let` and never reassigned.
    fn compile_assignment(&mut self, p: &mut Parser, name: &str) {
        p.pos += 1; // the identifier
        p.eat(TokenKind::Eq);
        let v = self.compile_expr(p);
        p.expect(TokenKind::Semi);
        match self.locals.get(name) {
            Some(local) => {
                let (offset, size) = (local.offset, local.ty.size() as i16);
                self.code.push(Insn::abc(Opcode::Cpy, offset, v.offset, size));
            }
            None => self.ctx.error(format!("undefined variable '{}'", name), p.loc()),
        }
    }

    /// `while (cond) { body }`: re-evaluates `cond` on every iteration. No
    /// loop construct exists in `original_source` to ground this on
    /// directly (`script_context.hpp` only emits `if`/`JMPIFN`), so this
    /// generalizes `compile_if`'s backpatching to a guard that re-checks
    /// itself via a back-edge `JMP` instead of falling through once.
    fn compile_while(&mut self, p: &mut Parser) {
        let guard_start = self.code.len();
        let cond = self.compile_expr(p);
        let jmpifn_index = self.code.len();
        self.code.push(Insn::adi(Opcode::JmpIfN, cond.offset, 0)); // patched below
        self.compile_block(p);

        let back_edge_index = self.code.len();
        let di = guard_start as i32 - (back_edge_index as i32 + 1);
        self.code.push(Insn::adi(Opcode::Jmp, 0, di));

        let end = self.code.len();
        self.patch_relative(jmpifn_index, end);
    }

    fn compile_if(&mut self, p: &mut Parser) {
        let cond = self.compile_expr(p);
        let jmpifn_index = self.code.len();
        self.code.push(Insn::adi(Opcode::JmpIfN, cond.offset, 0)); // patched below
        self.compile_block(p);

        if p.eat_keyword("else") {
            let jmp_index = self.code.len();
            self.code.push(Insn::adi(Opcode::Jmp, 0, 0)); // patched below
            let else_start = self.code.len();
            self.patch_relative(jmpifn_index, else_start);
            self.compile_block(p);
            let end = self.code.len();
            self.patch_relative(jmp_index, end);
        } else {
            let end = self.code.len();
            self.patch_relative(jmpifn_index, end);
        }
    }

    /// `JMP`/`JMPIFN`'s `DI` is relative to the instruction right after
    /// the jump (spec.md §4.3 `set_jmp`): `target - (jump_index + 1)`.
    fn patch_relative(&mut self, jump_index: usize, target: usize) {
        let di = target as i32 - (jump_index as i32 + 1);
        self.code[jump_index].set_di(di);
    }

    fn compile_expr(&mut self, p: &mut Parser) -> Value {
        self.compile_comparison(p)
    }

    fn compile_comparison(&mut self, p: &mut Parser) -> Value {
        let lhs = self.compile_additive(p);
        if p.eat(TokenKind::Lt) {
            let rhs = self.compile_additive(p);
            return self.emit_binop(BinOpKind::Lt, lhs, rhs, p.loc());
        }
        lhs
    }

    fn compile_additive(&mut self, p: &mut Parser) -> Value {
        let mut lhs = self.compile_multiplicative(p);
        loop {
            if p.eat(TokenKind::Plus) {
                let rhs = self.compile_multiplicative(p);
                lhs = self.emit_binop(BinOpKind::Add, lhs, rhs, p.loc());
            } else if p.eat(TokenKind::Minus) {
                let rhs = self.compile_multiplicative(p);
                lhs = self.emit_binop(BinOpKind::Sub, lhs, rhs, p.loc());
            } else {
                break;
            }
        }
        lhs
    }

    fn compile_multiplicative(&mut self, p: &mut Parser) -> Value {
        let mut lhs = self.compile_primary(p);
        loop {
            if p.eat(TokenKind::Star) {
                let rhs = self.compile_primary(p);
                lhs = self.emit_binop(BinOpKind::Mul, lhs, rhs, p.loc());
            } else if p.eat(TokenKind::Slash) {
                let rhs = self.compile_primary(p);
                lhs = self.emit_binop(BinOpKind::Div, lhs, rhs, p.loc());
            } else {
                break;
            }
        }
        lhs
    }

    /// Resolves the operator against `lhs`'s usertype table (spec.md
    /// §4.1 `get_binop`) and emits either the constant-folded or general
    /// form of whichever emitter thunk matched.
    fn emit_binop(&mut self, op: BinOpKind, lhs: Value, rhs: Value, loc: SourceLocation) -> Value {
        let user = match lhs.ty.as_user() {
            Some(u) => u.clone(),
            None => {
                self.ctx.error("left-hand side of a binary operator has no operators", loc);
                return Value { offset: lhs.offset, ty: lhs.ty };
            }
        };
        let def = match Type::get_binop(&op, &user, &rhs.ty) {
            Some(d) => d,
            None => {
                self.ctx.error(format!("no '{:?}' operator for these operand types", op), loc);
                return Value { offset: lhs.offset, ty: lhs.ty };
            }
        };
        let dest = self.alloc(def.result_type.clone());
        (def.emit_general)(&mut self.code, dest.offset, lhs.offset, rhs.offset);
        Value { offset: dest.offset, ty: def.result_type.clone() }
    }

    fn compile_primary(&mut self, p: &mut Parser) -> Value {
        if p.eat(TokenKind::LParen) {
            let v = self.compile_expr(p);
            p.expect(TokenKind::RParen);
            return v;
        }
        if let TokenKind::Int(n) = p.peek().clone() {
            p.pos += 1;
            let dest = self.alloc(self.ctx.int_ty.clone());
            self.code.push(Insn::adi(Opcode::ISetC, dest.offset, n));
            return dest;
        }
        if let TokenKind::Float(n) = p.peek().clone() {
            p.pos += 1;
            let dest = self.alloc(self.ctx.float_ty.clone());
            self.code.push(Insn::adf(Opcode::FSetC, dest.offset, n));
            return dest;
        }
        if p.eat_keyword("true") {
            let dest = self.alloc(self.ctx.bool_ty.clone());
            self.code.push(Insn::adb(Opcode::BSetC, dest.offset, true));
            return dest;
        }
        if p.eat_keyword("false") {
            let dest = self.alloc(self.ctx.bool_ty.clone());
            self.code.push(Insn::adb(Opcode::BSetC, dest.offset, false));
            return dest;
        }
        if let TokenKind::Ident(name) = p.peek().clone() {
            p.pos += 1;
            if p.check(TokenKind::LParen) {
                return self.compile_call(p, &name);
            }
            if let Some(local) = self.locals.get(&name) {
                return Value { offset: local.offset, ty: local.ty.clone() };
            }
            self.ctx.error(format!("undefined variable '{}'", name), p.loc());
            return self.alloc(Type::Nothing);
        }
        self.ctx.error("expected an expression", p.loc());
        p.pos += 1;
        self.alloc(Type::Nothing)
    }

    /// Calls a module-local function (spec.md §4.2.2's call protocol): the
    /// return value and the new frame's linkage/args are laid out back to
    /// back in the caller's own locals, then `CALL` jumps.
    fn compile_call(&mut self, p: &mut Parser, name: &str) -> Value {
        let sig = match self.ctx.functions.get(name) {
            Some(decl) => decl.sig.clone(),
            None => {
                self.ctx.error(format!("call to undefined function '{}'", name), p.loc());
                Rc::new(FunctionSignature { params: Vec::new(), ret: Type::Nothing })
            }
        };

        p.expect(TokenKind::LParen);
        let ret_val = self.alloc(sig.ret.clone());
        let func_ptr = self.alloc(Type::FunctionPtr(sig.clone()));
        let linkage_end = self.top; // new frame base sits right here
        self.top += crate::types::LINKAGE_SIZE as i16;

        let setadr_index = self.code.len();
        self.code.push(Insn::adi(Opcode::SetAdr, func_ptr.offset, 0)); // patched to the target's offset
        self.fixups.push(CallFixup { instr_index: setadr_index, target_fn: name.to_string() });

        // Reserve the callee's parameter slots contiguously right after
        // its linkage, before compiling any argument expression — the
        // callee reads its first parameter at `new_base + LINKAGE_SIZE`
        // (compile_function numbers params from there), so nothing from
        // `compile_expr`'s own bump allocation may land in this region.
        let mut param_offsets = Vec::with_capacity(sig.params.len());
        let mut param_top = linkage_end + crate::types::LINKAGE_SIZE as i16;
        for param_ty in &sig.params {
            param_offsets.push(param_top);
            param_top += (param_ty.size() as i16).max(1);
        }
        self.top = param_top;

        let mut args = Vec::new();
        if !p.check(TokenKind::RParen) {
            loop {
                args.push(self.compile_expr(p));
                if !p.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        p.expect(TokenKind::RParen);

        for (i, arg) in args.iter().enumerate() {
            if let Some(&slot_offset) = param_offsets.get(i) {
                self.code.push(Insn::abc(Opcode::Cpy, slot_offset, arg.offset, arg.ty.size() as i16));
            }
        }

        let t = linkage_end;
        self.code.push(Insn::abc(Opcode::Call, t, func_ptr.offset, 0));
        Value { offset: ret_val.offset, ty: sig.ret.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::RuntimeState;
    use std::convert::TryInto;

    fn run_main(source: &str) -> i32 {
        let result = compile("test", source);
        assert!(result.messages.is_empty(), "{:?}", result.messages);
        let mut state = RuntimeState::new(1 << 16);
        let idx = state.load_module(result.module);
        let outcome = state.execute(idx, 4);
        assert!(outcome.is_ok(), "{:?}", outcome);
        i32::from_le_bytes(state.stack_slice_for_test()[0..4].try_into().unwrap())
    }

    #[test]
    fn constant_arithmetic() {
        assert_eq!(run_main("fn main() -> int { return 2 + 3 * 4; }"), 14);
    }

    #[test]
    fn calls_an_earlier_defined_function() {
        let src = "fn add1(n: int) -> int { return n + 1; } fn main() -> int { return add1(41); }";
        assert_eq!(run_main(src), 42);
    }

    #[test]
    fn calls_a_later_defined_function() {
        let src = "fn main() -> int { return add1(41); } fn add1(n: int) -> int { return n + 1; }";
        assert_eq!(run_main(src), 42);
    }

    #[test]
    fn if_else_picks_the_right_branch() {
        let src = "fn main() -> int { let x = 10; if x < 5 { return 1; } else { return 2; } }";
        assert_eq!(run_main(src), 2);
    }

    #[test]
    fn undefined_function_call_is_reported() {
        let result = compile("bad", "fn main() -> int { return nope(1); }");
        assert!(!result.messages.is_empty());
    }

    #[test]
    fn while_loop_sums_zero_through_four() {
        let src = "fn main() -> int { \
            let sum = 0; let i = 0; \
            while i < 5 { sum = sum + i; i = i + 1; } \
            return sum; \
        }";
        assert_eq!(run_main(src), 10);
    }

    #[test]
    fn recursive_call_computes_fibonacci() {
        let src = "fn fib(n: int) -> int { \
            if n < 2 { return n; } \
            return fib(n - 1) + fib(n - 2); \
        } \
        fn main() -> int { return fib(10); }";
        assert_eq!(run_main(src), 55);
    }
}
