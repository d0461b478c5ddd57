//! Single-pass assembler for the Ngaro virtual machine.
//!
//! The source syntax is Forth-like and token oriented:
//!
//! - opcode mnemonics (`lit`, `dup`, `+`, `0;`, ...) emit themselves;
//! - integers emit an implicit `lit` in statement position, or just the
//!   value when an operand is expected;
//! - `:name` defines a label at the current compile address, `:N` with a
//!   decimal N defines a local label referenced as `N+` (next) or `N-`
//!   (previous);
//! - any other word is a call site: a one-cell address literal patched at
//!   the end of the parse, preceded below address 31 by an explicit
//!   `lit pc+3, push, jump` prologue (the boot image keeps a caller
//!   trampoline in low memory);
//! - `.org V` moves the compile address, `.dat V` emits a raw cell,
//!   `.equ NAME V` binds a constant;
//! - `( ... )` is a comment (non-nesting).
//!
//! Forward references are resolved by a fixup pass once the source is
//! exhausted; unresolved labels are an error citing their first use.

pub mod lexer;

use std::collections::BTreeMap;

use crate::core::cell::Cell;
use crate::core::error::{Position, VmError, VmResult};
use crate::core::opcode::Opcode;

use self::lexer::{parse_char, parse_int, Scanner, Word};

/// Separator between a local label's number and its occurrence index.
/// Words never contain whitespace, so user input cannot collide with a
/// mangled name.
const LOCAL_SEP: char = '·';

/// Image growth quantum during assembly, in cells.
const GROW_CHUNK: usize = 16384;

/// Call sites below this compile address get the explicit call prologue.
const PROLOGUE_LIMIT: usize = 31;

#[derive(Debug, Clone)]
struct LabelUse {
    pos: Position,
    /// Image cell to patch with the resolved address.
    address: usize,
}

#[derive(Debug, Clone)]
struct Label {
    pos: Position,
    /// Defined address, or -1 while only forward-referenced.
    address: Cell,
    uses: Vec<LabelUse>,
}

#[derive(Debug, Clone)]
struct Constant {
    pos: Position,
    value: Cell,
}

/// Parser state: what the next token is allowed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Any token accepted.
    Statement,
    /// An inline operand is expected (after `lit`, `loop`, the jumps, or
    /// `.dat`).
    Operand,
    /// The `.org` argument.
    Org,
    /// The `.equ` value.
    Equ,
}

fn asm_err(message: String, pos: Position) -> VmError {
    VmError::Assembly { message, pos }
}

/// The single-pass compiler. Feed it source with [`Assembler::parse`],
/// then take the image with [`Assembler::finish`].
pub struct Assembler {
    image: Vec<Cell>,
    pc: usize,
    high_water: usize,
    labels: BTreeMap<String, Label>,
    consts: BTreeMap<String, Constant>,
    local_counters: BTreeMap<i64, usize>,
    state: State,
    equ_name: String,
    equ_pos: Position,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            image: Vec::new(),
            pc: 0,
            high_water: 0,
            labels: BTreeMap::new(),
            consts: BTreeMap::new(),
            local_counters: BTreeMap::new(),
            state: State::Statement,
            equ_name: String::new(),
            equ_pos: Position::default(),
        }
    }

    /// Compile `source`, named `name` in error positions.
    pub fn parse(&mut self, name: &str, source: &str) -> VmResult<()> {
        let mut s = Scanner::new(name, source);
        while let Some(word) = s.next_word() {
            self.token(word, &mut s)?;
        }
        Ok(())
    }

    /// Run the fixup pass and return the image, trimmed to the highest
    /// address emitted.
    pub fn finish(mut self) -> VmResult<Vec<Cell>> {
        for (name, label) in &self.labels {
            if label.address == -1 {
                let pos = label
                    .uses
                    .first()
                    .map(|u| u.pos.clone())
                    .unwrap_or_else(|| label.pos.clone());
                return Err(asm_err(
                    format!("missing label definition for {}, first use here", name),
                    pos,
                ));
            }
            for u in &label.uses {
                self.image[u.address] = label.address;
            }
        }
        self.image.truncate(self.high_water);
        Ok(self.image)
    }

    fn emit(&mut self, v: Cell) {
        while self.pc >= self.image.len() {
            self.image.extend(std::iter::repeat(0).take(GROW_CHUNK));
        }
        self.image[self.pc] = v;
        self.pc += 1;
        self.high_water = self.high_water.max(self.pc);
    }

    fn token(&mut self, w: Word, s: &mut Scanner) -> VmResult<()> {
        // Promote integers, character literals and constants; chars are
        // just a special case of ints.
        if let Some(v) = parse_int(&w.text) {
            return self.integer(v, w.pos);
        }
        if let Some(r) = parse_char(&w.text) {
            let c = r.map_err(|m| asm_err(m, w.pos.clone()))?;
            return self.integer(c as Cell, w.pos);
        }
        if let Some(c) = self.consts.get(&w.text) {
            let v = c.value;
            return self.integer(v, w.pos);
        }
        self.ident(w, s)
    }

    fn integer(&mut self, v: Cell, pos: Position) -> VmResult<()> {
        match self.state {
            State::Org => {
                if v < 0 {
                    return Err(asm_err(format!(".org to negative address {}", v), pos));
                }
                self.pc = v as usize;
            }
            State::Equ => {
                let name = std::mem::take(&mut self.equ_name);
                let cst_pos = std::mem::replace(&mut self.equ_pos, Position::default());
                self.consts.insert(
                    name,
                    Constant {
                        pos: cst_pos,
                        value: v,
                    },
                );
            }
            State::Statement => {
                self.emit(Opcode::Lit.code());
                self.emit(v);
            }
            State::Operand => self.emit(v),
        }
        self.state = State::Statement;
        Ok(())
    }

    fn ident(&mut self, w: Word, s: &mut Scanner) -> VmResult<()> {
        match w.text.chars().next() {
            Some(':') => self.define_label(&w),
            Some('.') => self.directive(&w, s),
            _ => {
                if w.text == "(" {
                    // Comment: skip words until the closing token.
                    while let Some(next) = s.next_word() {
                        if next.text == ")" {
                            break;
                        }
                    }
                    return Ok(());
                }
                if matches!(self.state, State::Org | State::Equ) {
                    return Err(asm_err(
                        format!("unexpected name as directive argument: {}", w.text),
                        w.pos,
                    ));
                }
                if self.state == State::Statement {
                    if let Some(op) = Opcode::from_mnemonic(&w.text) {
                        self.emit(op.code());
                        if op.has_operand() {
                            self.state = State::Operand;
                        }
                        return Ok(());
                    }
                }
                // Call site or address operand. Below the trampoline area
                // a bare reference needs the explicit call prologue.
                if self.state == State::Statement && self.pc < PROLOGUE_LIMIT {
                    self.emit(Opcode::Lit.code());
                    self.emit(self.pc as Cell + 3);
                    self.emit(Opcode::Push.code());
                    self.emit(Opcode::Jump.code());
                }
                self.label_ref(&w.text, w.pos)?;
                self.emit(0);
                self.state = State::Statement;
                Ok(())
            }
        }
    }

    fn define_label(&mut self, w: &Word) -> VmResult<()> {
        if self.state != State::Statement {
            return Err(asm_err(
                format!("unexpected label definition as argument: {}", w.text),
                w.pos.clone(),
            ));
        }
        let name = &w.text[1..];
        if name.is_empty() {
            return Err(asm_err("empty label name".to_string(), w.pos.clone()));
        }
        if let Some(c) = self.consts.get(name) {
            return Err(asm_err(
                format!(
                    "label redefinition: {}, previously defined as a constant at {}",
                    name, c.pos
                ),
                w.pos.clone(),
            ));
        }
        // Local labels are numeric; each definition gets a fresh index.
        let key = if let Ok(n) = name.parse::<i64>() {
            let idx = self.local_counters.entry(n).or_insert(0);
            *idx += 1;
            format!("{}{}{}", n, LOCAL_SEP, idx)
        } else {
            name.to_string()
        };
        match self.labels.get_mut(&key) {
            Some(l) => {
                if l.address != -1 {
                    return Err(asm_err(
                        format!(
                            "label redefinition: {}, previous definition at {}",
                            key, l.pos
                        ),
                        w.pos.clone(),
                    ));
                }
                // Forward declaration gets its address here.
                l.address = self.pc as Cell;
                l.pos = w.pos.clone();
            }
            None => {
                self.labels.insert(
                    key,
                    Label {
                        pos: w.pos.clone(),
                        address: self.pc as Cell,
                        uses: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn directive(&mut self, w: &Word, s: &mut Scanner) -> VmResult<()> {
        if self.state != State::Statement {
            return Err(asm_err(
                format!("unexpected directive as argument: {}", w.text),
                w.pos.clone(),
            ));
        }
        match w.text.as_str() {
            ".org" => self.state = State::Org,
            ".dat" => self.state = State::Operand,
            ".equ" => {
                let name = s.next_word().ok_or_else(|| {
                    asm_err(".equ: expected identifier".to_string(), w.pos.clone())
                })?;
                if let Some(l) = self.labels.get(&name.text) {
                    return Err(asm_err(
                        format!(
                            ".equ: redefinition of {}, previously defined or used as a label at {}",
                            name.text, l.pos
                        ),
                        name.pos,
                    ));
                }
                self.equ_name = name.text;
                self.equ_pos = name.pos;
                self.state = State::Equ;
            }
            other => {
                return Err(asm_err(
                    format!("unknown dot directive: {}", other),
                    w.pos.clone(),
                ))
            }
        }
        Ok(())
    }

    /// Register a use of `name` at the current compile address. Local
    /// references resolve directionally: `N-` to the latest definition of
    /// `:N`, `N+` to the next one (a forward stub until it appears).
    fn label_ref(&mut self, name: &str, pos: Position) -> VmResult<()> {
        let mut key = name.to_string();
        if name.len() > 1 && (name.ends_with('-') || name.ends_with('+')) {
            let stem = &name[..name.len() - 1];
            if let Ok(n) = stem.parse::<i64>() {
                let counter = self.local_counters.get(&n).copied().unwrap_or(0);
                if name.ends_with('-') {
                    key = format!("{}{}{}", n, LOCAL_SEP, counter);
                    if !self.labels.contains_key(&key) {
                        return Err(asm_err(
                            format!("backward reference to undefined local label {}", stem),
                            pos,
                        ));
                    }
                } else {
                    key = format!("{}{}{}", n, LOCAL_SEP, counter + 1);
                }
            }
        }
        let label = self.labels.entry(key).or_insert(Label {
            pos: pos.clone(),
            address: -1,
            uses: Vec::new(),
        });
        label.uses.push(LabelUse {
            pos,
            address: self.pc,
        });
        Ok(())
    }
}

/// Assemble `source` into a memory image. `name` appears in error
/// positions.
pub fn assemble(name: &str, source: &str) -> VmResult<Vec<Cell>> {
    let mut asm = Assembler::new();
    asm.parse(name, source)?;
    asm.finish()
}
