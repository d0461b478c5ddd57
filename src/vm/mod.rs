//! Execution engine for the Ngaro virtual machine.
//!
//! An [`Instance`] owns a memory image, the data and address stacks, the
//! 1024-entry port array and the input stream stack. [`Instance::run`]
//! fetches and dispatches opcodes until the program counter passes the end
//! of the image, the program requests an exit through the capability port,
//! or an error surfaces.
//!
//! I/O happens through ports: programs write a request into a port, clear
//! the ready flag (port 0) and execute WAIT; the engine then dispatches to
//! whichever handlers are bound. Ports 1 (input), 2 (output), 4 (file I/O)
//! and 5 (capabilities) have default handlers installed at construction;
//! embedders can bind their own IN, OUT and WAIT handlers to any port.
//!
//! The engine is single-threaded and cooperative. Handlers run
//! synchronously on the VM thread and must not re-enter `run`. The only
//! cross-thread facility is the [`StopHandle`], which asks the loop to
//! return at the next iteration.

pub mod io;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::cell::{self, Cell, CELL_BITS};
use crate::core::error::{StackId, VmError, VmResult};
use crate::core::image::Image;
use crate::core::opcode::Opcode;
use crate::core::stack::{Stack, STACK_SIZE};

use self::io::InputStack;

/// Number of I/O ports.
pub const PORT_COUNT: usize = 1024;

/// Callback bound to a port for IN, OUT or WAIT dispatch. Receives the
/// instance, the current port value (the written value, for OUT) and the
/// port number.
pub type IoHandler = Box<dyn FnMut(&mut Instance, Cell, Cell) -> VmResult<()>>;

/// Callback receiving negative opcode values.
pub type OpcodeHandler = Box<dyn FnMut(&mut Instance, Cell) -> VmResult<()>>;

/// Callback invoked periodically from the dispatch loop.
pub type TickFn = Box<dyn FnMut(&mut Instance) -> VmResult<()>>;

/// Construction-time configuration for an [`Instance`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Data stack capacity in cells.
    pub data_size: usize,
    /// Address stack capacity in cells.
    pub address_size: usize,
    /// Save only cells below HERE when the program dumps the image.
    pub shrink: bool,
    /// Treat the input/output as a raw terminal: Ctrl-D on input is end of
    /// input, and a backspace written to port 2 erases the previous glyph.
    pub tty: bool,
    /// Dispatch the extended opcodes (CALL and the float set). Off by
    /// default so that every cell value ≥ 31 keeps its base-set meaning of
    /// "call this address".
    pub extended_ops: bool,
    /// When set to `k`, invoke the tick callback every 2^k instructions.
    pub tick_shift: Option<u32>,
    /// Console dimensions reported by capability selectors −11/−12.
    pub console_size: Option<(Cell, Cell)>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            data_size: STACK_SIZE,
            address_size: STACK_SIZE,
            shrink: false,
            tty: false,
            extended_ops: false,
            tick_shift: None,
            console_size: None,
        }
    }
}

/// Cooperative stop signal for a running instance.
///
/// Cloneable and sendable to other threads. When triggered, the dispatch
/// loop notices at the top of its next iteration, sets the instance's
/// stopped flag and returns cleanly.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the instance to stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An Ngaro virtual machine instance.
pub struct Instance {
    pc: Cell,
    /// Memory image. Mutable through FETCH/STORE; never resized at runtime.
    pub image: Image,
    /// The I/O port array. Port 0 is the ready flag.
    pub ports: Vec<Cell>,
    data: Stack,
    address: Stack,
    ins_count: u64,
    in_h: BTreeMap<Cell, IoHandler>,
    out_h: BTreeMap<Cell, IoHandler>,
    wait_h: BTreeMap<Cell, IoHandler>,
    opcode_h: Option<OpcodeHandler>,
    tick: Option<TickFn>,
    tick_mask: Option<u64>,
    image_file: PathBuf,
    pub(crate) input: InputStack,
    pub(crate) output: Option<Box<dyn Write>>,
    pub(crate) shrink: bool,
    pub(crate) tty: bool,
    extended_ops: bool,
    pub(crate) console_size: Option<(Cell, Cell)>,
    stop: Option<Arc<AtomicBool>>,
    stopped: bool,
}

impl Instance {
    /// Create a new instance over `image`.
    ///
    /// `image_file` is the path a program-requested image dump (port 4)
    /// writes to; it does not have to exist, or even be writable, unless a
    /// program asks for a dump. Default WAIT handlers are bound to ports 1,
    /// 2, 4 and 5.
    pub fn new(image: Image, image_file: impl AsRef<Path>, config: VmConfig) -> Instance {
        let mut i = Instance {
            pc: 0,
            image,
            ports: vec![0; PORT_COUNT],
            data: Stack::new(StackId::Data, config.data_size),
            address: Stack::new(StackId::Address, config.address_size),
            ins_count: 0,
            in_h: BTreeMap::new(),
            out_h: BTreeMap::new(),
            wait_h: BTreeMap::new(),
            opcode_h: None,
            tick: None,
            tick_mask: config.tick_shift.map(|k| (1u64 << k.min(63)) - 1),
            image_file: image_file.as_ref().to_path_buf(),
            input: InputStack::new(),
            output: None,
            shrink: config.shrink,
            tty: config.tty,
            extended_ops: config.extended_ops,
            console_size: config.console_size,
            stop: None,
            stopped: false,
        };
        for port in [1, 2, 4, 5] {
            i.wait_h
                .insert(port, Box::new(|vm: &mut Instance, v, p| vm.wait(v, p)));
        }
        i
    }

    /// Current program counter.
    #[inline]
    pub fn pc(&self) -> Cell {
        self.pc
    }

    /// Set the program counter, e.g. to resume at a known entry point.
    pub fn set_pc(&mut self, pc: Cell) {
        self.pc = pc;
    }

    /// Number of instructions executed by the last or current `run`.
    pub fn instruction_count(&self) -> u64 {
        self.ins_count
    }

    /// The live data stack, bottom first.
    pub fn data(&self) -> &[Cell] {
        self.data.as_slice()
    }

    /// The live address stack, bottom first.
    pub fn address(&self) -> &[Cell] {
        self.address.as_slice()
    }

    /// Push onto the data stack.
    pub fn push(&mut self, v: Cell) -> VmResult<()> {
        self.data.push(v)
    }

    /// Pop from the data stack (0 when empty).
    pub fn pop(&mut self) -> Cell {
        self.data.pop()
    }

    /// Push onto the address stack.
    pub fn rpush(&mut self, v: Cell) -> VmResult<()> {
        self.address.push(v)
    }

    /// Pop from the address stack (0 when empty).
    pub fn rpop(&mut self) -> Cell {
        self.address.pop()
    }

    /// Top of the data stack.
    pub fn tos(&self) -> Cell {
        self.data.tos()
    }

    /// Next on the data stack.
    pub fn nos(&self) -> Cell {
        self.data.nos()
    }

    /// Push a reader on top of the input stack. Reads drain the most
    /// recently pushed source first.
    pub fn push_input<R: Read + 'static>(&mut self, r: R) {
        self.input.push(r);
    }

    /// Set the output writer for port 2.
    pub fn set_output<W: Write + 'static>(&mut self, w: W) {
        self.output = Some(Box::new(w));
    }

    /// Bind an IN handler to `port`, replacing the default behavior
    /// (push the port value, then clear the port).
    pub fn bind_in_handler(&mut self, port: Cell, handler: IoHandler) {
        self.in_h.insert(port, handler);
    }

    /// Bind an OUT handler to `port`, replacing the default behavior
    /// (store the written value in the port).
    pub fn bind_out_handler(&mut self, port: Cell, handler: IoHandler) {
        self.out_h.insert(port, handler);
    }

    /// Bind a WAIT handler to `port`. The handler runs when a WAIT executes
    /// while the port holds a non-zero value and the ready flag is clear;
    /// it should answer through [`Instance::wait_reply`].
    pub fn bind_wait_handler(&mut self, port: Cell, handler: IoHandler) {
        self.wait_h.insert(port, handler);
    }

    /// Bind the handler receiving negative opcode values. Without one,
    /// negative opcodes are an error.
    pub fn set_opcode_handler(&mut self, handler: OpcodeHandler) {
        self.opcode_h = Some(handler);
    }

    /// Set the tick callback, invoked every 2^k instructions per
    /// [`VmConfig::tick_shift`].
    pub fn set_tick(&mut self, tick: TickFn) {
        self.tick = Some(tick);
    }

    /// Obtain a stop handle for this instance. The same handle is returned
    /// on subsequent calls.
    pub fn stop_handle(&mut self) -> StopHandle {
        let flag = self
            .stop
            .get_or_insert_with(|| Arc::new(AtomicBool::new(false)));
        StopHandle(flag.clone())
    }

    /// True when the last `run` returned because of a stop request.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Path written by program-requested image dumps.
    pub fn image_file(&self) -> &Path {
        &self.image_file
    }

    /// Run until the program counter passes the end of the image.
    ///
    /// Returns the final program counter. A clean exit through the `-9`
    /// capability lands exactly on `image.len()`; a wild jump may land
    /// past it, as in the reference implementation. On error, the program
    /// counter still points at the faulting instruction and the image and
    /// stacks are preserved for introspection.
    pub fn run(&mut self) -> VmResult<Cell> {
        self.ins_count = 0;
        self.stopped = false;
        let len = self.image.len() as Cell;
        while self.pc >= 0 && self.pc < len {
            if let Some(flag) = &self.stop {
                if flag.load(Ordering::SeqCst) {
                    self.stopped = true;
                    return Ok(self.pc);
                }
            }
            if let Some(mask) = self.tick_mask {
                if self.ins_count & mask == 0 {
                    self.call_tick()?;
                }
            }
            let pc = self.pc;
            let op = self.image[pc as usize];
            self.step(op).map_err(|e| e.at(pc))?;
            self.ins_count += 1;
        }
        if self.pc < 0 {
            return Err(VmError::PcOutOfRange { pc: self.pc });
        }
        Ok(self.pc)
    }

    fn call_tick(&mut self) -> VmResult<()> {
        if let Some(mut f) = self.tick.take() {
            let r = f(self);
            if self.tick.is_none() {
                self.tick = Some(f);
            }
            r?;
        }
        Ok(())
    }

    /// Inline operand of the instruction at the current PC.
    fn operand(&self) -> VmResult<Cell> {
        self.image
            .get(self.pc + 1)
            .map_err(|_| VmError::PcOutOfRange { pc: self.pc + 1 })
    }

    fn binary(&mut self, f: impl Fn(Cell, Cell) -> Cell) -> VmResult<()> {
        let b = self.data.pop();
        let a = self.data.pop();
        self.data.push(f(a, b))?;
        self.pc += 1;
        Ok(())
    }

    fn compare_jump(&mut self, f: impl Fn(Cell, Cell) -> bool) -> VmResult<()> {
        let target = self.operand()?;
        let t = self.data.pop();
        let n = self.data.pop();
        if f(n, t) {
            self.pc = target;
        } else {
            self.pc += 2;
        }
        Ok(())
    }

    fn require_floats(&self, op_cell: Cell) -> VmResult<()> {
        if CELL_BITS == 64 {
            Ok(())
        } else {
            Err(VmError::FloatWidth {
                opcode: op_cell,
                pc: self.pc,
            })
        }
    }

    fn float_binary(&mut self, op_cell: Cell, f: impl Fn(f64, f64) -> f64) -> VmResult<()> {
        self.require_floats(op_cell)?;
        let b = cell::cell_to_float(self.data.pop());
        let a = cell::cell_to_float(self.data.pop());
        self.data.push(cell::float_to_cell(f(a, b)))?;
        self.pc += 1;
        Ok(())
    }

    fn float_compare_jump(
        &mut self,
        op_cell: Cell,
        f: impl Fn(f64, f64) -> bool,
    ) -> VmResult<()> {
        self.require_floats(op_cell)?;
        let target = self.operand()?;
        let t = cell::cell_to_float(self.data.pop());
        let n = cell::cell_to_float(self.data.pop());
        if f(n, t) {
            self.pc = target;
        } else {
            self.pc += 2;
        }
        Ok(())
    }

    fn custom_opcode(&mut self, op_cell: Cell) -> VmResult<()> {
        let mut h = match self.opcode_h.take() {
            Some(h) => h,
            None => {
                return Err(VmError::InvalidOpcode {
                    opcode: op_cell,
                    pc: self.pc,
                })
            }
        };
        let before = self.pc;
        let r = h(self, op_cell);
        if self.opcode_h.is_none() {
            self.opcode_h = Some(h);
        }
        r?;
        // A handler that did not transfer control falls through.
        if self.pc == before {
            self.pc += 1;
        }
        Ok(())
    }

    fn check_port(&self, port: Cell) -> VmResult<()> {
        if port >= 0 && (port as usize) < self.ports.len() {
            Ok(())
        } else {
            Err(VmError::PortOutOfRange { port, pc: self.pc })
        }
    }

    fn op_in(&mut self) -> VmResult<()> {
        let port = self.data.pop();
        self.check_port(port)?;
        if let Some(mut h) = self.in_h.remove(&port) {
            let v = self.ports[port as usize];
            let r = h(self, v, port);
            self.in_h.entry(port).or_insert(h);
            r?;
        } else {
            let v = self.ports[port as usize];
            self.data.push(v)?;
            self.ports[port as usize] = 0;
        }
        self.pc += 1;
        Ok(())
    }

    fn op_out(&mut self) -> VmResult<()> {
        let port = self.data.pop();
        let v = self.data.pop();
        self.check_port(port)?;
        if let Some(mut h) = self.out_h.remove(&port) {
            let r = h(self, v, port);
            self.out_h.entry(port).or_insert(h);
            r?;
        } else {
            self.ports[port as usize] = v;
        }
        self.pc += 1;
        Ok(())
    }

    fn step(&mut self, op_cell: Cell) -> VmResult<()> {
        let known = Opcode::from_cell(op_cell)
            .filter(|op| self.extended_ops || !op.is_extended());
        let op = match known {
            Some(op) => op,
            None if op_cell < 0 => return self.custom_opcode(op_cell),
            None => {
                // Unknown opcodes are calls: remember where we came from
                // and jump to the opcode's value.
                self.address.push(self.pc)?;
                self.pc = op_cell;
                return Ok(());
            }
        };
        match op {
            Opcode::Nop => self.pc += 1,
            Opcode::Lit => {
                let v = self.operand()?;
                self.data.push(v)?;
                self.pc += 2;
            }
            Opcode::Dup => {
                let t = self.data.tos();
                self.data.push(t)?;
                self.pc += 1;
            }
            Opcode::Drop => {
                self.data.drop_top();
                self.pc += 1;
            }
            Opcode::Swap => {
                let a = self.data.pop();
                let b = self.data.pop();
                self.data.push(a)?;
                self.data.push(b)?;
                self.pc += 1;
            }
            Opcode::Push => {
                let v = self.data.pop();
                self.address.push(v)?;
                self.pc += 1;
            }
            Opcode::Pop => {
                let v = self.address.pop();
                self.data.push(v)?;
                self.pc += 1;
            }
            Opcode::Loop => {
                let v = self.data.pop().wrapping_sub(1);
                if v > 0 {
                    self.data.push(v)?;
                    self.pc = self.operand()?;
                } else {
                    self.pc += 2;
                }
            }
            Opcode::Jump => self.pc = self.operand()?,
            Opcode::Return => self.pc = self.address.pop().wrapping_add(1),
            Opcode::GtJump => self.compare_jump(|n, t| n > t)?,
            Opcode::LtJump => self.compare_jump(|n, t| n < t)?,
            Opcode::NeJump => self.compare_jump(|n, t| n != t)?,
            Opcode::EqJump => self.compare_jump(|n, t| n == t)?,
            Opcode::Fetch => {
                let a = self.data.pop();
                let v = self.image.get(a)?;
                self.data.push(v)?;
                self.pc += 1;
            }
            Opcode::Store => {
                let a = self.data.pop();
                let v = self.data.pop();
                self.image.set(a, v)?;
                self.pc += 1;
            }
            Opcode::Add => self.binary(|a, b| a.wrapping_add(b))?,
            Opcode::Sub => self.binary(|a, b| a.wrapping_sub(b))?,
            Opcode::Mul => self.binary(|a, b| a.wrapping_mul(b))?,
            Opcode::Dimod => {
                let b = self.data.pop();
                let a = self.data.pop();
                if b == 0 {
                    return Err(VmError::DivisionByZero { pc: self.pc });
                }
                self.data.push(a.wrapping_rem(b))?;
                self.data.push(a.wrapping_div(b))?;
                self.pc += 1;
            }
            Opcode::And => self.binary(|a, b| a & b)?,
            Opcode::Or => self.binary(|a, b| a | b)?,
            Opcode::Xor => self.binary(|a, b| a ^ b)?,
            Opcode::Shl => self.binary(cell::shl)?,
            Opcode::Shr => self.binary(cell::shr)?,
            Opcode::ZeroExit => {
                if self.data.tos() == 0 {
                    self.data.drop_top();
                    self.pc = self.address.pop().wrapping_add(1);
                } else {
                    self.pc += 1;
                }
            }
            Opcode::Inc => {
                let t = self.data.pop();
                self.data.push(t.wrapping_add(1))?;
                self.pc += 1;
            }
            Opcode::Dec => {
                let t = self.data.pop();
                self.data.push(t.wrapping_sub(1))?;
                self.pc += 1;
            }
            Opcode::In => self.op_in()?,
            Opcode::Out => self.op_out()?,
            Opcode::Wait => {
                self.io_wait()?;
                self.pc += 1;
            }
            Opcode::Call => {
                self.address.push(self.pc + 1)?;
                self.pc = self.operand()?;
            }
            Opcode::FAdd => self.float_binary(op_cell, |a, b| a + b)?,
            Opcode::FSub => self.float_binary(op_cell, |a, b| a - b)?,
            Opcode::FMul => self.float_binary(op_cell, |a, b| a * b)?,
            Opcode::FDiv => self.float_binary(op_cell, |a, b| a / b)?,
            Opcode::Itof => {
                self.require_floats(op_cell)?;
                let t = self.data.pop();
                self.data.push(cell::float_to_cell(t as f64))?;
                self.pc += 1;
            }
            Opcode::Ftoi => {
                self.require_floats(op_cell)?;
                let t = self.data.pop();
                self.data.push(cell::cell_to_float(t) as Cell)?;
                self.pc += 1;
            }
            Opcode::FGtJump => self.float_compare_jump(op_cell, |n, t| n > t)?,
            Opcode::FLtJump => self.float_compare_jump(op_cell, |n, t| n < t)?,
            Opcode::FNeJump => self.float_compare_jump(op_cell, |n, t| n != t)?,
            Opcode::FEqJump => self.float_compare_jump(op_cell, |n, t| n == t)?,
        }
        Ok(())
    }
}
