//! Error types for the Ngaro virtual machine and assembler.
//!
//! The crate surfaces one error enum, [`VmError`], whose variants carry the
//! context a caller needs to diagnose a failure: the program counter for
//! runtime faults, the source position for assembly errors, and the path for
//! image codec errors.

use std::fmt;

use super::cell::Cell;

/// Identifies which of the two VM stacks an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackId {
    Data,
    Address,
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackId::Data => write!(f, "data"),
            StackId::Address => write!(f, "address"),
        }
    }
}

/// The I/O operation during which a handler error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    In,
    Out,
    Wait,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::In => write!(f, "IN"),
            IoOp::Out => write!(f, "OUT"),
            IoOp::Wait => write!(f, "WAIT"),
        }
    }
}

/// A position in assembler source text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Position {
    /// Source name (usually a file name).
    pub file: String,
    /// Line number (1-indexed).
    pub line: usize,
    /// Column number (1-indexed).
    pub column: usize,
}

impl Position {
    pub fn new(file: &str, line: usize, column: usize) -> Self {
        Self {
            file: file.to_string(),
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Error type for every fallible operation in the crate.
#[derive(Debug, Clone)]
pub enum VmError {
    /// Image file could not be loaded: I/O failure, unsupported width,
    /// partial trailing cell, or a value too large for the compiled cell.
    Load { path: String, message: String },

    /// Image file could not be saved: I/O failure or value truncation.
    Save { path: String, message: String },

    /// The assembler rejected the source text.
    Assembly { message: String, pos: Position },

    /// A push exceeded a stack's capacity.
    StackOverflow { stack: StackId, pc: Cell },

    /// A pop drained a stack below empty. Never raised by the engine, which
    /// applies the loose policy (reads below the surface yield 0); strict
    /// embedders can raise it from custom handlers.
    StackUnderflow { stack: StackId, pc: Cell },

    /// A negative opcode was dispatched with no custom opcode handler bound.
    InvalidOpcode { opcode: Cell, pc: Cell },

    /// The program counter left the image: a negative fetch address, or a
    /// literal-operand read past the end of memory.
    PcOutOfRange { pc: Cell },

    /// A fetch or store addressed a cell outside the image.
    MemoryBounds { address: Cell, len: usize, pc: Cell },

    /// An IN or OUT addressed a port outside the port array.
    PortOutOfRange { port: Cell, pc: Cell },

    /// DIMOD with a zero divisor.
    DivisionByZero { pc: Cell },

    /// A float opcode was dispatched on a build with 32-bit cells.
    FloatWidth { opcode: Cell, pc: Cell },

    /// An I/O failure inside a handler, wrapped with the operation and PC.
    Io { op: IoOp, pc: Cell, message: String },

    /// Every input source is exhausted. Not a failure in interactive use;
    /// the CLI converts it to a clean exit.
    EndOfInput,
}

/// Result type alias for VM and assembler operations.
pub type VmResult<T> = Result<T, VmError>;

/// Error category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Image,
    Assembly,
    Runtime,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Image => write!(f, "image"),
            ErrorCategory::Assembly => write!(f, "assembly"),
            ErrorCategory::Runtime => write!(f, "runtime"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Load { path, message } => {
                write!(f, "load {}: {}", path, message)
            }
            VmError::Save { path, message } => {
                write!(f, "save {}: {}", path, message)
            }
            VmError::Assembly { message, pos } => {
                write!(f, "{}: {}", pos, message)
            }
            VmError::StackOverflow { stack, pc } => {
                write!(f, "{} stack overflow at pc {}", stack, pc)
            }
            VmError::StackUnderflow { stack, pc } => {
                write!(f, "{} stack underflow at pc {}", stack, pc)
            }
            VmError::InvalidOpcode { opcode, pc } => {
                write!(f, "invalid opcode {} at pc {}", opcode, pc)
            }
            VmError::PcOutOfRange { pc } => {
                write!(f, "program counter {} out of range", pc)
            }
            VmError::MemoryBounds { address, len, pc } => {
                write!(
                    f,
                    "memory access at {} outside image of {} cells, pc {}",
                    address, len, pc
                )
            }
            VmError::PortOutOfRange { port, pc } => {
                write!(f, "port {} out of range at pc {}", port, pc)
            }
            VmError::DivisionByZero { pc } => {
                write!(f, "division by zero at pc {}", pc)
            }
            VmError::FloatWidth { opcode, pc } => {
                write!(
                    f,
                    "float opcode {} at pc {} requires 64-bit cells",
                    opcode, pc
                )
            }
            VmError::Io { op, pc, message } => {
                write!(f, "{} failed at pc {}: {}", op, pc, message)
            }
            VmError::EndOfInput => write!(f, "end of input"),
        }
    }
}

impl std::error::Error for VmError {}

impl VmError {
    /// Fill in the program counter on variants that carry one, when it was
    /// not known at the point the error was created.
    pub fn at(self, at_pc: Cell) -> VmError {
        match self {
            VmError::StackOverflow { stack, pc } if pc < 0 => {
                VmError::StackOverflow { stack, pc: at_pc }
            }
            VmError::StackUnderflow { stack, pc } if pc < 0 => {
                VmError::StackUnderflow { stack, pc: at_pc }
            }
            VmError::MemoryBounds { address, len, pc } if pc < 0 => {
                VmError::MemoryBounds {
                    address,
                    len,
                    pc: at_pc,
                }
            }
            VmError::Io { op, pc, message } if pc < 0 => VmError::Io {
                op,
                pc: at_pc,
                message,
            },
            other => other,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            VmError::Load { .. } | VmError::Save { .. } => ErrorCategory::Image,
            VmError::Assembly { .. } => ErrorCategory::Assembly,
            VmError::StackOverflow { .. }
            | VmError::StackUnderflow { .. }
            | VmError::InvalidOpcode { .. }
            | VmError::PcOutOfRange { .. }
            | VmError::MemoryBounds { .. }
            | VmError::PortOutOfRange { .. }
            | VmError::DivisionByZero { .. }
            | VmError::FloatWidth { .. } => ErrorCategory::Runtime,
            VmError::Io { .. } | VmError::EndOfInput => ErrorCategory::Io,
        }
    }

    /// True for the end-of-input sentinel, which interactive callers treat
    /// as a normal exit.
    pub fn is_end_of_input(&self) -> bool {
        matches!(self, VmError::EndOfInput)
    }
}
