//! An implementation of the Ngaro virtual machine, the stack-oriented
//! bytecode engine behind the Retro language, together with an assembler
//! compiling a Forth-like mnemonic syntax into Ngaro memory images.
//!
//! The [`vm::Instance`] executes a memory [`Image`] loaded from disk or
//! produced by [`asm::assemble`]. I/O goes through a 1024-entry port array
//! with pluggable IN/OUT/WAIT handlers; input comes from a stack of
//! pushable readers, so boot code, included files and a terminal can feed
//! the same VM in order.

pub mod asm;
pub mod core;
pub mod vm;

pub use crate::asm::{assemble, Assembler};
pub use crate::core::cell::{Cell, CELL_BITS};
pub use crate::core::error::{ErrorCategory, IoOp, Position, StackId, VmError, VmResult};
pub use crate::core::image::Image;
pub use crate::core::opcode::Opcode;
pub use crate::core::stack::{Stack, STACK_SIZE};
pub use crate::vm::{Instance, IoHandler, StopHandle, VmConfig, PORT_COUNT};
