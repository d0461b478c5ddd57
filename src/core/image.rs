//! Memory image for the Ngaro virtual machine.
//!
//! An image is a flat array of cells. On disk it is nothing more than the
//! cells packed little-endian at 32 or 64 bits each: no header, no magic
//! number, no checksum. Cells 0..2 are reserved by convention and cell 3
//! holds HERE, the first unused address, which the shrink policy consults
//! when saving.
//!
//! Strings live in memory one code point per cell, zero terminated.

use std::fmt;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::cell::{Cell, CELL_BITS};
use super::error::{VmError, VmResult};
use super::opcode::Opcode;

/// Free cells guaranteed past the file contents when loading.
pub const LOAD_HEADROOM: usize = 1024;

/// The VM's memory: a contiguous, index-addressable array of cells.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    cells: Vec<Cell>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({} cells)", self.cells.len())
    }
}

impl From<Vec<Cell>> for Image {
    fn from(cells: Vec<Cell>) -> Self {
        Image { cells }
    }
}

impl std::ops::Index<usize> for Image {
    type Output = Cell;
    #[inline]
    fn index(&self, i: usize) -> &Cell {
        &self.cells[i]
    }
}

impl std::ops::IndexMut<usize> for Image {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut Cell {
        &mut self.cells[i]
    }
}

fn width_of(cell_bits: usize) -> VmResult<usize> {
    match cell_bits {
        0 => Ok(CELL_BITS),
        32 | 64 => Ok(cell_bits),
        other => Err(VmError::Load {
            path: String::new(),
            message: format!("{} bit images are not supported", other),
        }),
    }
}

impl Image {
    /// Wrap an existing cell vector.
    pub fn new(cells: Vec<Cell>) -> Self {
        Image { cells }
    }

    /// An all-zero image of the given size.
    pub fn with_size(size: usize) -> Self {
        Image {
            cells: vec![0; size],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Bounds-checked read at a cell-typed address.
    #[inline]
    pub fn get(&self, address: Cell) -> VmResult<Cell> {
        if address >= 0 && (address as usize) < self.cells.len() {
            Ok(self.cells[address as usize])
        } else {
            Err(VmError::MemoryBounds {
                address,
                len: self.cells.len(),
                pc: -1,
            })
        }
    }

    /// Bounds-checked write at a cell-typed address.
    #[inline]
    pub fn set(&mut self, address: Cell, v: Cell) -> VmResult<()> {
        if address >= 0 && (address as usize) < self.cells.len() {
            self.cells[address as usize] = v;
            Ok(())
        } else {
            Err(VmError::MemoryBounds {
                address,
                len: self.cells.len(),
                pc: -1,
            })
        }
    }

    /// Extend the image with zero cells so that `size` cells exist.
    pub fn grow_to(&mut self, size: usize) {
        if size > self.cells.len() {
            self.cells.resize(size, 0);
        }
    }

    /// Load an image from `path`.
    ///
    /// `cell_bits` selects the on-disk width: 32, 64, or 0 for the compiled
    /// [`CELL_BITS`]. The in-memory image gets `max(file_cells + 1024,
    /// min_size)` cells so user programs always have headroom. Returns the
    /// image and the number of cells actually read from the file.
    pub fn load(path: &Path, min_size: usize, cell_bits: usize) -> VmResult<(Image, usize)> {
        let load_err = |message: String| VmError::Load {
            path: path.display().to_string(),
            message,
        };

        let bits = width_of(cell_bits).map_err(|e| match e {
            VmError::Load { message, .. } => load_err(message),
            other => other,
        })?;
        let bytes = fs::read(path).map_err(|e| load_err(e.to_string()))?;
        let width = bits / 8;
        if bytes.len() % width != 0 {
            return Err(load_err(format!(
                "file size {} is not a multiple of the {} byte cell width",
                bytes.len(),
                width
            )));
        }
        let file_cells = bytes.len() / width;
        let size = (file_cells + LOAD_HEADROOM).max(min_size);
        let mut cells = vec![0 as Cell; size];

        match bits {
            32 => {
                for (i, ch) in bytes.chunks_exact(4).enumerate() {
                    let v = i32::from_le_bytes([ch[0], ch[1], ch[2], ch[3]]);
                    cells[i] = v as Cell;
                }
            }
            _ => {
                for (i, ch) in bytes.chunks_exact(8).enumerate() {
                    let v = i64::from_le_bytes([
                        ch[0], ch[1], ch[2], ch[3], ch[4], ch[5], ch[6], ch[7],
                    ]);
                    cells[i] = Cell::try_from(v).map_err(|_| {
                        load_err(format!(
                            "64 bit value {} at cell {} does not fit a {} bit cell",
                            v, i, CELL_BITS
                        ))
                    })?;
                }
            }
        }
        Ok((Image { cells }, file_cells))
    }

    /// Save the image to `path` at the requested on-disk width.
    ///
    /// With `shrink`, only cells below HERE (cell 3) are written, provided
    /// HERE is a valid index. A value that does not fit the target width is
    /// an error, and any error after file creation removes the partial file.
    pub fn save(&self, path: &Path, cell_bits: usize, shrink: bool) -> VmResult<()> {
        let end = if shrink {
            self.shrink_len()
        } else {
            self.cells.len()
        };
        let result = self.write_cells(path, cell_bits, end);
        if result.is_err() {
            let _ = fs::remove_file(path);
        }
        result
    }

    /// Number of cells the shrink policy would keep: HERE when cell 3 holds
    /// a valid index, the full image otherwise.
    pub fn shrink_len(&self) -> usize {
        if self.cells.len() < 4 {
            return self.cells.len();
        }
        let here = self.cells[3];
        if here >= 0 && (here as usize) < self.cells.len() {
            here as usize
        } else {
            self.cells.len()
        }
    }

    fn write_cells(&self, path: &Path, cell_bits: usize, end: usize) -> VmResult<()> {
        let save_err = |message: String| VmError::Save {
            path: path.display().to_string(),
            message,
        };

        let bits = match cell_bits {
            0 => CELL_BITS,
            32 | 64 => cell_bits,
            other => {
                return Err(save_err(format!(
                    "{} bit images are not supported",
                    other
                )))
            }
        };
        let f = File::create(path).map_err(|e| save_err(e.to_string()))?;
        let mut w = BufWriter::new(f);
        match bits {
            32 => {
                for (i, &v) in self.cells[..end].iter().enumerate() {
                    let nv = i32::try_from(v).map_err(|_| {
                        save_err(format!(
                            "value {} at cell {} does not fit 32 bits",
                            v, i
                        ))
                    })?;
                    w.write_all(&nv.to_le_bytes())
                        .map_err(|e| save_err(e.to_string()))?;
                }
            }
            _ => {
                for &v in &self.cells[..end] {
                    w.write_all(&(v as i64).to_le_bytes())
                        .map_err(|e| save_err(e.to_string()))?;
                }
            }
        }
        w.flush().map_err(|e| save_err(e.to_string()))
    }

    /// Decode the zero-terminated string starting at `start`. The trailing
    /// zero is not included. Cells that are not valid code points decode as
    /// U+FFFD.
    pub fn decode_string(&self, start: Cell) -> String {
        let mut s = String::new();
        let mut pos = start.max(0) as usize;
        while pos < self.cells.len() && self.cells[pos] != 0 {
            let c = u32::try_from(self.cells[pos])
                .ok()
                .and_then(char::from_u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            s.push(c);
            pos += 1;
        }
        s
    }

    /// Write `s` starting at `start`, one code point per cell, and
    /// terminate it with a zero cell.
    pub fn encode_string(&mut self, start: Cell, s: &str) -> VmResult<()> {
        let mut pos = start;
        for c in s.chars() {
            self.set(pos, c as Cell)?;
            pos += 1;
        }
        self.set(pos, 0)
    }

    /// Disassemble the cells at `pc`. Returns the position of the next
    /// opcode and the disassembly text. Cells that are not opcodes render
    /// as calls.
    pub fn disassemble(&self, pc: usize) -> (usize, String) {
        if pc >= self.cells.len() {
            return (pc + 1, "???".to_string());
        }
        let cell = self.cells[pc];
        match Opcode::from_cell(cell) {
            Some(op) if op.has_operand() => {
                if pc + 1 < self.cells.len() {
                    (pc + 2, format!("{}\t{}", op, self.cells[pc + 1]))
                } else {
                    (pc + 1, format!("{}\t???", op))
                }
            }
            Some(op) => (pc + 1, op.to_string()),
            None => (pc + 1, format!("call\t{}", cell)),
        }
    }
}
