//! I/O for the Ngaro virtual machine: the input stream stack, the console
//! writer and the default port handlers.
//!
//! Input is a LIFO of byte readers decoded incrementally as UTF-8. A
//! program (or an embedder) can push a new source at any time; reads drain
//! the most recent source and fall back to the one below on EOF. Invalid
//! byte sequences decode as U+FFFD and never terminate the stream.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::cell::{Cell, CELL_BITS};
use crate::core::error::{IoOp, VmError, VmResult};

use super::Instance;

/// One byte reader decoded as UTF-8 code points.
struct CharReader {
    inner: Box<dyn Read>,
}

/// Expected sequence length for a UTF-8 lead byte; 0 when invalid.
fn utf8_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => 0,
    }
}

impl CharReader {
    fn read_byte(&mut self, b: &mut u8) -> io::Result<bool> {
        let mut one = [0u8; 1];
        loop {
            match self.inner.read(&mut one) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    *b = one[0];
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one code point; `None` at EOF. Truncated or malformed
    /// sequences yield U+FFFD.
    fn read_char(&mut self) -> io::Result<Option<char>> {
        let mut buf = [0u8; 4];
        if !self.read_byte(&mut buf[0])? {
            return Ok(None);
        }
        let len = utf8_len(buf[0]);
        if len == 0 {
            return Ok(Some(char::REPLACEMENT_CHARACTER));
        }
        for slot in buf.iter_mut().take(len).skip(1) {
            if !self.read_byte(slot)? {
                return Ok(Some(char::REPLACEMENT_CHARACTER));
            }
        }
        match std::str::from_utf8(&buf[..len]) {
            Ok(s) => Ok(Some(
                s.chars().next().unwrap_or(char::REPLACEMENT_CHARACTER),
            )),
            Err(_) => Ok(Some(char::REPLACEMENT_CHARACTER)),
        }
    }
}

/// LIFO stack of code-point readers backing port 1.
#[derive(Default)]
pub struct InputStack {
    readers: Vec<CharReader>,
}

impl InputStack {
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
        }
    }

    /// Prepend a new source; subsequent reads drain it first.
    pub fn push<R: Read + 'static>(&mut self, r: R) {
        self.readers.insert(
            0,
            CharReader {
                inner: Box::new(r),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Read the next code point. On EOF of the head source it is popped
    /// (dropping it closes any underlying file) and the next one services
    /// the read; when every source is exhausted this is `EndOfInput`.
    pub fn read_char(&mut self) -> VmResult<char> {
        while let Some(head) = self.readers.first_mut() {
            match head.read_char() {
                Ok(Some(c)) => return Ok(c),
                Ok(None) => {
                    self.readers.remove(0);
                }
                Err(e) => {
                    return Err(VmError::Io {
                        op: IoOp::In,
                        pc: -1,
                        message: e.to_string(),
                    })
                }
            }
        }
        Err(VmError::EndOfInput)
    }
}

fn unix_time() -> Cell {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as Cell)
        .unwrap_or(0)
}

impl Instance {
    /// WAIT dispatch. Does nothing when the ready flag (port 0) is already
    /// set; otherwise visits every bound WAIT handler whose port holds a
    /// non-zero value, in ascending port order.
    pub(crate) fn io_wait(&mut self) -> VmResult<()> {
        if self.ports[0] == 1 {
            return Ok(());
        }
        let bound: Vec<Cell> = self.wait_h.keys().copied().collect();
        for port in bound {
            if port < 0 || port as usize >= self.ports.len() {
                continue;
            }
            let v = self.ports[port as usize];
            if v == 0 {
                continue;
            }
            if let Some(mut h) = self.wait_h.remove(&port) {
                let r = h(self, v, port);
                self.wait_h.entry(port).or_insert(h);
                r?;
            }
        }
        Ok(())
    }

    /// Complete a WAIT request: store `v` in `port` and set the ready
    /// flag. WAIT handlers reply through this. Out-of-range ports are
    /// ignored.
    pub fn wait_reply(&mut self, v: Cell, port: Cell) {
        if port >= 0 && (port as usize) < self.ports.len() {
            self.ports[port as usize] = v;
            self.ports[0] = 1;
        }
    }

    /// Default WAIT behavior for ports 1, 2, 4 and 5, bound at
    /// construction. Custom handlers can delegate requests they do not
    /// recognize here, exactly as the canvas and capability overrides do.
    pub fn wait(&mut self, v: Cell, port: Cell) -> VmResult<()> {
        if v == 0 {
            return Ok(());
        }
        match port {
            1 => self.wait_input(v),
            2 => self.wait_output(v),
            4 => self.wait_file(v),
            5 => self.wait_query(v),
            _ => Ok(()),
        }
    }

    fn wait_input(&mut self, v: Cell) -> VmResult<()> {
        if v != 1 {
            return Ok(());
        }
        let c = self.input.read_char()?;
        if self.tty && c == '\u{4}' {
            // Ctrl-D on a raw terminal ends the session.
            return Err(VmError::EndOfInput);
        }
        self.wait_reply(c as Cell, 1);
        Ok(())
    }

    fn wait_output(&mut self, v: Cell) -> VmResult<()> {
        if v != 1 {
            return Ok(());
        }
        let r = self.pop();
        let c = u32::try_from(r)
            .ok()
            .and_then(char::from_u32)
            .unwrap_or(char::REPLACEMENT_CHARACTER);
        self.write_char(c)?;
        if self.tty && r == 8 {
            // Erase the glyph under the cursor.
            self.write_char(' ')?;
            self.write_char('\u{8}')?;
        }
        self.wait_reply(0, 2);
        Ok(())
    }

    fn write_char(&mut self, c: char) -> VmResult<()> {
        if let Some(w) = self.output.as_mut() {
            let mut buf = [0u8; 4];
            w.write_all(c.encode_utf8(&mut buf).as_bytes())
                .map_err(|e| VmError::Io {
                    op: IoOp::Wait,
                    pc: -1,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn wait_file(&mut self, v: Cell) -> VmResult<()> {
        self.ports[0] = 1;
        self.ports[4] = 0;
        match v {
            1 => {
                // Dump the memory image to the configured path.
                let path = self.image_file.clone();
                let shrink = self.shrink;
                self.image
                    .save(&path, 0, shrink)
                    .map_err(|e| VmError::Io {
                        op: IoOp::Wait,
                        pc: -1,
                        message: format!("image dump failed: {}", e),
                    })?;
            }
            2 => {
                // Include: open the named file as a new input source.
                let addr = self.pop();
                let path = self.image.decode_string(addr);
                let f = File::open(&path).map_err(|e| VmError::Io {
                    op: IoOp::Wait,
                    pc: -1,
                    message: format!("include {}: {}", path, e),
                })?;
                self.input.push(f);
            }
            _ => {}
        }
        Ok(())
    }

    /// Capability queries on port 5. Unknown selectors answer 0.
    fn wait_query(&mut self, v: Cell) -> VmResult<()> {
        let reply = match v {
            -1 => self.image.len() as Cell,
            -5 => self.data.depth() as Cell,
            -6 => self.address.depth() as Cell,
            -8 => unix_time(),
            -9 => {
                // Exit request: park the PC on the last cell; the WAIT
                // dispatch increment lands it exactly on image.len().
                self.pc = self.image.len() as Cell - 1;
                0
            }
            -10 => {
                // Environment query: name address on top, destination under.
                let src = self.pop();
                let dst = self.pop();
                let name = self.image.decode_string(src);
                let value = std::env::var(&name).unwrap_or_default();
                self.image.encode_string(dst, &value)?;
                0
            }
            -11 => self.console_size.map(|(w, _)| w).unwrap_or(0),
            -12 => self.console_size.map(|(_, h)| h).unwrap_or(0),
            -13 => CELL_BITS as Cell,
            -16 => self.data.capacity() as Cell,
            -17 => self.address.capacity() as Cell,
            _ => 0,
        };
        self.ports[5] = reply;
        self.ports[0] = 1;
        Ok(())
    }
}
