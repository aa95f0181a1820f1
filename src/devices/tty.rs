//! Line-buffered terminal device
//!
//! Input is pulled from a [`LineSource`] one line at a time and handed out
//! byte by byte. Output accumulates until a newline (or an explicit flush,
//! e.g. on close) and is then passed to a [`LineSink`] without the newline.

use crate::error::{Errno, FsResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Supplies terminal input a line at a time
pub trait LineSource {
    /// Next line without its terminator, `Ok(None)` at end of input
    ///
    /// `ErrorKind::WouldBlock` means no input is available yet.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Receives completed terminal output lines
pub trait LineSink {
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

impl<F: FnMut() -> io::Result<Option<String>>> LineSource for F {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        self()
    }
}

/// Queue of canned input lines
#[derive(Debug, Default, Clone)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl LineSource for ScriptedInput {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}

/// Sink that records lines into a shared buffer
///
/// Clones share the buffer, so one clone can be handed to the runtime while
/// another is kept to inspect the output.
#[derive(Debug, Default, Clone)]
pub struct CapturedLines {
    lines: Rc<RefCell<Vec<String>>>,
}

impl CapturedLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

impl LineSink for CapturedLines {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.lines.borrow_mut().push(line.to_string());
        Ok(())
    }
}

pub struct Tty {
    input: VecDeque<u8>,
    output: Vec<u8>,
    source: Option<Box<dyn LineSource>>,
    sink: Option<Box<dyn LineSink>>,
}

impl Tty {
    pub fn new(source: Option<Box<dyn LineSource>>, sink: Option<Box<dyn LineSink>>) -> Self {
        Self {
            input: VecDeque::new(),
            output: Vec::new(),
            source,
            sink,
        }
    }

    /// Bytes already buffered for reading
    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Read up to `buf.len()` bytes, stopping after a line terminator
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let mut read = 0;
        while read < buf.len() {
            if self.input.is_empty() && !self.fill_line(read)? {
                break;
            }
            let Some(byte) = self.input.pop_front() else {
                break;
            };
            buf[read] = byte;
            read += 1;
            if byte == b'\n' {
                break;
            }
        }
        Ok(read)
    }

    /// Pull the next line into the input buffer; false at end of input
    fn fill_line(&mut self, already_read: usize) -> FsResult<bool> {
        let source = self.source.as_mut().ok_or(Errno::NotSupported)?;
        match source.read_line() {
            Ok(Some(line)) => {
                self.input.extend(line.into_bytes());
                self.input.push_back(b'\n');
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if already_read == 0 {
                    Err(Errno::Again)
                } else {
                    Ok(false)
                }
            }
            Err(e) => {
                log::warn!("terminal input failed: {}", e);
                Err(Errno::Io)
            }
        }
    }

    /// Buffer output, emitting a line at each newline
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        if self.sink.is_none() {
            return Err(Errno::NotSupported);
        }
        for &byte in data {
            match byte {
                b'\n' => self.emit_line()?,
                0 => {}
                _ => self.output.push(byte),
            }
        }
        Ok(data.len())
    }

    /// Emit any partial line
    pub fn flush(&mut self) -> FsResult<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        self.emit_line()
    }

    fn emit_line(&mut self) -> FsResult<()> {
        let line = String::from_utf8_lossy(&self.output).into_owned();
        self.output.clear();
        let sink = self.sink.as_mut().ok_or(Errno::NotSupported)?;
        sink.write_line(&line).map_err(|e| {
            log::warn!("terminal output failed: {}", e);
            Errno::Io
        })
    }
}
