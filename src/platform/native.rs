//! Native host bindings (tests, CLI embedding)

use super::{ConsoleStream, PlatformError, PlatformResult};
use crate::devices::{LineSink, LineSource};
use std::io::{self, BufRead, Write};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Monotonic milliseconds since first use
pub fn perf_now() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64() * 1000.0
}

/// Prints each terminal line to stdout or stderr
pub struct ConsoleSink {
    stream: ConsoleStream,
}

impl LineSink for ConsoleSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self.stream {
            ConsoleStream::Out => writeln!(io::stdout().lock(), "{}", line),
            ConsoleStream::Err => writeln!(io::stderr().lock(), "{}", line),
        }
    }
}

pub fn console(stream: ConsoleStream) -> Box<dyn LineSink> {
    Box::new(ConsoleSink { stream })
}

/// Reads terminal input lines from the process stdin
pub struct StdinLines;

impl LineSource for StdinLines {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

pub fn stdin_lines() -> Box<dyn LineSource> {
    Box::new(StdinLines)
}

/// Network fetch is only available in the browser
pub async fn fetch_bytes(url: &str) -> PlatformResult<Vec<u8>> {
    Err(PlatformError::NotSupported(format!(
        "fetching {} requires a browser host",
        url
    )))
}
