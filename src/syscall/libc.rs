//! libc hooks the module's runtime library delegates to the host
//!
//! C++ exception allocation and throw, and `strftime` in the C locale.

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Runtime;
use bytemuck::{Pod, Zeroable};
use std::fmt::Write;

/// Bytes of bookkeeping in front of every thrown object
pub const EXCEPTION_HEADER: u32 = 24;

/// `struct tm` as laid out in module memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Tm {
    pub sec: i32,
    pub min: i32,
    pub hour: i32,
    pub mday: i32,
    pub mon: i32,
    /// Years since 1900
    pub year: i32,
    pub wday: i32,
    pub yday: i32,
    pub isdst: i32,
    pub gmtoff: i32,
    /// Pointer to the zone abbreviation, or 0
    pub zone: u32,
}

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn name(table: &[&'static str], index: i32) -> &'static str {
    usize::try_from(index)
        .ok()
        .and_then(|i| table.get(i).copied())
        .unwrap_or("?")
}

fn short(table: &[&'static str], index: i32) -> &'static str {
    let full = name(table, index);
    &full[..full.len().min(3)]
}

/// Expand `format` for `tm`
pub fn format_tm(format: &str, tm: &Tm, zone: &str) -> String {
    let mut out = String::with_capacity(format.len() * 2);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut conversion = chars.next();
        // E and O modifiers select alternative representations the C locale lacks
        if matches!(conversion, Some('E') | Some('O')) {
            conversion = chars.next();
        }
        let Some(conversion) = conversion else {
            out.push('%');
            break;
        };
        expand(&mut out, conversion, tm, zone);
    }
    out
}

fn expand(out: &mut String, conversion: char, tm: &Tm, zone: &str) {
    let year = tm.year as i64 + 1900;
    let hour12 = match tm.hour % 12 {
        0 => 12,
        h => h,
    };
    // Writing to a String cannot fail
    let _ = match conversion {
        'a' => write!(out, "{}", short(&WEEKDAYS, tm.wday)),
        'A' => write!(out, "{}", name(&WEEKDAYS, tm.wday)),
        'b' | 'h' => write!(out, "{}", short(&MONTHS, tm.mon)),
        'B' => write!(out, "{}", name(&MONTHS, tm.mon)),
        'c' => write!(out, "{}", format_tm("%a %b %e %H:%M:%S %Y", tm, zone)),
        'C' => write!(out, "{:02}", year.div_euclid(100)),
        'd' => write!(out, "{:02}", tm.mday),
        'D' | 'x' => write!(out, "{}", format_tm("%m/%d/%y", tm, zone)),
        'e' => write!(out, "{:2}", tm.mday),
        'F' => write!(out, "{}", format_tm("%Y-%m-%d", tm, zone)),
        'H' => write!(out, "{:02}", tm.hour),
        'I' => write!(out, "{:02}", hour12),
        'j' => write!(out, "{:03}", tm.yday + 1),
        'm' => write!(out, "{:02}", tm.mon + 1),
        'M' => write!(out, "{:02}", tm.min),
        'n' => out.write_char('\n'),
        'p' => write!(out, "{}", if tm.hour < 12 { "AM" } else { "PM" }),
        'r' => write!(out, "{}", format_tm("%I:%M:%S %p", tm, zone)),
        'R' => write!(out, "{}", format_tm("%H:%M", tm, zone)),
        'S' => write!(out, "{:02}", tm.sec),
        't' => out.write_char('\t'),
        'T' | 'X' => write!(out, "{}", format_tm("%H:%M:%S", tm, zone)),
        'u' => write!(out, "{}", if tm.wday == 0 { 7 } else { tm.wday }),
        'U' => write!(out, "{:02}", (tm.yday + 7 - tm.wday) / 7),
        'w' => write!(out, "{}", tm.wday),
        'W' => write!(out, "{:02}", (tm.yday + 7 - (tm.wday + 6) % 7) / 7),
        'y' => write!(out, "{:02}", year.rem_euclid(100)),
        'Y' => write!(out, "{}", year),
        'z' => {
            let minutes = tm.gmtoff / 60;
            let sign = if minutes < 0 { '-' } else { '+' };
            let minutes = minutes.abs();
            write!(out, "{}{:02}{:02}", sign, minutes / 60, minutes % 60)
        }
        'Z' => write!(out, "{}", zone),
        '%' => out.write_char('%'),
        other => write!(out, "%{}", other),
    };
}

impl Runtime {
    // ========================================================================
    // C++ exceptions
    // ========================================================================

    /// Allocate a thrown object of `size` bytes behind its header
    pub fn cxa_allocate_exception(&mut self, size: u32) -> RuntimeResult<u32> {
        let block = self.alloc(size.saturating_add(EXCEPTION_HEADER))?;
        self.memory.fill(block.offset, EXCEPTION_HEADER, 0)?;
        Ok(block.offset + EXCEPTION_HEADER)
    }

    /// Record the thrown object's type and destructor, then trap
    ///
    /// Nothing on the host side can catch, so every throw unwinds out of
    /// the current call.
    pub fn cxa_throw(&mut self, thrown: u32, type_info: u32, destructor: u32) -> RuntimeError {
        let header = thrown.wrapping_sub(EXCEPTION_HEADER);
        let recorded = self
            .memory
            .fill(header, EXCEPTION_HEADER, 0)
            .and_then(|()| self.memory.write_u32(header + 4, type_info))
            .and_then(|()| self.memory.write_u32(header + 8, destructor));
        if let Err(e) = recorded {
            return e;
        }
        log::warn!("uncaught C++ exception {:#x} (type info {:#x})", thrown, type_info);
        RuntimeError::Trap {
            reason: format!("uncaught C++ exception at {:#x}", thrown),
        }
    }

    // ========================================================================
    // Time formatting
    // ========================================================================

    /// Format `tm` into `buf`; the byte count without the NUL, or 0 if it
    /// does not fit in `max_size`
    pub fn strftime(&mut self, buf: u32, max_size: u32, format: u32, tm: u32) -> RuntimeResult<u32> {
        let format = self.memory.read_cstring(format)?;
        let tm: Tm = self.memory.read_pod(tm)?;
        let zone = match tm.zone {
            0 => String::new(),
            at => self.memory.read_cstring(at)?,
        };

        let text = format_tm(&format, &tm, &zone);
        if text.len() >= max_size as usize {
            return Ok(0);
        }
        self.memory.write_cstring(buf, &text)?;
        Ok(text.len() as u32)
    }
}
