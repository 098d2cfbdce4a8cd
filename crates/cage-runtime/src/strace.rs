//! Strace-like tracing of dispatched syscalls.
//!
//! One line per call, `name(arg, arg, ...) = result`, emitted through
//! `log::info!` once the result is known.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{cage::CageId, memory::MemoryHandler, syscall::SyscallNumber};
use log::info;
use nix::errno::Errno;
use std::{convert::TryFrom, fmt};

/// How many characters to display from a string or memory buffer.
const BUFFER_DISPLAY_LEN: usize = 32;
/// Values below this are printed in decimal, others in hex.
const DECIMAL_DISPLAY_LIMIT: u64 = 0x1000;

/// State of strace structure.
enum TraceState {
    /// Initial state: we have only seen the function name.
    Func,
    /// We have seen one or more arguments.
    Args,
    /// We have seen the result of the function call.
    Done,
}

pub struct Strace {
    enabled: bool,
    state: TraceState,
    line: String,
}

/// Convert a vector of bytes into a printable ASCII string.
/// The bytes may contain readable text, which is useful to display,
/// but they may also contain binary data, so we cannot decode them as UTF-8.
pub fn strace_string(bytes: &[u8], max: usize) -> String {
    let mut res = String::from("\"");
    let n = bytes.len().min(max);
    for i in 0..n {
        let b = bytes[i];
        if (0x20..0x7f).contains(&b) {
            if b == b'\\' || b == b'"' {
                res.push('\\');
            }
            res.push(b as char)
        } else if b == b'\t' {
            res.push_str("\\t")
        } else if b == b'\n' {
            res.push_str("\\n")
        } else if i + 1 < n && bytes[i + 1].is_ascii_digit() {
            // The following character is a digit, so use three octal digits.
            res.push_str(&format!("\\{:03o}", b))
        } else {
            res.push_str(&format!("\\{:o}", b))
        }
    }
    res.push('"');
    if bytes.len() > max {
        res.push_str("...")
    }
    res
}

impl Strace {
    /// Start generating strace output for `syscall` issued by `cage`.
    pub fn func(enabled: bool, cage: CageId, syscall: u64) -> Self {
        let line = if enabled {
            match SyscallNumber::name_of(syscall) {
                Some(name) => format!("[{}] {}(", cage, name),
                None => format!("[{}] syscall_{}(", cage, syscall),
            }
        } else {
            String::new()
        };
        Strace {
            enabled,
            state: TraceState::Func,
            line,
        }
    }

    /// Common code for handling arguments: adds a comma as required.
    fn arg_print_comma(&mut self) {
        match self.state {
            TraceState::Func => self.state = TraceState::Args,
            TraceState::Args => self.line.push_str(", "),
            TraceState::Done => self.line.push_str(" <unexpected arg> "),
        }
    }

    /// Handle argument as decimal value.
    pub fn arg_dec<T: fmt::Display>(&mut self, n: T) {
        if !self.enabled {
            return;
        }
        self.arg_print_comma();
        self.line.push_str(&n.to_string());
    }

    /// Handle argument as hexadecimal value.
    pub fn arg_hex<T: fmt::LowerHex>(&mut self, n: T) {
        if !self.enabled {
            return;
        }
        self.arg_print_comma();
        self.line.push_str(&format!("0x{:x}", n));
    }

    /// Handle a raw argument slot: small values in decimal, addresses in hex.
    pub fn arg_value(&mut self, n: u64) {
        if n < DECIMAL_DISPLAY_LIMIT {
            self.arg_dec(n)
        } else {
            self.arg_hex(n)
        }
    }

    /// Print ellipsis ("...") for argument that we do not display.
    pub fn arg_dots(&mut self) {
        if !self.enabled {
            return;
        }
        self.arg_print_comma();
        self.line.push_str("...");
    }

    /// Handle argument that is a memory buffer.
    pub fn arg_buffer<T: MemoryHandler>(&mut self, mem: &T, adr: u32, len: u32) {
        if !self.enabled {
            return;
        }
        self.arg_print_comma();
        let shown = len.min(BUFFER_DISPLAY_LEN as u32 + 1);
        match mem.get_slice(adr, shown) {
            Ok(bytes) => self
                .line
                .push_str(&strace_string(bytes, BUFFER_DISPLAY_LEN)),
            Err(_) => self.line.push_str("BAD_MEM_REF"),
        }
    }

    /// Handle argument that is a NUL-terminated path.
    pub fn arg_path<T: MemoryHandler>(&mut self, mem: &T, adr: u32) {
        if !self.enabled {
            return;
        }
        self.arg_print_comma();
        let shown = mem
            .get_size()
            .saturating_sub(u64::from(adr))
            .min(BUFFER_DISPLAY_LEN as u64 + 1) as u32;
        match mem.get_slice(adr, shown) {
            Ok(bytes) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                self.line
                    .push_str(&strace_string(&bytes[..end], BUFFER_DISPLAY_LEN))
            }
            Err(_) => self.line.push_str("BAD_MEM_REF"),
        }
    }

    /// Handle the result returned from the call; this function is called
    /// last and emits the line.
    pub fn result(&mut self, result: i64) -> i64 {
        if !self.enabled {
            return result;
        }
        if let TraceState::Done = self.state {
            info!("Unexpected strace result: {}", result);
            return result;
        }
        self.state = TraceState::Done;
        if result < 0 {
            self.line
                .push_str(&format!(") = {} ({})", result, errno_name(result)));
        } else {
            self.line.push_str(&format!(") = {}", result));
        }
        info!("{}", self.line);
        result
    }

    /// The line built so far; complete once `result` has been called.
    pub fn line(&self) -> &str {
        &self.line
    }
}

fn errno_name(result: i64) -> &'static str {
    result
        .checked_neg()
        .and_then(|n| i32::try_from(n).ok())
        .map(|n| Errno::from_i32(n).desc())
        .unwrap_or("Unknown errno")
}
