//! External/builtin functions the interpreter applies directly rather than
//! looking up in the module's function table: the SysY-style I/O builtins
//! (`getint`/`putint`/...) and the two timing no-ops. Anything else naming
//! no function in the module is an error -- the front-end is responsible
//! for rejecting calls to truly unknown externs before this IR is built.

use std::io::Write as _;

use crate::error::{InterpError, InterpResult};
use crate::memory::Memory;
use crate::value::Value;

pub struct Stdin<'a> {
    tokens: std::str::SplitWhitespace<'a>,
    original: &'a str,
    consumed_bytes: usize,
}

impl<'a> Stdin<'a> {
    pub fn new(input: &'a str) -> Self {
        Stdin { tokens: input.split_whitespace(), original: input, consumed_bytes: 0 }
    }

    fn next_int(&mut self) -> i64 {
        self.tokens.next().and_then(|t| t.parse::<i64>().ok()).unwrap_or(0)
    }

    fn next_float(&mut self) -> f32 {
        self.tokens.next().and_then(|t| t.parse::<f32>().ok()).unwrap_or(0.0)
    }

    /// `getch` reads a single raw byte rather than a whitespace-delimited
    /// token; tracked separately from the tokenizer used by the other
    /// `get*` builtins.
    fn next_byte(&mut self) -> i64 {
        let bytes = self.original.as_bytes();
        if self.consumed_bytes < bytes.len() {
            let b = bytes[self.consumed_bytes];
            self.consumed_bytes += 1;
            b as i64
        } else {
            0
        }
    }
}

pub fn apply_extern(name: &str, args: &[Value], stdin: &mut Stdin, stdout: &mut String, memory: &mut Memory) -> InterpResult<Value> {
    match name {
        "getint" => Ok(Value::Int(stdin.next_int())),
        "getch" => Ok(Value::Int(stdin.next_byte())),
        "getfloat" => Ok(Value::Float(stdin.next_float())),
        "getarray" => {
            let n = stdin.next_int();
            let base = args[0].as_int();
            for i in 0..n {
                let v = stdin.next_int() as i32;
                memory.write_i32(base + i * 4, v)?;
            }
            Ok(Value::Int(n))
        }
        "getfarray" => {
            let n = stdin.next_int();
            let base = args[0].as_int();
            for i in 0..n {
                let v = stdin.next_float();
                memory.write_f32(base + i * 4, v)?;
            }
            Ok(Value::Int(n))
        }
        "putint" => {
            write!(stdout, "{}", args[0].as_i32()).ok();
            Ok(Value::Int(0))
        }
        "putch" => {
            stdout.push((args[0].as_i32() as u8) as char);
            Ok(Value::Int(0))
        }
        "putfloat" => {
            write!(stdout, "{}", args[0].as_float()).ok();
            Ok(Value::Int(0))
        }
        "putarray" => {
            let n = args[0].as_i32();
            let base = args[1].as_int();
            write!(stdout, "{n}:").ok();
            for i in 0..n as i64 {
                let v = memory.read_i32(base + i * 4)?;
                write!(stdout, " {v}").ok();
            }
            stdout.push('\n');
            Ok(Value::Int(0))
        }
        "putfarray" => {
            let n = args[0].as_i32();
            let base = args[1].as_int();
            write!(stdout, "{n}:").ok();
            for i in 0..n as i64 {
                let v = memory.read_f32(base + i * 4)?;
                write!(stdout, " {v}").ok();
            }
            stdout.push('\n');
            Ok(Value::Int(0))
        }
        "_sysy_starttime" | "_sysy_stoptime" | "starttime" | "stoptime" => Ok(Value::Int(0)),
        other => Err(InterpError::UnknownExtern(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getint_reads_whitespace_tokens_in_order() {
        let mut stdin = Stdin::new("10 20 30");
        assert_eq!(stdin.next_int(), 10);
        assert_eq!(stdin.next_int(), 20);
        assert_eq!(stdin.next_int(), 30);
    }

    #[test]
    fn putint_writes_decimal() {
        let mut stdin = Stdin::new("");
        let mut stdout = String::new();
        let mut mem = Memory::new();
        apply_extern("putint", &[Value::Int(42)], &mut stdin, &mut stdout, &mut mem).unwrap();
        assert_eq!(stdout, "42");
    }
}
