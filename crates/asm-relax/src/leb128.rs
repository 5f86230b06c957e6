//! LEB128-encoded values whose width follows the value.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bytecode::{AddSpanFunc, BytecodeInfo, Contents, Expansion, TOO_COMPLEX};
use crate::error::{AsmError, Diagnostics};
use crate::expr::Expr;
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;
use crate::value::Value;

/// Longest encoding of a 64-bit value.
const MAX_LEN: u64 = 10;

/// Append the LEB128 encoding of `v`, padded with continuation bytes to at
/// least `min_len` bytes.  Unsigned encoding treats `v` as `u64`.
pub fn encode(v: i64, signed: bool, min_len: usize, out: &mut Vec<u8>) {
    let mut count = 0;
    if signed {
        let mut v = v;
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            count += 1;
            let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
            let more = !done || count < min_len;
            out.push(if more { byte | 0x80 } else { byte });
            if !more {
                break;
            }
        }
    } else {
        let mut u = v as u64;
        loop {
            let byte = (u & 0x7F) as u8;
            u >>= 7;
            count += 1;
            let more = u != 0 || count < min_len;
            out.push(if more { byte | 0x80 } else { byte });
            if !more {
                break;
            }
        }
    }
}

/// Encoded length of `v`.
pub fn size(v: i64, signed: bool) -> u64 {
    if signed {
        let mut v = v;
        let mut n = 1;
        loop {
            let byte = v & 0x7F;
            v >>= 7;
            if (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0) {
                return n;
            }
            n += 1;
        }
    }
    let mut u = v as u64;
    let mut n = 1;
    while u >= 0x80 {
        u >>= 7;
        n += 1;
    }
    n
}

/// Values representable in `len` bytes.
fn window(len: u64, signed: bool) -> (i64, i64) {
    let bits = 7 * len;
    if signed {
        if bits >= 64 {
            (i64::MIN, i64::MAX)
        } else {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        }
    } else if len >= MAX_LEN {
        // the full u64 range, negatives included
        (i64::MIN, i64::MAX)
    } else if bits >= 63 {
        (0, i64::MAX)
    } else {
        (0, (1i64 << bits) - 1)
    }
}

/// A LEB128 field.  Constant values get their exact width; values that
/// depend on the layout start at one byte and widen as needed, never
/// shrinking.
#[derive(Debug, Clone)]
pub struct Leb128Contents {
    value: Expr,
    signed: bool,
    len: u64,
}

impl Leb128Contents {
    /// Encode `value`, signed or unsigned.
    pub fn new(value: impl Into<Expr>, signed: bool) -> Self {
        Self {
            value: value.into(),
            signed,
            len: 1,
        }
    }
}

impl Contents for Leb128Contents {
    fn kind(&self) -> &'static str {
        "leb128"
    }

    fn finalize(
        &mut self,
        bc: &BytecodeInfo,
        symbols: &SymbolTable,
        diags: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        self.value
            .expand_symbols(symbols)
            .map_err(|_| AsmError::CircularReference { loc: bc.source })?;
        self.value.simplify();
        if self.value.contains_sym() {
            return Err(AsmError::NotAbsolute {
                detail: String::from("LEB128 value"),
                loc: bc.source,
            });
        }
        if let Some(v) = self.value.as_int() {
            if !self.signed && v < 0 {
                diags.warn("negative value in unsigned LEB128", bc.source);
            }
        }
        Ok(())
    }

    fn calc_len(
        &mut self,
        _: &BytecodeInfo,
        add_span: &mut AddSpanFunc<'_>,
    ) -> Result<u64, AsmError> {
        if let Some(v) = self.value.as_int() {
            self.len = size(v, self.signed);
            return Ok(self.len);
        }
        let (lo, hi) = window(self.len, self.signed);
        add_span(1, Value::from_expr(self.value.clone()), lo, hi);
        Ok(self.len)
    }

    fn expand(
        &mut self,
        bc: &BytecodeInfo,
        _: i32,
        _: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        if new_val == TOO_COMPLEX {
            return Err(AsmError::NotAbsolute {
                detail: String::from("LEB128 value"),
                loc: bc.source,
            });
        }
        self.len = self.len.max(size(new_val, self.signed)).min(MAX_LEN);
        let (lo, hi) = window(self.len, self.signed);
        Ok(Expansion::keep(self.len, lo, hi))
    }

    fn output(&self, bc: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        let v = out
            .evaluate(&self.value)
            .ok_or_else(|| AsmError::TooComplex {
                detail: String::from("LEB128 value"),
                loc: bc.source,
            })?;
        let mut buf = Vec::with_capacity(bc.tail_len as usize);
        encode(v, self.signed, bc.tail_len as usize, &mut buf);
        if buf.len() as u64 != bc.tail_len {
            return Err(AsmError::ValueOverflow {
                value: i128::from(v),
                size: bc.tail_len as u8,
                loc: bc.source,
            });
        }
        out.output_bytes(&buf);
        Ok(())
    }
}
