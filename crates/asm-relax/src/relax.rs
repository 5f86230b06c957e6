//! PC-relative branches with a short and a long encoding.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bytecode::{AddSpanFunc, BytecodeInfo, Contents, Expansion};
use crate::error::{AsmError, Diagnostics};
use crate::expr::Expr;
use crate::output::{BytecodeOutput, Reloc};
use crate::symbol::SymbolTable;
use crate::value::Value;

/// Which encoding a branch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    /// 8-bit displacement.
    Short,
    /// Full-width displacement.
    Long,
}

/// One encoding of a branch: opcode bytes followed by a displacement field
/// that ends the instruction.  The displacement is relative to the end of
/// the instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    /// Opcode bytes.
    pub opcode: Vec<u8>,
    /// Displacement size in bytes (1, 2 or 4).
    pub disp_size: u8,
}

impl Encoding {
    /// Opcode bytes plus a `disp_size`-byte displacement.
    pub fn new(opcode: &[u8], disp_size: u8) -> Self {
        Self {
            opcode: opcode.to_vec(),
            disp_size,
        }
    }

    /// Instruction length.
    pub fn len(&self) -> u64 {
        self.opcode.len() as u64 + u64::from(self.disp_size)
    }

    /// Whether the encoding is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self) -> (i64, i64) {
        let bits = (u32::from(self.disp_size) * 8).clamp(8, 32);
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    }
}

/// A branch to `target` that starts short and is widened permanently once
/// the target drifts out of the short displacement's reach.
///
/// Targets that are external symbols or otherwise not computable during
/// layout use the long form and, if external, leave a relocation.
///
/// # Examples
///
/// ```rust
/// use asm_relax::{Form, RelaxableBranch};
///
/// let jmp = RelaxableBranch::jmp("loop_top");
/// assert_eq!(jmp.form(), Form::Short);
/// let call = RelaxableBranch::call("printf");
/// assert_eq!(call.form(), Form::Long);
/// ```
#[derive(Debug, Clone)]
pub struct RelaxableBranch {
    target: Expr,
    /// `target` minus the branch start, set by finalize.
    value: Option<Value>,
    short: Option<Encoding>,
    long: Encoding,
    form: Form,
}

impl RelaxableBranch {
    /// A branch with the given encodings.  Without a short encoding the
    /// branch is always long.
    pub fn new(target: impl Into<Expr>, short: Option<Encoding>, long: Encoding) -> Self {
        let form = if short.is_some() { Form::Short } else { Form::Long };
        Self {
            target: target.into(),
            value: None,
            short,
            long,
            form,
        }
    }

    /// x86 `jmp`: `EB rel8` / `E9 rel32`.
    pub fn jmp(target: impl Into<Expr>) -> Self {
        Self::new(target, Some(Encoding::new(&[0xEB], 1)), Encoding::new(&[0xE9], 4))
    }

    /// x86 `jcc` with condition code `cc` (0..=15): `70+cc rel8` /
    /// `0F 80+cc rel32`.
    pub fn jcc(cc: u8, target: impl Into<Expr>) -> Self {
        let cc = cc & 0x0F;
        Self::new(
            target,
            Some(Encoding::new(&[0x70 + cc], 1)),
            Encoding::new(&[0x0F, 0x80 + cc], 4),
        )
    }

    /// x86 `call rel32`.
    pub fn call(target: impl Into<Expr>) -> Self {
        Self::new(target, None, Encoding::new(&[0xE8], 4))
    }

    /// Start in the long form (`jmp near`).
    pub fn long(mut self) -> Self {
        self.form = Form::Long;
        self
    }

    /// Current form.
    pub fn form(&self) -> Form {
        self.form
    }

    fn encoding(&self) -> &Encoding {
        match (self.form, &self.short) {
            (Form::Short, Some(short)) => short,
            _ => &self.long,
        }
    }
}

impl Contents for RelaxableBranch {
    fn kind(&self) -> &'static str {
        "branch"
    }

    fn finalize(
        &mut self,
        bc: &BytecodeInfo,
        symbols: &SymbolTable,
        _: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        let mut value = Value::from_expr(self.target.clone()).signed(true);
        value.finalize(symbols, bc.source)?;
        value.sub_location(bc.tail_loc());
        if value.is_relative() {
            self.form = Form::Long;
        }
        self.value = Some(value);
        Ok(())
    }

    fn calc_len(
        &mut self,
        _: &BytecodeInfo,
        add_span: &mut AddSpanFunc<'_>,
    ) -> Result<u64, AsmError> {
        if let (Form::Short, Some(short), Some(value)) = (self.form, &self.short, &self.value) {
            let len = short.len() as i64;
            let (lo, hi) = short.range();
            add_span(1, value.clone(), lo + len, hi + len);
        }
        Ok(self.encoding().len())
    }

    fn expand(&mut self, _: &BytecodeInfo, _: i32, _: i64, _: i64) -> Result<Expansion, AsmError> {
        self.form = Form::Long;
        Ok(Expansion::done(self.long.len()))
    }

    fn output(&self, bc: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        let enc = self.encoding();
        let value = self.value.as_ref().ok_or_else(|| AsmError::TooComplex {
            detail: String::from("branch target"),
            loc: bc.source,
        })?;
        // The branch may be one copy of a repetition, so its address is
        // where the output is, not where its location says.
        let start = out.address() as i64;
        out.output_bytes(&enc.opcode);
        let size = usize::from(enc.disp_size);

        if let Some(symbol) = value.rel() {
            // value.abs = addend - $; the relocation wants the addend
            // relative to the displacement field.
            let here = out.location_address(bc.tail_loc()).unwrap_or(0) as i64;
            let abs = value.abs().and_then(|e| out.evaluate(e)).unwrap_or(-here);
            let addend = abs + here - (enc.len() as i64 - enc.opcode.len() as i64);
            let offset = out.num_output();
            out.add_reloc(Reloc {
                offset,
                size: enc.disp_size,
                symbol: String::from(symbol),
                addend,
                pc_relative: true,
            });
            out.output_gap(size as u64);
            return Ok(());
        }

        let target = value
            .abs()
            .and_then(|e| out.evaluate(e))
            .zip(out.location_address(bc.tail_loc()))
            .map(|(rel, here)| rel + here as i64)
            .ok_or_else(|| AsmError::TooComplex {
                detail: String::from("branch target"),
                loc: bc.source,
            })?;
        let disp = target - (start + enc.len() as i64);
        let (lo, hi) = enc.range();
        if disp < lo || disp > hi {
            return Err(AsmError::BranchOutOfRange {
                disp,
                max: hi,
                loc: bc.source,
            });
        }
        out.output_bytes(&disp.to_le_bytes()[..size]);
        Ok(())
    }
}
