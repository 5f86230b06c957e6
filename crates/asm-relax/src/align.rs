//! Alignment padding.

use alloc::string::String;

use crate::bytecode::{AddSpanFunc, BytecodeInfo, Contents, Expansion, SpecialType};
use crate::error::{AsmError, Diagnostics, SourceLoc};
use crate::expr::Expr;
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;

/// Intel-recommended multi-byte NOPs, indexed by length.
const NOP_SEQUENCES: [&[u8]; 10] = [
    &[],
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Write `n` bytes of x86 NOPs, longest sequences first.
pub(crate) fn nop_padding(out: &mut BytecodeOutput<'_>, mut n: u64) {
    while n > 0 {
        let chunk = n.min(9) as usize;
        out.output_bytes(NOP_SEQUENCES[chunk]);
        n -= chunk as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    Zero,
    Byte(u8),
    Nop,
}

/// Pads to the next multiple of a power-of-two boundary.
///
/// An offset-setter: its length is a function of where it starts.  With
/// a max-skip, padding that would exceed it is dropped altogether.
#[derive(Debug, Clone)]
pub struct AlignContents {
    boundary: Expr,
    fill: Option<Expr>,
    max_skip: Option<Expr>,
    nop: bool,
    // resolved by finalize
    boundary_val: u64,
    fill_val: Fill,
    max_skip_val: Option<u64>,
}

impl AlignContents {
    /// Align to `boundary` bytes, padding with zeros.
    pub fn new(boundary: impl Into<Expr>) -> Self {
        Self {
            boundary: boundary.into(),
            fill: None,
            max_skip: None,
            nop: false,
            boundary_val: 0,
            fill_val: Fill::Zero,
            max_skip_val: None,
        }
    }

    /// Pad with `byte` instead of zeros.
    pub fn with_fill(mut self, byte: impl Into<Expr>) -> Self {
        self.fill = Some(byte.into());
        self
    }

    /// Skip the alignment if it would take more than `max` bytes.
    pub fn with_max_skip(mut self, max: impl Into<Expr>) -> Self {
        self.max_skip = Some(max.into());
        self
    }

    /// Pad with x86 multi-byte NOPs.
    pub fn with_nop_fill(mut self) -> Self {
        self.nop = true;
        self
    }

    /// Padding needed at tail offset `offset`, and the offset up to which
    /// that answer holds.
    fn padding(&self, offset: u64) -> (u64, i64) {
        let boundary = self.boundary_val;
        if boundary <= 1 {
            return (0, i64::MAX);
        }
        let end = offset.div_ceil(boundary) * boundary;
        let len = end - offset;
        match self.max_skip_val {
            Some(max) if len > max => (0, end as i64 - max as i64 - 1),
            _ => (len, end as i64),
        }
    }
}

fn constant(
    expr: &mut Expr,
    what: &str,
    symbols: &SymbolTable,
    loc: SourceLoc,
) -> Result<i64, AsmError> {
    expr.expand_symbols(symbols)
        .map_err(|_| AsmError::CircularReference { loc })?;
    expr.simplify();
    expr.as_int().ok_or_else(|| AsmError::NotConstant {
        detail: String::from(what),
        loc,
    })
}

impl Contents for AlignContents {
    fn kind(&self) -> &'static str {
        "align"
    }

    fn finalize(
        &mut self,
        bc: &BytecodeInfo,
        symbols: &SymbolTable,
        _: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        let loc = bc.source;
        let boundary = constant(&mut self.boundary, "align boundary", symbols, loc)?;
        if boundary < 0 || (boundary != 0 && !(boundary as u64).is_power_of_two()) {
            return Err(AsmError::Value {
                detail: alloc::format!("alignment boundary {} is not a power of two", boundary),
                loc,
            });
        }
        self.boundary_val = boundary as u64;

        self.fill_val = if self.nop {
            Fill::Nop
        } else if let Some(fill) = self.fill.as_mut() {
            let v = constant(fill, "align fill", symbols, loc)?;
            Fill::Byte(v as u8)
        } else {
            Fill::Zero
        };

        if let Some(max) = self.max_skip.as_mut() {
            let v = constant(max, "align maximum skip", symbols, loc)?;
            if v < 0 {
                return Err(AsmError::Value {
                    detail: String::from("align maximum skip is negative"),
                    loc,
                });
            }
            self.max_skip_val = Some(v as u64);
        }
        Ok(())
    }

    fn calc_len(&mut self, bc: &BytecodeInfo, _: &mut AddSpanFunc<'_>) -> Result<u64, AsmError> {
        Ok(self.padding(bc.tail_offset()).0)
    }

    fn expand(
        &mut self,
        _: &BytecodeInfo,
        _: i32,
        _: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        let (len, thres) = self.padding(new_val.max(0) as u64);
        Ok(Expansion::keep(len, 0, thres))
    }

    fn output(&self, bc: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        match self.fill_val {
            Fill::Zero => out.output_gap(bc.tail_len),
            Fill::Byte(b) => out.output_fill(b, bc.tail_len),
            Fill::Nop => nop_padding(out, bc.tail_len),
        }
        Ok(())
    }

    fn special(&self) -> SpecialType {
        SpecialType::Offset
    }
}
