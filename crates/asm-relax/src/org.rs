//! Origin: pad up to an absolute section offset.

use crate::bytecode::{AddSpanFunc, BytecodeInfo, Contents, Expansion, SpecialType};
use crate::error::{AsmError, Diagnostics};
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;

/// Pads with `fill` so that the next bytecode starts at section offset
/// `start`.  Fails if preceding data already extends past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrgContents {
    start: u64,
    fill: u8,
}

impl OrgContents {
    /// Pad to `start` with `fill`.
    pub fn new(start: u64, fill: u8) -> Self {
        Self { start, fill }
    }

    fn pad(&self, bc: &BytecodeInfo, offset: i64) -> Result<u64, AsmError> {
        let current = offset.max(0) as u64;
        if current > self.start {
            return Err(AsmError::OrgOverlap {
                target: self.start,
                current,
                loc: bc.source,
            });
        }
        Ok(self.start - current)
    }
}

impl Contents for OrgContents {
    fn kind(&self) -> &'static str {
        "org"
    }

    fn finalize(
        &mut self,
        _: &BytecodeInfo,
        _: &SymbolTable,
        _: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        Ok(())
    }

    fn calc_len(&mut self, bc: &BytecodeInfo, _: &mut AddSpanFunc<'_>) -> Result<u64, AsmError> {
        self.pad(bc, bc.tail_offset() as i64)
    }

    fn expand(
        &mut self,
        bc: &BytecodeInfo,
        _: i32,
        _: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        let len = self.pad(bc, new_val)?;
        Ok(Expansion::keep(len, 0, self.start as i64))
    }

    fn output(&self, bc: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        out.output_fill(self.fill, bc.tail_len);
        Ok(())
    }

    fn special(&self) -> SpecialType {
        SpecialType::Offset
    }
}
