//! Output sink and section images.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{AsmError, SourceLoc};
use crate::expr::{Expr, Location};
use crate::object::Section;
use crate::value::Value;

/// A field left for the linker because it references an external symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reloc {
    /// Byte offset of the field within the section.
    pub offset: u64,
    /// Field size in bytes.
    pub size: u8,
    /// Target symbol.
    pub symbol: String,
    /// Constant added to the symbol's address.
    pub addend: i64,
    /// Whether the field holds `symbol + addend - field address`.
    pub pc_relative: bool,
}

/// The bytes of one laid-out section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectionImage {
    /// Section name.
    pub name: String,
    /// Base address.
    pub start: u64,
    /// Section contents.
    pub bytes: Vec<u8>,
    /// Relocations against external symbols.
    pub relocs: Vec<Reloc>,
}

impl SectionImage {
    /// Section size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the section is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Byte sink handed to bytecodes during output.
///
/// Locations resolve against the final layout, so any expression over
/// labels of any section evaluates to a concrete address here.
#[derive(Debug)]
pub struct BytecodeOutput<'a> {
    sections: &'a [Section],
    base: u64,
    bytes: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl<'a> BytecodeOutput<'a> {
    pub(crate) fn new(sections: &'a [Section]) -> Self {
        Self {
            sections,
            base: 0,
            bytes: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub(crate) fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Bytes written so far (the current section offset).
    pub fn num_output(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Absolute address of the next byte written.
    pub fn address(&self) -> u64 {
        self.base + self.num_output()
    }

    /// Append raw bytes.
    pub fn output_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append `size` bytes of uninitialized space (written as zeros).
    pub fn output_gap(&mut self, size: u64) {
        self.output_fill(0, size);
    }

    /// Append `count` copies of `byte`.
    pub fn output_fill(&mut self, byte: u8, count: u64) {
        self.bytes.resize(self.bytes.len() + count as usize, byte);
    }

    /// Absolute address of a location in the final layout.
    pub fn location_address(&self, loc: Location) -> Option<u64> {
        crate::object::location_address(self.sections, loc)
    }

    /// Evaluate an expression against the final layout.
    pub fn evaluate(&self, expr: &Expr) -> Option<i64> {
        expr.evaluate_with(&|loc| self.location_address(loc).map(|a| a as i64))
    }

    /// Compute `value` into `buf` (little-endian, `buf.len()` bytes).
    ///
    /// `at` is the section offset the field will land at; a relative value
    /// records a relocation there and writes only its addend.
    pub fn write_value(
        &mut self,
        buf: &mut [u8],
        value: &Value,
        at: u64,
        pc_relative: bool,
        loc: SourceLoc,
    ) -> Result<(), AsmError> {
        if buf.is_empty() {
            return Err(AsmError::Value {
                detail: String::from("value field has no size"),
                loc,
            });
        }
        let v = match value.abs() {
            Some(e) => self.evaluate(e).ok_or_else(|| AsmError::TooComplex {
                detail: String::from("value"),
                loc,
            })?,
            None => 0,
        };
        let size = buf.len();
        if let Some(symbol) = value.rel() {
            self.relocs.push(Reloc {
                offset: at,
                size: size as u8,
                symbol: String::from(symbol),
                addend: v,
                pc_relative,
            });
        }
        if size < 8 {
            let bits = size as u32 * 8;
            let min = -(1i128 << (bits - 1));
            let max = (1i128 << bits) - 1;
            let wide = v as i128;
            if wide < min || wide > max {
                return Err(AsmError::ValueOverflow {
                    value: wide,
                    size: size as u8,
                    loc,
                });
            }
        }
        let le = v.to_le_bytes();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = le.get(i).copied().unwrap_or(if v < 0 { 0xFF } else { 0 });
        }
        Ok(())
    }

    /// Compute `value` and append it as a `size`-byte field.
    pub fn output_value(
        &mut self,
        value: &Value,
        size: usize,
        loc: SourceLoc,
    ) -> Result<(), AsmError> {
        let mut buf = alloc::vec![0u8; size];
        let at = self.num_output();
        self.write_value(&mut buf, value, at, false, loc)?;
        self.output_bytes(&buf);
        Ok(())
    }

    /// Record a relocation.
    pub fn add_reloc(&mut self, reloc: Reloc) {
        self.relocs.push(reloc);
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, Vec<Reloc>) {
        (self.bytes, self.relocs)
    }
}
