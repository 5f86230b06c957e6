//! Bytecodes: a fixed byte prefix plus optional variable-length contents.
//!
//! Every bytecode is laid out as `[fixed bytes][tail]`.  The fixed part is
//! known when the bytecode is built; the tail is produced by a
//! [`Contents`] implementation whose length may depend on the final
//! layout.  Contents that depend on a layout quantity register a *span*
//! from [`Contents::calc_len`] and are told through [`Contents::expand`]
//! when that quantity leaves the range they can tolerate.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{AsmError, Diagnostics, SourceLoc};
use crate::expr::{BytecodeRef, Location};
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;
use crate::value::Value;

/// Span value standing for "cannot be computed" (external or unsolvable).
/// Contents receiving it must pick their largest form.
pub const TOO_COMPLEX: i64 = i64::MAX;

/// Whether a bytecode's length is driven by its own start offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecialType {
    /// Ordinary bytecode.
    #[default]
    None,
    /// Offset-setter (alignment, origin): its tail length is recomputed
    /// from its tail offset every time preceding bytecodes change size.
    Offset,
}

/// Result of [`Contents::expand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    /// New tail length.
    pub len: u64,
    /// Keep the span alive with the new thresholds.  `false` retires it.
    pub keep: bool,
    /// New lower threshold.
    pub neg_thres: i64,
    /// New upper threshold.
    pub pos_thres: i64,
}

impl Expansion {
    /// Final expansion: the span is retired.
    pub fn done(len: u64) -> Self {
        Self {
            len,
            keep: false,
            neg_thres: 0,
            pos_thres: 0,
        }
    }

    /// Expansion that keeps watching the span within `[neg_thres, pos_thres]`.
    pub fn keep(len: u64, neg_thres: i64, pos_thres: i64) -> Self {
        Self {
            len,
            keep: true,
            neg_thres,
            pos_thres,
        }
    }
}

/// Snapshot of the bytecode a [`Contents`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeInfo {
    /// Handle of the bytecode.
    pub bc: BytecodeRef,
    /// Start offset within the section.
    pub offset: u64,
    /// Length of the fixed prefix.
    pub fixed_len: u64,
    /// Current tail length.
    pub tail_len: u64,
    /// Global sequence number assigned by the optimizer.
    pub index: usize,
    /// Originating source construct.
    pub source: SourceLoc,
}

impl BytecodeInfo {
    /// Section offset of the tail.
    pub fn tail_offset(&self) -> u64 {
        self.offset + self.fixed_len
    }

    /// Location of the tail start (`$` for the contents).
    pub fn tail_loc(&self) -> Location {
        Location::new(self.bc, self.fixed_len)
    }
}

/// Span registration callback: `(id, dependent value, neg_thres, pos_thres)`.
pub type AddSpanFunc<'a> = dyn FnMut(i32, Value, i64, i64) + 'a;

/// Variable-length tail of a bytecode.
///
/// Implementations must keep [`calc_len`](Contents::calc_len) idempotent,
/// only grow from [`expand`](Contents::expand) (except offset-setters), and
/// produce exactly the last computed length from
/// [`output`](Contents::output).
pub trait Contents: fmt::Debug + Send {
    /// Short kind name for diagnostics.
    fn kind(&self) -> &'static str;

    /// Resolve symbols and check expressions once all symbols are known.
    fn finalize(
        &mut self,
        bc: &BytecodeInfo,
        symbols: &SymbolTable,
        diags: &mut Diagnostics,
    ) -> Result<(), AsmError>;

    /// Minimum tail length, registering spans through `add_span`.
    fn calc_len(
        &mut self,
        bc: &BytecodeInfo,
        add_span: &mut AddSpanFunc<'_>,
    ) -> Result<u64, AsmError>;

    /// React to span `span` moving from `old_val` to `new_val`.
    fn expand(
        &mut self,
        bc: &BytecodeInfo,
        span: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        let _ = (span, old_val, new_val);
        Err(AsmError::TooComplex {
            detail: alloc::format!("{} length", self.kind()),
            loc: bc.source,
        })
    }

    /// Write exactly the current tail length of bytes.
    fn output(&self, bc: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError>;

    /// Offset-setter classification.
    fn special(&self) -> SpecialType {
        SpecialType::None
    }
}

/// A value patched into the fixed bytes at output.
#[derive(Debug, Clone)]
pub struct Fixup {
    /// Offset of the field in the fixed bytes.
    pub off: usize,
    /// Field value; its size selects the field width.
    pub value: Value,
}

/// One unit of layout.
#[derive(Debug, Default)]
pub struct Bytecode {
    fixed: Vec<u8>,
    fixups: Vec<Fixup>,
    contents: Option<Box<dyn Contents>>,
    bc_ref: BytecodeRef,
    source: SourceLoc,
    offset: u64,
    index: usize,
    tail_len: u64,
}

impl Bytecode {
    /// An empty bytecode.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bytecode whose tail is `contents`.
    pub fn with_contents(contents: Box<dyn Contents>, source: SourceLoc) -> Self {
        Self {
            contents: Some(contents),
            source,
            ..Self::default()
        }
    }

    /// Install `contents` as the tail.  Fixed bytes are kept.
    pub fn transform(&mut self, contents: Box<dyn Contents>) {
        self.contents = Some(contents);
        self.tail_len = 0;
    }

    /// Whether a tail is installed.
    pub fn has_contents(&self) -> bool {
        self.contents.is_some()
    }

    /// The tail implementation.
    pub fn contents(&self) -> Option<&dyn Contents> {
        self.contents.as_deref()
    }

    /// Offset-setter classification of the tail.
    pub fn special(&self) -> SpecialType {
        self.contents
            .as_ref()
            .map_or(SpecialType::None, |c| c.special())
    }

    /// Fixed bytes.
    pub fn fixed(&self) -> &[u8] {
        &self.fixed
    }

    /// Append raw bytes to the fixed part.
    pub fn append_fixed_bytes(&mut self, bytes: &[u8]) {
        self.fixed.extend_from_slice(bytes);
    }

    /// Reserve a field for `value` in the fixed part.
    pub fn append_fixed(&mut self, value: Value) {
        let off = self.fixed.len();
        let size = (value.size() as usize).div_ceil(8);
        self.fixed.resize(off + size, 0);
        self.fixups.push(Fixup { off, value });
    }

    /// Pending fixups.
    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Originating source construct.
    pub fn source(&self) -> SourceLoc {
        self.source
    }

    /// Set the originating source construct.
    pub fn set_source(&mut self, source: SourceLoc) {
        self.source = source;
    }

    /// Handle of this bytecode.
    pub fn bc_ref(&self) -> BytecodeRef {
        self.bc_ref
    }

    pub(crate) fn set_bc_ref(&mut self, bc_ref: BytecodeRef) {
        self.bc_ref = bc_ref;
    }

    /// Section offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Global sequence number.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Length of the fixed part.
    pub fn fixed_len(&self) -> u64 {
        self.fixed.len() as u64
    }

    /// Current tail length.
    pub fn tail_len(&self) -> u64 {
        self.tail_len
    }

    /// Fixed plus tail length.
    pub fn total_len(&self) -> u64 {
        self.fixed_len() + self.tail_len
    }

    /// Section offset of the tail.
    pub fn tail_offset(&self) -> u64 {
        self.offset + self.fixed_len()
    }

    /// Section offset just past this bytecode.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.total_len()
    }

    /// Snapshot handed to the contents.
    pub fn info(&self) -> BytecodeInfo {
        BytecodeInfo {
            bc: self.bc_ref,
            offset: self.offset,
            fixed_len: self.fixed_len(),
            tail_len: self.tail_len,
            index: self.index,
            source: self.source,
        }
    }

    /// Finalize fixups and contents.
    pub fn finalize(
        &mut self,
        symbols: &SymbolTable,
        diags: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        for fixup in &mut self.fixups {
            fixup.value.finalize(symbols, self.source)?;
        }
        let info = self.info();
        if let Some(contents) = self.contents.as_mut() {
            contents.finalize(&info, symbols, diags)?;
        }
        Ok(())
    }

    /// Compute the minimum tail length.
    pub fn calc_len(&mut self, add_span: &mut AddSpanFunc<'_>) -> Result<(), AsmError> {
        let info = self.info();
        self.tail_len = match self.contents.as_mut() {
            Some(contents) => contents.calc_len(&info, add_span)?,
            None => 0,
        };
        Ok(())
    }

    /// Forward a span change to the contents and adopt the new tail length.
    pub fn expand(&mut self, span: i32, old_val: i64, new_val: i64) -> Result<Expansion, AsmError> {
        let info = self.info();
        let Some(contents) = self.contents.as_mut() else {
            return Ok(Expansion::done(0));
        };
        let exp = contents.expand(&info, span, old_val, new_val)?;
        self.tail_len = exp.len;
        Ok(exp)
    }

    /// Move to `offset`.  Offset-setters recompute their tail from the new
    /// tail offset.  Returns the next bytecode's offset.
    pub fn update_offset(&mut self, offset: u64) -> Result<u64, AsmError> {
        self.offset = offset;
        if self.special() == SpecialType::Offset {
            self.expand(1, 0, self.tail_offset() as i64)?;
        }
        Ok(self.next_offset())
    }

    /// Write fixed bytes (with fixups applied) followed by the tail.
    pub fn output(&self, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        let start = out.num_output();
        let mut fixed = self.fixed.clone();
        for fixup in &self.fixups {
            let size = (fixup.value.size() as usize).div_ceil(8);
            let field = fixed
                .get_mut(fixup.off..fixup.off + size)
                .ok_or_else(|| AsmError::Value {
                    detail: String::from("fixup outside fixed bytes"),
                    loc: self.source,
                })?;
            out.write_value(field, &fixup.value, start + fixup.off as u64, false, self.source)?;
        }
        out.output_bytes(&fixed);
        if let Some(contents) = &self.contents {
            contents.output(&self.info(), out)?;
        }
        debug_assert_eq!(
            out.num_output() - start,
            self.total_len(),
            "{} wrote a different length than it reported",
            self.contents.as_ref().map_or("bytecode", |c| c.kind())
        );
        Ok(())
    }
}
