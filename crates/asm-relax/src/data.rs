//! Convenience builders for appending data and directives to a container.

use alloc::boxed::Box;

use crate::align::AlignContents;
use crate::bytecode::{Bytecode, Contents};
use crate::container::BytecodeContainer;
use crate::error::SourceLoc;
use crate::expr::Expr;
use crate::leb128::Leb128Contents;
use crate::multiple::MultipleContents;
use crate::org::OrgContents;
use crate::relax::RelaxableBranch;
use crate::value::Value;

impl BytecodeContainer {
    /// Append one byte of fixed data.
    pub fn append_byte(&mut self, byte: u8) {
        self.fresh_bytecode().append_fixed_bytes(&[byte]);
    }

    /// Append fixed data.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.fresh_bytecode().append_fixed_bytes(bytes);
    }

    /// Append a `size`-bit field holding `expr`, resolved at output.
    pub fn append_value(&mut self, size: u32, expr: impl Into<Expr>, source: SourceLoc) {
        let bc = self.fresh_bytecode();
        if bc.fixups().is_empty() && bc.fixed_len() == 0 {
            bc.set_source(source);
        }
        bc.append_fixed(Value::new(size, expr));
    }

    /// Append a bytecode whose tail is `contents`; returns its index.
    pub fn append_contents(&mut self, contents: Box<dyn Contents>, source: SourceLoc) -> usize {
        self.append_bytecode(Bytecode::with_contents(contents, source))
    }

    /// Append a LEB128 field.
    pub fn append_leb128(
        &mut self,
        expr: impl Into<Expr>,
        signed: bool,
        source: SourceLoc,
    ) -> usize {
        self.append_contents(Box::new(Leb128Contents::new(expr, signed)), source)
    }

    /// Append alignment padding.
    pub fn append_align(&mut self, align: AlignContents, source: SourceLoc) -> usize {
        self.append_contents(Box::new(align), source)
    }

    /// Append padding up to section offset `start`.
    pub fn append_org(&mut self, start: u64, fill: u8, source: SourceLoc) -> usize {
        self.append_contents(Box::new(OrgContents::new(start, fill)), source)
    }

    /// Append `count` repetitions of `inner`.
    pub fn append_multiple(
        &mut self,
        count: impl Into<Expr>,
        inner: BytecodeContainer,
        source: SourceLoc,
    ) -> usize {
        self.append_contents(Box::new(MultipleContents::new(count, inner)), source)
    }

    /// Append a relaxable branch.
    pub fn append_branch(&mut self, branch: RelaxableBranch, source: SourceLoc) -> usize {
        self.append_contents(Box::new(branch), source)
    }
}
