//! Ordered bytecode sequences.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::bytecode::{AddSpanFunc, Bytecode, BytecodeInfo, Contents};
use crate::error::{AsmError, Diagnostics, SourceLoc};
use crate::expr::{BytecodeRef, Location};
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;

/// Uninitialized space (`resb`, `.skip`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapContents {
    size: u64,
}

impl GapContents {
    /// A gap of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self { size }
    }

    /// Gap size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Contents for GapContents {
    fn kind(&self) -> &'static str {
        "gap"
    }

    fn finalize(
        &mut self,
        _: &BytecodeInfo,
        _: &SymbolTable,
        _: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        Ok(())
    }

    fn calc_len(&mut self, _: &BytecodeInfo, _: &mut AddSpanFunc<'_>) -> Result<u64, AsmError> {
        Ok(self.size)
    }

    fn output(&self, _: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        out.output_gap(self.size);
        Ok(())
    }
}

/// A section's bytecodes, in layout order.
///
/// The container always holds at least one bytecode: an empty one at index
/// 0 that anchors labels defined before any data.  Data is appended to the
/// *fresh* (last) bytecode until something with a tail is added, which
/// starts a new one.
#[derive(Debug)]
pub struct BytecodeContainer {
    section: usize,
    bcs: Vec<Bytecode>,
    /// Size of the trailing gap, when the last bytecode is one.
    last_gap: Option<u64>,
}

impl BytecodeContainer {
    /// A container for section `section`.
    pub fn new(section: usize) -> Self {
        let mut c = Self {
            section,
            bcs: Vec::new(),
            last_gap: None,
        };
        c.push(Bytecode::new());
        c
    }

    fn push(&mut self, mut bc: Bytecode) -> usize {
        let index = self.bcs.len();
        bc.set_bc_ref(BytecodeRef::new(self.section, index));
        self.bcs.push(bc);
        index
    }

    /// Section index of this container.
    pub fn section(&self) -> usize {
        self.section
    }

    /// Number of bytecodes.
    pub fn len(&self) -> usize {
        self.bcs.len()
    }

    /// Whether the container holds no bytecodes.
    pub fn is_empty(&self) -> bool {
        self.bcs.is_empty()
    }

    /// All bytecodes.
    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bcs
    }

    pub(crate) fn bytecodes_mut(&mut self) -> &mut [Bytecode] {
        &mut self.bcs
    }

    /// Bytecode at `index`.
    pub fn get(&self, index: usize) -> Option<&Bytecode> {
        self.bcs.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Bytecode> {
        self.bcs.get_mut(index)
    }

    /// Append a complete bytecode; returns its index.
    pub fn append_bytecode(&mut self, bc: Bytecode) -> usize {
        self.last_gap = None;
        self.push(bc)
    }

    /// Append `size` bytes of uninitialized space, merging with a gap that
    /// immediately precedes it.
    pub fn append_gap(&mut self, size: u64, source: SourceLoc) -> usize {
        if let Some(prev) = self.last_gap {
            let merged = prev + size;
            let index = self.bcs.len() - 1;
            self.bcs[index].transform(Box::new(GapContents::new(merged)));
            self.last_gap = Some(merged);
            return index;
        }
        let index = self.push(Bytecode::with_contents(Box::new(GapContents::new(size)), source));
        self.last_gap = Some(size);
        index
    }

    /// Index of the bytecode new fixed data goes into, creating one if the
    /// last bytecode already has a tail.
    pub fn fresh_index(&mut self) -> usize {
        let last = self.bcs.len() - 1;
        if self.bcs[last].has_contents() {
            self.last_gap = None;
            self.push(Bytecode::new())
        } else {
            last
        }
    }

    /// The bytecode new fixed data goes into.
    pub fn fresh_bytecode(&mut self) -> &mut Bytecode {
        let index = self.fresh_index();
        &mut self.bcs[index]
    }

    /// Start a new empty bytecode unconditionally.
    pub fn start_bytecode(&mut self) -> &mut Bytecode {
        self.last_gap = None;
        let index = self.push(Bytecode::new());
        &mut self.bcs[index]
    }

    /// Location just past the current end of the container.
    pub fn end_loc(&self) -> Location {
        let last = self.bcs.len() - 1;
        let bc = &self.bcs[last];
        Location::new(bc.bc_ref(), bc.total_len())
    }

    /// Total size in bytes with the current offsets.
    pub fn size(&self) -> u64 {
        self.bcs.last().map_or(0, Bytecode::next_offset)
    }

    /// Point every bytecode at `bc`.  Used when the container is owned by
    /// another bytecode's contents, so that spans and locations inside it
    /// attribute to that owner.
    pub(crate) fn retarget(&mut self, bc: BytecodeRef) {
        for b in &mut self.bcs {
            b.set_bc_ref(bc);
        }
    }

    /// Finalize every bytecode, recording errors and continuing.
    pub fn finalize(&mut self, symbols: &SymbolTable, diags: &mut Diagnostics) {
        for bc in &mut self.bcs {
            if let Err(e) = bc.finalize(symbols, diags) {
                diags.error(e);
            }
        }
    }

    /// Recompute offsets from the current lengths.  A failing offset-setter
    /// records its error and layout continues from its current length.
    pub fn update_offsets(&mut self, diags: &mut Diagnostics) -> u64 {
        let mut offset = 0;
        for bc in &mut self.bcs {
            offset = match bc.update_offset(offset) {
                Ok(next) => next,
                Err(e) => {
                    diags.error(e);
                    bc.next_offset()
                }
            };
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_anchor_bytecode() {
        let c = BytecodeContainer::new(2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.bytecodes()[0].bc_ref(), BytecodeRef::new(2, 0));
        assert_eq!(c.end_loc(), Location::new(BytecodeRef::new(2, 0), 0));
    }

    #[test]
    fn fixed_data_shares_fresh_bytecode() {
        let mut c = BytecodeContainer::new(0);
        c.fresh_bytecode().append_fixed_bytes(&[1, 2]);
        c.fresh_bytecode().append_fixed_bytes(&[3]);
        assert_eq!(c.len(), 1);
        c.append_gap(4, SourceLoc::dummy());
        c.fresh_bytecode().append_fixed_bytes(&[5]);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn consecutive_gaps_coalesce() {
        let mut c = BytecodeContainer::new(0);
        let a = c.append_gap(4, SourceLoc::dummy());
        let b = c.append_gap(6, SourceLoc::dummy());
        assert_eq!(a, b);
        assert_eq!(c.len(), 2);
        let mut diags = Diagnostics::new();
        c.bytecodes_mut()[1].calc_len(&mut |_, _, _, _| {}).unwrap();
        assert_eq!(c.update_offsets(&mut diags), 10);
    }

    #[test]
    fn gap_after_data_does_not_coalesce() {
        let mut c = BytecodeContainer::new(0);
        c.append_gap(4, SourceLoc::dummy());
        c.fresh_bytecode().append_fixed_bytes(&[0]);
        c.append_gap(4, SourceLoc::dummy());
        assert_eq!(c.len(), 4);
    }
}
