//! Objects: named sections plus a symbol table.

use alloc::string::String;
use alloc::vec::Vec;

use tracing::debug;

use crate::bytecode::Bytecode;
use crate::container::BytecodeContainer;
use crate::error::{AsmError, Diagnostics, SourceLoc};
use crate::expr::{BytecodeRef, Expr, Location};
use crate::optimizer::{self, OptimizeStats, OptimizerConfig};
use crate::output::{BytecodeOutput, SectionImage};
use crate::symbol::SymbolTable;

/// A named section and its bytecodes.
#[derive(Debug)]
pub struct Section {
    name: String,
    start: u64,
    pub(crate) container: BytecodeContainer,
}

impl Section {
    pub(crate) fn new(name: &str, start: u64, container: BytecodeContainer) -> Self {
        Self {
            name: String::from(name),
            start,
            container,
        }
    }

    /// Section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The section's bytecodes.
    pub fn container(&self) -> &BytecodeContainer {
        &self.container
    }

    /// Mutable access for appending bytecodes.
    pub fn container_mut(&mut self) -> &mut BytecodeContainer {
        &mut self.container
    }

    /// Size in bytes with the current offsets.
    pub fn size(&self) -> u64 {
        self.container.size()
    }
}

pub(crate) fn bytecode(sections: &[Section], r: BytecodeRef) -> Option<&Bytecode> {
    sections.get(r.section)?.container.get(r.index)
}

pub(crate) fn bytecode_mut(sections: &mut [Section], r: BytecodeRef) -> Option<&mut Bytecode> {
    sections.get_mut(r.section)?.container.get_mut(r.index)
}

/// Section offset of a location.
pub(crate) fn location_offset(sections: &[Section], loc: Location) -> Option<u64> {
    bytecode(sections, loc.bc).map(|bc| bc.offset() + loc.off)
}

/// Absolute address of a location.
pub(crate) fn location_address(sections: &[Section], loc: Location) -> Option<u64> {
    let start = sections.get(loc.bc.section)?.start;
    location_offset(sections, loc).map(|off| start + off)
}

/// `loc2 - loc`, when both are in the same section.
pub(crate) fn calc_dist(sections: &[Section], loc: Location, loc2: Location) -> Option<i64> {
    if loc.bc.section != loc2.bc.section {
        return None;
    }
    let a = location_offset(sections, loc)?;
    let b = location_offset(sections, loc2)?;
    Some(b as i64 - a as i64)
}

pub(crate) fn update_offsets(sections: &mut [Section], diags: &mut Diagnostics) {
    for section in sections {
        section.container.update_offsets(diags);
    }
}

/// A collection of sections laid out together.
///
/// # Examples
///
/// ```rust
/// use asm_relax::{Object, RelaxableBranch, SourceLoc};
///
/// let mut obj = Object::new();
/// let text = obj.add_section(".text", 0x1000);
/// obj.define_label(text, "top", SourceLoc::line(1)).unwrap();
/// obj.container_mut(text).append_byte(0x90);
/// obj.container_mut(text)
///     .append_branch(RelaxableBranch::jmp("top"), SourceLoc::line(2));
///
/// let images = asm_relax::layout(&mut obj).unwrap();
/// assert_eq!(images[0].bytes, vec![0x90, 0xEB, 0xFD]);
/// ```
#[derive(Debug, Default)]
pub struct Object {
    sections: Vec<Section>,
    symbols: SymbolTable,
    config: OptimizerConfig,
}

impl Object {
    /// An empty object with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty object with `config`.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Replace the configuration.
    pub fn set_config(&mut self, config: OptimizerConfig) {
        self.config = config;
    }

    /// Add a section based at `start`; returns its index.
    pub fn add_section(&mut self, name: &str, start: u64) -> usize {
        let index = self.sections.len();
        self.sections
            .push(Section::new(name, start, BytecodeContainer::new(index)));
        index
    }

    /// All sections.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Section by index.
    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// Section by name.
    pub fn find_section(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// The container of section `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a section of this object.
    pub fn container_mut(&mut self, index: usize) -> &mut BytecodeContainer {
        &mut self.sections[index].container
    }

    /// The symbol table.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Define a label at the current end of section `section`.
    pub fn define_label(
        &mut self,
        section: usize,
        name: &str,
        source: SourceLoc,
    ) -> Result<(), AsmError> {
        let container = &mut self
            .sections
            .get_mut(section)
            .ok_or_else(|| AsmError::Value {
                detail: alloc::format!("no section {}", section),
                loc: source,
            })?
            .container;
        let bc = container.fresh_bytecode();
        let loc = Location::new(bc.bc_ref(), bc.fixed_len());
        self.symbols.define_label(name, loc, source)
    }

    /// Define a named constant.
    pub fn define_equ(
        &mut self,
        name: &str,
        expr: impl Into<Expr>,
        source: SourceLoc,
    ) -> Result<(), AsmError> {
        self.symbols.define_equ(name, expr.into(), source)
    }

    /// Resolve symbols in every bytecode.
    ///
    /// Every container is closed with a bytecode without contents, so that
    /// the end of each contents bytecode is a location of its own.
    pub fn finalize(&mut self, diags: &mut Diagnostics) {
        for section in &mut self.sections {
            section.container.fresh_index();
            section.container.finalize(&self.symbols, diags);
        }
    }

    /// Compute final lengths and offsets for every bytecode.
    pub fn optimize(&mut self, diags: &mut Diagnostics) -> Result<OptimizeStats, AsmError> {
        debug!(sections = self.sections.len(), "optimizing object");
        optimizer::optimize(&mut self.sections, self.config, diags)
    }

    /// Recompute offsets from the current lengths.
    pub fn update_offsets(&mut self, diags: &mut Diagnostics) {
        update_offsets(&mut self.sections, diags);
    }

    /// `loc2 - loc` with the current offsets, when in the same section.
    pub fn calc_dist(&self, loc: Location, loc2: Location) -> Option<i64> {
        calc_dist(&self.sections, loc, loc2)
    }

    /// Absolute address of a location with the current offsets.
    pub fn location_address(&self, loc: Location) -> Option<u64> {
        location_address(&self.sections, loc)
    }

    /// Every label with its absolute address, in name order.
    pub fn label_table(&self) -> Vec<(String, u64)> {
        self.symbols
            .labels()
            .filter_map(|(name, loc)| Some((String::from(name), self.location_address(loc)?)))
            .collect()
    }

    /// Produce the bytes of section `index`.
    pub fn output_section(&self, index: usize) -> Result<SectionImage, AsmError> {
        let section = self.sections.get(index).ok_or_else(|| AsmError::Value {
            detail: alloc::format!("no section {}", index),
            loc: SourceLoc::dummy(),
        })?;
        let mut out = BytecodeOutput::new(&self.sections).with_base(section.start);
        for bc in section.container.bytecodes() {
            bc.output(&mut out)?;
        }
        let (bytes, relocs) = out.into_parts();
        Ok(SectionImage {
            name: section.name.clone(),
            start: section.start,
            bytes,
            relocs,
        })
    }

    /// Produce every section, collecting errors across all of them.
    pub fn output(&self, diags: &mut Diagnostics) -> Vec<SectionImage> {
        let mut images = Vec::with_capacity(self.sections.len());
        for index in 0..self.sections.len() {
            match self.output_section(index) {
                Ok(image) => images.push(image),
                Err(e) => diags.error(e),
            }
        }
        images
    }
}
