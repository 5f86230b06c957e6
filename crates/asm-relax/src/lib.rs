//! # asm-relax: Span-Dependent Layout for Assembler Backends
//!
//! `asm-relax` lays out an assembled object: it decides the final size and
//! offset of every bytecode whose encoding depends on distances between
//! labels (short/long branches, repetition counts, LEB128 fields) or on its
//! own position (alignment, origin), picking the smallest encodings that
//! keep every dependent value in range.
//!
//! ## Quick Start
//!
//! ```rust
//! use asm_relax::{layout, AlignContents, Object, RelaxableBranch, SourceLoc};
//!
//! let mut obj = Object::new();
//! let text = obj.add_section(".text", 0);
//! obj.container_mut(text).append_byte(0x90);
//! obj.container_mut(text)
//!     .append_align(AlignContents::new(8).with_nop_fill(), SourceLoc::line(2));
//! obj.container_mut(text)
//!     .append_branch(RelaxableBranch::jmp("far"), SourceLoc::line(3));
//! obj.container_mut(text).append_bytes(&[0xCC; 200]);
//! obj.define_label(text, "far", SourceLoc::line(5)).unwrap();
//!
//! let images = layout(&mut obj).unwrap();
//! // 1 + 7 bytes of padding, then the jump needed its rel32 form.
//! assert_eq!(&images[0].bytes[8..13], &[0xE9, 200, 0, 0, 0]);
//! ```
//!
//! ## Features
//!
//! - **Minimal growth**: every variable-size bytecode starts at its
//!   smallest form and only grows, so layout always terminates.
//! - **Offset-setters**: alignment and origin padding absorb and propagate
//!   size changes of preceding bytecodes.
//! - **Repetitions**: `TIMES`-style counts may depend on label distances.
//! - **Cycle detection**: circular size dependencies are reported, not
//!   looped on.
//! - **`no_std` + `alloc`**: embeddable.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// Layout code converts freely between offsets (u64), signed distances (i64)
// and field widths (u8/u32).  The lints below are expected and acceptable
// in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::redundant_closure_for_method_calls,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::map_unwrap_or,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::needless_continue
)]

extern crate alloc;

/// Alignment padding.
pub mod align;
/// Bytecodes and the `Contents` extension point.
pub mod bytecode;
/// Ordered bytecode sequences.
pub mod container;
/// Data and directive builders on `BytecodeContainer`.
pub mod data;
/// Error types and the diagnostics sink.
pub mod error;
/// Expressions over integers, symbols and locations.
pub mod expr;
/// Interval index used to find terms crossing a bytecode.
pub mod interval;
/// LEB128 fields.
pub mod leb128;
/// Repetitions.
pub mod multiple;
/// Objects and sections.
pub mod object;
/// The span-dependent optimizer.
pub mod optimizer;
/// Origin padding.
pub mod org;
/// Output sink and section images.
pub mod output;
/// Relaxable PC-relative branches.
pub mod relax;
/// Symbol table.
pub mod symbol;
/// Sized values.
pub mod value;

// Re-exports
pub use align::AlignContents;
pub use bytecode::{
    AddSpanFunc, Bytecode, BytecodeInfo, Contents, Expansion, SpecialType, TOO_COMPLEX,
};
pub use container::{BytecodeContainer, GapContents};
pub use error::{AsmError, Diagnostics, SourceLoc, Warning};
pub use expr::{BytecodeRef, Expr, Location};
pub use leb128::Leb128Contents;
pub use multiple::MultipleContents;
pub use object::{Object, Section};
pub use optimizer::{OptimizeStats, OptimizerConfig};
pub use org::OrgContents;
pub use output::{BytecodeOutput, Reloc, SectionImage};
pub use relax::{Encoding, Form, RelaxableBranch};
pub use symbol::{Symbol, SymbolTable};
pub use value::Value;

use alloc::vec::Vec;

/// Finalize, optimize, and output every section of `object`.
///
/// # Errors
///
/// Returns [`AsmError`] if any bytecode fails to finalize, the layout
/// cannot be solved (circular dependencies, origin overlaps, negative
/// repetition counts, exhausted expansion budget), or a value does not fit
/// its field at output.  Several errors are returned as
/// [`AsmError::Multiple`].
pub fn layout(object: &mut Object) -> Result<Vec<SectionImage>, AsmError> {
    layout_with_diagnostics(object).0
}

/// Like [`layout`], also returning the diagnostics sink with any warnings.
pub fn layout_with_diagnostics(
    object: &mut Object,
) -> (Result<Vec<SectionImage>, AsmError>, Diagnostics) {
    let mut diags = Diagnostics::with_limit(object.config().max_errors);
    object.finalize(&mut diags);
    if diags.has_errors() {
        return (diags.clone().into_result(Vec::new()), diags);
    }
    if let Err(err) = object.optimize(&mut diags) {
        return (Err(err), diags);
    }
    let images = object.output(&mut diags);
    (diags.clone().into_result(images), diags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_lays_out() {
        let mut obj = Object::new();
        obj.add_section(".text", 0);
        let images = layout(&mut obj).unwrap();
        assert_eq!(images.len(), 1);
        assert!(images[0].is_empty());
    }

    #[test]
    fn warnings_are_returned() {
        let mut obj = Object::new();
        let s = obj.add_section(".data", 0);
        obj.container_mut(s).append_leb128(-1, false, SourceLoc::line(3));
        let (result, diags) = layout_with_diagnostics(&mut obj);
        assert_eq!(result.unwrap()[0].len(), 10);
        assert_eq!(diags.warnings().len(), 1);
        assert_eq!(diags.warnings()[0].loc, SourceLoc::line(3));
    }
}
