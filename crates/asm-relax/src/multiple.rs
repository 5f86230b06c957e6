//! Repetition (`TIMES n`) of a bytecode sequence.

use alloc::string::String;

use crate::bytecode::{AddSpanFunc, BytecodeInfo, Contents, Expansion, SpecialType, TOO_COMPLEX};
use crate::container::BytecodeContainer;
use crate::error::{AsmError, Diagnostics};
use crate::expr::{BytecodeRef, Expr, Location};
use crate::output::BytecodeOutput;
use crate::symbol::SymbolTable;
use crate::value::Value;

/// Span id for the repetition count.
const COUNT_SPAN: i32 = -1;

/// Ids of spans registered by the `i`-th inner bytecode are moved away
/// from zero by `SPAN_STRIDE * (i + 1)`, plus `ANCHOR_STRIDE` for the copy
/// measured from the end of the repetition.
const SPAN_STRIDE: i32 = 100;
const ANCHOR_STRIDE: i32 = 50;

fn remap_id(id: i32, slot: usize, anchor: i32) -> i32 {
    let shift = SPAN_STRIDE * (slot as i32 + 1) + ANCHOR_STRIDE * anchor;
    if id > 0 {
        id + shift
    } else {
        id - shift
    }
}

/// Inverse of [`remap_id`]: the inner bytecode and its own span id.
fn unmap_id(span: i32) -> Option<(usize, i32)> {
    let abs = span.unsigned_abs();
    let slot = (abs / SPAN_STRIDE.unsigned_abs()) as usize;
    let inner = (abs % SPAN_STRIDE.unsigned_abs() % ANCHOR_STRIDE.unsigned_abs()) as i32;
    Some((slot.checked_sub(1)?, inner * span.signum()))
}

/// Repeats an inner bytecode sequence `count` times.
///
/// A count that depends on the layout is tracked as an `id <= 0` span:
/// the optimizer assumes zero repetitions first and settles the real
/// count before widening ordinary spans.
///
/// An inner span measured from inside the repetition (a branch, say) is
/// registered twice, once from the start and once from the end of the
/// whole repetition, so that the form it settles on fits every copy.
#[derive(Debug)]
pub struct MultipleContents {
    count: Expr,
    inner: BytecodeContainer,
    reps: u64,
}

impl MultipleContents {
    /// Repeat `inner` `count` times.
    pub fn new(count: impl Into<Expr>, inner: BytecodeContainer) -> Self {
        Self {
            count: count.into(),
            inner,
            reps: 0,
        }
    }

    /// Repetitions decided so far.
    pub fn reps(&self) -> u64 {
        self.reps
    }

    fn inner_len(&self) -> u64 {
        self.inner.bytecodes().iter().map(|b| b.total_len()).sum()
    }

    fn set_count(&mut self, bc: &BytecodeInfo, count: i64) -> Result<(), AsmError> {
        if count == TOO_COMPLEX {
            return Err(AsmError::NotAbsolute {
                detail: String::from("repetition count"),
                loc: bc.source,
            });
        }
        if count < 0 {
            return Err(AsmError::Value {
                detail: alloc::format!("repetition count is negative ({})", count),
                loc: bc.source,
            });
        }
        self.reps = count as u64;
        Ok(())
    }
}

impl Contents for MultipleContents {
    fn kind(&self) -> &'static str {
        "times"
    }

    fn finalize(
        &mut self,
        bc: &BytecodeInfo,
        symbols: &SymbolTable,
        diags: &mut Diagnostics,
    ) -> Result<(), AsmError> {
        self.count
            .expand_symbols(symbols)
            .map_err(|_| AsmError::CircularReference { loc: bc.source })?;
        self.count.simplify();
        if self.count.contains_sym() {
            return Err(AsmError::NotAbsolute {
                detail: String::from("repetition count"),
                loc: bc.source,
            });
        }
        self.inner.retarget(bc.bc);
        self.inner.finalize(symbols, diags);
        if self
            .inner
            .bytecodes()
            .iter()
            .any(|b| b.special() == SpecialType::Offset)
        {
            return Err(AsmError::TooComplex {
                detail: String::from("alignment or origin inside a repetition"),
                loc: bc.source,
            });
        }
        Ok(())
    }

    fn calc_len(
        &mut self,
        bc: &BytecodeInfo,
        add_span: &mut AddSpanFunc<'_>,
    ) -> Result<u64, AsmError> {
        let owner = bc.bc;
        let start = bc.tail_loc();
        let end = Location::new(BytecodeRef::new(owner.section, owner.index + 1), 0);
        let mut offset = 0;
        for (i, inner) in self.inner.bytecodes_mut().iter_mut().enumerate() {
            inner.set_offset(offset);
            inner.calc_len(&mut |id, value, neg, pos| {
                let mut from_end = value.clone();
                from_end.map_locations(&|l| if l.bc == owner { end } else { l });
                if from_end == value {
                    add_span(remap_id(id, i, 0), value, neg, pos);
                    return;
                }
                let mut from_start = value;
                from_start.map_locations(&|l| if l.bc == owner { start } else { l });
                add_span(remap_id(id, i, 0), from_start, neg, pos);
                add_span(remap_id(id, i, 1), from_end, neg, pos);
            })?;
            offset += inner.total_len();
        }

        match self.count.as_int() {
            Some(n) => self.set_count(bc, n)?,
            None => {
                add_span(COUNT_SPAN, Value::from_expr(self.count.clone()), 0, 0);
                self.reps = 0;
            }
        }
        Ok(self.inner_len() * self.reps)
    }

    fn expand(
        &mut self,
        bc: &BytecodeInfo,
        span: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        if span == COUNT_SPAN {
            self.set_count(bc, new_val)?;
            return Ok(Expansion::keep(self.inner_len() * self.reps, 0, 0));
        }

        let missing = || AsmError::TooComplex {
            detail: String::from("repeated bytecode"),
            loc: bc.source,
        };
        let (i, inner_id) = unmap_id(span).ok_or_else(missing)?;
        let exp = self
            .inner
            .get_mut(i)
            .ok_or_else(missing)?
            .expand(inner_id, old_val, new_val)?;

        let mut offset = 0;
        for inner in self.inner.bytecodes_mut() {
            inner.set_offset(offset);
            offset += inner.total_len();
        }
        Ok(Expansion {
            len: self.inner_len() * self.reps,
            ..exp
        })
    }

    fn output(&self, _: &BytecodeInfo, out: &mut BytecodeOutput<'_>) -> Result<(), AsmError> {
        for _ in 0..self.reps {
            for inner in self.inner.bytecodes() {
                inner.output(out)?;
            }
        }
        Ok(())
    }
}
