//! Span-dependent layout optimizer.
//!
//! Computes the minimum length of every bytecode whose size depends on
//! distances between locations (short/long branches, repetition counts,
//! LEB128 fields) and on section offsets (alignment, origin), such that
//! every dependent value fits the form chosen for it.
//!
//! The algorithm starts from the smallest form of every bytecode and only
//! ever grows them:
//!
//! 1. number bytecodes, compute minimum lengths and collect spans and
//!    offset-setters (1a), turn spans' location differences into terms and
//!    expand whatever is already out of range (1b), lay out (1c), and
//!    recheck every span against the real offsets (1d).  If nothing is out
//!    of range, the layout is final.
//! 2. otherwise build an interval index from bytecode ranges to the terms
//!    that measure across them and check `id <= 0` spans for cycles (1e),
//!    then drain a worklist: every expansion updates the terms crossing the
//!    grown bytecode and ripples through the offset-setters after it,
//!    queueing spans that leave their range (2).
//! 3. lay out once more with the final lengths (3).
//!
//! Repetition counts (`id <= 0`) are processed before ordinary spans so
//! that they absorb size changes before branches are widened.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use tracing::{debug, trace};

use crate::bytecode::{BytecodeInfo, SpecialType, TOO_COMPLEX};
use crate::error::{AsmError, Diagnostics, SourceLoc};
use crate::expr::{BytecodeRef, Expr, Location};
use crate::interval::IntervalIndex;
use crate::object::{self, Section};
use crate::value::Value;

/// Optimizer resource limits.
///
/// # Examples
///
/// ```rust
/// use asm_relax::OptimizerConfig;
///
/// let config = OptimizerConfig {
///     max_expansions: 10_000,
///     ..OptimizerConfig::default()
/// };
/// assert_eq!(config.max_errors, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizerConfig {
    /// Maximum number of span expansions before giving up.
    /// Default: 1,000,000.
    pub max_expansions: usize,
    /// Maximum accumulated errors kept by the diagnostics sink. Default: 64.
    pub max_errors: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_expansions: 1_000_000,
            max_errors: 64,
        }
    }
}

/// Counters from one optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizeStats {
    /// Spans registered in step 1a.
    pub spans: usize,
    /// Distance terms created in step 1b.
    pub span_terms: usize,
    /// Spans rechecked in step 1d.
    pub step1d_spans: usize,
    /// Terms inserted into the interval index.
    pub itree_terms: usize,
    /// Offset-setters.
    pub offset_setters: usize,
    /// Span value recalculations.
    pub recalcs: usize,
    /// Expansions performed in step 2.
    pub expansions: usize,
    /// Spans queued by step 1d.
    pub initial_qb: usize,
    /// Pops from the repetition queue.
    pub qa_pops: usize,
    /// Pops from the ordinary queue.
    pub qb_pops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanState {
    Inactive,
    Active,
    OnQueue,
}

/// Distance `loc2 - loc` substituted into a span expression.
#[derive(Debug, Clone)]
struct Term {
    loc: Location,
    loc2: Location,
    /// Global indices of the bytecodes holding `loc` and `loc2`.
    index: usize,
    index2: usize,
    cur_val: i64,
    new_val: i64,
}

#[derive(Debug)]
struct Span {
    bc: BytecodeRef,
    bc_index: usize,
    source: SourceLoc,
    id: i32,
    depval: Value,
    /// Absolute part of `depval` with distances replaced by `Subst(n)`,
    /// `n` indexing `terms`.
    expr: Option<Expr>,
    terms: Vec<Term>,
    cur_val: i64,
    new_val: i64,
    neg_thres: i64,
    pos_thres: i64,
    state: SpanState,
    /// First offset-setter after this span's bytecode.
    os_index: usize,
}

impl Span {
    fn create_terms(&mut self, sections: &[Section]) -> Result<(), AsmError> {
        let Some(abs) = self.depval.abs() else {
            return Ok(());
        };
        let mut expr = abs.clone();
        let mut pairs = Vec::new();
        expr.subst_dist(&mut |_, loc, loc2| pairs.push((loc, loc2)));
        self.expr = Some(expr);

        let too_complex = || AsmError::TooComplex {
            detail: String::from("distance"),
            loc: self.source,
        };
        let mut terms = Vec::with_capacity(pairs.len());
        for (loc, loc2) in pairs {
            let dist = object::calc_dist(sections, loc, loc2).ok_or_else(too_complex)?;
            let index = object::bytecode(sections, loc.bc)
                .ok_or_else(too_complex)?
                .index();
            let index2 = object::bytecode(sections, loc2.bc)
                .ok_or_else(too_complex)?
                .index();
            if self.id <= 0 {
                let (low, high) = (index.min(index2), index.max(index2));
                if low <= self.bc_index && self.bc_index < high {
                    return Err(AsmError::CircularReference { loc: self.source });
                }
            }
            terms.push(Term {
                loc,
                loc2,
                index,
                index2,
                cur_val: 0,
                new_val: dist,
            });
        }
        self.terms = terms;
        Ok(())
    }

    /// Recompute the span value from its terms.  Returns whether the span
    /// needs expanding.
    fn recalc_normal(&mut self, stats: &mut OptimizeStats) -> bool {
        stats.recalcs += 1;
        self.new_val = if self.depval.is_relative() {
            TOO_COMPLEX
        } else {
            match &self.expr {
                Some(expr) => {
                    let terms = &self.terms;
                    expr.evaluate(&|n| terms.get(n).map(|t| t.new_val))
                        .unwrap_or(TOO_COMPLEX)
                }
                None => 0,
            }
        };
        if self.new_val == TOO_COMPLEX {
            self.state = SpanState::Inactive;
        }
        let exceeded = if self.id <= 0 {
            self.new_val != self.cur_val
        } else {
            self.new_val < self.neg_thres || self.new_val > self.pos_thres
        };
        trace!(
            span = self.id,
            bc = self.bc_index,
            cur = self.cur_val,
            new = self.new_val,
            exceeded,
            "span recalculated"
        );
        exceeded
    }
}

/// One offset-setter; the list ends with a placeholder whose `bc` is `None`.
#[derive(Debug, Clone, Default)]
struct OffsetSetter {
    bc: Option<BytecodeRef>,
    cur_val: u64,
    new_val: u64,
    thres: u64,
}

#[derive(Debug)]
struct Optimizer {
    config: OptimizerConfig,
    spans: Vec<Span>,
    qa: VecDeque<usize>,
    qb: VecDeque<usize>,
    itree: IntervalIndex<(usize, usize)>,
    offset_setters: Vec<OffsetSetter>,
    stats: OptimizeStats,
    hits: Vec<(usize, usize)>,
}

impl Optimizer {
    fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            spans: Vec::new(),
            qa: VecDeque::new(),
            qb: VecDeque::new(),
            itree: IntervalIndex::new(),
            offset_setters: vec![OffsetSetter::default()],
            stats: OptimizeStats::default(),
            hits: Vec::new(),
        }
    }

    fn add_span(
        &mut self,
        bc: &BytecodeInfo,
        id: i32,
        depval: Value,
        neg_thres: i64,
        pos_thres: i64,
    ) {
        trace!(bc = bc.index, id, neg_thres, pos_thres, "span added");
        self.spans.push(Span {
            bc: bc.bc,
            bc_index: bc.index,
            source: bc.source,
            id,
            depval,
            expr: None,
            terms: Vec::new(),
            cur_val: 0,
            new_val: 0,
            neg_thres,
            pos_thres,
            state: SpanState::Active,
            os_index: self.offset_setters.len() - 1,
        });
        self.stats.spans += 1;
    }

    fn add_offset_setter(&mut self, bc: BytecodeRef, next_offset: u64) {
        if let Some(last) = self.offset_setters.last_mut() {
            last.bc = Some(bc);
            last.thres = next_offset;
        }
        self.offset_setters.push(OffsetSetter::default());
    }

    fn step1b(&mut self, sections: &mut [Section], diags: &mut Diagnostics) {
        let spans = core::mem::take(&mut self.spans);
        for mut span in spans {
            if let Err(e) = span.create_terms(sections) {
                diags.error(e);
                continue;
            }
            self.stats.span_terms += span.terms.len();
            if span.recalc_normal(&mut self.stats) {
                let Some(bc) = object::bytecode_mut(sections, span.bc) else {
                    continue;
                };
                match bc.expand(span.id, span.cur_val, span.new_val) {
                    Err(e) => {
                        diags.error(e);
                        continue;
                    }
                    Ok(exp) if exp.keep => {
                        span.neg_thres = exp.neg_thres;
                        span.pos_thres = exp.pos_thres;
                        if span.state == SpanState::Inactive {
                            diags.error(AsmError::SecondaryExpansion { loc: span.source });
                        }
                    }
                    Ok(_) => {
                        trace!(bc = span.bc_index, id = span.id, "span resolved in 1b");
                        continue;
                    }
                }
            }
            span.cur_val = span.new_val;
            self.spans.push(span);
        }
        debug!(spans = self.spans.len(), terms = self.stats.span_terms, "step 1b done");
    }

    fn step1d(&mut self, sections: &[Section]) -> bool {
        for (i, span) in self.spans.iter_mut().enumerate() {
            self.stats.step1d_spans += 1;
            for term in &mut span.terms {
                term.cur_val = term.new_val;
                if let Some(dist) = object::calc_dist(sections, term.loc, term.loc2) {
                    term.new_val = dist;
                }
            }
            if span.recalc_normal(&mut self.stats) {
                self.qb.push_back(i);
                span.state = SpanState::OnQueue;
                self.stats.initial_qb += 1;
            }
        }
        debug!(queued = self.qb.len(), "step 1d done");
        self.qb.is_empty()
    }

    fn step1e(&mut self, sections: &[Section], diags: &mut Diagnostics) {
        for os in &mut self.offset_setters {
            let Some(bc) = os.bc.and_then(|r| object::bytecode(sections, r)) else {
                continue;
            };
            os.thres = bc.next_offset();
            os.new_val = bc.tail_offset();
            os.cur_val = os.new_val;
            self.stats.offset_setters += 1;
        }

        for (si, span) in self.spans.iter().enumerate() {
            for (ti, term) in span.terms.iter().enumerate() {
                if term.index == term.index2 {
                    continue;
                }
                let low = term.index.min(term.index2);
                let high = term.index.max(term.index2) - 1;
                self.itree.insert(low, high, (si, ti));
                self.stats.itree_terms += 1;
            }
        }
        self.itree.build();
        self.check_cycles(diags);
        debug!(
            itree_terms = self.stats.itree_terms,
            offset_setters = self.stats.offset_setters,
            "step 1e done"
        );
    }

    /// Report cycles among `id <= 0` spans, where an edge `S -> D` means a
    /// size change of S's bytecode changes D's value.
    fn check_cycles(&self, diags: &mut Diagnostics) {
        let n = self.spans.len();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (si, span) in self.spans.iter().enumerate() {
            if span.id > 0 {
                continue;
            }
            let out = &mut edges[si];
            self.itree.enumerate(span.bc_index, span.bc_index, |&(di, _)| {
                if di != si && self.spans[di].id <= 0 && !out.contains(&di) {
                    out.push(di);
                }
            });
        }

        // 0 = unvisited, 1 = on the DFS stack, 2 = done
        let mut color = vec![0u8; n];
        for start in 0..n {
            if self.spans[start].id > 0 || color[start] != 0 {
                continue;
            }
            color[start] = 1;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(&(node, next)) = stack.last() {
                if next < edges[node].len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let d = edges[node][next];
                    match color[d] {
                        0 => {
                            color[d] = 1;
                            stack.push((d, 0));
                        }
                        1 => diags.error(AsmError::CircularReference {
                            loc: self.spans[node].source,
                        }),
                        _ => {}
                    }
                } else {
                    color[node] = 2;
                    stack.pop();
                }
            }
        }
    }

    fn pop(&mut self) -> Option<usize> {
        if let Some(i) = self.qa.pop_front() {
            self.stats.qa_pops += 1;
            return Some(i);
        }
        let i = self.qb.pop_front()?;
        self.stats.qb_pops += 1;
        Some(i)
    }

    fn step2(&mut self, sections: &mut [Section], diags: &mut Diagnostics) {
        while let Some(si) = self.pop() {
            let span = &mut self.spans[si];
            if span.state == SpanState::Inactive {
                continue;
            }
            span.state = SpanState::Active;
            // Offset-setters may have shrunk the value back into range
            // since the span was queued.
            if !span.recalc_normal(&mut self.stats) {
                continue;
            }
            if self.stats.expansions >= self.config.max_expansions {
                diags.error(AsmError::RelaxationLimit {
                    max: self.config.max_expansions,
                });
                return;
            }
            self.stats.expansions += 1;

            let Some(bc) = object::bytecode_mut(sections, span.bc) else {
                continue;
            };
            let orig_len = bc.total_len();
            match bc.expand(span.id, span.cur_val, span.new_val) {
                Err(e) => {
                    diags.error(e);
                    span.state = SpanState::Inactive;
                    continue;
                }
                Ok(exp) if exp.keep => {
                    for term in &mut span.terms {
                        term.cur_val = term.new_val;
                    }
                    span.cur_val = span.new_val;
                    span.neg_thres = exp.neg_thres;
                    span.pos_thres = exp.pos_thres;
                }
                Ok(_) => span.state = SpanState::Inactive,
            }
            let len_diff = bc.total_len() as i64 - orig_len as i64;
            if len_diff == 0 {
                continue;
            }
            trace!(bc = span.bc_index, len_diff, "bytecode expanded");
            let (bc_index, os_index, section) = (span.bc_index, span.os_index, span.bc.section);
            self.expand_terms(bc_index, len_diff);
            self.ripple_offset_setters(sections, diags, os_index, section, len_diff);
        }
        debug!(
            expansions = self.stats.expansions,
            qa_pops = self.stats.qa_pops,
            qb_pops = self.stats.qb_pops,
            "step 2 done"
        );
    }

    /// Shift every term measuring across bytecode `bc_index` by `len_diff`
    /// and queue the spans that leave their range.
    fn expand_terms(&mut self, bc_index: usize, len_diff: i64) {
        let mut hits = core::mem::take(&mut self.hits);
        hits.clear();
        self.itree.enumerate(bc_index, bc_index, |&h| hits.push(h));
        for &(si, ti) in &hits {
            let span = &mut self.spans[si];
            if span.state == SpanState::Inactive {
                continue;
            }
            let term = &mut span.terms[ti];
            if term.index < term.index2 {
                term.new_val += len_diff;
            } else {
                term.new_val -= len_diff;
            }
            if span.state == SpanState::OnQueue {
                continue;
            }
            if !span.recalc_normal(&mut self.stats) {
                continue;
            }
            if span.id <= 0 {
                self.qa.push_back(si);
            } else {
                self.qb.push_back(si);
            }
            span.state = SpanState::OnQueue;
        }
        self.hits = hits;
    }

    /// Propagate an offset change through the offset-setters following a
    /// grown bytecode, stopping at the section end or once a setter absorbs
    /// the change.
    fn ripple_offset_setters(
        &mut self,
        sections: &mut [Section],
        diags: &mut Diagnostics,
        mut os_index: usize,
        section: usize,
        mut offset_diff: i64,
    ) {
        while offset_diff != 0 {
            let Some(os) = self.offset_setters.get_mut(os_index) else {
                break;
            };
            let Some(r) = os.bc.filter(|r| r.section == section) else {
                break;
            };
            let Some(bc) = object::bytecode_mut(sections, r) else {
                break;
            };
            let old_next = os.cur_val + bc.tail_len();
            debug_assert!(
                offset_diff >= 0 || offset_diff.unsigned_abs() <= os.new_val,
                "offset-setter moved to a negative offset"
            );
            os.new_val = os.new_val.saturating_add_signed(offset_diff);

            let orig_tail = bc.tail_len();
            match bc.expand(1, os.cur_val as i64, os.new_val as i64) {
                Ok(exp) => os.thres = exp.pos_thres.max(0) as u64,
                Err(e) => diags.error(e),
            }
            offset_diff = (os.new_val + bc.tail_len()) as i64 - old_next as i64;
            let len_diff = bc.tail_len() as i64 - orig_tail as i64;
            let index = bc.index();
            os.cur_val = os.new_val;
            os_index += 1;

            if len_diff != 0 {
                trace!(bc = index, len_diff, "offset-setter changed");
                self.expand_terms(index, len_diff);
            }
        }
    }
}

/// Only called once `diags.has_errors()`, which makes `to_error` `Some`.
fn failure(diags: &Diagnostics) -> AsmError {
    diags
        .to_error()
        .unwrap_or(AsmError::Suppressed { count: 0 })
}

/// Run the full optimization over `sections`.
///
/// Errors are recorded in `diags`; the run stops after the first phase
/// that recorded any and returns them collapsed.  On success every
/// bytecode has its final offset and length.
pub(crate) fn optimize(
    sections: &mut [Section],
    config: OptimizerConfig,
    diags: &mut Diagnostics,
) -> Result<OptimizeStats, AsmError> {
    let mut opt = Optimizer::new(config);

    // Step 1a
    let mut bc_index = 0;
    for section in sections.iter_mut() {
        let mut offset = 0;
        for bc in section.container.bytecodes_mut() {
            bc.set_index(bc_index);
            bc_index += 1;
            bc.set_offset(offset);
            let info = bc.info();
            let result = bc.calc_len(&mut |id, value, neg, pos| {
                opt.add_span(&info, id, value, neg, pos)
            });
            match result {
                Ok(()) => {
                    if bc.special() == SpecialType::Offset {
                        opt.add_offset_setter(bc.bc_ref(), bc.next_offset());
                    }
                    offset = bc.next_offset();
                }
                Err(e) => diags.error(e),
            }
        }
    }
    debug!(bytecodes = bc_index, spans = opt.stats.spans, "step 1a done");
    if diags.has_errors() {
        return Err(failure(diags));
    }

    opt.step1b(sections, diags);
    if diags.has_errors() {
        return Err(failure(diags));
    }

    // Step 1c
    object::update_offsets(sections, diags);
    if diags.has_errors() {
        return Err(failure(diags));
    }

    if opt.step1d(sections) {
        debug!("layout converged after step 1d");
        return Ok(opt.stats);
    }

    opt.step1e(sections, diags);
    if diags.has_errors() {
        return Err(failure(diags));
    }

    opt.step2(sections, diags);
    if diags.has_errors() {
        return Err(failure(diags));
    }

    // Step 3
    object::update_offsets(sections, diags);
    if diags.has_errors() {
        return Err(failure(diags));
    }
    debug!(expansions = opt.stats.expansions, "layout converged");
    Ok(opt.stats)
}
