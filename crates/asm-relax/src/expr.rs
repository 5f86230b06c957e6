//! Expression trees over integers, symbols and bytecode locations.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::symbol::{Symbol, SymbolTable};

/// Handle to a bytecode: its section and its position inside that
/// section's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BytecodeRef {
    /// Section index within the owning object.
    pub section: usize,
    /// Bytecode index within the section's container.
    pub index: usize,
}

impl BytecodeRef {
    /// Create a new handle.
    pub fn new(section: usize, index: usize) -> Self {
        Self { section, index }
    }
}

/// A position inside a bytecode: `off` bytes past its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    /// The bytecode the location is anchored to.
    pub bc: BytecodeRef,
    /// Byte offset from the start of that bytecode.
    pub off: u64,
}

impl Location {
    /// Create a new location.
    pub fn new(bc: BytecodeRef, off: u64) -> Self {
        Self { bc, off }
    }
}

/// An integer expression.
///
/// Subtraction is `Add` of a `Neg` term.  `Subst(n)` is a placeholder the
/// optimizer puts in place of a distance between two locations, filled in
/// from the span's term list on evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    /// Integer literal.
    Int(i64),
    /// Symbol reference (label, EQU constant, or external).
    Sym(String),
    /// A location within the object.
    Loc(Location),
    /// Placeholder for the n-th distance term.
    Subst(usize),
    /// Negation.
    Neg(Box<Expr>),
    /// Sum of terms.
    Add(Vec<Expr>),
    /// Product.
    Mul(Box<Expr>, Box<Expr>),
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Int(i64::from(v))
    }
}

impl From<Location> for Expr {
    fn from(loc: Location) -> Self {
        Expr::Loc(loc)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Sym(String::from(name))
    }
}

impl Expr {
    /// Symbol reference.
    pub fn sym(name: &str) -> Self {
        Expr::Sym(String::from(name))
    }

    /// `a + b`.
    pub fn add(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Add(alloc::vec![a.into(), b.into()])
    }

    /// `a - b`.
    pub fn sub(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Add(alloc::vec![a.into(), Expr::neg(b)])
    }

    /// `a * b`.
    pub fn mul(a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Mul(Box::new(a.into()), Box::new(b.into()))
    }

    /// `-a`.
    pub fn neg(a: impl Into<Expr>) -> Self {
        Expr::Neg(Box::new(a.into()))
    }

    /// The integer value, if the expression is a plain literal.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether any symbol reference remains.
    pub fn contains_sym(&self) -> bool {
        match self {
            Expr::Sym(_) => true,
            Expr::Neg(e) => e.contains_sym(),
            Expr::Add(terms) => terms.iter().any(Expr::contains_sym),
            Expr::Mul(a, b) => a.contains_sym() || b.contains_sym(),
            Expr::Int(_) | Expr::Loc(_) | Expr::Subst(_) => false,
        }
    }

    /// Whether any location remains.
    pub fn contains_loc(&self) -> bool {
        match self {
            Expr::Loc(_) => true,
            Expr::Neg(e) => e.contains_loc(),
            Expr::Add(terms) => terms.iter().any(Expr::contains_loc),
            Expr::Mul(a, b) => a.contains_loc() || b.contains_loc(),
            Expr::Int(_) | Expr::Sym(_) | Expr::Subst(_) => false,
        }
    }

    /// Rewrite every location through `f`.
    pub fn map_locations(&mut self, f: &dyn Fn(Location) -> Location) {
        match self {
            Expr::Loc(loc) => *loc = f(*loc),
            Expr::Neg(e) => e.map_locations(f),
            Expr::Add(terms) => terms.iter_mut().for_each(|t| t.map_locations(f)),
            Expr::Mul(a, b) => {
                a.map_locations(f);
                b.map_locations(f);
            }
            Expr::Int(_) | Expr::Sym(_) | Expr::Subst(_) => {}
        }
    }

    /// Replace labels by their locations and EQU names by their
    /// definitions.  Unknown names are left as symbols (externals).
    ///
    /// Returns the offending name if EQU definitions refer to each other
    /// in a cycle.
    pub fn expand_symbols(&mut self, symbols: &SymbolTable) -> Result<(), String> {
        let mut active = Vec::new();
        self.expand_inner(symbols, &mut active)
    }

    fn expand_inner(
        &mut self,
        symbols: &SymbolTable,
        active: &mut Vec<String>,
    ) -> Result<(), String> {
        match self {
            Expr::Sym(name) => {
                let replacement = match symbols.get(name) {
                    Some(Symbol::Label { loc, .. }) => Expr::Loc(*loc),
                    Some(Symbol::Equ { expr, .. }) => {
                        if active.iter().any(|a| a == name) {
                            return Err(name.clone());
                        }
                        active.push(name.clone());
                        let mut e = expr.clone();
                        e.expand_inner(symbols, active)?;
                        active.pop();
                        e
                    }
                    None => return Ok(()),
                };
                *self = replacement;
                Ok(())
            }
            Expr::Neg(e) => e.expand_inner(symbols, active),
            Expr::Add(terms) => {
                for t in terms {
                    t.expand_inner(symbols, active)?;
                }
                Ok(())
            }
            Expr::Mul(a, b) => {
                a.expand_inner(symbols, active)?;
                b.expand_inner(symbols, active)
            }
            Expr::Int(_) | Expr::Loc(_) | Expr::Subst(_) => Ok(()),
        }
    }

    /// Normalize in place: flatten nested sums, push negation into sums,
    /// fold constants, and cancel `x + -x` for identical symbols and
    /// locations.
    pub fn simplify(&mut self) {
        match self {
            Expr::Neg(inner) => {
                inner.simplify();
                let inner = core::mem::replace(&mut **inner, Expr::Int(0));
                *self = match inner {
                    Expr::Int(v) => Expr::Int(v.wrapping_neg()),
                    Expr::Neg(e) => *e,
                    Expr::Add(terms) => {
                        let mut sum = Expr::Add(terms.into_iter().map(Expr::neg).collect());
                        sum.simplify();
                        sum
                    }
                    other => Expr::Neg(Box::new(other)),
                };
            }
            Expr::Mul(a, b) => {
                a.simplify();
                b.simplify();
                let folded = match (a.as_int(), b.as_int()) {
                    (Some(x), Some(y)) => Some(Expr::Int(x.wrapping_mul(y))),
                    (Some(0), _) | (_, Some(0)) => Some(Expr::Int(0)),
                    (Some(1), _) => Some(core::mem::replace(&mut **b, Expr::Int(0))),
                    (_, Some(1)) => Some(core::mem::replace(&mut **a, Expr::Int(0))),
                    (Some(-1), _) => {
                        let mut n = Expr::neg(core::mem::replace(&mut **b, Expr::Int(0)));
                        n.simplify();
                        Some(n)
                    }
                    (_, Some(-1)) => {
                        let mut n = Expr::neg(core::mem::replace(&mut **a, Expr::Int(0)));
                        n.simplify();
                        Some(n)
                    }
                    _ => None,
                };
                if let Some(e) = folded {
                    *self = e;
                }
            }
            Expr::Add(terms) => {
                let mut flat: Vec<Expr> = Vec::with_capacity(terms.len());
                let mut constant: i64 = 0;
                for mut t in core::mem::take(terms) {
                    t.simplify();
                    match t {
                        Expr::Int(v) => constant = constant.wrapping_add(v),
                        Expr::Add(inner) => {
                            for it in inner {
                                match it {
                                    Expr::Int(v) => constant = constant.wrapping_add(v),
                                    other => flat.push(other),
                                }
                            }
                        }
                        other => flat.push(other),
                    }
                }
                cancel_opposites(&mut flat);
                if constant != 0 || flat.is_empty() {
                    flat.push(Expr::Int(constant));
                }
                *self = if flat.len() == 1 {
                    flat.pop().unwrap_or(Expr::Int(0))
                } else {
                    Expr::Add(flat)
                };
            }
            Expr::Int(_) | Expr::Sym(_) | Expr::Loc(_) | Expr::Subst(_) => {}
        }
    }

    /// Replace each `loc2 - loc` pair of locations in the same section by a
    /// `Subst(n)` placeholder, calling `f(n, loc, loc2)` for every pair.
    ///
    /// Every sum in the tree is scanned; placeholders are numbered from 0 in
    /// the order they are created.  Returns the number of placeholders.
    pub fn subst_dist(&mut self, f: &mut dyn FnMut(usize, Location, Location)) -> usize {
        let mut next = 0;
        self.subst_inner(f, &mut next);
        next
    }

    fn subst_inner(&mut self, f: &mut dyn FnMut(usize, Location, Location), next: &mut usize) {
        match self {
            Expr::Neg(e) => e.subst_inner(f, next),
            Expr::Mul(a, b) => {
                a.subst_inner(f, next);
                b.subst_inner(f, next);
            }
            Expr::Add(terms) => {
                for t in terms.iter_mut() {
                    t.subst_inner(f, next);
                }
                let mut paired = false;
                for i in 0..terms.len() {
                    let Expr::Loc(rel) = terms[i] else { continue };
                    let partner = terms.iter().position(|t| {
                        matches!(t, Expr::Neg(inner)
                            if matches!(**inner, Expr::Loc(l) if l.bc.section == rel.bc.section))
                    });
                    let Some(j) = partner else { continue };
                    let Expr::Neg(inner) = &terms[j] else { continue };
                    let Expr::Loc(sub) = **inner else { continue };
                    f(*next, sub, rel);
                    terms[i] = Expr::Subst(*next);
                    terms[j] = Expr::Int(0);
                    *next += 1;
                    paired = true;
                }
                if paired {
                    terms.retain(|t| *t != Expr::Int(0));
                    if terms.is_empty() {
                        *self = Expr::Int(0);
                    } else if terms.len() == 1 {
                        if let Some(t) = terms.pop() {
                            *self = t;
                        }
                    }
                }
            }
            Expr::Int(_) | Expr::Sym(_) | Expr::Loc(_) | Expr::Subst(_) => {}
        }
    }

    /// Evaluate with distance placeholders resolved by `subst`.
    ///
    /// `None` if a symbol or unpaired location remains, or on overflow.
    pub fn evaluate(&self, subst: &dyn Fn(usize) -> Option<i64>) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Subst(n) => subst(*n),
            Expr::Sym(_) | Expr::Loc(_) => None,
            Expr::Neg(e) => e.evaluate(subst)?.checked_neg(),
            Expr::Add(terms) => terms
                .iter()
                .try_fold(0i64, |acc, t| acc.checked_add(t.evaluate(subst)?)),
            Expr::Mul(a, b) => a.evaluate(subst)?.checked_mul(b.evaluate(subst)?),
        }
    }

    /// Evaluate resolving every location through `locate` (used once the
    /// layout is final).
    pub fn evaluate_with(&self, locate: &dyn Fn(Location) -> Option<i64>) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Loc(loc) => locate(*loc),
            Expr::Sym(_) | Expr::Subst(_) => None,
            Expr::Neg(e) => e.evaluate_with(locate)?.checked_neg(),
            Expr::Add(terms) => terms
                .iter()
                .try_fold(0i64, |acc, t| acc.checked_add(t.evaluate_with(locate)?)),
            Expr::Mul(a, b) => a.evaluate_with(locate)?.checked_mul(b.evaluate_with(locate)?),
        }
    }
}

/// Remove pairs `x` / `-x` of identical symbols or locations from a sum.
fn cancel_opposites(terms: &mut Vec<Expr>) {
    let mut i = 0;
    while i < terms.len() {
        let opposite = match &terms[i] {
            Expr::Neg(inner) if matches!(**inner, Expr::Sym(_) | Expr::Loc(_)) => {
                let target = &**inner;
                terms.iter().position(|t| t == target)
            }
            t @ (Expr::Sym(_) | Expr::Loc(_)) => terms
                .iter()
                .position(|o| matches!(o, Expr::Neg(inner) if **inner == *t)),
            _ => None,
        };
        match opposite {
            Some(j) => {
                let (hi, lo) = if i > j { (i, j) } else { (j, i) };
                terms.remove(hi);
                terms.remove(lo);
                i = lo;
            }
            None => i += 1,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Sym(name) => write!(f, "{}", name),
            Expr::Loc(loc) => write!(f, "{{{}:{}+{}}}", loc.bc.section, loc.bc.index, loc.off),
            Expr::Subst(n) => write!(f, "[{}]", n),
            Expr::Neg(e) => write!(f, "-({})", e),
            Expr::Add(terms) => {
                write!(f, "(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            Expr::Mul(a, b) => write!(f, "({} * {})", a, b),
        }
    }
}
