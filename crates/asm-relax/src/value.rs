//! Sized values: an absolute expression plus an optional external symbol.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{AsmError, SourceLoc};
use crate::expr::{Expr, Location};
use crate::symbol::SymbolTable;

/// A value destined for an output field, or the quantity a span watches.
///
/// After [`Value::finalize`] the absolute part contains no symbols: labels
/// have become locations, EQUs their definitions, and at most one external
/// symbol has moved to the relative part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    abs: Option<Expr>,
    rel: Option<String>,
    size: u32,
    signed: bool,
}

impl Value {
    /// A value of `size` bits computed from `expr`.
    pub fn new(size: u32, expr: impl Into<Expr>) -> Self {
        Self {
            abs: Some(expr.into()),
            rel: None,
            size,
            signed: false,
        }
    }

    /// An unsized value, used for span dependencies.
    pub fn from_expr(expr: impl Into<Expr>) -> Self {
        Self::new(0, expr)
    }

    /// Mark the value as signed.
    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    /// Absolute portion.
    pub fn abs(&self) -> Option<&Expr> {
        self.abs.as_ref()
    }

    /// External symbol, if any.
    pub fn rel(&self) -> Option<&str> {
        self.rel.as_deref()
    }

    /// Whether an external symbol is involved.
    pub fn is_relative(&self) -> bool {
        self.rel.is_some()
    }

    /// Field size in bits (0 for unsized).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the value is signed.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Subtract a location from the absolute part (`value - loc`).
    pub fn sub_location(&mut self, loc: Location) {
        let abs = self.abs.take().unwrap_or(Expr::Int(0));
        let mut e = Expr::sub(abs, loc);
        e.simplify();
        self.abs = Some(e);
    }

    /// Rewrite every location in the absolute part through `f`.
    pub fn map_locations(&mut self, f: &dyn Fn(Location) -> Location) {
        if let Some(abs) = self.abs.as_mut() {
            abs.map_locations(f);
            abs.simplify();
        }
    }

    /// The integer value, if the absolute part is a literal and nothing is
    /// relative.
    pub fn get_int(&self) -> Option<i64> {
        if self.rel.is_some() {
            return None;
        }
        match &self.abs {
            Some(e) => e.as_int(),
            None => Some(0),
        }
    }

    /// Expand symbols, simplify, and split off the external symbol.
    pub fn finalize(&mut self, symbols: &SymbolTable, loc: SourceLoc) -> Result<(), AsmError> {
        let Some(mut abs) = self.abs.take() else {
            return Ok(());
        };
        abs.expand_symbols(symbols)
            .map_err(|_| AsmError::CircularReference { loc })?;
        abs.simplify();

        let mut terms = match abs {
            Expr::Add(terms) => terms,
            other => alloc::vec![other],
        };
        let mut externals: Vec<String> = Vec::new();
        terms.retain(|t| match t {
            Expr::Sym(name) => {
                externals.push(name.clone());
                false
            }
            _ => true,
        });
        if externals.len() + usize::from(self.rel.is_some()) > 1
            || terms.iter().any(Expr::contains_sym)
        {
            return Err(AsmError::TooComplex {
                detail: String::from("reference to more than one external symbol"),
                loc,
            });
        }
        if let Some(name) = externals.pop() {
            self.rel = Some(name);
        }

        let mut abs = Expr::Add(terms);
        abs.simplify();
        self.abs = Some(abs);
        Ok(())
    }
}
