//! Label and EQU symbol table.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::error::{AsmError, SourceLoc};
use crate::expr::{Expr, Location};

/// A defined symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// A label bound to a location.
    Label {
        /// Where the label points.
        loc: Location,
        /// Definition site.
        source: SourceLoc,
    },
    /// A named constant expression (`name EQU expr`).
    Equ {
        /// The defining expression, expanded lazily on use.
        expr: Expr,
        /// Definition site.
        source: SourceLoc,
    },
}

impl Symbol {
    /// Definition site.
    pub fn source(&self) -> SourceLoc {
        match self {
            Symbol::Label { source, .. } | Symbol::Equ { source, .. } => *source,
        }
    }
}

/// Name → symbol map.  Names not present are treated as external.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: &str, sym: Symbol) -> Result<(), AsmError> {
        if let Some(prev) = self.symbols.get(name) {
            return Err(AsmError::DuplicateLabel {
                label: String::from(name),
                loc: sym.source(),
                first_loc: prev.source(),
            });
        }
        self.symbols.insert(String::from(name), sym);
        Ok(())
    }

    /// Bind `name` to `loc`.
    pub fn define_label(
        &mut self,
        name: &str,
        loc: Location,
        source: SourceLoc,
    ) -> Result<(), AsmError> {
        self.insert(name, Symbol::Label { loc, source })
    }

    /// Bind `name` to a constant expression.
    pub fn define_equ(
        &mut self,
        name: &str,
        expr: Expr,
        source: SourceLoc,
    ) -> Result<(), AsmError> {
        self.insert(name, Symbol::Equ { expr, source })
    }

    /// Look up a symbol.
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Location of a label, if `name` is one.
    pub fn label(&self, name: &str) -> Option<Location> {
        match self.symbols.get(name) {
            Some(Symbol::Label { loc, .. }) => Some(*loc),
            _ => None,
        }
    }

    /// All labels, in name order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, Location)> {
        self.symbols.iter().filter_map(|(name, sym)| match sym {
            Symbol::Label { loc, .. } => Some((name.as_str(), *loc)),
            Symbol::Equ { .. } => None,
        })
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
