//! Error types, source locations, and the shared diagnostics sink.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Source location for diagnostics.
///
/// Tracks the line, column, byte offset, and length of the construct that
/// produced a bytecode.  The layout engine never inspects it; it only
/// attributes errors to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceLoc {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number (byte offset within line).
    pub col: u32,
    /// 0-based byte offset from start of source.
    pub offset: usize,
    /// Byte length of the spanned region.
    pub len: usize,
}

impl SourceLoc {
    /// Create a new source location.
    #[must_use]
    pub fn new(line: u32, col: u32, offset: usize, len: usize) -> Self {
        Self {
            line,
            col,
            offset,
            len,
        }
    }

    /// Location on `line`, column 1.
    #[must_use]
    pub fn line(line: u32) -> Self {
        Self::new(line, 1, 0, 0)
    }

    /// A dummy location for generated/internal constructs.
    #[must_use]
    pub fn dummy() -> Self {
        Self::default()
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Layout error, attributed to the source location of the failing bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsmError {
    /// A compile-time constant was required but the expression is not one.
    NotConstant {
        /// What needed to be constant.
        detail: String,
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// An expression cannot be computed where only a computable quantity
    /// is permitted.
    TooComplex {
        /// What was too complex.
        detail: String,
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// A value references an external symbol or another section where only
    /// a plain number is valid.
    NotAbsolute {
        /// What needed to be absolute.
        detail: String,
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// A size-dependent quantity depends on its own size.
    CircularReference {
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// An origin directive would have to move the layout backward.
    OrgOverlap {
        /// Requested section offset.
        target: u64,
        /// Offset already reached by preceding bytecodes.
        current: u64,
        /// Source location of the origin directive.
        loc: SourceLoc,
    },

    /// A value is out of its permitted domain (e.g. negative repetition count).
    Value {
        /// Description of the bad value.
        detail: String,
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// A span judged too complex asked to keep growing.
    SecondaryExpansion {
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// Label was defined more than once.
    DuplicateLabel {
        /// The duplicated label name.
        label: String,
        /// Source location of the duplicate definition.
        loc: SourceLoc,
        /// Source location of the first definition.
        first_loc: SourceLoc,
    },

    /// An output value does not fit its field.
    ValueOverflow {
        /// The value that overflowed.
        value: i128,
        /// Field size in bytes.
        size: u8,
        /// Source location of the bytecode.
        loc: SourceLoc,
    },

    /// A short branch cannot reach its target at output time.
    BranchOutOfRange {
        /// The displacement to the target.
        disp: i64,
        /// Maximum allowed displacement magnitude.
        max: i64,
        /// Source location of the branch.
        loc: SourceLoc,
    },

    /// The expansion budget ran out before the layout converged.
    RelaxationLimit {
        /// Maximum number of expansions allowed.
        max: usize,
    },

    /// Errors past the configured cap were counted but not kept.
    Suppressed {
        /// Number of errors not kept.
        count: usize,
    },

    /// Multiple errors collected during layout.
    Multiple {
        /// The collected errors.
        errors: Vec<AsmError>,
    },
}

impl AsmError {
    /// Source location of the error, if it has one.
    pub fn loc(&self) -> Option<SourceLoc> {
        match self {
            AsmError::NotConstant { loc, .. }
            | AsmError::TooComplex { loc, .. }
            | AsmError::NotAbsolute { loc, .. }
            | AsmError::CircularReference { loc }
            | AsmError::OrgOverlap { loc, .. }
            | AsmError::Value { loc, .. }
            | AsmError::SecondaryExpansion { loc }
            | AsmError::DuplicateLabel { loc, .. }
            | AsmError::ValueOverflow { loc, .. }
            | AsmError::BranchOutOfRange { loc, .. } => Some(*loc),
            AsmError::RelaxationLimit { .. }
            | AsmError::Suppressed { .. }
            | AsmError::Multiple { .. } => None,
        }
    }

    /// Flatten into the list of individual errors.
    pub fn into_errors(self) -> Vec<AsmError> {
        match self {
            AsmError::Multiple { errors } => errors,
            other => vec![other],
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::NotConstant { detail, loc } => {
                write!(f, "{}: {} must be a constant", loc, detail)
            }
            AsmError::TooComplex { detail, loc } => {
                write!(f, "{}: {} is too complex", loc, detail)
            }
            AsmError::NotAbsolute { detail, loc } => {
                write!(f, "{}: {} must be absolute", loc, detail)
            }
            AsmError::CircularReference { loc } => {
                write!(f, "{}: circular reference detected", loc)
            }
            AsmError::OrgOverlap {
                target,
                current,
                loc,
            } => {
                write!(
                    f,
                    "{}: ORG 0x{:X} overlaps already existing data (at 0x{:X})",
                    loc, target, current
                )
            }
            AsmError::Value { detail, loc } => {
                write!(f, "{}: {}", loc, detail)
            }
            AsmError::SecondaryExpansion { loc } => {
                write!(f, "{}: secondary expansion of an external/complex value", loc)
            }
            AsmError::DuplicateLabel {
                label,
                loc,
                first_loc,
            } => {
                write!(
                    f,
                    "{}: duplicate label '{}' (first defined at {})",
                    loc, label, first_loc
                )
            }
            AsmError::ValueOverflow { value, size, loc } => {
                write!(
                    f,
                    "{}: value {} does not fit in {} byte(s)",
                    loc, value, size
                )
            }
            AsmError::BranchOutOfRange { disp, max, loc } => {
                write!(
                    f,
                    "{}: branch target out of range (displacement={}, max=±{})",
                    loc, disp, max
                )
            }
            AsmError::RelaxationLimit { max } => {
                write!(
                    f,
                    "layout exceeded maximum of {} expansions before converging",
                    max
                )
            }
            AsmError::Suppressed { count } => {
                write!(f, "{} more error(s) not shown", count)
            }
            AsmError::Multiple { errors } => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AsmError {}

/// A non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Warning {
    /// Warning text.
    pub msg: String,
    /// Source location of the bytecode.
    pub loc: SourceLoc,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: warning: {}", self.loc, self.msg)
    }
}

/// Shared error/warning collector.
///
/// Bytecode-level failures are recorded here instead of aborting, so that a
/// single bad bytecode does not hide the errors of the rest of the section.
/// Errors past `max_errors` are counted but not stored.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    errors: Vec<AsmError>,
    warnings: Vec<Warning>,
    max_errors: usize,
    dropped: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Create an empty collector with the default error cap (64).
    pub fn new() -> Self {
        Self::with_limit(64)
    }

    /// Create an empty collector storing at most `max_errors` errors.
    pub fn with_limit(max_errors: usize) -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            max_errors,
            dropped: 0,
        }
    }

    /// Record an error.
    pub fn error(&mut self, err: AsmError) {
        tracing::debug!("error recorded: {}", err);
        for e in err.into_errors() {
            if self.errors.len() < self.max_errors {
                self.errors.push(e);
            } else {
                self.dropped += 1;
            }
        }
    }

    /// Record a warning.
    pub fn warn(&mut self, msg: impl Into<String>, loc: SourceLoc) {
        self.warnings.push(Warning {
            msg: msg.into(),
            loc,
        });
    }

    /// Whether any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.dropped > 0
    }

    /// Recorded errors, in report order.
    pub fn errors(&self) -> &[AsmError] {
        &self.errors
    }

    /// Recorded warnings, in report order.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Number of errors that exceeded the cap and were not stored.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Collapse the recorded errors into one [`AsmError`], if any.
    ///
    /// Errors dropped by the cap are reported as a trailing
    /// [`AsmError::Suppressed`], so this is `Some` exactly when
    /// [`has_errors`](Self::has_errors) is true.
    pub fn to_error(&self) -> Option<AsmError> {
        let mut errors = self.errors.clone();
        if self.dropped > 0 {
            errors.push(AsmError::Suppressed {
                count: self.dropped,
            });
        }
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(AsmError::Multiple { errors }),
        }
    }

    /// `Ok(value)` when no error was recorded, else the collapsed errors.
    pub fn into_result<T>(self, value: T) -> Result<T, AsmError> {
        match self.to_error() {
            Some(e) => Err(e),
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_loc_display() {
        let loc = SourceLoc::new(3, 12, 45, 5);
        assert_eq!(format!("{}", loc), "3:12");
    }

    #[test]
    fn source_loc_dummy() {
        let loc = SourceLoc::dummy();
        assert_eq!(loc.line, 0);
        assert_eq!(loc.col, 0);
    }

    #[test]
    fn error_org_overlap_display() {
        let err = AsmError::OrgOverlap {
            target: 10,
            current: 20,
            loc: SourceLoc::line(4),
        };
        assert_eq!(
            format!("{}", err),
            "4:1: ORG 0xA overlaps already existing data (at 0x14)"
        );
    }

    #[test]
    fn error_circular_display() {
        let err = AsmError::CircularReference {
            loc: SourceLoc::new(7, 3, 0, 0),
        };
        assert_eq!(format!("{}", err), "7:3: circular reference detected");
    }

    #[test]
    fn error_not_constant_display() {
        let err = AsmError::NotConstant {
            detail: "alignment boundary".into(),
            loc: SourceLoc::line(2),
        };
        assert_eq!(
            format!("{}", err),
            "2:1: alignment boundary must be a constant"
        );
    }

    #[test]
    fn error_duplicate_label_display() {
        let err = AsmError::DuplicateLabel {
            label: "loop".into(),
            loc: SourceLoc::new(20, 1, 200, 4),
            first_loc: SourceLoc::new(5, 1, 50, 4),
        };
        assert_eq!(
            format!("{}", err),
            "20:1: duplicate label 'loop' (first defined at 5:1)"
        );
    }

    #[test]
    fn error_relaxation_limit_display() {
        let err = AsmError::RelaxationLimit { max: 20 };
        assert_eq!(
            format!("{}", err),
            "layout exceeded maximum of 20 expansions before converging"
        );
        assert_eq!(err.loc(), None);
    }

    #[test]
    fn error_multiple_display() {
        let err = AsmError::Multiple {
            errors: vec![
                AsmError::Value {
                    detail: "err1".into(),
                    loc: SourceLoc::line(1),
                },
                AsmError::Value {
                    detail: "err2".into(),
                    loc: SourceLoc::line(2),
                },
            ],
        };
        let s = format!("{}", err);
        assert!(s.contains("err1"));
        assert!(s.contains("err2"));
    }

    #[test]
    fn diagnostics_collapse() {
        let mut diags = Diagnostics::new();
        assert!(diags.to_error().is_none());
        diags.error(AsmError::CircularReference {
            loc: SourceLoc::line(1),
        });
        assert!(matches!(
            diags.to_error(),
            Some(AsmError::CircularReference { .. })
        ));
        diags.error(AsmError::CircularReference {
            loc: SourceLoc::line(2),
        });
        match diags.to_error() {
            Some(AsmError::Multiple { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected Multiple, got {other:?}"),
        }
    }

    #[test]
    fn diagnostics_flatten_nested_multiple() {
        let mut diags = Diagnostics::new();
        diags.error(AsmError::Multiple {
            errors: vec![
                AsmError::SecondaryExpansion {
                    loc: SourceLoc::line(1),
                },
                AsmError::SecondaryExpansion {
                    loc: SourceLoc::line(2),
                },
            ],
        });
        assert_eq!(diags.errors().len(), 2);
    }

    #[test]
    fn diagnostics_cap() {
        let mut diags = Diagnostics::with_limit(1);
        for line in 1..=3 {
            diags.error(AsmError::CircularReference {
                loc: SourceLoc::line(line),
            });
        }
        assert_eq!(diags.errors().len(), 1);
        assert_eq!(diags.dropped(), 2);
        assert!(diags.has_errors());
        let errors = diags.to_error().unwrap().into_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1], AsmError::Suppressed { count: 2 });
    }

    #[test]
    fn diagnostics_zero_cap_still_fails() {
        let mut diags = Diagnostics::with_limit(0);
        diags.error(AsmError::CircularReference {
            loc: SourceLoc::line(1),
        });
        assert!(diags.errors().is_empty());
        assert_eq!(diags.to_error(), Some(AsmError::Suppressed { count: 1 }));
        assert_eq!(
            format!("{}", diags.clone().into_result(()).unwrap_err()),
            "1 more error(s) not shown"
        );
    }

    #[test]
    fn diagnostics_warnings_do_not_fail() {
        let mut diags = Diagnostics::new();
        diags.warn("negative value for unsigned LEB128", SourceLoc::line(9));
        assert!(!diags.has_errors());
        assert_eq!(diags.warnings().len(), 1);
        assert_eq!(diags.into_result(5).unwrap(), 5);
    }
}
