use crate::source_loc::SourceLoc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A user-facing diagnostic record. Lowering never unwinds on these: they are
/// collected into a [`DiagSink`] and the offending call site is left in a
/// safe, erasable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diag {
    pub severity: Severity,
    pub loc: SourceLoc,
    pub message: String,
}
impl Diag {
    #[inline]
    pub fn error(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            loc,
            message: message.into(),
        }
    }

    #[inline]
    pub fn warning(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            loc,
            message: message.into(),
        }
    }
}
impl core::fmt::Display for Diag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sev = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {sev}: {}", self.loc, self.message)
    }
}

/// Collects diagnostics across one lowering run. Errors do not stop the run;
/// a single invocation reports every fault in the module.
#[derive(Debug, Default)]
pub struct DiagSink {
    records: Vec<Diag>,
}
impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn report(&mut self, d: Diag) {
        self.records.push(d);
    }

    #[inline]
    pub fn error(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.report(Diag::error(loc, message));
    }

    #[inline]
    pub fn has_errors(&self) -> bool {
        self.records.iter().any(|d| d.severity == Severity::Error)
    }

    #[inline]
    pub fn records(&self) -> &[Diag] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A bug in this pass or an earlier one, never a user error. Lowering aborts
/// immediately on these; continuing would silently miscompile.
#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
    #[error("handle resolution re-entered an unresolved chain at {0}")]
    RecursiveHandleResolution(String),
    #[error("counter marked on a non-UAV resource at {0}")]
    CounterOnNonUav(String),
    #[error("malformed operation call: {0}")]
    MalformedCall(String),
}
