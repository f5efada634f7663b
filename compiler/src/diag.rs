// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler passes, and
// the concurrent sink that accumulates them for one compile invocation.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none. The core never prints diagnostics; the host renders them.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::id::ElementId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `E0302`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by error category.
pub mod codes {
    use super::DiagCode;

    // E01xx: structural errors (validation)
    pub const E0101: DiagCode = DiagCode("E0101"); // mandatory port not connected
    pub const E0102: DiagCode = DiagCode("E0102"); // cycle in connection graph
    pub const E0103: DiagCode = DiagCode("E0103"); // unresolvable flow part

    // E02xx: processor resolution errors
    pub const E0201: DiagCode = DiagCode("E0201"); // no rendezvous processor
    pub const E0202: DiagCode = DiagCode("E0202"); // no processor for element

    // E03xx: shuffle key errors
    pub const E0301: DiagCode = DiagCode("E0301"); // unknown data class
    pub const E0302: DiagCode = DiagCode("E0302"); // unknown property
    pub const E0303: DiagCode = DiagCode("E0303"); // grouping key mismatch across segments
    pub const E0304: DiagCode = DiagCode("E0304"); // shuffle input without key

    // E04xx: builder invariants (internal defects)
    pub const E0401: DiagCode = DiagCode("E0401");

    // E09xx: pass certificate failures
    pub const E0901: DiagCode = DiagCode("E0901");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Offending element ────────────────────────────────────────────────────

/// The element a diagnostic is attributed to. `name` is qualified with the
/// enclosing flow part names (`part.op`) for elements inside flow parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub id: ElementId,
    pub name: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub element: Option<ElementRef>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, element, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            element: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Shorthand for an error-level diagnostic with a code.
    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attribute the diagnostic to an element.
    pub fn with_element(mut self, id: ElementId, name: impl Into<String>) -> Self {
        self.element = Some(ElementRef {
            id,
            name: name.into(),
        });
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(elem) = &self.element {
            write!(f, "\n  at: {} ({})", elem.name, elem.id)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Diagnostic sink ──────────────────────────────────────────────────────

/// Append-only diagnostic collector shared by all passes of one compile.
///
/// Safe for concurrent append from per-stage analysis workers. Ordering of
/// entries appended from different workers is unspecified.
#[derive(Debug, Default)]
pub struct DiagSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Diagnostic>> {
        // A panicking worker must not hide diagnostics already recorded.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn emit(&self, diag: Diagnostic) {
        tracing::debug!(diagnostic = %diag, "diagnostic emitted");
        self.lock().push(diag);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.lock().iter().filter(|d| d.is_error()).count()
    }

    pub fn has_error(&self) -> bool {
        self.error_count() > 0
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    /// Drain all entries, leaving the sink empty.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.lock())
    }
}
