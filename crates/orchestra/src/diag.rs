//! Structured diagnostics.
//!
//! Diagnostics are the engine's user-facing reporting channel. Unlike hard
//! errors they accumulate: a failed graph node records its diagnostics and
//! the walk continues through unaffected subgraphs. The final bundle is the
//! union of every node's diagnostics plus orchestrator-level errors, sorted
//! by severity and then by subject address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a single diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single structured diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// One-line statement of the problem.
    pub summary: String,
    /// Longer explanation, possibly empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Canonical address of the object the diagnostic concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: String::new(),
            address: None,
        }
    }

    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: String::new(),
            address: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.summary)?;
        if let Some(addr) = &self.address {
            write!(f, " ({addr})")?;
        }
        if !self.detail.is_empty() {
            write!(f, "\n  {}", self.detail)?;
        }
        Ok(())
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Sort for presentation: errors before warnings, then by address.
    pub fn sort(&mut self) {
        self.0
            .sort_by(|a, b| (a.severity, &a.address, &a.summary).cmp(&(b.severity, &b.address, &b.summary)));
    }

    /// Render every diagnostic, one per line block.
    pub fn to_report(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(d: Diagnostic) -> Self {
        Self(vec![d])
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_errors() {
        let mut diags = Diagnostics::new();
        assert!(!diags.has_errors());

        diags.push(Diagnostic::warning("something looks off"));
        assert!(!diags.has_errors());

        diags.push(Diagnostic::error("something broke"));
        assert!(diags.has_errors());
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn test_sort_orders_errors_first() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning("w").with_address("b.b"));
        diags.push(Diagnostic::error("e").with_address("a.a"));
        diags.push(Diagnostic::error("e").with_address("a.b"));
        diags.sort();

        let addrs: Vec<_> = diags.iter().map(|d| d.address.clone().unwrap()).collect();
        assert_eq!(addrs, vec!["a.a", "a.b", "b.b"]);
        assert!(diags.iter().next().unwrap().is_error());
    }

    #[test]
    fn test_display_includes_detail_and_address() {
        let d = Diagnostic::error("missing attribute")
            .with_detail("the attribute \"ami\" is required")
            .with_address("web.main");
        let s = d.to_string();
        assert!(s.contains("error: missing attribute"));
        assert!(s.contains("web.main"));
        assert!(s.contains("required"));
    }
}
