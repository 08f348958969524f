//! Scrape error taxonomy.
//!
//! Every failure in a collection cycle is one of these kinds. Some kinds are
//! tolerated at their call site and degrade to an omitted metric series; the
//! rest propagate and abort the remainder of the scrape.

use thiserror::Error;

/// Errors raised while collecting one metric snapshot.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The hypervisor daemon could not be reached. Fatal for the scrape.
    #[error("failed to connect to {uri}: {reason}")]
    Connection { uri: String, reason: String },

    /// A batch or per-object hypervisor/kernel query failed. Fatal for the
    /// scrape unless a call site explicitly tolerates it.
    #[error("hypervisor query failed: {0}")]
    Query(String),

    /// The hypervisor or its version does not implement a feature.
    #[error("operation not supported by hypervisor: {0}")]
    Unsupported(String),

    /// The feature exists but is inapplicable to the current domain state.
    #[error("operation invalid for current domain state: {0}")]
    InvalidOperation(String),

    /// Malformed structured input (domain description, schedstat file).
    #[error("malformed input: {0}")]
    Parse(String),

    /// A kernel-level stat file is missing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ScrapeError {
    /// Whether this error degrades to an omitted field instead of aborting
    /// the scrape.
    pub fn is_tolerated(&self) -> bool {
        matches!(
            self,
            ScrapeError::Unsupported(_)
                | ScrapeError::InvalidOperation(_)
                | ScrapeError::Parse(_)
                | ScrapeError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds_are_not_tolerated() {
        let conn = ScrapeError::Connection {
            uri: "qemu:///system".into(),
            reason: "no daemon".into(),
        };
        assert!(!conn.is_tolerated());
        assert!(!ScrapeError::Query("batch failed".into()).is_tolerated());
    }

    #[test]
    fn test_degrading_kinds_are_tolerated() {
        assert!(ScrapeError::Unsupported("blkiotune".into()).is_tolerated());
        assert!(ScrapeError::InvalidOperation("domain not running".into()).is_tolerated());
        assert!(ScrapeError::Parse("schedstat".into()).is_tolerated());
        assert!(ScrapeError::NotFound("/proc/1/task/2/schedstat".into()).is_tolerated());
    }
}
