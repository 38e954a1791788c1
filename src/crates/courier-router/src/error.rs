//! Route-level error results
//!
//! Routing never raises: a failing key function produces a [`RouteError`]
//! that travels *in-band* with the matched terminals and is yielded to the
//! caller before any task result. [`RouteError::Filtered`] additionally
//! post-filters the matched terminal set before execution.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::node::Terminal;

/// Predicate applied to the matched terminal set by
/// [`RouteError::Filtered`]. Terminals for which it returns `false` are
/// dropped from the current dispatch pass.
#[derive(Clone)]
pub struct TerminalFilter(Arc<dyn Fn(&Terminal) -> bool + Send + Sync>);

impl TerminalFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Terminal) -> bool + Send + Sync + 'static,
    {
        TerminalFilter(Arc::new(f))
    }

    /// Drop every terminal of the current pass.
    pub fn drop_all() -> Self {
        TerminalFilter(Arc::new(|_| false))
    }

    pub fn keep(&self, terminal: &Terminal) -> bool {
        (self.0)(terminal)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TerminalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TerminalFilter").field(&"<function>").finish()
    }
}

/// In-band routing result errors.
#[derive(Clone, Debug, Error)]
pub enum RouteError {
    /// A key function asked for the terminal set to be post-filtered.
    #[error("route filtered")]
    Filtered(TerminalFilter),

    /// A key function failed with a non-route error.
    #[error("route internal error: {0}")]
    Internal(String),
}

impl RouteError {
    pub fn internal(reason: impl std::fmt::Display) -> Self {
        RouteError::Internal(reason.to_string())
    }

    /// Identity-style comparison used to deduplicate route results: a
    /// filter is the same result only when it is the same filter object.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (RouteError::Filtered(a), RouteError::Filtered(b)) => a.ptr_eq(b),
            (RouteError::Internal(a), RouteError::Internal(b)) => a == b,
            _ => false,
        }
    }
}
