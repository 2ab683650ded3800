//! Validate-and-repair layer for model output.
//!
//! Each validator takes the decoded JSON the model returned and produces a fully typed value.
//! Patterns are strict: one malformed entry rejects the batch. Sentiment and prediction are
//! lenient: anything short of a wrong top-level shape is repaired and reported to the
//! [`RepairObserver`] instead of failing.

pub mod patterns;
pub mod prediction;
pub mod sentiment;

pub use patterns::{normalize_patterns, top_patterns};
pub use prediction::normalize_prediction;
pub use sentiment::normalize_sentiment;

use std::fmt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("{what} must be a JSON object")]
    NotAnObject { what: &'static str },

    #[error("{what} must be a JSON array of patterns")]
    NotAnArray { what: &'static str },

    #[error("invalid field {path}: {reason}")]
    InvalidField { path: String, reason: String },
}

impl NormalizeError {
    fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairAction {
    Clamped { from: f64, to: f64 },
    /// Field was missing or had the wrong type; a default was substituted.
    Defaulted,
    /// Wrong-typed value replaced by null.
    Coerced,
    Renormalized { technical: f64, news: f64 },
    Skipped,
    Hedged,
    /// Required phrase was present in another case and rewritten to lowercase.
    Lowercased,
    DisclaimerAppended,
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clamped { from, to } => write!(f, "clamped {from} -> {to}"),
            Self::Defaulted => f.write_str("defaulted"),
            Self::Coerced => f.write_str("coerced to null"),
            Self::Renormalized { technical, news } => {
                write!(f, "renormalized to technical={technical} news={news}")
            }
            Self::Skipped => f.write_str("skipped"),
            Self::Hedged => f.write_str("hedge word inserted"),
            Self::Lowercased => f.write_str("lowercased"),
            Self::DisclaimerAppended => f.write_str("disclaimer appended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    /// Dotted path of the repaired field, e.g. `tradingRecommendation.quickTrade`.
    pub path: String,
    pub action: RepairAction,
}

/// Side channel for soft repairs. Validators never fail on a repair; they only report it here.
pub trait RepairObserver {
    fn on_repair(&mut self, repair: Repair);
}

impl RepairObserver for Vec<Repair> {
    fn on_repair(&mut self, repair: Repair) {
        self.push(repair);
    }
}

/// Logs each repair as a structured `warn` event.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    pub stage: &'static str,
}

impl RepairObserver for TracingObserver {
    fn on_repair(&mut self, repair: Repair) {
        tracing::warn!(
            stage = self.stage,
            path = %repair.path,
            action = %repair.action,
            "repaired model output"
        );
    }
}

pub(crate) fn report(observer: &mut dyn RepairObserver, path: impl Into<String>, action: RepairAction) {
    observer.on_repair(Repair {
        path: path.into(),
        action,
    });
}
