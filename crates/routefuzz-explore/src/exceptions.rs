//! Target exceptions, filtered and de-duplicated.

use log::info;
use routefuzz_target::{RawException, ReportError, TargetAdapter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Exception classes that are routine for a fuzzed web application.
pub const BENIGN_EXCEPTIONS: &[&str] = &[
    "ActionController::RoutingError",
    "ActionController::ParameterMissing",
    "ActiveRecord::RecordNotFound",
];

/// An exception raised while serving one request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub verb: String,
    pub path: String,
    pub class: String,
    pub message: String,
}

pub fn is_benign(class: &str) -> bool {
    BENIGN_EXCEPTIONS.contains(&class)
}

/// Every unique exception seen during a run.
#[derive(Debug, Clone, Default)]
pub struct ExceptionTracker {
    seen: BTreeSet<ExceptionRecord>,
    /// First-seen order.
    unique: Vec<ExceptionRecord>,
}

impl ExceptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exceptions reported since the last call, attributed to `verb path`,
    /// benign classes removed.
    pub fn update(
        &self,
        target: &mut dyn TargetAdapter,
        verb: &str,
        path: &str,
    ) -> Result<Vec<ExceptionRecord>, ReportError> {
        Ok(filter_benign(target.report_exceptions()?, verb, path))
    }

    /// Remember `new` and return the records never seen before.
    pub fn merge(&mut self, new: Vec<ExceptionRecord>) -> Vec<ExceptionRecord> {
        let mut delta = Vec::new();
        for record in new {
            if self.seen.insert(record.clone()) {
                info!(
                    "new exception on {} {}: {}: {}",
                    record.verb, record.path, record.class, record.message
                );
                self.unique.push(record.clone());
                delta.push(record);
            }
        }
        delta
    }

    pub fn unique(&self) -> &[ExceptionRecord] {
        &self.unique
    }
}

pub fn filter_benign(raw: Vec<RawException>, verb: &str, path: &str) -> Vec<ExceptionRecord> {
    raw.into_iter()
        .filter(|e| !is_benign(&e.class))
        .map(|e| ExceptionRecord {
            verb: verb.to_string(),
            path: path.to_string(),
            class: e.class,
            message: e.msg,
        })
        .collect()
}
