//! Per-run results, status histogram and coverage series.

use crate::exceptions::ExceptionRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stats blob name inside the results directory.
pub const STATS_FILE: &str = "fuzz_stats";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("no requests recorded")]
    NoResults,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed stats file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One request and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub verb: String,
    pub path: String,
    /// `None` when the request timed out.
    pub code: Option<u16>,
    pub exceptions: Vec<ExceptionRecord>,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSample {
    pub verb: String,
    pub path: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusClass {
    #[serde(rename = "2xx")]
    Success,
    #[serde(rename = "3xx")]
    Redirect,
    #[serde(rename = "4xx")]
    ClientError,
    #[serde(rename = "5xx")]
    ServerError,
    #[serde(rename = "timeout")]
    Timeout,
}

impl StatusClass {
    /// Anything below 300 counts as success.
    pub fn of(code: Option<u16>) -> Self {
        match code {
            None => StatusClass::Timeout,
            Some(c) if c >= 500 => StatusClass::ServerError,
            Some(c) if c >= 400 => StatusClass::ClientError,
            Some(c) if c >= 300 => StatusClass::Redirect,
            Some(_) => StatusClass::Success,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusClass::Success => "2xx",
            StatusClass::Redirect => "3xx",
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
            StatusClass::Timeout => "timeout",
        }
    }
}

/// Requests in one status class and the `VERB:path` routes that got it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub count: usize,
    pub routes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuzzStats {
    results: Vec<ResultRecord>,
    covs: Vec<CoverageSample>,
    buckets: BTreeMap<StatusClass, Bucket>,
}

impl FuzzStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stats(
        &mut self,
        verb: &str,
        path: &str,
        code: Option<u16>,
        exceptions: Vec<ExceptionRecord>,
        snapshot: Option<&Path>,
    ) {
        self.results.push(ResultRecord {
            verb: verb.to_string(),
            path: path.to_string(),
            code,
            exceptions,
            snapshot: snapshot.map(|p| p.display().to_string()),
        });
        let bucket = self.buckets.entry(StatusClass::of(code)).or_default();
        bucket.count += 1;
        bucket.routes.insert(format!("{}:{}", verb, path));
    }

    pub fn record_coverage(&mut self, verb: &str, path: &str, percentage: f64) {
        self.covs.push(CoverageSample {
            verb: verb.to_string(),
            path: path.to_string(),
            percentage,
        });
    }

    pub fn final_coverage(&self) -> Option<f64> {
        self.covs.last().map(|s| s.percentage)
    }

    pub fn coverage_series(&self) -> &[CoverageSample] {
        &self.covs
    }

    /// Requests per exact status code; `None` counts timeouts.
    pub fn get_code_counts(&self) -> BTreeMap<Option<u16>, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.results {
            *counts.entry(result.code).or_insert(0) += 1;
        }
        counts
    }

    pub fn buckets(&self) -> &BTreeMap<StatusClass, Bucket> {
        &self.buckets
    }

    /// Results matching every filter given.
    pub fn get_results(
        &self,
        verb: Option<&str>,
        path: Option<&str>,
        code: Option<u16>,
    ) -> Vec<&ResultRecord> {
        self.results
            .iter()
            .filter(|r| verb.map_or(true, |v| r.verb == v))
            .filter(|r| path.map_or(true, |p| r.path == p))
            .filter(|r| code.map_or(true, |c| r.code == Some(c)))
            .collect()
    }

    pub fn total_requests(&self) -> usize {
        self.results.len()
    }

    /// Share of requests answered 2xx.
    pub fn get_success_ratio(&self) -> Result<f64, StatsError> {
        if self.results.is_empty() {
            return Err(StatsError::NoResults);
        }
        let ok = self
            .buckets
            .get(&StatusClass::Success)
            .map_or(0, |b| b.count);
        Ok(ok as f64 / self.results.len() as f64)
    }

    /// Write the stats blob to `dir/fuzz_stats`, replacing any earlier one.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, StatsError> {
        let path = dir.join(STATS_FILE);
        let json = serde_json::to_vec(self).map_err(|source| StatsError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| StatsError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(file: &Path) -> Result<Self, StatsError> {
        let bytes = fs::read(file).map_err(|source| StatsError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StatsError::Json {
            path: file.to_path_buf(),
            source,
        })
    }
}
