//! File-backed feedback from an instrumented target.
//!
//! The target appends one JSON document per line to fixed file names in
//! the results directory. Each stream is truncated when the adapter is
//! opened so a run never sees a previous run's feedback.

use crate::{
    merge_coverage_into, CoverageMap, QueryRecord, RawException, ReportError, ReportStream,
    TargetAdapter,
};
use log::{debug, warn};
use reqwest::blocking::Client;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

pub const COVERAGE_FILE: &str = "src_line_coverage";
pub const QUERIES_FILE: &str = "queries";
pub const EXCEPTIONS_FILE: &str = "rails_exception_log.json";
pub const PARAMS_FILE: &str = "params";

/// Endpoint that makes the target release its pooled store connections.
pub const CLEAR_CONNECTIONS_PATH: &str = "/rails/info/clear_all_connections";

#[derive(Debug, Clone)]
struct Streams {
    coverage: ReportStream,
    queries: ReportStream,
    exceptions: ReportStream,
    params: ReportStream,
}

/// Reads the four report streams under one results directory.
pub struct ReportDir {
    streams: Streams,
    base_url: String,
    client: Client,
}

impl ReportDir {
    /// Open (and truncate) the report files under `results_dir`.
    ///
    /// `base_url` is the target origin, e.g. `http://localhost:3000`.
    pub fn open(results_dir: &Path, base_url: impl Into<String>) -> Result<Self, ReportError> {
        let mut streams = Streams {
            coverage: ReportStream::new(results_dir.join(COVERAGE_FILE)),
            queries: ReportStream::new(results_dir.join(QUERIES_FILE)),
            exceptions: ReportStream::new(results_dir.join(EXCEPTIONS_FILE)),
            params: ReportStream::new(results_dir.join(PARAMS_FILE)),
        };
        streams.coverage.reset()?;
        streams.queries.reset()?;
        streams.exceptions.reset()?;
        streams.params.reset()?;

        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            streams,
            base_url: base_url.into(),
            client,
        })
    }
}

impl TargetAdapter for ReportDir {
    /// Several coverage lines in one window are summed.
    fn report_coverage(&mut self) -> Result<CoverageMap, ReportError> {
        let reports: Vec<CoverageMap> = self.streams.coverage.read_new()?;
        let mut total = CoverageMap::new();
        for report in &reports {
            merge_coverage_into(&mut total, report);
        }
        Ok(total)
    }

    fn report_queries(&mut self) -> Result<Vec<QueryRecord>, ReportError> {
        self.streams.queries.read_new()
    }

    fn report_exceptions(&mut self) -> Result<Vec<RawException>, ReportError> {
        self.streams.exceptions.read_new()
    }

    /// Lines that are not arrays of strings are skipped.
    fn report_params(&mut self) -> Result<Vec<Vec<String>>, ReportError> {
        let lines: Vec<Value> = self.streams.params.read_new()?;
        let mut paths = Vec::new();
        for line in lines {
            match serde_json::from_value::<Vec<String>>(line) {
                Ok(path) if !path.is_empty() => paths.push(path),
                Ok(_) => {}
                Err(e) => debug!("skipping param report line: {}", e),
            }
        }
        Ok(paths)
    }

    fn clear_connections(&mut self) -> Result<(), ReportError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), CLEAR_CONNECTIONS_PATH);
        let status = self.client.get(&url).send()?.status();
        if !status.is_success() {
            warn!("clearing target connections returned {}", status);
        }
        Ok(())
    }
}
