//! Cumulative line coverage and per-request deltas.
//!
//! The target reports hit counts per source line. The tracker folds each
//! report into a cumulative map and returns only the lines that went from
//! never-hit to hit, which is what the engine treats as progress.

use log::warn;
use routefuzz_target::{merge_coverage_into, CoverageMap, ReportError};
use std::fs;
use std::path::Path;

/// Cumulative coverage for one fuzzing run.
#[derive(Debug, Clone, Default)]
pub struct CoverageTracker {
    cumulative: CoverageMap,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cumulative(&self) -> &CoverageMap {
        &self.cumulative
    }

    /// Fold `new_coverage` into the cumulative map and return the delta.
    ///
    /// A file seen for the first time is taken whole. For a known file a
    /// line counts as new only when its cumulative count was zero; counts
    /// on already-hit lines still accumulate. Files without a single new
    /// hit line are left out of the delta.
    pub fn update(&mut self, new_coverage: &CoverageMap) -> CoverageMap {
        let mut delta = CoverageMap::new();

        for (file, counts) in new_coverage {
            let file_delta = match self.cumulative.get_mut(file) {
                None => {
                    self.cumulative.insert(file.clone(), counts.clone());
                    counts.clone()
                }
                Some(cumulative) => {
                    if cumulative.len() < counts.len() {
                        cumulative.resize(counts.len(), None);
                    }
                    counts
                        .iter()
                        .zip(cumulative.iter_mut())
                        .map(|(count, total)| match (*count, *total) {
                            (None, _) | (Some(0), _) => *count,
                            (Some(hits), None) | (Some(hits), Some(0)) => {
                                *total = Some(hits);
                                Some(hits)
                            }
                            (Some(hits), Some(seen)) => {
                                *total = Some(seen + hits);
                                Some(0)
                            }
                        })
                        .collect()
                }
            };

            if file_delta.iter().any(|count| matches!(count, Some(n) if *n > 0)) {
                delta.insert(file.clone(), file_delta);
            }
        }

        delta
    }

    /// Percentage of runnable lines hit so far.
    pub fn percentage(&self) -> f64 {
        calculate_coverage_percentage(&self.cumulative)
    }
}

/// Hit runnable lines over runnable lines, times 100.
///
/// A map with no runnable lines yields 0.
pub fn calculate_coverage_percentage(coverage: &CoverageMap) -> f64 {
    let mut runnable = 0u64;
    let mut hit = 0u64;
    for count in coverage.values().flatten().flatten() {
        runnable += 1;
        if *count > 0 {
            hit += 1;
        }
    }
    if runnable == 0 {
        warn!("no runnable lines in coverage data");
        return 0.0;
    }
    hit as f64 / runnable as f64 * 100.0
}

/// Union of two coverage maps; counts on overlapping lines are summed.
pub fn merge_source_coverages(a: &CoverageMap, b: &CoverageMap) -> CoverageMap {
    let mut merged = a.clone();
    merge_coverage_into(&mut merged, b);
    merged
}

/// Read one coverage map stored as a single JSON document.
pub fn load_coverage_file(path: &Path) -> Result<CoverageMap, ReportError> {
    let text = fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge coverage files from independent runs.
pub fn union_coverage_files<P: AsRef<Path>>(paths: &[P]) -> Result<CoverageMap, ReportError> {
    let mut union = CoverageMap::new();
    for path in paths {
        let coverage = load_coverage_file(path.as_ref())?;
        merge_coverage_into(&mut union, &coverage);
    }
    Ok(union)
}
