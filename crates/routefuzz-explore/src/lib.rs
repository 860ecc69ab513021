//! Coverage-guided, stateful fuzzing engine for database-backed web
//! applications.
//!
//! The engine drives a target application through its HTTP routes and
//! steers parameter values with live feedback from the instrumented
//! target: source line coverage, executed queries and raised exceptions.
//!
//! # Architecture
//!
//! ```text
//! 1. Pick a route (REPLAY seeds → EXHAUSTIVE catalog → RANDOM forever)
//! 2. On route change: SNAPSHOT store + cookies + PRNG
//! 3. Send the request with the route's current parameter values
//! 4. Read feedback: coverage delta, new query shapes, new exceptions
//! 5. Map parameter values onto query columns; flag literal SQL splices
//! 6. Mutate: mapped params take live store values, others random values
//! 7. Progress keeps the route, otherwise move on
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use routefuzz_explore::catalog::{Catalog, DefaultHeaders};
//! use routefuzz_explore::explorer::{Explorer, ExplorerConfig};
//! use routefuzz_explore::report::format_report;
//! use routefuzz_target::http::{HttpSender, DEFAULT_TIMEOUT};
//! use routefuzz_target::postgres::PgCli;
//! use routefuzz_target::report_dir::ReportDir;
//! use std::path::Path;
//!
//! let results = Path::new("results");
//! let catalog = Catalog::load(&results.join("routes.json"), None, &DefaultHeaders::new(), &[])
//!     .unwrap();
//! let config = ExplorerConfig {
//!     port: 3000,
//!     db_name: "app_development".to_string(),
//!     results_dir: results.to_path_buf(),
//!     ..Default::default()
//! };
//!
//! let mut explorer = Explorer::new(
//!     config,
//!     catalog,
//!     Box::new(HttpSender::new(DEFAULT_TIMEOUT).unwrap()),
//!     Box::new(ReportDir::open(results, "http://localhost:3000").unwrap()),
//!     Box::new(PgCli::new("localhost", None, "app_development")),
//! )
//! .unwrap();
//! let report = explorer.run().unwrap();
//! println!("{}", format_report(&report));
//! ```
//!
//! # Module Structure
//!
//! - [`catalog`]: routes, seed examples and parameter discovery
//! - [`param`]: parameter values, naive mutation and live-value lookup
//! - [`coverage`]: cumulative line coverage and per-request deltas
//! - [`query`]: matching parameter values against query predicates
//! - [`injection`]: SQL injection candidates
//! - [`exceptions`]: filtered, de-duplicated target exceptions
//! - [`rng`]: capturable PRNG
//! - [`snapshot`]: store + session + PRNG checkpoints
//! - [`phase`]: phased route selection
//! - [`mutator`]: per-request mutation policy
//! - [`explorer`]: the fuzzing loop
//! - [`stats`], [`report`]: results and run summaries

pub mod catalog;
pub mod coverage;
pub mod exceptions;
pub mod explorer;
pub mod injection;
pub mod mutator;
pub mod param;
pub mod phase;
pub mod query;
pub mod report;
pub mod rng;
pub mod snapshot;
pub mod stats;

#[cfg(test)]
mod testing;
