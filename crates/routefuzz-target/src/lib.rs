//! Target-side contracts for routefuzz.
//!
//! The exploration engine never talks to a web application, a database or
//! the filesystem directly. It goes through the three traits defined here:
//!
//! - [`RequestSender`] delivers one HTTP request and returns the status
//!   code (or `None` on timeout).
//! - [`TargetAdapter`] exposes the feedback an instrumented target writes
//!   after each request: line coverage, executed queries, raised
//!   exceptions and accessed parameter paths.
//! - [`Storage`] snapshots and restores the backing store and answers
//!   live-value lookups.
//!
//! Concrete implementations for a real target live alongside:
//!
//! - [`http::HttpSender`]: blocking reqwest client, no redirects
//! - [`report_dir::ReportDir`]: line-delimited JSON report files
//! - [`postgres::PgCli`]: `pg_dump`/`psql`/`createdb`/`dropdb`
//!
//! # Module Structure
//!
//! - [`records`]: parsed report records (coverage, queries, exceptions)
//! - [`cookie`]: session cookie jar
//! - [`stream`]: byte-offset cursor over an append-only report file

pub mod cookie;
pub mod http;
pub mod postgres;
pub mod records;
pub mod report_dir;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cookie::CookieJar;
pub use records::{
    merge_coverage_into, value_text, Attribute, CoverageMap, Predicate, QueryAst, QueryMethod,
    QueryRecord, RawException, ValueNode,
};
pub use stream::ReportStream;

/// One request ready to be sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Absolute URL with dynamic segments already substituted.
    pub url: String,
    /// Upper-case HTTP verb.
    pub verb: String,
    pub body_params: BTreeMap<String, Value>,
    pub query_params: BTreeMap<String, Value>,
    pub headers: BTreeMap<String, String>,
}

/// Errors reading target feedback.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error on report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed line in report {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP error talking to target: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors delivering a request.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid HTTP verb {0:?}")]
    InvalidVerb(String),

    #[error("GET request to {url} cannot carry body params")]
    BodyOnGet { url: String },

    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
}

/// Errors from the backing store driver.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not drop database {db} after retry")]
    DropFailed { db: String },

    #[error("unexpected store output {0:?}")]
    Parse(String),
}

/// Delivers requests to the target.
pub trait RequestSender {
    /// Send `request`, updating `cookies` from the response.
    ///
    /// Returns `Ok(None)` when the request timed out; any HTTP status,
    /// including 4xx and 5xx, is `Ok(Some(code))`.
    fn send(
        &mut self,
        cookies: &mut CookieJar,
        request: &HttpRequest,
    ) -> Result<Option<u16>, SendError>;
}

/// Feedback written by the instrumented target.
///
/// Each call returns only what was reported since the previous call.
pub trait TargetAdapter {
    fn report_coverage(&mut self) -> Result<CoverageMap, ReportError>;
    fn report_queries(&mut self) -> Result<Vec<QueryRecord>, ReportError>;
    fn report_exceptions(&mut self) -> Result<Vec<RawException>, ReportError>;
    /// Parameter key paths the target read, e.g. `["post", "raw"]`.
    fn report_params(&mut self) -> Result<Vec<Vec<String>>, ReportError>;
    /// Ask the target to release pooled store connections.
    fn clear_connections(&mut self) -> Result<(), ReportError>;
}

/// Backing store driver.
pub trait Storage {
    /// Write a full dump of `db_name` to `path`.
    fn dump(&mut self, db_name: &str, path: &Path) -> Result<(), StoreError>;
    /// Drop `db_name`, recreate it and load the dump at `path`.
    fn restore(&mut self, db_name: &str, path: &Path) -> Result<(), StoreError>;
    /// The value of `column` in the row at `offset` of `table`.
    fn lookup(
        &mut self,
        table: &str,
        column: &str,
        offset: u64,
    ) -> Result<Option<String>, StoreError>;
    fn count_rows(&mut self, table: &str) -> Result<u64, StoreError>;
}
