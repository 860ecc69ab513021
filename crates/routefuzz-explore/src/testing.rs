//! In-memory collaborators for engine tests.

use routefuzz_target::{
    CookieJar, CoverageMap, HttpRequest, QueryRecord, RawException, ReportError, RequestSender,
    SendError, Storage, StoreError, TargetAdapter,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A "database" that is one string plus a few lookup tables.
#[derive(Debug, Default)]
pub struct FakeStore {
    pub contents: String,
    tables: BTreeMap<(String, String), Vec<String>>,
    pub dumps: Rc<RefCell<usize>>,
    pub restores: usize,
}

impl FakeStore {
    pub fn add_rows(&mut self, table: &str, column: &str, rows: &[&str]) {
        self.tables
            .entry((table.to_string(), column.to_string()))
            .or_default()
            .extend(rows.iter().map(|r| r.to_string()));
    }
}

impl Storage for FakeStore {
    fn dump(&mut self, _db_name: &str, path: &Path) -> Result<(), StoreError> {
        *self.dumps.borrow_mut() += 1;
        fs::write(path, &self.contents).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn restore(&mut self, _db_name: &str, path: &Path) -> Result<(), StoreError> {
        self.restores += 1;
        self.contents = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn lookup(
        &mut self,
        table: &str,
        column: &str,
        offset: u64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .tables
            .get(&(table.to_string(), column.to_string()))
            .and_then(|rows| rows.get(offset as usize))
            .cloned())
    }

    fn count_rows(&mut self, table: &str) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, rows)| rows.len() as u64)
            .max()
            .unwrap_or(0))
    }
}

/// Scripted feedback, one entry consumed per report call.
#[derive(Debug, Default)]
pub struct FakeTarget {
    pub coverage: VecDeque<CoverageMap>,
    pub queries: VecDeque<Vec<QueryRecord>>,
    pub exceptions: VecDeque<Vec<RawException>>,
    pub params: VecDeque<Vec<Vec<String>>>,
    pub connection_clears: Rc<RefCell<usize>>,
}

impl TargetAdapter for FakeTarget {
    fn report_coverage(&mut self) -> Result<CoverageMap, ReportError> {
        Ok(self.coverage.pop_front().unwrap_or_default())
    }

    fn report_queries(&mut self) -> Result<Vec<QueryRecord>, ReportError> {
        Ok(self.queries.pop_front().unwrap_or_default())
    }

    fn report_exceptions(&mut self) -> Result<Vec<RawException>, ReportError> {
        Ok(self.exceptions.pop_front().unwrap_or_default())
    }

    fn report_params(&mut self) -> Result<Vec<Vec<String>>, ReportError> {
        Ok(self.params.pop_front().unwrap_or_default())
    }

    fn clear_connections(&mut self) -> Result<(), ReportError> {
        *self.connection_clears.borrow_mut() += 1;
        Ok(())
    }
}

/// Records every request; answers with scripted statuses, then 200.
#[derive(Debug, Default)]
pub struct FakeSender {
    pub sent: Rc<RefCell<Vec<HttpRequest>>>,
    pub statuses: VecDeque<Result<Option<u16>, String>>,
    /// Cleared while a request is in flight, like a signal would.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl RequestSender for FakeSender {
    fn send(
        &mut self,
        _cookies: &mut CookieJar,
        request: &HttpRequest,
    ) -> Result<Option<u16>, SendError> {
        self.sent.borrow_mut().push(request.clone());
        if let Some(running) = &self.interrupt {
            running.store(false, Ordering::Relaxed);
        }
        match self.statuses.pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(verb)) => Err(SendError::InvalidVerb(verb)),
            None => Ok(Some(200)),
        }
    }
}
