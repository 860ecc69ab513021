//! PostgreSQL storage driven through the client command-line tools.

use crate::{Storage, StoreError};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

/// Backoff between drop attempts.
const DROP_RETRY_DELAY: Duration = Duration::from_secs(1);
const DROP_ATTEMPTS: usize = 2;

/// Storage backed by `pg_dump`, `psql`, `createdb` and `dropdb`.
#[derive(Debug, Clone)]
pub struct PgCli {
    host: String,
    user: Option<String>,
    /// Database queried by [`Storage::lookup`] and [`Storage::count_rows`].
    database: String,
    /// Model name → table name, for names reported in model form.
    tables: BTreeMap<String, String>,
}

impl PgCli {
    pub fn new(host: impl Into<String>, user: Option<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user,
            database: database.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_tables(mut self, tables: BTreeMap<String, String>) -> Self {
        self.tables = tables;
        self
    }

    /// The table backing `name`, which may be a model or a table name.
    pub fn table_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.tables.get(name).map(String::as_str).unwrap_or(name)
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = vec!["-h".to_string(), self.host.clone()];
        if let Some(user) = &self.user {
            args.push("-U".to_string());
            args.push(user.clone());
        }
        args
    }

    fn run(&self, program: &str, args: &[String], stdin: Option<File>) -> Result<Output, StoreError> {
        debug!("{} {}", program, args.join(" "));
        let mut command = Command::new(program);
        command.args(self.connection_args()).args(args);
        if let Some(file) = stdin {
            command.stdin(Stdio::from(file));
        }
        command.output().map_err(|source| StoreError::Spawn {
            program: program.to_string(),
            source,
        })
    }

    fn run_checked(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<File>,
    ) -> Result<Output, StoreError> {
        let output = self.run(program, args, stdin)?;
        if !output.status.success() {
            return Err(StoreError::Failed {
                program: program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Single-value query against the fuzzed database.
    fn scalar(&self, sql: &str) -> Result<String, StoreError> {
        let args = vec![
            "-At".to_string(),
            "-d".to_string(),
            self.database.clone(),
            "-c".to_string(),
            sql.to_string(),
        ];
        let output = self.run_checked("psql", &args, None)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn terminate_connections(&self, db_name: &str) -> Result<(), StoreError> {
        let args = vec![
            "-d".to_string(),
            "postgres".to_string(),
            "-c".to_string(),
            terminate_sql(db_name),
        ];
        self.run_checked("psql", &args, None).map(|_| ())
    }

    /// Drop `db_name`, retrying once after killing its connections.
    /// A database that does not exist counts as dropped.
    fn ensure_dropped(&self, db_name: &str) -> Result<(), StoreError> {
        for attempt in 0..DROP_ATTEMPTS {
            let output = self.run("dropdb", &[db_name.to_string()], None)?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.status.success() || stderr.contains("does not exist") {
                return Ok(());
            }
            warn!(
                "dropdb {} failed (attempt {}): {}",
                db_name,
                attempt + 1,
                stderr.trim()
            );
            let Some(delay) = retry_delay(attempt) else {
                break;
            };
            if let Err(e) = self.terminate_connections(db_name) {
                warn!("terminating connections to {} failed: {}", db_name, e);
            }
            thread::sleep(delay);
        }
        Err(StoreError::DropFailed {
            db: db_name.to_string(),
        })
    }
}

/// Backoff before the attempt after `attempt`; none after the last one.
fn retry_delay(attempt: usize) -> Option<Duration> {
    (attempt + 1 < DROP_ATTEMPTS).then_some(DROP_RETRY_DELAY)
}

impl Storage for PgCli {
    fn dump(&mut self, db_name: &str, path: &Path) -> Result<(), StoreError> {
        let args = vec![
            "-f".to_string(),
            path.display().to_string(),
            db_name.to_string(),
        ];
        self.run_checked("pg_dump", &args, None)?;
        debug!("dumped {} to {}", db_name, path.display());
        Ok(())
    }

    fn restore(&mut self, db_name: &str, path: &Path) -> Result<(), StoreError> {
        let dump = File::open(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.ensure_dropped(db_name)?;
        self.run_checked(
            "createdb",
            &["-T".to_string(), "template0".to_string(), db_name.to_string()],
            None,
        )?;
        self.run_checked(
            "psql",
            &["-q".to_string(), "-d".to_string(), db_name.to_string()],
            Some(dump),
        )?;
        info!("restored {} from {}", db_name, path.display());
        Ok(())
    }

    fn lookup(
        &mut self,
        table: &str,
        column: &str,
        offset: u64,
    ) -> Result<Option<String>, StoreError> {
        let sql = lookup_sql(self.table_name(table), column, offset);
        let value = self.scalar(&sql)?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    fn count_rows(&mut self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(self.table_name(table)));
        let text = self.scalar(&sql)?;
        text.parse().map_err(|_| StoreError::Parse(text))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn lookup_sql(table: &str, column: &str, offset: u64) -> String {
    format!(
        "SELECT {} FROM {} LIMIT 1 OFFSET {}",
        quote_ident(column),
        quote_ident(table),
        offset
    )
}

fn terminate_sql(db_name: &str) -> String {
    format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = {} AND pid <> pg_backend_pid()",
        quote_literal(db_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_no_backoff_after_last_drop_attempt() {
        assert_eq!(retry_delay(0), Some(DROP_RETRY_DELAY));
        assert_eq!(retry_delay(DROP_ATTEMPTS - 1), None);
    }

    #[test]
    fn test_lookup_sql() {
        assert_eq!(
            lookup_sql("users", "name", 4),
            "SELECT \"name\" FROM \"users\" LIMIT 1 OFFSET 4"
        );
    }

    #[test]
    fn test_terminate_sql_quotes_db() {
        let sql = terminate_sql("o'brien");
        assert!(sql.contains("datname = 'o''brien'"));
    }

    #[test]
    fn test_table_name_mapping() {
        let mut tables = BTreeMap::new();
        tables.insert("User".to_string(), "users".to_string());
        let pg = PgCli::new("localhost", None, "app").with_tables(tables);
        assert_eq!(pg.table_name("User"), "users");
        assert_eq!(pg.table_name("posts"), "posts");
    }

    #[test]
    fn test_connection_args() {
        let pg = PgCli::new("db.local", Some("fuzz".to_string()), "app");
        assert_eq!(pg.connection_args(), vec!["-h", "db.local", "-U", "fuzz"]);
        let anon = PgCli::new("db.local", None, "app");
        assert_eq!(anon.connection_args(), vec!["-h", "db.local"]);
    }

    #[test]
    fn test_restore_missing_dump_is_io_error() {
        let mut pg = PgCli::new("localhost", None, "app");
        let err = pg
            .restore("app", Path::new("/nonexistent/routefuzz/dbdump"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
