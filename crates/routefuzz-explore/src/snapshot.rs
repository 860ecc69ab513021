//! Snapshot save/load for deterministic restarts.
//!
//! A snapshot directory `D` holds exactly three artifacts:
//!
//! ```text
//! D/fuzz_state/cookiejar   session cookies (JSON)
//! D/fuzz_state/rng         PRNG state (JSON)
//! D/fuzz_state/dbdump      backing-store dump
//! ```
//!
//! Loading a snapshot puts the session, the PRNG and the store back exactly
//! where they were, so the requests that follow replay bit-for-bit.

use crate::rng::{FuzzRng, RngState};
use log::info;
use routefuzz_target::{CookieJar, ReportError, Storage, StoreError, TargetAdapter};
use snafu::Snafu;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_DIR: &str = "fuzz_state";
const COOKIE_FILE: &str = "cookiejar";
const RNG_FILE: &str = "rng";
const DUMP_FILE: &str = "dbdump";

/// Errors from snapshot operations.
#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("no snapshot state at {}", dir.display()))]
    NotFound { dir: PathBuf },

    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },

    #[snafu(display("store error"), context(false))]
    Store { source: StoreError },

    #[snafu(display("target error"), context(false))]
    Target { source: ReportError },
}

/// Client-side state that a snapshot captures besides the store.
#[derive(Debug, Clone)]
pub struct Session {
    pub cookies: CookieJar,
    pub rng: FuzzRng,
}

impl Session {
    pub fn new(seed: u64) -> Self {
        Self {
            cookies: CookieJar::new(),
            rng: FuzzRng::from_seed(seed),
        }
    }
}

/// `dir/fuzz_state`.
pub fn state_dir(dir: &Path) -> PathBuf {
    dir.join(STATE_DIR)
}

pub fn save(
    dir: &Path,
    session: &Session,
    storage: &mut dyn Storage,
    db_name: &str,
) -> Result<(), SnapshotError> {
    let state = state_dir(dir);
    fs::create_dir_all(&state)?;
    fs::write(state.join(COOKIE_FILE), serde_json::to_vec(&session.cookies)?)?;
    fs::write(state.join(RNG_FILE), serde_json::to_vec(&session.rng.state())?)?;
    storage.dump(db_name, &state.join(DUMP_FILE))?;
    info!(
        "state saved at {} with {} cookies",
        dir.display(),
        session.cookies.len()
    );
    Ok(())
}

/// Restore `session` and, unless `skip_store`, the backing store.
///
/// The target is told to drop its pooled store connections first so the
/// database can be dropped and recreated underneath it.
pub fn load(
    dir: &Path,
    session: &mut Session,
    storage: &mut dyn Storage,
    target: &mut dyn TargetAdapter,
    db_name: &str,
    skip_store: bool,
) -> Result<(), SnapshotError> {
    let state = state_dir(dir);
    if !state.is_dir() {
        return NotFoundSnafu { dir: state }.fail();
    }

    session.cookies = serde_json::from_slice(&fs::read(state.join(COOKIE_FILE))?)?;
    let rng: RngState = serde_json::from_slice(&fs::read(state.join(RNG_FILE))?)?;
    session.rng.restore(&rng);

    if !skip_store {
        target.clear_connections()?;
        storage.restore(db_name, &state.join(DUMP_FILE))?;
    }
    info!("state loaded from {}", dir.display());
    Ok(())
}

/// Remove a snapshot. Missing directories and removal errors are ignored.
pub fn delete(dir: &Path) {
    let _ = fs::remove_dir_all(state_dir(dir));
}
