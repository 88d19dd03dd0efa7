//! A store persisted as a single JSON snapshot.
//!
//! Every commit rewrites the snapshot atomically:
//! 1. Write to `<path>.json.tmp`
//! 2. fsync the file
//! 3. Rename over `<path>`
//! 4. fsync the parent directory
//!
//! Readers therefore see either the previous or the new state, never a
//! partial write. The in-memory copy is only replaced once the snapshot is
//! durable, so a failed write leaves both unchanged.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{HistoryEntry, Proposal, ProposalId, RepoId};

use super::fsync::{fsync_dir, fsync_file};
use super::store::{Changeset, ProposalStore, Query, StoreError, StoreResult, StoreState};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    snapshot_at: DateTime<Utc>,
    state: StoreState,
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let state = try_load_snapshot(&path)?.unwrap_or_default();
        tracing::info!(
            path = %path.display(),
            proposals = state.proposals.len(),
            "opened proposal store"
        );
        Ok(JsonFileStore {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to a copy of the state, persists it, then swaps it in.
    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        save_snapshot_atomic(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }
}

impl ProposalStore for JsonFileStore {
    fn load(&self, id: ProposalId) -> StoreResult<Proposal> {
        self.lock().load(id)
    }

    fn find(&self, query: &Query) -> StoreResult<Vec<Proposal>> {
        Ok(self.lock().find(query))
    }

    fn next_id(&self, repo: &RepoId) -> StoreResult<(ProposalId, u64)> {
        self.write(|state| Ok(state.next_id(repo)))
    }

    fn commit(&self, changes: Changeset) -> StoreResult<()> {
        self.write(|state| state.apply(changes))
    }

    fn history(&self, id: ProposalId) -> StoreResult<Vec<HistoryEntry>> {
        Ok(self.lock().history(id))
    }
}

fn save_snapshot_atomic(path: &Path, state: &StoreState) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let snapshot = Snapshot {
        schema_version: SCHEMA_VERSION,
        snapshot_at: Utc::now(),
        state: state.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

fn load_snapshot(path: &Path) -> StoreResult<StoreState> {
    let bytes = std::fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }
    Ok(snapshot.state)
}

/// `None` when the file does not exist; other errors are propagated.
fn try_load_snapshot(path: &Path) -> StoreResult<Option<StoreState>> {
    match load_snapshot(path) {
        Ok(state) => Ok(Some(state)),
        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
