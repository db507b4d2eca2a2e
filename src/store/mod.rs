//! JSON state file holding a [`LedgerSnapshot`].

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::ledger::{Ledger, LedgerError, LedgerSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file {path} rejected: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: LedgerError,
    },
    #[error("state file {0} already exists")]
    AlreadyExists(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn load(path: &Path) -> Result<Ledger, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let snapshot: LedgerSnapshot =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    let ledger = Ledger::restore(snapshot).map_err(|source| StoreError::Ledger {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), height = ledger.meta.height, "state loaded");
    Ok(ledger)
}

/// Writes the ledger through a sibling temp file so a crash never leaves a
/// truncated state file behind.
pub fn save(path: &Path, ledger: &Ledger) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let json = serde_json::to_vec_pretty(&ledger.snapshot()).map_err(|source| {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        f.write_all(&json).map_err(io_err(&tmp))?;
        f.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))?;
    debug!(path = %path.display(), height = ledger.meta.height, "state saved");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation rejected: {0}")]
    Rejected(#[from] LedgerError),
}

/// Loads the ledger at `path`, runs `op`, and saves only when `op` succeeds.
/// A rejected operation leaves the file byte-for-byte as it was.
pub fn update<T>(
    path: &Path,
    op: impl FnOnce(&mut Ledger) -> Result<T, LedgerError>,
) -> Result<T, UpdateError> {
    let mut ledger = load(path)?;
    let out = op(&mut ledger)?;
    save(path, &ledger)?;
    Ok(out)
}

/// Like [`save`], but refuses to replace an existing file.
pub fn create(path: &Path, ledger: &Ledger) -> Result<(), StoreError> {
    if path.exists() {
        return Err(StoreError::AlreadyExists(path.to_path_buf()));
    }
    save(path, ledger)
}
