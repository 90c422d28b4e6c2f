use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accounts::AccountSource;
use crate::aggregator::UsageSession;

pub const ACCOUNTS_FILE_NAME: &str = "steam_users.json";
const SNAPSHOT_EXTENSION: &str = "json";
const SNAPSHOT_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize usage sessions: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Serializes detached sessions into timestamped files and refreshes the
/// account snapshot alongside them.
#[derive(Clone)]
pub struct SnapshotWriter {
    output_dir: PathBuf,
    accounts: Option<Arc<dyn AccountSource>>,
}

impl SnapshotWriter {
    pub fn new(output_dir: PathBuf, accounts: Option<Arc<dyn AccountSource>>) -> Self {
        Self {
            output_dir,
            accounts,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Returns the path of the new session file, or `None` when there was
    /// nothing to write.
    pub fn flush(&self, sessions: &[UsageSession]) -> Result<Option<PathBuf>, PersistError> {
        if sessions.is_empty() {
            debug!("no sessions to flush");
            return Ok(None);
        }

        let written = self.write_sessions(sessions);
        self.write_accounts();

        let path = written?;
        let tracked_secs: i64 = sessions.iter().map(UsageSession::duration_secs).sum();
        info!(
            path = %path.display(),
            sessions = sessions.len(),
            tracked_secs,
            "usage snapshot written"
        );
        Ok(Some(path))
    }

    fn write_sessions(&self, sessions: &[UsageSession]) -> Result<PathBuf, PersistError> {
        self.ensure_output_dir()?;
        let data = serde_json::to_vec_pretty(sessions)?;
        let stamp = Local::now().format(SNAPSHOT_STAMP_FORMAT).to_string();
        self.write_snapshot(&stamp, &data)
    }

    /// Never replaces an existing snapshot: a second flush within the same
    /// second gets a `_<n>` suffix, which still sorts after the first file.
    fn write_snapshot(&self, stamp: &str, data: &[u8]) -> Result<PathBuf, PersistError> {
        let mut tmp = self.staged(data)?;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stamp}.{SNAPSHOT_EXTENSION}")
            } else {
                format!("{stamp}_{attempt}.{SNAPSHOT_EXTENSION}")
            };
            let path = self.output_dir.join(name);
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => tmp = err.file,
                Err(err) => {
                    return Err(PersistError::Write {
                        path,
                        source: err.error,
                    });
                }
            }
        }

        Err(PersistError::Write {
            path: self.output_dir.join(format!("{stamp}.{SNAPSHOT_EXTENSION}")),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "no free snapshot name for this timestamp",
            ),
        })
    }

    fn write_accounts(&self) {
        let Some(source) = &self.accounts else {
            return;
        };

        let accounts = match source.load() {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %err, "account snapshot skipped");
                return;
            }
        };

        let path = self.output_dir.join(ACCOUNTS_FILE_NAME);
        let result = self.ensure_output_dir().and_then(|()| {
            let data = serde_json::to_vec_pretty(&accounts)?;
            let tmp = self.staged(&data)?;
            tmp.persist(&path).map_err(|err| PersistError::Write {
                path: path.clone(),
                source: err.error,
            })?;
            Ok(())
        });

        match result {
            Ok(()) => debug!(
                path = %path.display(),
                accounts = accounts.len(),
                "account snapshot written"
            ),
            Err(err) => warn!(error = %err, "failed to write account snapshot"),
        }
    }

    fn staged(&self, data: &[u8]) -> Result<NamedTempFile, PersistError> {
        let write_err = |source: io::Error| PersistError::Write {
            path: self.output_dir.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&self.output_dir).map_err(write_err)?;
        tmp.write_all(data).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        Ok(tmp)
    }

    fn ensure_output_dir(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| PersistError::CreateDir {
            path: self.output_dir.clone(),
            source,
        })
    }
}

/// Directory holding the running executable, or the working directory when
/// that cannot be determined.
pub fn install_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
