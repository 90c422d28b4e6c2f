//! Exclusive ownership of an output directory.
//!
//! The lock lives next to the snapshots it protects, so two agents that share
//! an output directory collide no matter which config home each one runs from.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const LOCK_FILE_NAME: &str = ".appusage-agent.lock";
const OWNER_FILE_NAME: &str = ".appusage-agent.owner.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirState {
    Free,
    Claimed { pid: Option<u32> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Owner {
    pid: u32,
    exe_path: Option<String>,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
}

/// Keeps the output directory claimed until dropped.
pub struct OutputDirGuard {
    lock: File,
    owner_path: PathBuf,
    pid: u32,
}

impl Drop for OutputDirGuard {
    fn drop(&mut self) {
        if let Some(owner) = read_owner(&self.owner_path)
            && owner.pid == self.pid
        {
            let _ = fs::remove_file(&self.owner_path);
        }
        let _ = FileExt::unlock(&self.lock);
    }
}

pub fn claim_output_dir(output_dir: &Path) -> Result<OutputDirGuard> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    let owner_path = output_dir.join(OWNER_FILE_NAME);
    let lock = open_lock(output_dir)?;
    if FileExt::try_lock_exclusive(&lock).is_err() {
        match read_owner(&owner_path) {
            Some(owner) => bail!(
                "appusage-agent (PID {}) is already writing to {}",
                owner.pid,
                output_dir.display()
            ),
            None => bail!("appusage-agent is already writing to {}", output_dir.display()),
        }
    }

    let owner = Owner {
        pid: std::process::id(),
        exe_path: env::current_exe()
            .ok()
            .map(|path| path.display().to_string()),
        output_dir: output_dir.to_path_buf(),
        started_at: Utc::now(),
    };
    write_owner(&owner_path, &owner)?;
    info!(pid = owner.pid, output_dir = %output_dir.display(), "output directory claimed");

    Ok(OutputDirGuard {
        lock,
        owner_path,
        pid: owner.pid,
    })
}

/// Reports whether some agent currently holds `output_dir`, without claiming it.
pub fn output_dir_state(output_dir: &Path) -> Result<DirState> {
    if !output_dir.join(LOCK_FILE_NAME).exists() {
        return Ok(DirState::Free);
    }

    let lock = open_lock(output_dir)?;
    if FileExt::try_lock_exclusive(&lock).is_ok() {
        let _ = FileExt::unlock(&lock);
        return Ok(DirState::Free);
    }
    Ok(DirState::Claimed {
        pid: read_owner(&output_dir.join(OWNER_FILE_NAME)).map(|owner| owner.pid),
    })
}

fn open_lock(output_dir: &Path) -> Result<File> {
    let path = output_dir.join(LOCK_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

fn write_owner(path: &Path, owner: &Owner) -> Result<()> {
    let payload = serde_json::to_vec_pretty(owner)?;
    let mut file = File::create(path)
        .with_context(|| format!("failed to create owner record {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write owner record {}", path.display()))?;
    Ok(())
}

fn read_owner(path: &Path) -> Option<Owner> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(owner) => Some(owner),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "ignoring unreadable owner record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_claim_on_same_dir_names_the_owner() {
        let tmp = TempDir::new().expect("temp dir");
        let _guard = claim_output_dir(tmp.path()).expect("first claim");

        let err = claim_output_dir(tmp.path())
            .err()
            .expect("second claim must fail");
        assert!(
            err.to_string()
                .contains(&format!("PID {}", std::process::id())),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn claims_are_scoped_to_the_output_dir() {
        let shared = TempDir::new().expect("shared dir");
        let other = TempDir::new().expect("other dir");

        let _shared_guard = claim_output_dir(shared.path()).expect("claim shared");
        let _other_guard = claim_output_dir(other.path()).expect("claim other");

        // A second agent pointed at the shared directory is refused even
        // though it would keep its config elsewhere.
        assert!(claim_output_dir(shared.path()).is_err());
    }

    #[test]
    fn state_follows_the_guard() {
        let tmp = TempDir::new().expect("temp dir");
        let out = tmp.path().join("snapshots");
        assert_eq!(output_dir_state(&out).expect("state"), DirState::Free);

        let guard = claim_output_dir(&out).expect("claim");
        assert_eq!(
            output_dir_state(&out).expect("state while held"),
            DirState::Claimed {
                pid: Some(std::process::id())
            }
        );

        let owner = read_owner(&out.join(OWNER_FILE_NAME)).expect("owner record");
        assert_eq!(owner.output_dir, out);

        drop(guard);
        assert_eq!(output_dir_state(&out).expect("state after"), DirState::Free);
        assert!(!out.join(OWNER_FILE_NAME).exists());
    }
}
