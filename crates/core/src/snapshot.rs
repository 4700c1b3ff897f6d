use crate::error::{PipelineError, Result};
use crate::store::VectorStore;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CURRENT_FILE: &str = "CURRENT";
pub const LOCK_FILE: &str = "LOCK";

const STAGING_PREFIX: &str = ".staging-";
const GENERATION_PREFIX: &str = "gen-";

/// Directory of index generations plus a `CURRENT` pointer naming the live one.
///
/// Snapshots are written into a staging directory first. `commit` renames the
/// staging directory into a generation and then moves the pointer with a
/// write-and-rename, so readers only ever resolve a complete snapshot.
///
/// Staging, purging, committing and pruning mutate the root; a rebuild does
/// them while holding the [`RebuildLock`] from [`SnapshotStore::lock`].
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Takes the exclusive rebuild lock on the root, failing with
    /// [`PipelineError::StoreBusy`] when another rebuild holds it.
    pub fn lock(&self) -> Result<RebuildLock> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "acquired rebuild lock");
                Ok(RebuildLock { file, path })
            }
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                Err(PipelineError::StoreBusy {
                    path: self.root.display().to_string(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn stage(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let staging = self
            .root
            .join(format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple()));
        fs::create_dir(&staging)?;
        debug!(path = %staging.display(), "created staging directory");
        Ok(staging)
    }

    /// Publishes a staged snapshot and returns its final location.
    pub fn commit(&self, staging: &Path) -> Result<PathBuf> {
        let name = format!(
            "{GENERATION_PREFIX}{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let generation = self.root.join(&name);
        fs::rename(staging, &generation)?;

        let pointer_tmp = self
            .root
            .join(format!("{CURRENT_FILE}.{}.tmp", Uuid::new_v4().simple()));
        let mut file = File::create(&pointer_tmp)?;
        file.write_all(name.as_bytes())?;
        file.sync_all()?;
        fs::rename(&pointer_tmp, self.root.join(CURRENT_FILE))?;

        info!(location = %generation.display(), "published index generation");
        self.prune_generations(&name);
        Ok(generation)
    }

    pub fn discard(&self, staging: &Path) -> Result<()> {
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        Ok(())
    }

    /// Removes staging directories left behind by abandoned rebuilds.
    ///
    /// Only safe under the rebuild lock: it cannot tell an abandoned staging
    /// directory from one a running rebuild is still writing.
    pub fn purge_stale_staging(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let mut purged = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGING_PREFIX));
            if is_staging && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Location of the live generation, `None` before the first rebuild.
    pub fn current_location(&self) -> Result<Option<PathBuf>> {
        let pointer = self.root.join(CURRENT_FILE);
        if !pointer.exists() {
            return Ok(None);
        }

        let name = fs::read_to_string(&pointer)?;
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(PipelineError::corrupt(&pointer, "invalid generation pointer"));
        }

        let location = self.root.join(name);
        if !location.is_dir() {
            return Err(PipelineError::corrupt(
                &pointer,
                format!("points at missing generation {name}"),
            ));
        }
        Ok(Some(location))
    }

    /// Loads the live snapshot; an empty store when nothing was built yet.
    pub fn load_current(&self) -> Result<VectorStore> {
        match self.current_location()? {
            Some(location) => VectorStore::load(&location),
            None => Ok(VectorStore::empty()),
        }
    }

    fn prune_generations(&self, keep: &str) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(reason = %error, "unable to list generations for pruning");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(GENERATION_PREFIX) || name == keep {
                continue;
            }
            if let Err(error) = fs::remove_dir_all(entry.path()) {
                warn!(generation = name, reason = %error, "unable to prune old generation");
            }
        }
    }
}

/// Held for the duration of a rebuild. Released on drop.
#[derive(Debug)]
pub struct RebuildLock {
    file: File,
    path: PathBuf,
}

impl RebuildLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), reason = %error, "unable to release rebuild lock");
        }
    }
}
