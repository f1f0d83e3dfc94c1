//! A plain directory standing in for the bucket.
//!
//! Useful with a shared network mount, for dry runs, and in tests. Keys map
//! onto relative paths below the root.

use crate::error::HostError;
use crate::progress::ProgressParser;
use crate::remote::{Location, ProgressFn, Remote, StorageSize};
use async_trait::async_trait;
use log::{debug, info};
use shared::{format_bytes, TransferProgress};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct LocalRemote {
    root: PathBuf,
}

/// Files and directories below a root, relative to it.
#[derive(Debug, Default)]
struct Tree {
    files: Vec<(PathBuf, u64)>,
    dirs: Vec<PathBuf>,
}

impl LocalRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalRemote { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    fn resolve(&self, location: &Location) -> PathBuf {
        match location {
            Location::Local(path) => path.clone(),
            Location::Remote(key) => self.path(key),
        }
    }
}

async fn walk(root: &Path) -> Result<Tree, HostError> {
    let mut tree = Tree::default();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let dir = root.join(&relative);
        let mut entries = fs::read_dir(&dir).await.map_err(|e| HostError::io(&dir, e))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&dir, e))? {
            let file_type = entry.file_type().await.map_err(|e| HostError::io(entry.path(), e))?;
            let child = relative.join(entry.file_name());

            if file_type.is_dir() {
                tree.dirs.push(child.clone());
                pending.push(child);
            } else {
                let metadata = entry.metadata().await.map_err(|e| HostError::io(entry.path(), e))?;
                tree.files.push((child, metadata.len()));
            }
        }
    }

    tree.files.sort();
    tree.dirs.sort();
    Ok(tree)
}

/// Copies through a sibling temporary file so readers never observe a
/// half-written object.
async fn copy_replacing(from: &Path, to: &Path) -> std::io::Result<()> {
    let name = to
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = to.with_file_name(format!(".{}.partial", name));

    fs::copy(from, &partial).await?;
    if let Err(e) = fs::rename(&partial, to).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e);
    }
    Ok(())
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.saturating_mul(100)) / total).min(100) as u8
    }
}

#[async_trait]
impl Remote for LocalRemote {
    async fn cat(&self, key: &str) -> Result<Option<String>, HostError> {
        let path = self.path(key);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    async fn copy_file(&self, local: &Path, key: &str) -> Result<(), HostError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HostError::io(parent, e))?;
        }

        match copy_replacing(local, &path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(HostError::not_found("file", local.display()))
            }
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    async fn delete_file(&self, key: &str) -> Result<bool, HostError> {
        let path = self.path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, HostError> {
        let dir = self.path(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HostError::not_found("directory", key))
            }
            Err(e) => return Err(HostError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| HostError::io(entry.path(), e))?
                .is_dir();
            names.push(if is_dir { format!("{}/", name) } else { name });
        }

        names.sort();
        Ok(names)
    }

    async fn list_dirs(&self, key: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .list(key)
            .await?
            .into_iter()
            .filter_map(|entry| entry.strip_suffix('/').map(str::to_string))
            .collect())
    }

    async fn purge(&self, key: &str) -> Result<(), HostError> {
        let path = self.path(key);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(HostError::not_found("directory", key)),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    async fn size(&self, key: &str) -> Result<StorageSize, HostError> {
        let path = self.path(key);
        if fs::metadata(&path).await.is_err() {
            return Ok(StorageSize::default());
        }

        let tree = walk(&path).await?;
        Ok(StorageSize {
            count: tree.files.len() as u64,
            bytes: tree.files.iter().map(|(_, len)| len).sum(),
        })
    }

    async fn check_access(&self) -> Result<(), HostError> {
        match fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(HostError::InvalidInput(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(HostError::not_found("bucket", self.root.display()))
            }
            Err(e) => Err(HostError::io(&self.root, e)),
        }
    }

    async fn mirror(
        &self,
        from: &Location,
        to: &Location,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<(), HostError> {
        let source = self.resolve(from);
        let destination = self.resolve(to);

        if !fs::metadata(&source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(HostError::not_found("directory", from));
        }

        info!("Mirroring {} -> {}", from, to);
        let tree = walk(&source).await?;
        let total: u64 = tree.files.iter().map(|(_, len)| len).sum();
        let mut done = 0u64;
        let mut progress = ProgressParser::new();

        fs::create_dir_all(&destination)
            .await
            .map_err(|e| HostError::io(&destination, e))?;
        for dir in &tree.dirs {
            let target = destination.join(dir);
            fs::create_dir_all(&target)
                .await
                .map_err(|e| HostError::io(&target, e))?;
        }

        for (file, len) in &tree.files {
            let target = destination.join(file);
            copy_replacing(&source.join(file), &target)
                .await
                .map_err(|e| HostError::io(&target, e))?;

            done += len;
            let update = progress.report(TransferProgress {
                percent: percent_of(done, total),
                transferred: format_bytes(done),
                total: format_bytes(total),
            });
            if let (Some(callback), Some(update)) = (on_progress, update) {
                callback(update);
            }
        }

        // Delete what the source no longer has.
        let existing = walk(&destination).await?;
        let keep_files: BTreeSet<&PathBuf> = tree.files.iter().map(|(path, _)| path).collect();
        let keep_dirs: BTreeSet<&PathBuf> = tree.dirs.iter().collect();

        for (file, _) in existing.files.iter().filter(|(f, _)| !keep_files.contains(f)) {
            let path = destination.join(file);
            debug!("Deleting {}", path.display());
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(HostError::io(&path, e)),
            }
        }

        for dir in existing.dirs.iter().filter(|d| !keep_dirs.contains(d)) {
            let path = destination.join(dir);
            match fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(HostError::io(&path, e)),
            }
        }

        if let Some(callback) = on_progress {
            callback(TransferProgress::complete());
        }
        Ok(())
    }
}
