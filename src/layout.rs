use std::fs;
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::UserDirs;
use tracing::debug;

use crate::domain::{ArtifactKind, BatchItem};
use crate::error::FetchError;

/// On-disk arrangement of batch downloads:
/// `<root>/<kind>/<sanitized name>/<id>.<ext>` plus
/// `<root>/<kind>/<sanitized name>_paths.tsv` manifests.
#[derive(Debug, Clone)]
pub struct DownloadLayout {
    root: Utf8PathBuf,
}

impl DownloadLayout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The user's download directory, falling back to the working directory.
    pub fn default_root() -> Result<Utf8PathBuf, FetchError> {
        let dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|dir| dir.to_path_buf()))
            .map(Ok)
            .unwrap_or_else(std::env::current_dir)
            .map_err(|err| FetchError::Filesystem(err.to_string()))?;
        Utf8PathBuf::from_path_buf(dir)
            .map_err(|_| FetchError::Filesystem("non-utf8 download directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn kind_root(&self, kind: ArtifactKind) -> Utf8PathBuf {
        self.root.join(kind.root_dir())
    }

    pub fn item_dir(&self, kind: ArtifactKind, item: &BatchItem) -> Utf8PathBuf {
        self.kind_root(kind).join(item.directory_name())
    }

    pub fn artifact_path(&self, kind: ArtifactKind, item: &BatchItem) -> Utf8PathBuf {
        self.item_dir(kind, item).join(kind.file_name(&item.id))
    }

    pub fn manifest_path(&self, kind: ArtifactKind, item: &BatchItem) -> Utf8PathBuf {
        self.kind_root(kind)
            .join(format!("{}_paths.tsv", item.directory_name()))
    }

    /// Rewrites the manifest for one populated item directory.
    ///
    /// Lists every `<identifier>.<ext>` artifact in the directory as
    /// `identifier\tabsolute path`, sorted by identifier, so repeated runs
    /// produce identical files.
    pub fn write_manifest(
        &self,
        kind: ArtifactKind,
        item: &BatchItem,
    ) -> Result<Utf8PathBuf, FetchError> {
        let dir = self.item_dir(kind, item);
        let suffix = format!(".{}", kind.extension());
        let mut entries = Vec::new();
        let listing =
            fs::read_dir(dir.as_std_path()).map_err(|err| FetchError::io(dir.as_std_path(), err))?;
        for entry in listing {
            let entry = entry.map_err(|err| FetchError::io(dir.as_std_path(), err))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }
            let Some(identifier) = path
                .file_name()
                .and_then(|name| name.strip_suffix(&suffix))
            else {
                continue;
            };
            let absolute = path
                .canonicalize_utf8()
                .map_err(|err| FetchError::io(path.as_std_path(), err))?;
            entries.push((identifier.to_string(), absolute));
        }
        entries.sort();

        let mut content = String::new();
        for (identifier, path) in &entries {
            content.push_str(identifier);
            content.push('\t');
            content.push_str(path.as_str());
            content.push('\n');
        }
        let manifest = self.manifest_path(kind, item);
        write_bytes_atomic(&manifest, content.as_bytes())?;
        debug!(manifest = %manifest, entries = entries.len(), "manifest written");
        Ok(manifest)
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FetchError> {
    let parent = path
        .parent()
        .ok_or_else(|| FetchError::Filesystem(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| FetchError::io(parent.as_std_path(), err))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".bvbrc-fetch")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| FetchError::io(parent.as_std_path(), err))?;
    temp.write_all(content)
        .map_err(|err| FetchError::io(temp.path(), err))?;
    temp.persist(path.as_std_path())
        .map_err(|err| FetchError::io(path.as_std_path(), err.error))?;
    Ok(())
}

/// Removes `dir` if it exists and holds nothing.
pub fn prune_empty_dir(dir: &Utf8Path) -> Result<bool, FetchError> {
    let is_empty = match fs::read_dir(dir.as_std_path()) {
        Ok(mut entries) => entries.next().is_none(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(FetchError::io(dir.as_std_path(), err)),
    };
    if is_empty {
        fs::remove_dir(dir.as_std_path()).map_err(|err| FetchError::io(dir.as_std_path(), err))?;
    }
    Ok(is_empty)
}
