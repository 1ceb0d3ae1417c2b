//! Local mirror of remote resource sets.
//!
//! Each resource set lives in its own directory under the mirror root. A
//! remote file `utils/format` of type `Code` is stored as
//! `<root>/<set>/utils/format.js`.

mod state;

pub use state::{FileState, SyncStateFile, STATE_FILE_NAME};

use crate::hash::{path_stem, ContentHash};
use crate::remote::FileType;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("invalid file name '{0}'")]
    InvalidName(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MirrorError {
    fn io(path: &Path, source: io::Error) -> Self {
        MirrorError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file in the local mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub name: String,
    pub file_type: FileType,
    pub content: String,
}

impl LocalFile {
    pub fn hash(&self) -> ContentHash {
        ContentHash::of_str(&self.content)
    }
}

#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_dir(&self, resource_set_id: &str) -> PathBuf {
        self.root.join(path_stem(resource_set_id))
    }

    pub fn state_path(&self, resource_set_id: &str) -> PathBuf {
        self.set_dir(resource_set_id).join(STATE_FILE_NAME)
    }

    /// Path of a file, rejecting names that would escape the set directory.
    pub fn file_path(
        &self,
        resource_set_id: &str,
        name: &str,
        file_type: FileType,
    ) -> Result<PathBuf, MirrorError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && !name.contains('\\')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(part) if !part.to_string_lossy().starts_with('.')));
        if !valid {
            return Err(MirrorError::InvalidName(name.to_string()));
        }
        Ok(self
            .set_dir(resource_set_id)
            .join(format!("{}.{}", name, file_type.extension())))
    }

    /// Every mirrored file, sorted by name. Dot-files and files with unknown
    /// extensions are skipped. A missing set directory is an empty mirror.
    pub async fn list(&self, resource_set_id: &str) -> Result<Vec<LocalFile>, MirrorError> {
        let base = self.set_dir(resource_set_id);
        let mut files = Vec::new();
        match tokio::fs::metadata(&base).await {
            Ok(_) => collect_files(&base, "", &mut files).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(MirrorError::io(&base, e)),
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub async fn read(
        &self,
        resource_set_id: &str,
        name: &str,
        file_type: FileType,
    ) -> Result<Option<LocalFile>, MirrorError> {
        let path = self.file_path(resource_set_id, name, file_type)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(LocalFile {
                name: name.to_string(),
                file_type,
                content,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::io(&path, e)),
        }
    }

    pub async fn write(
        &self,
        resource_set_id: &str,
        name: &str,
        file_type: FileType,
        content: &str,
    ) -> Result<(), MirrorError> {
        let path = self.file_path(resource_set_id, name, file_type)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MirrorError::io(parent, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| MirrorError::io(&path, e))
    }

    /// Remove a mirrored file; a missing file is not an error.
    pub async fn remove(
        &self,
        resource_set_id: &str,
        name: &str,
        file_type: FileType,
    ) -> Result<(), MirrorError> {
        let path = self.file_path(resource_set_id, name, file_type)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::io(&path, e)),
        }
    }

    pub async fn load_state(&self, resource_set_id: &str) -> Result<Option<SyncStateFile>, MirrorError> {
        let path = self.state_path(resource_set_id);
        SyncStateFile::load(&path)
            .await
            .map_err(|e| MirrorError::io(&path, e))
    }

    pub async fn save_state(&self, state: &SyncStateFile) -> Result<(), MirrorError> {
        let dir = self.set_dir(&state.resource_set_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MirrorError::io(&dir, e))?;
        let path = self.state_path(&state.resource_set_id);
        state.save(&path).await.map_err(|e| MirrorError::io(&path, e))
    }
}

/// Walk `dir`, collecting files as names relative to the set directory.
async fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<LocalFile>) -> Result<(), MirrorError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| MirrorError::io(dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MirrorError::io(dir, e))?
    {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| MirrorError::io(&path, e))?;

        if file_type.is_dir() {
            let child_prefix = if prefix.is_empty() {
                file_name
            } else {
                format!("{}/{}", prefix, file_name)
            };
            Box::pin(collect_files(&path, &child_prefix, out)).await?;
            continue;
        }

        let Some((stem, ext)) = file_name.rsplit_once('.') else {
            debug!("[mirror] skipping {} (no extension)", path.display());
            continue;
        };
        let Some(kind) = FileType::from_extension(ext) else {
            debug!("[mirror] skipping {} (unknown extension)", path.display());
            continue;
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MirrorError::io(&path, e))?;
        let name = if prefix.is_empty() {
            stem.to_string()
        } else {
            format!("{}/{}", prefix, stem)
        };
        out.push(LocalFile {
            name,
            file_type: kind,
            content,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::new(dir.path());
        mirror.write("p", "Code", FileType::Code, "a").await.unwrap();
        mirror
            .write("p", "utils/format", FileType::Code, "b")
            .await
            .unwrap();
        mirror.write("p", "appsscript", FileType::Data, "{}").await.unwrap();
        tokio::fs::write(mirror.set_dir("p").join("notes.txt"), "skip")
            .await
            .unwrap();

        let files = mirror.list("p").await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Code", "appsscript", "utils/format"]);

        mirror.remove("p", "Code", FileType::Code).await.unwrap();
        mirror.remove("p", "Code", FileType::Code).await.unwrap();
        assert!(mirror.read("p", "Code", FileType::Code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_set_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::new(dir.path());
        assert!(mirror.list("nothing").await.unwrap().is_empty());
        assert!(mirror.load_state("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similar_set_ids_do_not_share_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::new(dir.path());
        mirror.write("proj.1", "Code", FileType::Code, "a").await.unwrap();
        assert_ne!(mirror.set_dir("proj.1"), mirror.set_dir("proj_1"));
        assert!(mirror.list("proj_1").await.unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_names() {
        let mirror = LocalMirror::new("/tmp/m");
        for bad in ["", "../x", "/etc/passwd", "a/../../b", ".hidden", "a\\b"] {
            assert!(
                mirror.file_path("p", bad, FileType::Code).is_err(),
                "{bad} should be rejected"
            );
        }
        assert!(mirror.file_path("p", "a/b", FileType::Code).is_ok());
    }
}
