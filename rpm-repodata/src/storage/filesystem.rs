// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem backed storage. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        storage::{Storage, StorageWrite},
    },
    async_trait::async_trait,
    futures::{io::BufReader, AsyncRead},
    std::{
        borrow::Cow,
        path::{Path, PathBuf},
        pin::Pin,
    },
};

/// A [Storage] storing keys as files under a root directory.
#[derive(Clone, Debug)]
pub struct FilesystemStorage {
    root_dir: PathBuf,
}

impl FilesystemStorage {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// No validation of the passed path is performed. The directory does not need to exist.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn create_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", parent.display()), e))?;
        }

        Ok(())
    }

    fn walk(&self, dir: &Path, prefix: &str, res: &mut Vec<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RpmRepositoryError::IoPath(format!("{}", dir.display()), e)),
        };

        for entry in entries {
            let entry =
                entry.map_err(|e| RpmRepositoryError::IoPath(format!("{}", dir.display()), e))?;
            let path = entry.path();

            let key = path
                .strip_prefix(&self.root_dir)
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();

            if entry
                .file_type()
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))?
                .is_dir()
            {
                // Only descend into directories that may hold matching keys.
                if key.starts_with(prefix) || prefix.starts_with(&format!("{}/", key)) {
                    self.walk(&path, prefix, res)?;
                }
            } else if key.starts_with(prefix) {
                res.push(key);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut res = vec![];
        self.walk(&self.root_dir, prefix, &mut res)?;
        res.sort();

        Ok(res)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key).is_file())
    }

    async fn get_path(&self, key: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        let path = self.key_path(key);

        let f = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpmRepositoryError::KeyNotFound(key.to_string())
            } else {
                RpmRepositoryError::IoPath(format!("{}", path.display()), e)
            }
        })?;

        Ok(Box::pin(BufReader::new(futures::io::AllowStdIo::new(f))))
    }

    async fn write_path<'key, 'reader>(
        &self,
        key: Cow<'key, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> Result<StorageWrite<'key>> {
        let dest_path = self.key_path(key.as_ref());
        Self::create_parent(&dest_path)?;

        // Content is staged next to the destination and renamed into place.
        let temp_path = dest_path.with_file_name(format!(
            ".{}.{}.tmp",
            dest_path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));

        let fh = std::fs::File::create(&temp_path)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", temp_path.display()), e))?;

        let mut writer = futures::io::AllowStdIo::new(fh);

        let bytes_written = match futures::io::copy(reader, &mut writer).await {
            Ok(size) => size,
            Err(e) => {
                std::fs::remove_file(&temp_path).ok();
                return Err(RpmRepositoryError::IoPath(
                    format!("{}", dest_path.display()),
                    e,
                ));
            }
        };

        std::fs::rename(&temp_path, &dest_path)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dest_path.display()), e))?;

        Ok(StorageWrite { key, bytes_written })
    }

    async fn delete_path(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RpmRepositoryError::IoPath(format!("{}", path.display()), e)),
        }
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let source_path = self.key_path(source);
        let dest_path = self.key_path(dest);
        Self::create_parent(&dest_path)?;

        std::fs::rename(&source_path, &dest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpmRepositoryError::KeyNotFound(source.to_string())
            } else {
                RpmRepositoryError::IoPath(format!("{}", source_path.display()), e)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn write_list_move_delete() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemStorage::new(td.path());

        storage.write_bytes("repo/a.rpm", b"a".to_vec()).await?;
        storage.write_bytes("repo/sub/b.rpm", b"bb".to_vec()).await?;
        storage.write_bytes("other/c.rpm", b"c".to_vec()).await?;

        assert_eq!(
            storage.list("repo/").await?,
            vec!["repo/a.rpm".to_string(), "repo/sub/b.rpm".to_string()]
        );
        assert_eq!(storage.list("").await?.len(), 3);
        assert!(storage.exists("repo/sub/b.rpm").await?);
        assert!(!storage.exists("repo/sub").await?);

        storage.move_path("repo/sub/b.rpm", "repo/b.rpm").await?;
        assert!(!storage.exists("repo/sub/b.rpm").await?);
        assert_eq!(storage.read_to_vec("repo/b.rpm").await?, b"bb".to_vec());

        storage.write_bytes("repo/b.rpm", b"replaced".to_vec()).await?;
        assert_eq!(storage.read_to_vec("repo/b.rpm").await?, b"replaced".to_vec());

        storage.delete_path("repo/b.rpm").await?;
        storage.delete_path("repo/b.rpm").await?;
        assert!(matches!(
            storage.get_path("repo/b.rpm").await,
            Err(RpmRepositoryError::KeyNotFound(_))
        ));

        Ok(())
    }
}
