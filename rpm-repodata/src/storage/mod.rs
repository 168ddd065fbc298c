// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Key-value storage holding repositories.

A repository lives under a key prefix of a [Storage]. Keys are `/` delimited
relative paths. Package files are stored under arbitrary keys ending in `.rpm`
and metadata under `repodata/`.

[filesystem::FilesystemStorage] stores keys as files under a root directory.
[memory::InMemoryStorage] keeps everything in memory.
*/

pub mod filesystem;
pub mod memory;

use {
    crate::error::Result,
    async_trait::async_trait,
    futures::{AsyncRead, AsyncReadExt},
    std::{borrow::Cow, pin::Pin},
};

/// Describes a write operation.
#[derive(Clone, Debug)]
pub struct StorageWrite<'a> {
    /// The key that was written.
    pub key: Cow<'a, str>,
    /// The number of bytes written.
    pub bytes_written: u64,
}

/// Asynchronous key-value storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// List all keys starting with `prefix`, sorted.
    ///
    /// `prefix` is matched as a string. Pass a trailing `/` to list a directory.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get the content of a key as an async reader.
    ///
    /// Errors with [crate::RpmRepositoryError::KeyNotFound] if the key doesn't exist.
    async fn get_path(&self, key: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>>;

    /// Write data to a given key, replacing any existing value.
    ///
    /// Readers of the key observe either the old or the new value in full.
    async fn write_path<'key, 'reader>(
        &self,
        key: Cow<'key, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> Result<StorageWrite<'key>>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete_path(&self, key: &str) -> Result<()>;

    /// Move the value of a key to another key, replacing any existing value.
    async fn move_path(&self, source: &str, dest: &str) -> Result<()>;

    /// Read the full content of a key into memory.
    async fn read_to_vec(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.get_path(key).await?;
        let mut buf = vec![];
        reader.read_to_end(&mut buf).await?;

        Ok(buf)
    }

    /// Store an in-memory value.
    async fn write_bytes(&self, key: &str, data: Vec<u8>) -> Result<u64> {
        let write = self
            .write_path(
                Cow::Borrowed(key),
                Box::pin(futures::io::Cursor::new(data)),
            )
            .await?;

        Ok(write.bytes_written)
    }
}

/// Join a key prefix and a relative key.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');

    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Strip a repository prefix from a key.
///
/// Returns [None] if the key doesn't belong to the prefix.
pub fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_matches('/');

    if prefix.is_empty() {
        Some(key)
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys() {
        assert_eq!(join_key("", "repodata/repomd.xml"), "repodata/repomd.xml");
        assert_eq!(join_key("/repo/", "a.rpm"), "repo/a.rpm");
        assert_eq!(join_key("repo", "/a.rpm"), "repo/a.rpm");

        assert_eq!(relative_key("repo", "repo/a/b.rpm"), Some("a/b.rpm"));
        assert_eq!(relative_key("", "a.rpm"), Some("a.rpm"));
        assert_eq!(relative_key("repo", "repository/a.rpm"), None);
    }
}
