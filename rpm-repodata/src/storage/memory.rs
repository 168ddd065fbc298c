// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! In-memory storage. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        storage::{Storage, StorageWrite},
    },
    async_trait::async_trait,
    futures::AsyncRead,
    std::{borrow::Cow, collections::BTreeMap, pin::Pin, sync::Mutex},
};

/// A [Storage] holding all values in memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Obtain a copy of a stored value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values().get(key).cloned()
    }

    /// Store a value.
    pub fn insert(&self, key: impl ToString, value: impl Into<Vec<u8>>) {
        self.values().insert(key.to_string(), value.into());
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.values().keys().cloned().collect()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.values().contains_key(key))
    }

    async fn get_path(&self, key: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        let data = self
            .get(key)
            .ok_or_else(|| RpmRepositoryError::KeyNotFound(key.to_string()))?;

        Ok(Box::pin(futures::io::Cursor::new(data)))
    }

    async fn write_path<'key, 'reader>(
        &self,
        key: Cow<'key, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> Result<StorageWrite<'key>> {
        let mut writer = futures::io::Cursor::new(Vec::<u8>::new());

        let bytes_written = futures::io::copy(reader, &mut writer)
            .await
            .map_err(|e| RpmRepositoryError::IoPath(key.to_string(), e))?;

        self.insert(key.as_ref(), writer.into_inner());

        Ok(StorageWrite { key, bytes_written })
    }

    async fn delete_path(&self, key: &str) -> Result<()> {
        self.values().remove(key);

        Ok(())
    }

    async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let mut values = self.values();

        let value = values
            .remove(source)
            .ok_or_else(|| RpmRepositoryError::KeyNotFound(source.to_string()))?;
        values.insert(dest.to_string(), value);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn prefix_listing() -> Result<()> {
        let storage = InMemoryStorage::default();
        storage.insert("a/1.rpm", "1");
        storage.insert("a/2.rpm", "2");
        storage.insert("ab/3.rpm", "3");
        storage.insert("b/4.rpm", "4");

        assert_eq!(storage.list("a/").await?, vec!["a/1.rpm", "a/2.rpm"]);
        assert_eq!(storage.list("a").await?.len(), 3);
        assert_eq!(storage.list("").await?.len(), 4);

        storage.move_path("a/1.rpm", "c/1.rpm").await?;
        assert_eq!(storage.read_to_vec("c/1.rpm").await?, b"1".to_vec());
        assert!(storage.move_path("a/1.rpm", "d").await.is_err());

        Ok(())
    }
}
