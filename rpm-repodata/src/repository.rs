// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository level operations.

[RpmRepository] binds a [Storage] prefix holding package files to the
metadata describing them. Every operation holds the [RepositoryLock] of the
prefix for its whole duration.

Published metadata is first written under a staging key, then moved into
`repodata/`. `repodata/repomd.xml` is moved last, so readers observe the
previous manifest until all files it references exist.
*/

use {
    crate::{
        config::RepositoryConfig,
        error::{Result, RpmRepositoryError},
        header::RpmHeaderReader,
        io::{read_compressed, read_decompressed, Compression, ContentDigest, DigestAlgorithm, DigestingReader},
        lock::{LockOptions, RepositoryLock},
        metadata::repomd::{write_repomd, DataEntry, RepoMd},
        package::{PackageHeaderReader, PackageMeta},
        storage::{join_key, relative_key, Storage},
        workflow::{Appended, BatchWriter, MetadataFiles},
        xml::{merge::scan_primary, XmlPackage},
    },
    futures::{io::AllowStdIo, StreamExt, TryStreamExt},
    log::{debug, info, warn},
    std::{
        borrow::Cow,
        collections::{HashMap, HashSet},
        path::Path,
        sync::Arc,
    },
};

/// Directory holding metadata files, relative to the repository prefix.
pub const REPODATA_DIRECTORY: &str = "repodata";

/// Key of the manifest, relative to the repository prefix.
pub const REPOMD_KEY: &str = "repodata/repomd.xml";

/// Directory holding staged files during publishing, relative to the repository prefix.
pub const STAGING_DIRECTORY: &str = ".tmp";

/// Outcome of a repository operation.
#[derive(Clone, Debug, Default)]
pub struct UpdateSummary {
    /// Locations of packages added to the metadata.
    pub added: Vec<String>,
    /// Locations of packages removed from the metadata.
    pub removed: Vec<String>,
    /// Locations of packages left out of the metadata, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Number of packages in the metadata.
    pub count: usize,
    /// Keys of published metadata files. Empty if nothing was published.
    pub written: Vec<String>,
    /// Keys of metadata files that were no longer referenced and got deleted.
    pub deleted: Vec<String>,
}

/// A metadata file compressed for publishing.
struct CompressedFile {
    open_digest: ContentDigest,
    open_size: u64,
    digest: ContentDigest,
    size: u64,
}

/// Gzip `source` into `dest`, digesting both forms.
async fn compress_file(
    source: &Path,
    dest: &Path,
    algorithm: DigestAlgorithm,
) -> Result<CompressedFile> {
    let fh = std::fs::File::open(source)
        .map_err(|e| RpmRepositoryError::IoPath(format!("{}", source.display()), e))?;
    let mut open_reader = DigestingReader::new(AllowStdIo::new(fh), algorithm);

    let (digest, size) = {
        let mut compressed = DigestingReader::new(
            read_compressed(futures::io::BufReader::new(&mut open_reader), Compression::Gzip),
            algorithm,
        );

        let fh = std::fs::File::create(dest)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dest.display()), e))?;
        let mut writer = AllowStdIo::new(fh);

        futures::io::copy(&mut compressed, &mut writer)
            .await
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dest.display()), e))?;

        let (_, digest, size) = compressed.finish();
        (digest, size)
    };

    let (_, open_digest, open_size) = open_reader.finish();

    Ok(CompressedFile {
        open_digest,
        open_size,
        digest,
        size,
    })
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// An RPM repository under a storage prefix.
pub struct RpmRepository {
    storage: Arc<dyn Storage>,
    prefix: String,
    config: RepositoryConfig,
    header_reader: Arc<dyn PackageHeaderReader>,
    max_parallel_io: usize,
    lock_options: LockOptions,
}

impl RpmRepository {
    /// Construct an instance for the repository under `prefix`.
    ///
    /// Packages are read with [RpmHeaderReader].
    pub fn new(storage: Arc<dyn Storage>, prefix: impl ToString, config: RepositoryConfig) -> Self {
        Self {
            storage,
            prefix: prefix.to_string().trim_matches('/').to_string(),
            config,
            header_reader: Arc::new(RpmHeaderReader),
            max_parallel_io: num_cpus::get(),
            lock_options: LockOptions::default(),
        }
    }

    /// Replace the reader of package headers.
    pub fn set_header_reader(&mut self, reader: Arc<dyn PackageHeaderReader>) {
        self.header_reader = reader;
    }

    /// Set how many packages are read concurrently.
    pub fn set_max_parallel_io(&mut self, value: usize) {
        self.max_parallel_io = value.max(1);
    }

    /// Set the timing of lock acquisition.
    pub fn set_lock_options(&mut self, options: LockOptions) {
        self.lock_options = options;
    }

    /// The storage prefix of this repository.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The configuration of this repository.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn key(&self, relative: &str) -> String {
        join_key(&self.prefix, relative)
    }

    fn kinds(&self) -> Vec<XmlPackage> {
        XmlPackage::ALL
            .into_iter()
            .filter(|kind| self.config.filelists || *kind != XmlPackage::Filelists)
            .collect()
    }

    /// Run an operation while holding the repository lock.
    async fn locked<'a, F, Fut>(&'a self, operation: F) -> Result<UpdateSummary>
    where
        F: FnOnce(RepositoryLock<'a>) -> Fut,
        Fut: std::future::Future<Output = (RepositoryLock<'a>, Result<UpdateSummary>)>,
    {
        let lock = RepositoryLock::acquire(self.storage.as_ref(), &self.prefix, self.lock_options).await?;

        let (lock, res) = operation(lock).await;
        let released = lock.release().await;

        let summary = res?;
        released?;

        Ok(summary)
    }

    /// Locations of all stored packages, sorted.
    pub async fn list_packages(&self) -> Result<Vec<String>> {
        let directory = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        Ok(self
            .storage
            .list(&directory)
            .await?
            .iter()
            .filter_map(|key| relative_key(&self.prefix, key))
            .filter(|location| {
                location.ends_with(".rpm")
                    && !location.starts_with(&format!("{}/", REPODATA_DIRECTORY))
                    && !location.split('/').any(|part| part.starts_with('.'))
            })
            .map(|location| location.to_string())
            .collect())
    }

    /// Read and parse a stored package.
    async fn load_package(&self, location: String) -> Result<PackageMeta> {
        let data = self.storage.read_to_vec(&self.key(&location)).await?;
        let algorithm = self.config.digest;
        let reader = self.header_reader.clone();
        let time_file = now();

        tokio::task::spawn_blocking(move || {
            let checksum = algorithm.digest_bytes(&data);
            reader.read_package(&data, &location, checksum, time_file)
        })
        .await?
    }

    /// Read and parse stored packages, preserving order.
    ///
    /// Packages that fail to parse are logged and returned separately.
    async fn load_packages(
        &self,
        locations: Vec<String>,
    ) -> Result<(Vec<PackageMeta>, Vec<(String, String)>)> {
        let results = futures::stream::iter(locations)
            .map(|location| async move { (location.clone(), self.load_package(location).await) })
            .buffered(self.max_parallel_io)
            .collect::<Vec<_>>()
            .await;

        let mut packages = vec![];
        let mut skipped = vec![];

        for (location, res) in results {
            match res {
                Ok(package) => packages.push(package),
                Err(RpmRepositoryError::PackageParse { reason, .. }) => {
                    warn!("skipping {}: {}", location, reason);
                    skipped.push((location, reason));
                }
                Err(e) => return Err(e),
            }
        }

        Ok((packages, skipped))
    }

    /// Digest stored packages. Returns `(location, hex digest)` pairs.
    async fn digest_packages(&self, locations: Vec<String>) -> Result<Vec<(String, String)>> {
        let algorithm = self.config.digest;

        futures::stream::iter(locations)
            .map(|location| async move {
                let reader = self.storage.get_path(&self.key(&location)).await?;
                let (digest, _) = algorithm.digest_reader(reader).await?;

                Ok::<_, RpmRepositoryError>((location, digest.digest_hex()))
            })
            .buffer_unordered(self.max_parallel_io)
            .try_collect::<Vec<_>>()
            .await
    }

    /// Fetch the currently published index documents into working copies.
    async fn load_metadata(&self) -> Result<MetadataFiles> {
        let mut files = MetadataFiles::new(self.kinds())?;

        let repomd_key = self.key(REPOMD_KEY);
        if !self.storage.exists(&repomd_key).await? {
            return Ok(files);
        }

        let repomd = RepoMd::from_reader(&self.storage.read_to_vec(&repomd_key).await?[..])?;

        for kind in files.kinds().to_vec() {
            let entry = if let Some(entry) = repomd.find(kind.data_type()) {
                entry
            } else {
                continue;
            };

            let key = self.key(&entry.location.href);
            let dest = files.scratch_path(kind);

            let reader = read_decompressed(
                futures::io::BufReader::new(self.storage.get_path(&key).await?),
                Compression::from_path(&key),
            );

            let fh = std::fs::File::create(&dest)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dest.display()), e))?;
            let mut writer = AllowStdIo::new(fh);

            futures::io::copy(reader, &mut writer)
                .await
                .map_err(|e| RpmRepositoryError::IoPath(key.clone(), e))?;

            debug!("fetched {} index from {}", kind, key);
            files.replace(kind, dest)?;
        }

        Ok(files)
    }

    /// Publish working copies of index documents and a manifest referencing them.
    ///
    /// Returns the keys written.
    async fn publish(&self, files: &MetadataFiles) -> Result<Vec<String>> {
        let staging = self.key(&format!("{}/{}", STAGING_DIRECTORY, uuid::Uuid::new_v4()));
        let mut staged = vec![];

        let res = self.publish_staged(files, &staging, &mut staged).await;

        if res.is_err() {
            for (staged_key, _) in &staged {
                self.storage.delete_path(staged_key).await.ok();
            }
        }

        res
    }

    async fn publish_staged(
        &self,
        files: &MetadataFiles,
        staging: &str,
        staged: &mut Vec<(String, String)>,
    ) -> Result<Vec<String>> {
        let timestamp = now();
        let mut entries = vec![];

        for kind in files.kinds() {
            let path = if let Some(path) = files.path(*kind) {
                path
            } else {
                continue;
            };

            let compressed_path = files.scratch_path(*kind).with_extension("xml.gz");
            let compressed = compress_file(path, &compressed_path, self.config.digest).await?;

            let name_digest = match self.config.naming_policy.digest_algorithm() {
                Some(algorithm) if algorithm == self.config.digest => Some(compressed.digest.clone()),
                Some(algorithm) => {
                    let fh = std::fs::File::open(&compressed_path).map_err(|e| {
                        RpmRepositoryError::IoPath(format!("{}", compressed_path.display()), e)
                    })?;
                    Some(algorithm.digest_reader(AllowStdIo::new(fh)).await?.0)
                }
                None => None,
            };

            let name = self.config.naming_policy.name(
                &format!("{}{}", kind.filename(), Compression::Gzip.extension()),
                name_digest.as_ref(),
            );
            let location = format!("{}/{}", REPODATA_DIRECTORY, name);
            let staged_key = format!("{}/{}", staging, name);

            let fh = std::fs::File::open(&compressed_path).map_err(|e| {
                RpmRepositoryError::IoPath(format!("{}", compressed_path.display()), e)
            })?;
            self.storage
                .write_path(
                    Cow::Borrowed(&staged_key),
                    Box::pin(futures::io::BufReader::new(AllowStdIo::new(fh))),
                )
                .await?;
            std::fs::remove_file(&compressed_path).ok();

            staged.push((staged_key, self.key(&location)));

            entries.push(DataEntry {
                data_type: kind.data_type().to_string(),
                checksum: compressed.digest,
                open_checksum: compressed.open_digest,
                location,
                timestamp,
                size: compressed.size,
                open_size: compressed.open_size,
            });
        }

        let repomd_key = self.key(REPOMD_KEY);
        let existing = if self.storage.exists(&repomd_key).await? {
            Some(self.storage.read_to_vec(&repomd_key).await?)
        } else {
            None
        };

        let removed = XmlPackage::ALL
            .into_iter()
            .filter(|kind| files.path(*kind).is_none())
            .map(|kind| kind.data_type())
            .collect::<Vec<_>>();

        let mut repomd = vec![];
        write_repomd(
            existing.as_deref(),
            &mut repomd,
            &timestamp.to_string(),
            &entries,
            &removed,
        )?;

        let staged_repomd = format!("{}/repomd.xml", staging);
        self.storage.write_bytes(&staged_repomd, repomd).await?;
        staged.push((staged_repomd, repomd_key));

        let mut written = vec![];
        for (staged_key, key) in staged.iter() {
            self.storage.move_path(staged_key, key).await?;
            info!("published {}", key);
            written.push(key.clone());
        }

        Ok(written)
    }

    /// Delete metadata files not in `keep`.
    async fn collect_garbage(&self, keep: &[String]) -> Result<Vec<String>> {
        let repomd_key = self.key(REPOMD_KEY);
        let directory = format!("{}/", self.key(REPODATA_DIRECTORY));

        let mut deleted = vec![];

        for key in self.storage.list(&directory).await? {
            if key == repomd_key || keep.contains(&key) {
                continue;
            }

            debug!("deleting unreferenced {}", key);
            self.storage.delete_path(&key).await?;
            deleted.push(key);
        }

        Ok(deleted)
    }

    /// Publish, then delete what the new manifest no longer references.
    async fn finish(
        &self,
        lock: &mut RepositoryLock<'_>,
        files: &MetadataFiles,
        summary: &mut UpdateSummary,
    ) -> Result<()> {
        // Confirms the lease is still ours before anything becomes visible.
        lock.renew(self.lock_options.lease).await?;

        summary.written = self.publish(files).await?;
        summary.deleted = self.collect_garbage(&summary.written).await?;

        Ok(())
    }

    /// Regenerate all metadata from the stored packages.
    ///
    /// Packages with the content of a package indexed before them are skipped, so every
    /// checksum is listed once. Which copy gets indexed depends on read order.
    pub async fn batch_update(&self) -> Result<UpdateSummary> {
        self.locked(|mut lock| async move {
            let res = self.rebuild(&mut lock, &HashSet::new()).await;
            (lock, res)
        })
        .await
    }

    /// Index every stored package except those at `withdrawn` locations.
    async fn rebuild(
        &self,
        lock: &mut RepositoryLock<'_>,
        withdrawn: &HashSet<String>,
    ) -> Result<UpdateSummary> {
        let locations = self
            .list_packages()
            .await?
            .into_iter()
            .filter(|location| !withdrawn.contains(location))
            .collect::<Vec<_>>();
        info!(
            "indexing {} packages under '{}'",
            locations.len(),
            self.prefix
        );

        let mut files = MetadataFiles::new(self.kinds())?;
        let writer = BatchWriter::new(&files)?;

        let outcomes = {
            let writer = &writer;

            futures::stream::iter(locations)
                .map(|location| async move {
                    match self.load_package(location.clone()).await {
                        Ok(package) => writer.append(&package).await.map(|appended| match appended {
                            Appended::Written => Ok(location),
                            Appended::Duplicate(existing) => {
                                Err((location, format!("same content as {}", existing)))
                            }
                        }),
                        Err(RpmRepositoryError::PackageParse { reason, .. }) => {
                            warn!("skipping {}: {}", location, reason);
                            Ok(Err((location, reason)))
                        }
                        Err(e) => Err(e),
                    }
                })
                .buffer_unordered(self.max_parallel_io)
                .try_collect::<Vec<_>>()
                .await?
        };

        let mut summary = UpdateSummary::default();
        for outcome in outcomes {
            match outcome {
                Ok(location) => summary.added.push(location),
                Err(skipped) => summary.skipped.push(skipped),
            }
        }
        summary.added.sort();
        summary.skipped.sort();

        summary.count = writer.finish(&mut files).await?;
        self.finish(lock, &files, &mut summary).await?;

        Ok(summary)
    }

    /// Bring metadata up to date with the stored packages, only reading changed packages.
    ///
    /// A package is added if its location is not indexed or its content changed, and
    /// removed if its location no longer holds a package. A package whose content is
    /// already indexed at another location is skipped. Nothing is published when there
    /// is no change.
    pub async fn batch_update_incrementally(&self) -> Result<UpdateSummary> {
        self.locked(|mut lock| async move {
            let res = self.update_incrementally(&mut lock).await;
            (lock, res)
        })
        .await
    }

    async fn update_incrementally(&self, lock: &mut RepositoryLock<'_>) -> Result<UpdateSummary> {
        let mut files = self.load_metadata().await?;

        if !files.is_complete() {
            info!("metadata of '{}' is incomplete; rebuilding", self.prefix);
            return self.rebuild(lock, &HashSet::new()).await;
        }

        let indexed = self
            .indexed_packages(&files)
            .await?
            .into_iter()
            .collect::<HashMap<_, _>>();

        let stored = self.digest_packages(self.list_packages().await?).await?;
        let stored_digests = stored
            .iter()
            .map(|(location, digest)| (location.as_str(), digest.as_str()))
            .collect::<HashMap<_, _>>();

        // Checksum to location of records that stay.
        let mut live = indexed
            .iter()
            .filter(|(location, checksum)| {
                stored_digests.get(location.as_str()) == Some(&checksum.as_str())
            })
            .map(|(location, checksum)| (checksum.clone(), location.clone()))
            .collect::<HashMap<_, _>>();

        let mut removed = indexed
            .keys()
            .filter(|location| !stored_digests.contains_key(location.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        let mut changed = stored
            .iter()
            .filter(|(location, digest)| indexed.get(location) != Some(digest))
            .collect::<Vec<_>>();
        changed.sort();

        let mut added = vec![];
        let mut skipped = vec![];

        for (location, digest) in changed {
            if let Some(existing) = live.get(digest) {
                debug!("skipping {}: same content as {}", location, existing);
                skipped.push((location.clone(), format!("same content as {}", existing)));

                if indexed.contains_key(location) {
                    removed.push(location.clone());
                }
            } else {
                live.insert(digest.clone(), location.clone());
                added.push(location.clone());
            }
        }
        removed.sort();

        info!(
            "'{}': {} indexed, {} stored, {} to add, {} to remove",
            self.prefix,
            indexed.len(),
            stored.len(),
            added.len(),
            removed.len()
        );

        let (packages, mut unreadable) = self.load_packages(added).await?;
        skipped.append(&mut unreadable);

        let mut summary = UpdateSummary {
            skipped,
            count: indexed.len(),
            ..Default::default()
        };

        if packages.is_empty() && removed.is_empty() {
            return Ok(summary);
        }

        if !removed.is_empty() {
            summary.count = files
                .remove_locations(removed.iter().cloned().collect())
                .await?;
            summary.removed = removed;
        }

        if !packages.is_empty() {
            summary.added = packages.iter().map(|p| p.location.clone()).collect();
            summary.count = files.append(packages).await?.count;
        }

        self.finish(lock, &files, &mut summary).await?;

        Ok(summary)
    }

    /// `(location, checksum)` of every record of the primary index.
    async fn indexed_packages(&self, files: &MetadataFiles) -> Result<Vec<(String, String)>> {
        let path = match files.path(XmlPackage::Primary) {
            Some(path) => path.to_path_buf(),
            None => return Ok(vec![]),
        };

        tokio::task::spawn_blocking(move || {
            let fh = std::fs::File::open(&path)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))?;
            scan_primary(std::io::BufReader::new(fh))
        })
        .await?
    }

    /// Remove packages from the metadata and delete their files.
    ///
    /// `locations` are keys relative to the repository prefix. Locations without a
    /// stored package are ignored. Only the records at the given locations are
    /// removed; copies of the same content elsewhere stay listed.
    pub async fn remove_packages(&self, locations: &[String]) -> Result<UpdateSummary> {
        let locations = locations.to_vec();

        self.locked(|mut lock| async move {
            let res = self.remove(&mut lock, locations).await;
            (lock, res)
        })
        .await
    }

    async fn remove(
        &self,
        lock: &mut RepositoryLock<'_>,
        locations: Vec<String>,
    ) -> Result<UpdateSummary> {
        let mut present = vec![];
        for location in locations {
            if self.storage.exists(&self.key(&location)).await? {
                present.push(location);
            } else {
                warn!("{} does not exist; ignoring", location);
            }
        }
        let withdrawn = present.iter().cloned().collect::<HashSet<_>>();

        let mut files = self.load_metadata().await?;

        let mut summary = if files.is_complete() && files.path(XmlPackage::Primary).is_some() {
            let mut summary = UpdateSummary {
                count: files.remove_locations(withdrawn).await?,
                ..Default::default()
            };
            self.finish(lock, &files, &mut summary).await?;

            summary
        } else {
            info!("metadata of '{}' is incomplete; rebuilding", self.prefix);
            self.rebuild(lock, &withdrawn).await?
        };

        for location in &present {
            self.storage.delete_path(&self.key(location)).await?;
            info!("deleted {}", location);
        }

        summary.removed = present;

        Ok(summary)
    }
}
