// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Coordinated updates of the index documents of one repository.

[MetadataFiles] holds uncompressed working copies of the index documents in a
temporary directory. Its append and remove operations keep the documents in
agreement: the primary index is merged first and the checksums of superseded
packages are used to drop the matching records from the other kinds.

Document transforms are synchronous and run on the blocking thread pool.
Independent kinds are processed concurrently.

[BatchWriter] produces fresh documents when every package is appended from
scratch by concurrent tasks.

Removal comes in two forms. [MetadataFiles::remove()] drops every record of the
given checksums. [MetadataFiles::remove_locations()] drops only the records at
the given locations, leaving other copies of the same content listed.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        lock::WriterLock,
        package::PackageMeta,
        xml::{
            alter::patch_attribute,
            event::render_record,
            maid::{prune, prune_counted, prune_locations},
            merge::{merge_packages, merge_primary, unique_packages, MergeResult},
            write_document_end, write_document_start, XmlPackage, PACKAGES_ATTRIBUTE,
            PLACEHOLDER_COUNT,
        },
    },
    log::{debug, warn},
    quick_xml::Writer,
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

fn open_buffered(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path).map_err(|e| {
        RpmRepositoryError::IoPath(format!("{}", path.display()), e)
    })?))
}

fn create_buffered(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).map_err(|e| {
        RpmRepositoryError::IoPath(format!("{}", path.display()), e)
    })?))
}

/// Write the package count into the root element of a document.
fn write_count(kind: XmlPackage, source: &Path, dest: &Path, count: usize) -> Result<()> {
    patch_attribute(
        open_buffered(source)?,
        create_buffered(dest)?,
        kind.root_tag(),
        PACKAGES_ATTRIBUTE,
        &count.to_string(),
    )?;
    std::fs::remove_file(source)
        .map_err(|e| RpmRepositoryError::IoPath(format!("{}", source.display()), e))?;

    Ok(())
}

/// Working copies of index documents.
pub struct MetadataFiles {
    dir: tempfile::TempDir,
    kinds: Vec<XmlPackage>,
    paths: BTreeMap<XmlPackage, PathBuf>,
}

impl MetadataFiles {
    /// Create an empty set of documents of the given kinds.
    ///
    /// [XmlPackage::Primary] is always included.
    pub fn new(kinds: impl IntoIterator<Item = XmlPackage>) -> Result<Self> {
        let mut kinds = kinds.into_iter().collect::<Vec<_>>();
        kinds.push(XmlPackage::Primary);
        kinds.sort();
        kinds.dedup();

        Ok(Self {
            dir: tempfile::Builder::new().prefix("rpm-repodata-").tempdir()?,
            kinds,
            paths: BTreeMap::new(),
        })
    }

    /// The maintained kinds, primary first.
    pub fn kinds(&self) -> &[XmlPackage] {
        &self.kinds
    }

    /// Path of the current document of a kind, if it exists.
    pub fn path(&self, kind: XmlPackage) -> Option<&Path> {
        self.paths.get(&kind).map(|p| p.as_path())
    }

    /// Whether the primary document exists and all other kinds are missing or present alike.
    pub fn is_complete(&self) -> bool {
        let present = self.kinds.iter().filter(|k| self.paths.contains_key(k)).count();

        present == 0 || present == self.kinds.len()
    }

    /// A fresh path in the working directory.
    pub fn scratch_path(&self, kind: XmlPackage) -> PathBuf {
        self.dir
            .path()
            .join(format!("{}-{}", uuid::Uuid::new_v4(), kind.filename()))
    }

    /// Make `path` the current document of a kind, deleting the previous one.
    pub fn replace(&mut self, kind: XmlPackage, path: PathBuf) -> Result<()> {
        if let Some(previous) = self.paths.insert(kind, path) {
            std::fs::remove_file(&previous)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", previous.display()), e))?;
        }

        Ok(())
    }

    fn merge_kind(
        &self,
        kind: XmlPackage,
        packages: Arc<Vec<PackageMeta>>,
        duplicates: Arc<HashSet<String>>,
    ) -> (PathBuf, tokio::task::JoinHandle<Result<MergeResult>>) {
        let input = self.path(kind).map(|p| p.to_path_buf());
        let merged = self.scratch_path(kind);
        let dest = self.scratch_path(kind);
        let res_path = dest.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let input = input.as_deref().map(open_buffered).transpose()?;
            let output = create_buffered(&merged)?;

            let res = match kind {
                XmlPackage::Primary => merge_primary(input, output, &packages)?,
                _ => merge_packages(kind, input, output, &packages, &duplicates)?,
            };

            write_count(kind, &merged, &dest, res.count)?;

            Ok(res)
        });

        (res_path, handle)
    }

    /// Add packages to every document.
    ///
    /// Existing records at the location of a new package, or with the checksum of a new
    /// package, are replaced. When several packages share a location or a checksum, the
    /// last one wins.
    ///
    /// Returns the resulting package count and the checksums of replaced packages.
    pub async fn append(&mut self, packages: Vec<PackageMeta>) -> Result<MergeResult> {
        let packages = Arc::new(unique_packages(packages));

        let (path, handle) =
            self.merge_kind(XmlPackage::Primary, packages.clone(), Arc::new(HashSet::new()));
        let primary = handle.await??;
        self.replace(XmlPackage::Primary, path)?;

        debug!(
            "merged {} packages into primary; {} replaced",
            packages.len(),
            primary.checksums.len()
        );

        let duplicates = Arc::new(primary.checksums.clone());

        let tasks = self
            .kinds
            .iter()
            .filter(|kind| **kind != XmlPackage::Primary)
            .map(|kind| {
                let (path, handle) = self.merge_kind(*kind, packages.clone(), duplicates.clone());
                let kind = *kind;

                async move { Ok::<_, RpmRepositoryError>((kind, path, handle.await??)) }
            })
            .collect::<Vec<_>>();

        for (kind, path, res) in futures::future::try_join_all(tasks).await? {
            if res.count != primary.count {
                warn!(
                    "{} holds {} packages but primary holds {}",
                    kind, res.count, primary.count
                );
            }

            self.replace(kind, path)?;
        }

        Ok(primary)
    }

    /// Remove packages with the given checksums from every existing document.
    ///
    /// Returns the resulting package count.
    pub async fn remove(&mut self, checksums: HashSet<String>) -> Result<usize> {
        let checksums = Arc::new(checksums);

        let tasks = self
            .kinds
            .iter()
            .filter_map(|kind| self.path(*kind).map(|input| (*kind, input.to_path_buf())))
            .map(|(kind, input)| {
                let pruned = self.scratch_path(kind);
                let dest = self.scratch_path(kind);
                let checksums = checksums.clone();

                async move {
                    let path = dest.clone();
                    let count = tokio::task::spawn_blocking(move || {
                        let count = prune(
                            kind,
                            open_buffered(&input)?,
                            create_buffered(&pruned)?,
                            &checksums,
                        )?;
                        write_count(kind, &pruned, &dest, count)?;

                        Ok::<_, RpmRepositoryError>(count)
                    })
                    .await??;

                    Ok::<_, RpmRepositoryError>((kind, path, count))
                }
            })
            .collect::<Vec<_>>();

        let mut primary_count = 0;

        for (kind, path, count) in futures::future::try_join_all(tasks).await? {
            if kind == XmlPackage::Primary {
                primary_count = count;
            }

            self.replace(kind, path)?;
        }

        Ok(primary_count)
    }

    /// Remove the packages at the given locations from every existing document.
    ///
    /// Records of other packages sharing a checksum with a removed one are kept.
    ///
    /// Returns the resulting package count.
    pub async fn remove_locations(&mut self, locations: HashSet<String>) -> Result<usize> {
        let input = match self.path(XmlPackage::Primary) {
            Some(path) => path.to_path_buf(),
            None => return Ok(0),
        };
        let pruned = self.scratch_path(XmlPackage::Primary);
        let dest = self.scratch_path(XmlPackage::Primary);
        let path = dest.clone();

        let (count, dropped) = tokio::task::spawn_blocking(move || {
            let (count, dropped) = prune_locations(
                open_buffered(&input)?,
                create_buffered(&pruned)?,
                &locations,
            )?;
            write_count(XmlPackage::Primary, &pruned, &dest, count)?;

            Ok::<_, RpmRepositoryError>((count, dropped))
        })
        .await??;
        self.replace(XmlPackage::Primary, path)?;

        debug!(
            "removed {} records from primary",
            dropped.values().sum::<usize>()
        );

        let dropped = Arc::new(dropped);

        let tasks = self
            .kinds
            .iter()
            .filter(|kind| **kind != XmlPackage::Primary)
            .filter_map(|kind| self.path(*kind).map(|input| (*kind, input.to_path_buf())))
            .map(|(kind, input)| {
                let pruned = self.scratch_path(kind);
                let dest = self.scratch_path(kind);
                let dropped = dropped.clone();

                async move {
                    let path = dest.clone();
                    let count = tokio::task::spawn_blocking(move || {
                        let count = prune_counted(
                            kind,
                            open_buffered(&input)?,
                            create_buffered(&pruned)?,
                            (*dropped).clone(),
                        )?;
                        write_count(kind, &pruned, &dest, count)?;

                        Ok::<_, RpmRepositoryError>(count)
                    })
                    .await??;

                    Ok::<_, RpmRepositoryError>((kind, path, count))
                }
            })
            .collect::<Vec<_>>();

        for (kind, path, kind_count) in futures::future::try_join_all(tasks).await? {
            if kind_count != count {
                warn!(
                    "{} holds {} packages but primary holds {}",
                    kind, kind_count, count
                );
            }

            self.replace(kind, path)?;
        }

        Ok(count)
    }
}

/// Output state shared by the tasks appending to a [BatchWriter].
struct BatchState {
    outputs: Vec<(XmlPackage, PathBuf, Writer<BufWriter<File>>)>,
    /// Checksum to location of every package written.
    checksums: HashMap<String, String>,
    locations: HashSet<String>,
}

/// Outcome of [BatchWriter::append()].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Appended {
    Written,
    /// The package was left out. Holds the location of the package written earlier
    /// with the same location or checksum.
    Duplicate(String),
}

/// Produces new documents from packages appended by concurrent tasks.
///
/// Records of one package are appended to every document before another package's,
/// so all documents list packages in the same order. A location or checksum is
/// written at most once; the first package to claim it wins.
pub struct BatchWriter {
    kinds: Vec<XmlPackage>,
    state: WriterLock<BatchState>,
}

impl BatchWriter {
    /// Start new documents for the kinds of `files`.
    pub fn new(files: &MetadataFiles) -> Result<Self> {
        let outputs = files
            .kinds()
            .iter()
            .map(|kind| {
                let path = files.scratch_path(*kind);
                let mut writer = Writer::new(create_buffered(&path)?);
                write_document_start(&mut writer, *kind, PLACEHOLDER_COUNT)?;

                Ok((*kind, path, writer))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kinds: files.kinds().to_vec(),
            state: WriterLock::new(BatchState {
                outputs,
                checksums: HashMap::new(),
                locations: HashSet::new(),
            }),
        })
    }

    /// Append the records of a package to every document.
    pub async fn append(&self, package: &PackageMeta) -> Result<Appended> {
        let records = self
            .kinds
            .iter()
            .map(|kind| render_record(*kind, package))
            .collect::<Result<Vec<_>>>()?;

        let checksum = package.pkgid();
        let mut state = self.state.lock().await;

        let existing = if state.locations.contains(&package.location) {
            Some(package.location.clone())
        } else {
            state.checksums.get(&checksum).cloned()
        };

        if let Some(existing) = existing {
            warn!(
                "ignoring {}: same location or content as {}",
                package.location, existing
            );
            self.state.unlock(state);

            return Ok(Appended::Duplicate(existing));
        }

        for ((_, _, writer), record) in state.outputs.iter_mut().zip(&records) {
            writer.get_mut().write_all(record)?;
            writer.get_mut().write_all(b"\n")?;
        }

        state.locations.insert(package.location.clone());
        state.checksums.insert(checksum, package.location.clone());
        self.state.unlock(state);

        Ok(Appended::Written)
    }

    /// Finish all documents and install them as the current documents of `files`.
    ///
    /// Returns the number of packages written.
    pub async fn finish(self, files: &mut MetadataFiles) -> Result<usize> {
        let state = self.state.into_inner();
        let count = state.locations.len();

        let tasks = state
            .outputs
            .into_iter()
            .map(|(kind, source, mut writer)| {
                let dest = files.scratch_path(kind);

                async move {
                    let path = dest.clone();

                    tokio::task::spawn_blocking(move || {
                        write_document_end(&mut writer, kind)?;
                        writer.into_inner().flush()?;

                        write_count(kind, &source, &dest, count)
                    })
                    .await??;

                    Ok::<_, RpmRepositoryError>((kind, path))
                }
            })
            .collect::<Vec<_>>();

        for (kind, path) in futures::future::try_join_all(tasks).await? {
            files.replace(kind, path)?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::xml::{event::test::sample_package, merge::scan_primary, test_support::count_packages},
    };

    fn read(files: &MetadataFiles, kind: XmlPackage) -> String {
        std::fs::read_to_string(files.path(kind).expect("document should exist"))
            .expect("document should be readable")
    }

    fn all_kinds() -> Result<MetadataFiles> {
        MetadataFiles::new(XmlPackage::ALL)
    }

    #[tokio::test]
    async fn append_to_empty() -> Result<()> {
        let mut files = all_kinds()?;
        assert!(files.is_complete());

        let res = files
            .append(vec![sample_package("a", "a.rpm"), sample_package("b", "b.rpm")])
            .await?;
        assert_eq!(res.count, 2);

        for kind in XmlPackage::ALL {
            let xml = read(&files, kind);
            assert!(xml.contains("packages=\"2\""), "{}", kind);
            assert_eq!(count_packages(&xml), 2);
        }

        Ok(())
    }

    #[tokio::test]
    async fn append_replaces_across_kinds() -> Result<()> {
        let mut files = all_kinds()?;
        let original = sample_package("libdeflt", "libdeflt.rpm");
        files
            .append(vec![sample_package("abc", "abc.rpm"), original.clone()])
            .await?;

        let mut updated = sample_package("libdeflt", "libdeflt.rpm");
        updated.version = "2.0".to_string();
        updated.checksum = crate::io::DigestAlgorithm::Sha256.digest_bytes(b"new content");

        let res = files.append(vec![updated.clone()]).await?;
        assert_eq!(res.count, 2);
        assert_eq!(res.checksums, HashSet::from([original.pkgid()]));

        for kind in XmlPackage::ALL {
            let xml = read(&files, kind);
            assert!(xml.contains("packages=\"2\""));
            assert!(!xml.contains(&original.pkgid()), "{}", kind);
            assert!(xml.contains(&updated.pkgid()), "{}", kind);
            assert!(xml.contains("ver=\"2.0\""));
        }

        Ok(())
    }

    #[tokio::test]
    async fn append_is_idempotent() -> Result<()> {
        let packages = vec![sample_package("a", "a.rpm"), sample_package("b", "b.rpm")];
        let mut files = all_kinds()?;

        files.append(packages.clone()).await?;
        let before = XmlPackage::ALL.map(|kind| read(&files, kind));

        files.append(packages).await?;
        let after = XmlPackage::ALL.map(|kind| read(&files, kind));

        assert_eq!(before, after);

        Ok(())
    }

    #[tokio::test]
    async fn remove_everywhere() -> Result<()> {
        let mut files = all_kinds()?;
        let a = sample_package("a", "a.rpm");
        let b = sample_package("b", "b.rpm");
        files.append(vec![a.clone(), b.clone()]).await?;

        let count = files.remove(HashSet::from([a.pkgid()])).await?;
        assert_eq!(count, 1);

        for kind in XmlPackage::ALL {
            let xml = read(&files, kind);
            assert!(xml.contains("packages=\"1\""));
            assert!(!xml.contains(&a.pkgid()));
            assert!(xml.contains(&b.pkgid()));
        }

        let count = files.remove(HashSet::from([b.pkgid()])).await?;
        assert_eq!(count, 0);
        assert!(read(&files, XmlPackage::Other).contains("packages=\"0\""));

        Ok(())
    }

    #[tokio::test]
    async fn without_filelists() -> Result<()> {
        let mut files = MetadataFiles::new([XmlPackage::Other])?;
        assert_eq!(files.kinds(), &[XmlPackage::Primary, XmlPackage::Other]);

        files.append(vec![sample_package("a", "a.rpm")]).await?;
        assert!(files.path(XmlPackage::Filelists).is_none());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_writer_concurrent() -> Result<()> {
        let mut files = all_kinds()?;
        let writer = Arc::new(BatchWriter::new(&files)?);

        let tasks = (0..16)
            .map(|i| {
                let writer = writer.clone();
                tokio::spawn(async move {
                    writer
                        .append(&sample_package(&format!("p{}", i), &format!("p{}.rpm", i)))
                        .await
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await??;
        }

        let writer = Arc::try_unwrap(writer).map_err(|_| {
            RpmRepositoryError::MalformedIndex("primary", "writer still shared".to_string())
        })?;
        assert_eq!(writer.finish(&mut files).await?, 16);

        let primary = read(&files, XmlPackage::Primary);
        assert!(primary.contains("packages=\"16\""));

        // All documents list packages in the same order.
        let locations = scan_primary(primary.as_bytes())?
            .into_iter()
            .map(|(location, _)| location.trim_end_matches(".rpm").to_string())
            .collect::<Vec<_>>();
        assert_eq!(locations.len(), 16);

        for kind in [XmlPackage::Other, XmlPackage::Filelists] {
            let xml = read(&files, kind);
            let positions = locations
                .iter()
                .map(|name| xml.find(&format!("name=\"{}\"", name)))
                .collect::<Vec<_>>();

            assert!(positions.iter().all(|p| p.is_some()));
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", kind);
        }

        Ok(())
    }

    #[tokio::test]
    async fn batch_writer_skips_duplicates() -> Result<()> {
        let mut files = all_kinds()?;
        let writer = BatchWriter::new(&files)?;

        let original = sample_package("a", "a.rpm");
        let mut copy = sample_package("a", "copy/a.rpm");
        copy.checksum = original.checksum.clone();
        let mut rebuilt = sample_package("a", "a.rpm");
        rebuilt.version = "2.0".to_string();

        assert_eq!(writer.append(&original).await?, Appended::Written);
        assert_eq!(
            writer.append(&copy).await?,
            Appended::Duplicate("a.rpm".to_string())
        );
        assert_eq!(
            writer.append(&rebuilt).await?,
            Appended::Duplicate("a.rpm".to_string())
        );

        assert_eq!(writer.finish(&mut files).await?, 1);

        for kind in XmlPackage::ALL {
            let xml = read(&files, kind);
            assert!(xml.contains("packages=\"1\""), "{}", kind);
            assert_eq!(xml.matches(&original.pkgid()).count(), 1, "{}", kind);
        }

        Ok(())
    }

    #[tokio::test]
    async fn remove_locations_keeps_shared_content() -> Result<()> {
        let mut files = MetadataFiles::new([XmlPackage::Other])?;

        // Older metadata listing one content at two locations.
        let documents = [
            (
                XmlPackage::Primary,
                concat!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                    "<metadata xmlns=\"http://linux.duke.edu/metadata/common\" packages=\"3\">\n",
                    "<package type=\"rpm\"><checksum type=\"sha256\" pkgid=\"YES\">aaaa</checksum>",
                    "<location href=\"a.rpm\"/></package>\n",
                    "<package type=\"rpm\"><checksum type=\"sha256\" pkgid=\"YES\">aaaa</checksum>",
                    "<location href=\"copy/a.rpm\"/></package>\n",
                    "<package type=\"rpm\"><checksum type=\"sha256\" pkgid=\"YES\">bbbb</checksum>",
                    "<location href=\"b.rpm\"/></package>\n",
                    "</metadata>\n",
                ),
            ),
            (
                XmlPackage::Other,
                concat!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                    "<otherdata xmlns=\"http://linux.duke.edu/metadata/other\" packages=\"3\">\n",
                    "<package pkgid=\"aaaa\" name=\"a\" arch=\"x86_64\"></package>\n",
                    "<package pkgid=\"aaaa\" name=\"a\" arch=\"x86_64\"></package>\n",
                    "<package pkgid=\"bbbb\" name=\"b\" arch=\"x86_64\"></package>\n",
                    "</otherdata>\n",
                ),
            ),
        ];

        for (kind, xml) in documents {
            let path = files.scratch_path(kind);
            std::fs::write(&path, xml)?;
            files.replace(kind, path)?;
        }

        let count = files
            .remove_locations(HashSet::from([
                "copy/a.rpm".to_string(),
                "b.rpm".to_string(),
                "gone.rpm".to_string(),
            ]))
            .await?;
        assert_eq!(count, 1);

        let primary = read(&files, XmlPackage::Primary);
        assert!(primary.contains("packages=\"1\""));
        assert!(primary.contains("href=\"a.rpm\""));
        assert!(!primary.contains("copy/a.rpm"));

        let other = read(&files, XmlPackage::Other);
        assert!(other.contains("packages=\"1\""));
        assert_eq!(other.matches("pkgid=\"aaaa\"").count(), 1);
        assert!(!other.contains("bbbb"));

        Ok(())
    }
}
