// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Merging new packages into an existing index document.

The primary index is merged first. A primary record is superseded when a new
package is published at the same location or carries the same checksum. The
checksums of superseded records are reported so the other index kinds can drop
their records for the same packages.

The `packages` attribute of merged documents is left as found (or set to
[crate::xml::PLACEHOLDER_COUNT] for new documents). The merge reports the true
count, which is subsequently written with [crate::xml::alter].
*/

use {
    crate::{
        error::Result,
        package::PackageMeta,
        xml::{
            attribute_value, event::render_record, filter_records, write_document_end,
            write_document_start, write_rendered, RecordFilter, XmlPackage, PLACEHOLDER_COUNT,
        },
    },
    log::warn,
    quick_xml::{
        events::{BytesStart, Event},
        Writer,
    },
    rayon::prelude::*,
    std::{
        collections::{HashMap, HashSet},
        io::{BufRead, Write},
    },
};

/// Outcome of a merge.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeResult {
    /// Number of records in the merged document.
    pub count: usize,
    /// Checksums of existing records that were dropped.
    pub checksums: HashSet<String>,
}

/// Collapse packages sharing a location or a checksum, keeping the last supplied of each.
///
/// The survivors keep their relative order.
pub fn unique_packages(packages: Vec<PackageMeta>) -> Vec<PackageMeta> {
    let mut locations = HashSet::new();
    let mut checksums = HashSet::new();

    let mut res = packages
        .into_iter()
        .rev()
        .filter(|p| {
            let checksum = p.pkgid();

            if locations.contains(&p.location) || checksums.contains(&checksum) {
                warn!("ignoring {}: superseded by a later package of the batch", p.location);
                false
            } else {
                locations.insert(p.location.clone());
                checksums.insert(checksum);
                true
            }
        })
        .collect::<Vec<_>>();
    res.reverse();

    res
}

/// Render records for packages in parallel, preserving order.
pub fn render_records(kind: XmlPackage, packages: &[PackageMeta]) -> Result<Vec<Vec<u8>>> {
    packages
        .par_iter()
        .map(|package| render_record(kind, package))
        .collect::<Result<Vec<_>>>()
}

/// Tracks a primary `<package>` element's checksum and location.
#[derive(Default)]
pub(crate) struct PrimaryRecordState {
    in_checksum: bool,
    pub checksum: String,
    pub location: Option<String>,
}

impl PrimaryRecordState {
    pub fn reset(&mut self) {
        self.in_checksum = false;
        self.checksum.clear();
        self.location = None;
    }

    pub fn observe(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Start(e) if e.name().as_ref() == b"checksum" => {
                self.in_checksum = true;
            }
            Event::End(e) if e.name().as_ref() == b"checksum" => {
                self.in_checksum = false;
            }
            Event::Text(t) if self.in_checksum => {
                self.checksum.push_str(t.unescape()?.trim());
            }
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"location" => {
                self.location = attribute_value(e, "href")?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// Drops primary records superseded by a new batch.
struct SupersededFilter<'a> {
    locations: &'a HashSet<&'a str>,
    checksums: &'a HashSet<String>,
    state: PrimaryRecordState,
    dropped: HashSet<String>,
}

impl<'a> RecordFilter for SupersededFilter<'a> {
    fn start(&mut self, _: &BytesStart) -> Result<()> {
        self.state.reset();
        Ok(())
    }

    fn observe(&mut self, event: &Event) -> Result<()> {
        self.state.observe(event)
    }

    fn finish(&mut self) -> Result<bool> {
        let superseded = self
            .state
            .location
            .as_deref()
            .map(|href| self.locations.contains(href))
            .unwrap_or(false)
            || self.checksums.contains(&self.state.checksum);

        if superseded {
            self.dropped.insert(std::mem::take(&mut self.state.checksum));
        }

        Ok(!superseded)
    }
}

/// Drops records whose `pkgid` attribute is in a set.
pub(crate) struct PkgIdFilter<'a> {
    pub ids: &'a HashSet<String>,
    pub drop: bool,
}

impl<'a> RecordFilter for PkgIdFilter<'a> {
    fn start(&mut self, element: &BytesStart) -> Result<()> {
        self.drop = match attribute_value(element, "pkgid")? {
            Some(id) => self.ids.contains(&id),
            None => false,
        };

        Ok(())
    }

    fn observe(&mut self, _: &Event) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<bool> {
        Ok(!self.drop)
    }
}

/// Records the location and checksum of every primary record.
struct ScanFilter {
    state: PrimaryRecordState,
    records: Vec<(String, String)>,
}

impl RecordFilter for ScanFilter {
    fn start(&mut self, _: &BytesStart) -> Result<()> {
        self.state.reset();
        Ok(())
    }

    fn observe(&mut self, event: &Event) -> Result<()> {
        self.state.observe(event)
    }

    fn finish(&mut self) -> Result<bool> {
        if let Some(location) = self.state.location.take() {
            self.records
                .push((location, std::mem::take(&mut self.state.checksum)));
        }

        Ok(false)
    }
}

/// Obtain the `(location, checksum)` pairs of every record of a primary index.
pub fn scan_primary<R: BufRead>(input: R) -> Result<Vec<(String, String)>> {
    let mut filter = ScanFilter {
        state: PrimaryRecordState::default(),
        records: vec![],
    };

    filter_records(
        XmlPackage::Primary,
        input,
        &mut Writer::new(std::io::sink()),
        &mut filter,
        |_| Ok(0),
    )?;

    Ok(filter.records)
}

/// Write a complete new document holding only `records`.
fn write_fresh<W: Write>(
    kind: XmlPackage,
    writer: &mut Writer<W>,
    records: &[Vec<u8>],
) -> Result<usize> {
    write_document_start(writer, kind, PLACEHOLDER_COUNT)?;
    let count = write_rendered(writer, records)?;
    write_document_end(writer, kind)?;

    Ok(count)
}

/// Merge new packages into a primary index.
///
/// `input` is the existing document, if any. Records of packages at the location of
/// a new package or with the checksum of a new package are dropped. New records are
/// appended in the order supplied.
pub fn merge_primary<R: BufRead, W: Write>(
    input: Option<R>,
    output: W,
    packages: &[PackageMeta],
) -> Result<MergeResult> {
    let records = render_records(XmlPackage::Primary, packages)?;
    let mut writer = Writer::new(output);

    let res = match input {
        Some(input) => {
            let locations = packages
                .iter()
                .map(|p| p.location.as_str())
                .collect::<HashSet<_>>();
            let checksums = packages.iter().map(|p| p.pkgid()).collect::<HashSet<_>>();

            let mut filter = SupersededFilter {
                locations: &locations,
                checksums: &checksums,
                state: PrimaryRecordState::default(),
                dropped: HashSet::new(),
            };

            let (kept, appended) = filter_records(
                XmlPackage::Primary,
                input,
                &mut writer,
                &mut filter,
                |writer| write_rendered(writer, &records),
            )?;

            MergeResult {
                count: kept + appended,
                checksums: filter.dropped,
            }
        }
        None => MergeResult {
            count: write_fresh(XmlPackage::Primary, &mut writer, &records)?,
            checksums: HashSet::new(),
        },
    };

    writer.into_inner().flush()?;

    Ok(res)
}

/// Merge new packages into an other or filelists index.
///
/// Records whose `pkgid` is in `duplicates` are dropped. New records are appended in
/// the order supplied.
pub fn merge_packages<R: BufRead, W: Write>(
    kind: XmlPackage,
    input: Option<R>,
    output: W,
    packages: &[PackageMeta],
    duplicates: &HashSet<String>,
) -> Result<MergeResult> {
    let records = render_records(kind, packages)?;
    let mut writer = Writer::new(output);

    let count = match input {
        Some(input) => {
            let mut filter = PkgIdFilter {
                ids: duplicates,
                drop: false,
            };

            let (kept, appended) =
                filter_records(kind, input, &mut writer, &mut filter, |writer| {
                    write_rendered(writer, &records)
                })?;

            kept + appended
        }
        None => write_fresh(kind, &mut writer, &records)?,
    };

    writer.into_inner().flush()?;

    Ok(MergeResult {
        count,
        checksums: HashSet::new(),
    })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::io::DigestAlgorithm,
        crate::xml::{
            event::test::sample_package,
            test_support::{count_packages, OTHER_TWO, PRIMARY_TWO},
        },
    };

    fn merge_primary_str(input: Option<&str>, packages: &[PackageMeta]) -> Result<(String, MergeResult)> {
        let mut out = vec![];
        let res = merge_primary(input.map(|s| s.as_bytes()), &mut out, packages)?;

        Ok((String::from_utf8_lossy(&out).to_string(), res))
    }

    #[test]
    fn primary_into_absent() -> Result<()> {
        let packages = vec![sample_package("a", "a.rpm"), sample_package("b", "b.rpm")];
        let (xml, res) = merge_primary_str(None, &packages)?;

        assert_eq!(res.count, 2);
        assert!(res.checksums.is_empty());
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<metadata "));
        assert!(xml.contains("packages=\"-1\""));
        assert!(xml.ends_with("</package>\n</metadata>\n"));
        assert!(xml.find("a.rpm") < xml.find("b.rpm"));
        assert_eq!(count_packages(&xml), 2);

        Ok(())
    }

    #[test]
    fn primary_replaces_location() -> Result<()> {
        let mut replacement = sample_package("libdeflt", "libdeflt-1.0.rpm");
        replacement.version = "1.1".to_string();

        let (xml, res) = merge_primary_str(Some(PRIMARY_TWO), &[replacement.clone()])?;

        assert_eq!(res.count, 2);
        assert_eq!(res.checksums, HashSet::from(["bbbb".to_string()]));
        assert!(xml.contains("<name>abc</name>"));
        assert!(!xml.contains(">bbbb<"));
        assert!(xml.contains(&replacement.pkgid()));
        // The stale count is left for the patcher.
        assert!(xml.contains("packages=\"2\""));
        assert_eq!(count_packages(&xml), 2);
        // Untouched records are preserved byte for byte.
        assert!(xml.contains(concat!(
            "<package type=\"rpm\">\n",
            "  <name>abc</name>\n",
            "  <arch>x86_64</arch>\n",
            "  <checksum type=\"sha256\" pkgid=\"YES\">aaaa</checksum>\n",
            "  <location href=\"abc-1.0.rpm\"/>\n",
            "</package>\n<package type=\"rpm\">\n  <name>libdeflt</name>",
        )));

        Ok(())
    }

    #[test]
    fn primary_is_idempotent() -> Result<()> {
        let packages = vec![sample_package("a", "a.rpm")];

        let (first, _) = merge_primary_str(None, &packages)?;
        let (second, res) = merge_primary_str(Some(&first), &packages)?;

        assert_eq!(res.count, 1);
        assert_eq!(res.checksums, HashSet::from([packages[0].pkgid()]));
        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn primary_same_checksum_new_location() -> Result<()> {
        let (first, _) = merge_primary_str(None, &[sample_package("a", "a.rpm")])?;

        let mut moved = sample_package("a", "a.rpm");
        moved.location = "sub/a.rpm".to_string();

        let (xml, res) = merge_primary_str(Some(&first), &[moved])?;

        assert_eq!(res.count, 1);
        assert!(xml.contains("sub/a.rpm"));
        assert!(!xml.contains("\"a.rpm\""));

        Ok(())
    }

    #[test]
    fn other_drops_duplicates() -> Result<()> {
        let package = sample_package("libdeflt", "libdeflt-1.0.rpm");

        let mut out = vec![];
        let res = merge_packages(
            XmlPackage::Other,
            Some(OTHER_TWO.as_bytes()),
            &mut out,
            &[package.clone()],
            &HashSet::from(["bbbb".to_string()]),
        )?;
        let xml = String::from_utf8_lossy(&out);

        assert_eq!(res.count, 2);
        assert!(xml.contains("pkgid=\"aaaa\""));
        assert!(!xml.contains("pkgid=\"bbbb\""));
        assert!(!xml.contains("Initial &amp; only"));
        assert!(xml.contains(&format!("pkgid=\"{}\"", package.pkgid())));
        assert!(xml.ends_with("</package>\n</otherdata>\n"));

        Ok(())
    }

    #[test]
    fn empty_root_element() -> Result<()> {
        let input = "<?xml version=\"1.0\"?>\n<filelists xmlns=\"http://linux.duke.edu/metadata/filelists\" packages=\"0\"/>\n";
        let package = sample_package("a", "a.rpm");

        let mut out = vec![];
        let res = merge_packages(
            XmlPackage::Filelists,
            Some(input.as_bytes()),
            &mut out,
            &[package],
            &HashSet::new(),
        )?;
        let xml = String::from_utf8_lossy(&out);

        assert_eq!(res.count, 1);
        assert!(xml.contains("packages=\"0\">\n<package "));
        assert!(xml.contains("</package>\n</filelists>"));

        Ok(())
    }

    #[test]
    fn malformed_input() {
        let mut out = vec![];
        assert!(merge_packages(
            XmlPackage::Other,
            Some("<otherdata><package pkgid=\"x\">".as_bytes()),
            &mut out,
            &[],
            &HashSet::new(),
        )
        .is_err());

        let mut out = vec![];
        assert!(merge_packages(
            XmlPackage::Other,
            Some("".as_bytes()),
            &mut out,
            &[],
            &HashSet::new(),
        )
        .is_err());
    }

    #[test]
    fn scan() -> Result<()> {
        let records = scan_primary(PRIMARY_TWO.as_bytes())?;

        assert_eq!(
            records,
            vec![
                ("abc-1.0.rpm".to_string(), "aaaa".to_string()),
                ("libdeflt-1.0.rpm".to_string(), "bbbb".to_string()),
            ]
        );

        Ok(())
    }

    #[test]
    fn duplicate_locations_in_batch() {
        let mut first = sample_package("a", "a.rpm");
        first.version = "1".to_string();
        let mut second = sample_package("a", "a.rpm");
        second.version = "2".to_string();
        second.checksum = DigestAlgorithm::Sha256.digest_bytes(b"a 2");

        let res = unique_packages(vec![first, sample_package("b", "b.rpm"), second]);

        assert_eq!(res.len(), 2);
        assert_eq!(res[0].location, "b.rpm");
        assert_eq!(res[1].version, "2");
    }

    #[test]
    fn duplicate_checksums_in_batch() -> Result<()> {
        let original = sample_package("same", "a.rpm");
        let mut copy = sample_package("same", "copy/a.rpm");
        copy.checksum = original.checksum.clone();

        let res = unique_packages(vec![original.clone(), copy]);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].location, "copy/a.rpm");

        let (xml, merged) = merge_primary_str(Some(PRIMARY_TWO), &res)?;
        assert_eq!(merged.count, 3);
        assert_eq!(xml.matches(&original.pkgid()).count(), 1);

        Ok(())
    }
}
