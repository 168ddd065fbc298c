// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Removal of packages from an existing index document. */

use {
    crate::{
        error::Result,
        xml::{
            attribute_value, filter_records, merge::PkgIdFilter, merge::PrimaryRecordState,
            RecordFilter, XmlPackage,
        },
    },
    quick_xml::{
        events::{BytesStart, Event},
        Writer,
    },
    std::{
        collections::{HashMap, HashSet},
        io::{BufRead, Write},
    },
};

/// How a pruner identifies the records it removes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruneStrategy {
    /// By the `pkgid` attribute of `<package>`. Used for other and filelists.
    PkgId,
    /// By the text of the nested `<checksum>` element. Used for primary.
    Checksum,
}

impl PruneStrategy {
    /// The strategy appropriate for an index kind.
    pub fn for_kind(kind: XmlPackage) -> Self {
        match kind {
            XmlPackage::Primary => Self::Checksum,
            XmlPackage::Other | XmlPackage::Filelists => Self::PkgId,
        }
    }
}

struct ChecksumFilter<'a> {
    ids: &'a HashSet<String>,
    state: PrimaryRecordState,
}

impl<'a> RecordFilter for ChecksumFilter<'a> {
    fn start(&mut self, _: &BytesStart) -> Result<()> {
        self.state.reset();
        Ok(())
    }

    fn observe(&mut self, event: &Event) -> Result<()> {
        self.state.observe(event)
    }

    fn finish(&mut self) -> Result<bool> {
        Ok(!self.ids.contains(&self.state.checksum))
    }
}

/// Remove records of packages with the given checksums from an index document.
///
/// Returns the number of records remaining. The `packages` attribute is left as
/// found.
pub fn prune<R: BufRead, W: Write>(
    kind: XmlPackage,
    input: R,
    output: W,
    checksums: &HashSet<String>,
) -> Result<usize> {
    let mut writer = Writer::new(output);

    let (kept, _) = match PruneStrategy::for_kind(kind) {
        PruneStrategy::PkgId => {
            let mut filter = PkgIdFilter {
                ids: checksums,
                drop: false,
            };
            filter_records(kind, input, &mut writer, &mut filter, |_| Ok(0))?
        }
        PruneStrategy::Checksum => {
            let mut filter = ChecksumFilter {
                ids: checksums,
                state: PrimaryRecordState::default(),
            };
            filter_records(kind, input, &mut writer, &mut filter, |_| Ok(0))?
        }
    };

    writer.into_inner().flush()?;

    Ok(kept)
}

/// Drops primary records at given locations, counting the checksums it drops.
struct LocationFilter<'a> {
    locations: &'a HashSet<String>,
    state: PrimaryRecordState,
    dropped: HashMap<String, usize>,
}

impl<'a> RecordFilter for LocationFilter<'a> {
    fn start(&mut self, _: &BytesStart) -> Result<()> {
        self.state.reset();
        Ok(())
    }

    fn observe(&mut self, event: &Event) -> Result<()> {
        self.state.observe(event)
    }

    fn finish(&mut self) -> Result<bool> {
        let gone = matches!(&self.state.location, Some(href) if self.locations.contains(href));

        if gone {
            *self
                .dropped
                .entry(std::mem::take(&mut self.state.checksum))
                .or_default() += 1;
        }

        Ok(!gone)
    }
}

/// Drops up to a given number of records per `pkgid`.
struct CountedPkgIdFilter {
    remaining: HashMap<String, usize>,
    drop: bool,
}

impl RecordFilter for CountedPkgIdFilter {
    fn start(&mut self, element: &BytesStart) -> Result<()> {
        self.drop = false;

        if let Some(id) = attribute_value(element, "pkgid")? {
            if let Some(remaining) = self.remaining.get_mut(&id).filter(|n| **n > 0) {
                *remaining -= 1;
                self.drop = true;
            }
        }

        Ok(())
    }

    fn observe(&mut self, _: &Event) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<bool> {
        Ok(!self.drop)
    }
}

/// Remove the records of packages at the given locations from a primary index.
///
/// Other records are kept even when they share a checksum with a removed one.
///
/// Returns the number of records remaining and how many records were removed per
/// checksum. The `packages` attribute is left as found.
pub fn prune_locations<R: BufRead, W: Write>(
    input: R,
    output: W,
    locations: &HashSet<String>,
) -> Result<(usize, HashMap<String, usize>)> {
    let mut writer = Writer::new(output);
    let mut filter = LocationFilter {
        locations,
        state: PrimaryRecordState::default(),
        dropped: HashMap::new(),
    };

    let (kept, _) = filter_records(XmlPackage::Primary, input, &mut writer, &mut filter, |_| Ok(0))?;
    writer.into_inner().flush()?;

    Ok((kept, filter.dropped))
}

/// Remove as many records per `pkgid` as given by `counts` from an other or filelists index.
///
/// Pairs with [prune_locations()] so the kinds keep agreeing when a checksum is
/// listed more than once.
pub fn prune_counted<R: BufRead, W: Write>(
    kind: XmlPackage,
    input: R,
    output: W,
    counts: HashMap<String, usize>,
) -> Result<usize> {
    let mut writer = Writer::new(output);
    let mut filter = CountedPkgIdFilter {
        remaining: counts,
        drop: false,
    };

    let (kept, _) = filter_records(kind, input, &mut writer, &mut filter, |_| Ok(0))?;
    writer.into_inner().flush()?;

    Ok(kept)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::xml::test_support::{count_packages, OTHER_TWO, PRIMARY_TWO},
    };

    fn prune_str(kind: XmlPackage, input: &str, ids: &[&str]) -> Result<(String, usize)> {
        let ids = ids.iter().map(|s| s.to_string()).collect::<HashSet<_>>();
        let mut out = vec![];
        let count = prune(kind, input.as_bytes(), &mut out, &ids)?;

        Ok((String::from_utf8_lossy(&out).to_string(), count))
    }

    #[test]
    fn strategies() {
        assert_eq!(PruneStrategy::for_kind(XmlPackage::Primary), PruneStrategy::Checksum);
        assert_eq!(PruneStrategy::for_kind(XmlPackage::Filelists), PruneStrategy::PkgId);
    }

    #[test]
    fn prune_primary_by_checksum() -> Result<()> {
        let (xml, count) = prune_str(XmlPackage::Primary, PRIMARY_TWO, &["bbbb"])?;

        assert_eq!(count, 1);
        assert_eq!(count_packages(&xml), 1);
        assert!(xml.contains("<name>abc</name>"));
        assert!(!xml.contains("libdeflt"));
        assert!(xml.ends_with("</package>\n</metadata>\n"));

        Ok(())
    }

    #[test]
    fn prune_everything() -> Result<()> {
        let (xml, count) = prune_str(XmlPackage::Other, OTHER_TWO, &["aaaa", "bbbb"])?;

        assert_eq!(count, 0);
        assert_eq!(count_packages(&xml), 0);
        assert!(xml.ends_with("packages=\"2\">\n</otherdata>\n"));

        Ok(())
    }

    #[test]
    fn prune_unknown_is_identity() -> Result<()> {
        let (xml, count) = prune_str(XmlPackage::Other, OTHER_TWO, &["cccc"])?;

        assert_eq!(count, 2);
        assert_eq!(xml, OTHER_TWO);

        let (xml, count) = prune_str(XmlPackage::Primary, PRIMARY_TWO, &[])?;
        assert_eq!(count, 2);
        assert_eq!(xml, PRIMARY_TWO);

        Ok(())
    }

    /// Two live records at different locations carrying one checksum.
    const PRIMARY_SHARED: &str = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
        "<metadata xmlns=\"http://linux.duke.edu/metadata/common\" packages=\"2\">\n",
        "<package type=\"rpm\">\n",
        "  <checksum type=\"sha256\" pkgid=\"YES\">aaaa</checksum>\n",
        "  <location href=\"a.rpm\"/>\n",
        "</package>\n",
        "<package type=\"rpm\">\n",
        "  <checksum type=\"sha256\" pkgid=\"YES\">aaaa</checksum>\n",
        "  <location href=\"copy/a.rpm\"/>\n",
        "</package>\n",
        "</metadata>\n",
    );

    #[test]
    fn prune_by_location_keeps_shared_checksum() -> Result<()> {
        let locations = ["copy/a.rpm".to_string()].into_iter().collect::<HashSet<_>>();

        let mut out = vec![];
        let (count, dropped) = prune_locations(PRIMARY_SHARED.as_bytes(), &mut out, &locations)?;
        let xml = String::from_utf8_lossy(&out).to_string();

        assert_eq!(count, 1);
        assert_eq!(dropped.get("aaaa"), Some(&1));
        assert!(xml.contains("href=\"a.rpm\""));
        assert!(!xml.contains("copy/a.rpm"));

        let mut out = vec![];
        let count = prune_counted(
            XmlPackage::Other,
            OTHER_TWO.replace("bbbb", "aaaa").as_bytes(),
            &mut out,
            dropped,
        )?;

        assert_eq!(count, 1);
        assert_eq!(String::from_utf8_lossy(&out).matches("pkgid=\"aaaa\"").count(), 1);

        Ok(())
    }

    #[test]
    fn prune_by_location_ignores_unknown() -> Result<()> {
        let locations = ["gone.rpm".to_string()].into_iter().collect::<HashSet<_>>();

        let mut out = vec![];
        let (count, dropped) = prune_locations(PRIMARY_TWO.as_bytes(), &mut out, &locations)?;

        assert_eq!(count, 2);
        assert!(dropped.is_empty());
        assert_eq!(String::from_utf8_lossy(&out), PRIMARY_TWO);

        Ok(())
    }
}
