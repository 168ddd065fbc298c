// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package metadata as consumed by the index formatters.

[PackageMeta] is a flattened view of an RPM header. It is produced by a
[PackageHeaderReader] and consumed by the record formatters in
[crate::xml::event].
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::ContentDigest,
    },
    chrono::{DateTime, NaiveDate, TimeZone, Utc},
    std::{fmt::Formatter, str::FromStr},
};

/// Version comparison operator of a dependency entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DependencyFlag {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl DependencyFlag {
    /// The value of the `flags` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "EQ",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
        }
    }
}

impl std::fmt::Display for DependencyFlag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `provides` / `requires` / `obsoletes` / `conflicts` entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dependency {
    /// Capability name.
    pub name: String,
    /// Comparison operator, if versioned.
    pub flags: Option<DependencyFlag>,
    pub epoch: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
    /// Whether this is a pre-install requirement.
    pub pre: bool,
}

impl Dependency {
    /// An unversioned entry.
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A versioned entry, splitting an `[epoch:]version[-release]` string.
    pub fn with_evr(name: impl ToString, flags: DependencyFlag, evr: &str) -> Self {
        let (epoch, rest) = match evr.split_once(':') {
            Some((epoch, rest)) => (Some(epoch.to_string()), rest),
            None => (None, evr),
        };
        let (version, release) = match rest.split_once('-') {
            Some((version, release)) => (version.to_string(), Some(release.to_string())),
            None => (rest.to_string(), None),
        };

        Self {
            name: name.to_string(),
            flags: Some(flags),
            epoch: Some(epoch.unwrap_or_else(|| "0".to_string())),
            version: Some(version),
            release,
            pre: false,
        }
    }

    /// Mark this entry as a pre-install requirement.
    pub fn pre(mut self) -> Self {
        self.pre = true;
        self
    }
}

/// A parsed changelog entry.
///
/// Entries use the `* <weekday> <month> <day> <year> <author> - <content>` grammar.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangelogEntry {
    /// Author of the entry.
    pub author: String,
    /// Unix time (UTC midnight) of the entry date.
    pub date: i64,
    /// Text of the entry.
    pub content: String,
}

impl ChangelogEntry {
    /// Render a changelog triple from an RPM header into the textual grammar.
    pub fn format_header_entry(author: &str, timestamp: i64, text: &str) -> String {
        let date = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();

        format!("* {} {}\n{}", date.format("%a %b %d %Y"), author, text)
    }
}

impl FromStr for ChangelogEntry {
    type Err = RpmRepositoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || RpmRepositoryError::ChangelogParse(s.to_string());

        let body = s.strip_prefix('*').ok_or_else(bad)?.trim_start();

        let mut tokens = body.splitn(5, |c: char| c == ' ' || c == '\t');
        // The weekday is frequently wrong in the wild, so it isn't checked against the date.
        let _weekday = tokens.next().ok_or_else(bad)?;
        let month = tokens.next().ok_or_else(bad)?;
        let day = tokens.next().ok_or_else(bad)?;
        let year = tokens.next().ok_or_else(bad)?;
        let rest = tokens.next().unwrap_or_default();

        let date = NaiveDate::parse_from_str(&format!("{} {} {}", month, day, year), "%b %d %Y")
            .map_err(|_| bad())?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(bad)?;
        let date = Utc.from_utc_datetime(&date).timestamp();

        let (author, content) = if let Some((author, content)) = rest.split_once(" - ") {
            (author, content)
        } else if let Some((author, content)) = rest.split_once('\n') {
            (author, content)
        } else {
            (rest, "")
        };

        Ok(Self {
            author: author.trim().to_string(),
            date,
            content: content.to_string(),
        })
    }
}

/// Metadata of one package, as extracted from its header.
#[derive(Clone, Debug)]
pub struct PackageMeta {
    pub name: String,
    pub arch: String,
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub summary: String,
    pub description: String,
    pub packager: String,
    pub url: String,
    pub license: String,
    pub vendor: String,
    pub group: String,
    pub build_host: String,
    pub source_rpm: String,

    /// Modification time of the package file.
    pub time_file: u64,
    /// Build time recorded in the header.
    pub time_build: u64,

    /// Size of the package file.
    pub size_package: u64,
    /// Total size of installed files.
    pub size_installed: u64,
    /// Size of the payload archive.
    pub size_archive: u64,

    /// Byte offsets of the header in the package file.
    pub header_start: u64,
    pub header_end: u64,

    /// Digest of the package file content. This is the package identity.
    pub checksum: ContentDigest,

    /// Repository relative location the package is published under.
    pub location: String,

    pub provides: Vec<Dependency>,
    pub requires: Vec<Dependency>,
    pub obsoletes: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,

    /// Full paths of every file in the package.
    pub files: Vec<String>,
    /// Directory names of the package, each with a trailing `/`.
    pub dirnames: Vec<String>,

    /// Changelog entries in the textual grammar parsed by [ChangelogEntry].
    pub changelog: Vec<String>,
}

impl PackageMeta {
    /// Hex digest identifying this package.
    pub fn pkgid(&self) -> String {
        self.checksum.digest_hex()
    }
}

/// Extracts [PackageMeta] from the bytes of a package file.
pub trait PackageHeaderReader: Send + Sync {
    /// Parse a package.
    ///
    /// `location` is the repository relative href the package is published under and
    /// `checksum` the digest of `data`. Implementations return
    /// [RpmRepositoryError::PackageParse] when the header cannot be read.
    fn read_package(
        &self,
        data: &[u8],
        location: &str,
        checksum: ContentDigest,
        time_file: u64,
    ) -> Result<PackageMeta>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_changelog() -> Result<()> {
        let entry = ChangelogEntry::from_str(
            "* Wed May 13 2020 John Doe <johndoe@example.org> - 0.1-2\n- Second package",
        )?;

        assert_eq!(entry.author, "John Doe <johndoe@example.org>");
        assert_eq!(entry.date, 1589328000);
        assert_eq!(entry.content, "0.1-2\n- Second package");

        Ok(())
    }

    #[test]
    fn parse_changelog_wrong_weekday() -> Result<()> {
        let entry = ChangelogEntry::from_str("* Mon Jan 01 1970 Someone - content")?;

        assert_eq!(entry.date, 0);
        assert_eq!(entry.author, "Someone");
        assert_eq!(entry.content, "content");

        Ok(())
    }

    #[test]
    fn parse_changelog_malformed() {
        assert!(ChangelogEntry::from_str("no asterisk").is_err());
        assert!(ChangelogEntry::from_str("* Wed Foo 13 2020 x - y").is_err());
        assert!(ChangelogEntry::from_str("* Wed").is_err());
    }

    #[test]
    fn header_entry_round_trip() -> Result<()> {
        let text = ChangelogEntry::format_header_entry("Jane <jane@example.org> - 1.0-1", 1589328000, "- Fix");
        assert_eq!(text, "* Wed May 13 2020 Jane <jane@example.org> - 1.0-1\n- Fix");

        let entry = ChangelogEntry::from_str(&text)?;
        assert_eq!(entry.date, 1589328000);
        assert_eq!(entry.author, "Jane <jane@example.org>");

        Ok(())
    }

    #[test]
    fn dependency_evr() {
        let dep = Dependency::with_evr("libfoo", DependencyFlag::Ge, "1:2.3-4.fc35");
        assert_eq!(dep.epoch.as_deref(), Some("1"));
        assert_eq!(dep.version.as_deref(), Some("2.3"));
        assert_eq!(dep.release.as_deref(), Some("4.fc35"));

        let dep = Dependency::with_evr("libfoo", DependencyFlag::Eq, "2.3").pre();
        assert_eq!(dep.epoch.as_deref(), Some("0"));
        assert_eq!(dep.release, None);
        assert!(dep.pre);
    }
}
