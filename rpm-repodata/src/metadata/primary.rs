// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Parsed form of `primary.xml`.

Only the identity of each package is modeled: name, version, checksum,
location, and the format fields rendered from a [crate::package::PackageMeta].
Other elements are ignored when parsing.

A [Primary] holds the whole document in memory. Updates never do this and
stream documents through [crate::xml] instead.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ContentDigest, DigestAlgorithm},
        metadata::repomd::Location,
    },
    serde::{Deserialize, Serialize},
    std::{io::Read, str::FromStr},
};

/// A parsed `primary.xml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Primary {
    /// Value of the `packages` attribute.
    #[serde(rename = "packages")]
    pub count: usize,

    #[serde(default, rename = "package")]
    pub packages: Vec<Package>,
}

impl Primary {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_xml_rs::from_reader(reader)?)
    }

    pub fn from_xml(s: &str) -> Result<Self> {
        Ok(serde_xml_rs::from_str(s)?)
    }

    /// `(location, checksum)` of every package, in document order.
    pub fn records(&self) -> Vec<(String, String)> {
        self.packages
            .iter()
            .map(|p| (p.location.href.clone(), p.checksum.value.clone()))
            .collect()
    }
}

/// A `<package>` element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub arch: String,
    pub version: PackageVersion,
    pub checksum: Checksum,
    pub location: Location,
    pub format: Option<PackageFormat>,
}

impl Package {
    /// The package checksum.
    pub fn digest(&self) -> Result<ContentDigest> {
        ContentDigest::try_from(self.checksum.clone())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PackageVersion {
    pub epoch: u64,
    #[serde(rename = "ver")]
    pub version: String,
    #[serde(rename = "rel")]
    pub release: String,
}

/// Content digest of a package file. Its hex value is the package's `pkgid`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub name: String,

    #[serde(rename = "$value")]
    pub value: String,
}

impl TryFrom<Checksum> for ContentDigest {
    type Error = RpmRepositoryError;

    fn try_from(v: Checksum) -> std::result::Result<Self, Self::Error> {
        ContentDigest::from_hex_digest(DigestAlgorithm::from_str(&v.name)?, &v.value)
    }
}

/// The `<format>` element of a package.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PackageFormat {
    pub license: Option<String>,
    pub provides: Option<Entries>,
    pub requires: Option<Entries>,

    /// Files listed in primary. The complete list is in `filelists.xml`.
    #[serde(default, rename = "file")]
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entries {
    #[serde(rename = "entry")]
    pub entries: Vec<PackageEntry>,
}

/// A dependency entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PackageEntry {
    pub name: String,
    pub flags: Option<String>,
    pub epoch: Option<u64>,
    #[serde(rename = "ver")]
    pub version: Option<String>,
    #[serde(rename = "rel")]
    pub release: Option<String>,
    /// Present and `1` for install-time requirements.
    pub pre: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileEntry {
    /// `dir` or `ghost`. Regular files carry no type.
    #[serde(rename = "type")]
    pub file_type: Option<String>,

    #[serde(rename = "$value")]
    pub value: String,
}
