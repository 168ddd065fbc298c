// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository configuration. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ContentDigest, DigestAlgorithm},
    },
    serde::Deserialize,
    std::str::FromStr,
};

/// Controls the storage names of published metadata files.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub enum NamingPolicy {
    /// Files are published under their plain name. e.g. `primary.xml.gz`.
    Plain,
    /// Names are prefixed with the SHA-1 of the published content.
    Sha1,
    /// Names are prefixed with the SHA-256 of the published content.
    Sha256,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self::Plain
    }
}

impl NamingPolicy {
    /// The digest algorithm used to derive name prefixes, if any.
    pub fn digest_algorithm(&self) -> Option<DigestAlgorithm> {
        match self {
            Self::Plain => None,
            Self::Sha1 => Some(DigestAlgorithm::Sha1),
            Self::Sha256 => Some(DigestAlgorithm::Sha256),
        }
    }

    /// Derive the published file name given the plain name and the published content digest.
    ///
    /// `digest` must have been computed with [Self::digest_algorithm()] when that is [Some].
    pub fn name(&self, plain: &str, digest: Option<&ContentDigest>) -> String {
        match (self, digest) {
            (Self::Plain, _) | (_, None) => plain.to_string(),
            (_, Some(digest)) => format!("{}-{}", digest.digest_hex(), plain),
        }
    }
}

impl FromStr for NamingPolicy {
    type Err = RpmRepositoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(RpmRepositoryError::UnknownNamingPolicy(s.to_string())),
        }
    }
}

impl TryFrom<String> for NamingPolicy {
    type Error = RpmRepositoryError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

/// Parse a `true` / `false` option value.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(RpmRepositoryError::InvalidBoolean(value.to_string())),
    }
}

fn default_filelists() -> bool {
    true
}

/// Describes how a repository's metadata is produced.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RepositoryConfig {
    /// Digest used for package checksums and metadata file checksums.
    #[serde(default)]
    pub digest: DigestAlgorithm,

    /// Naming of published metadata files.
    #[serde(default, rename = "naming-policy", alias = "naming_policy")]
    pub naming_policy: NamingPolicy,

    /// Whether `filelists.xml` is maintained.
    #[serde(default = "default_filelists")]
    pub filelists: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            digest: DigestAlgorithm::default(),
            naming_policy: NamingPolicy::default(),
            filelists: default_filelists(),
        }
    }
}

impl RepositoryConfig {
    /// Construct an instance from the string forms of each option.
    ///
    /// Missing values fall back to defaults.
    pub fn from_options(
        digest: Option<&str>,
        naming_policy: Option<&str>,
        filelists: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = digest {
            config.digest = DigestAlgorithm::from_str(value)?;
        }
        if let Some(value) = naming_policy {
            config.naming_policy = NamingPolicy::from_str(value)?;
        }
        if let Some(value) = filelists {
            config.filelists = parse_bool(value)?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        let config = RepositoryConfig::from_options(None, None, None)?;

        assert_eq!(config.digest, DigestAlgorithm::Sha256);
        assert_eq!(config.naming_policy, NamingPolicy::Plain);
        assert!(config.filelists);

        Ok(())
    }

    #[test]
    fn explicit_options() -> Result<()> {
        let config = RepositoryConfig::from_options(Some("sha1"), Some("sha256"), Some("false"))?;

        assert_eq!(config.digest, DigestAlgorithm::Sha1);
        assert_eq!(config.naming_policy, NamingPolicy::Sha256);
        assert!(!config.filelists);

        assert!(RepositoryConfig::from_options(None, Some("md5"), None).is_err());
        assert!(RepositoryConfig::from_options(None, None, Some("yes")).is_err());

        Ok(())
    }

    #[test]
    fn naming_policy_names() {
        let digest = DigestAlgorithm::Sha256.digest_bytes(b"content");

        assert_eq!(
            NamingPolicy::Plain.name("primary.xml.gz", Some(&digest)),
            "primary.xml.gz"
        );
        assert_eq!(
            NamingPolicy::Sha256.name("primary.xml.gz", Some(&digest)),
            format!("{}-primary.xml.gz", digest.digest_hex())
        );
        assert_eq!(NamingPolicy::Sha1.digest_algorithm(), Some(DigestAlgorithm::Sha1));
    }
}
