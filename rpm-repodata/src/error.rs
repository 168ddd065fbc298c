// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Error type for this crate.
#[derive(Debug, Error)]
pub enum RpmRepositoryError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0:?}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0:?}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("XML deserialization error: {0:?}")]
    XmlDeserialize(#[from] serde_xml_rs::Error),

    #[error("repository I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("storage key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid hex in content digest: {0}; {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("unknown content digest format: {0}")]
    UnknownDigestFormat(String),

    #[error("unknown naming policy: {0}")]
    UnknownNamingPolicy(String),

    #[error("invalid boolean value: {0}")]
    InvalidBoolean(String),

    #[error("repository metadata entry not found: {0}")]
    MetadataFileNotFound(&'static str),

    #[error("malformed {0} index: {1}")]
    MalformedIndex(&'static str, String),

    #[error("failed to parse package {key}: {reason}")]
    PackageParse { key: String, reason: String },

    #[error("malformed changelog entry: {0}")]
    ChangelogParse(String),

    #[error("repository lock for {0} is held by another writer")]
    LockHeld(String),

    #[error("blocking task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, RpmRepositoryError>;
