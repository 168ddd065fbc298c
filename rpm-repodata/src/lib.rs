// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! RPM repository metadata maintenance.

This crate maintains the metadata of RPM package repositories. A repository is
a set of `.rpm` files under a storage prefix plus a `repodata` directory
containing a `repomd.xml` manifest (represented by [metadata::repomd::RepoMd])
and the index documents it references:

* `primary.xml` describes each package (name, version, dependencies, location).
* `filelists.xml` lists the files of each package.
* `other.xml` holds package changelogs.

Index documents are never loaded in full. The [xml] module rewrites them as
event streams: [xml::merge] replaces and appends records, [xml::maid] prunes
records, and [xml::alter] patches the package count once the final count is known.

[workflow::MetadataFiles] keeps the three documents consistent with each other.
[RpmRepository] drives whole repository updates against a [storage::Storage]
backend while holding a [lock::RepositoryLock] for the prefix.

Package headers are read through the [package::PackageHeaderReader] trait.
[header::RpmHeaderReader] implements it with the `rpm` crate.
*/

pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod lock;
pub mod metadata;
pub mod package;
pub mod repository;
pub mod storage;
pub mod workflow;
pub mod xml;

pub use crate::{
    config::{NamingPolicy, RepositoryConfig},
    error::{Result, RpmRepositoryError},
    repository::{RpmRepository, UpdateSummary},
};
