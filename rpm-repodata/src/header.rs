// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading package headers with the `rpm` crate. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::ContentDigest,
        package::{ChangelogEntry, Dependency, DependencyFlag, PackageHeaderReader, PackageMeta},
    },
    rpm::DependencyFlags,
    std::collections::HashSet,
};

/// Map header dependency flags to a comparison operator.
fn comparison(flags: DependencyFlags) -> Option<DependencyFlag> {
    let less = flags.contains(DependencyFlags::LESS);
    let greater = flags.contains(DependencyFlags::GREATER);
    let equal = flags.contains(DependencyFlags::EQUAL);

    match (less, greater, equal) {
        (true, false, true) => Some(DependencyFlag::Le),
        (false, true, true) => Some(DependencyFlag::Ge),
        (true, false, false) => Some(DependencyFlag::Lt),
        (false, true, false) => Some(DependencyFlag::Gt),
        (false, false, true) => Some(DependencyFlag::Eq),
        _ => None,
    }
}

fn is_pre(flags: DependencyFlags) -> bool {
    flags.intersects(DependencyFlags::PREREQ | DependencyFlags::SCRIPT_PRE | DependencyFlags::SCRIPT_POST)
}

fn convert_dependency(dep: rpm::Dependency) -> Dependency {
    let res = match comparison(dep.flags) {
        Some(flag) if !dep.version.is_empty() => Dependency::with_evr(&dep.name, flag, &dep.version),
        _ => Dependency::new(&dep.name),
    };

    if is_pre(dep.flags) {
        res.pre()
    } else {
        res
    }
}

fn convert_dependencies(deps: std::result::Result<Vec<rpm::Dependency>, rpm::Error>) -> Vec<Dependency> {
    deps.unwrap_or_default()
        .into_iter()
        .map(convert_dependency)
        .collect()
}

/// Directory names of a set of paths, each with a trailing `/`, in first seen order.
fn dirnames<'a>(paths: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut res = vec![];

    for path in paths {
        if let Some((dir, _)) = path.rsplit_once('/') {
            let dir = format!("{}/", dir);

            if seen.insert(dir.clone()) {
                res.push(dir);
            }
        }
    }

    res
}

/// A [PackageHeaderReader] backed by the `rpm` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpmHeaderReader;

impl PackageHeaderReader for RpmHeaderReader {
    fn read_package(
        &self,
        data: &[u8],
        location: &str,
        checksum: ContentDigest,
        time_file: u64,
    ) -> Result<PackageMeta> {
        let parse_error = |e: rpm::Error| RpmRepositoryError::PackageParse {
            key: location.to_string(),
            reason: format!("{}", e),
        };

        let package = rpm::Package::parse(&mut std::io::Cursor::new(data)).map_err(parse_error)?;
        let header = &package.metadata;

        let offsets = header.get_package_segment_offsets();

        let files = header
            .get_file_paths()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        let dirnames = dirnames(files.iter().map(|s| s.as_str()));

        let changelog = header
            .get_changelog_entries()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                ChangelogEntry::format_header_entry(
                    &entry.name,
                    entry.timestamp as i64,
                    &entry.description,
                )
            })
            .collect::<Vec<_>>();

        Ok(PackageMeta {
            name: header.get_name().map_err(parse_error)?.to_string(),
            arch: header.get_arch().map_err(parse_error)?.to_string(),
            epoch: header.get_epoch().unwrap_or(0) as u64,
            version: header.get_version().map_err(parse_error)?.to_string(),
            release: header.get_release().map_err(parse_error)?.to_string(),
            summary: header.get_summary().unwrap_or_default().to_string(),
            description: header.get_description().unwrap_or_default().to_string(),
            packager: header.get_packager().unwrap_or_default().to_string(),
            url: header.get_url().unwrap_or_default().to_string(),
            license: header.get_license().unwrap_or_default().to_string(),
            vendor: header.get_vendor().unwrap_or_default().to_string(),
            group: header.get_group().unwrap_or_default().to_string(),
            build_host: header.get_build_host().unwrap_or_default().to_string(),
            source_rpm: header.get_source_rpm().unwrap_or_default().to_string(),
            time_file,
            time_build: header.get_build_time().unwrap_or(0),
            size_package: data.len() as u64,
            size_installed: header.get_installed_size().unwrap_or(0),
            size_archive: (data.len() as u64).saturating_sub(offsets.payload),
            header_start: offsets.header,
            header_end: offsets.payload,
            checksum,
            location: location.to_string(),
            provides: convert_dependencies(header.get_provides()),
            requires: convert_dependencies(header.get_requires()),
            obsoletes: convert_dependencies(header.get_obsoletes()),
            conflicts: convert_dependencies(header.get_conflicts()),
            files,
            dirnames,
            changelog,
        })
    }
}
