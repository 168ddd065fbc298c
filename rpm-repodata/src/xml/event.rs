// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Rendering of `<package>` records.

Each [XmlPackage] kind has its own record layout. Records are rendered with
two space indentation into standalone byte buffers so they can be produced in
parallel and spliced into a document stream afterwards.
*/

use {
    crate::{
        error::Result,
        package::{ChangelogEntry, Dependency, DependencyFlag, PackageMeta},
        xml::{write_text_element, XmlPackage},
    },
    log::warn,
    quick_xml::{
        events::{BytesEnd, BytesStart, BytesText, Event},
        Writer,
    },
    std::{cmp::Ordering, collections::HashSet, io::Write, str::FromStr},
};

/// Render the record for a package into a standalone buffer.
pub fn render_record(kind: XmlPackage, package: &PackageMeta) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_record(&mut writer, kind, package)?;

    Ok(writer.into_inner())
}

/// Write the record for a package.
pub fn write_record<W: Write>(
    writer: &mut Writer<W>,
    kind: XmlPackage,
    package: &PackageMeta,
) -> Result<()> {
    match kind {
        XmlPackage::Primary => write_primary(writer, package),
        XmlPackage::Other => write_other(writer, package),
        XmlPackage::Filelists => write_filelists(writer, package),
    }
}

fn write_version<W: Write>(writer: &mut Writer<W>, package: &PackageMeta) -> Result<()> {
    let epoch = package.epoch.to_string();

    let mut version = BytesStart::new("version");
    version.push_attribute(("epoch", epoch.as_str()));
    version.push_attribute(("ver", package.version.as_str()));
    version.push_attribute(("rel", package.release.as_str()));
    writer.write_event(Event::Empty(version))?;

    Ok(())
}

/// Opening `<package>` tag of the other and filelists layouts.
fn identity_start(package: &PackageMeta) -> BytesStart<'static> {
    let mut start = BytesStart::new("package");
    start.push_attribute(("pkgid", package.pkgid().as_str()));
    start.push_attribute(("name", package.name.as_str()));
    start.push_attribute(("arch", package.arch.as_str()));

    start
}

fn write_primary<W: Write>(writer: &mut Writer<W>, package: &PackageMeta) -> Result<()> {
    let mut start = BytesStart::new("package");
    start.push_attribute(("type", "rpm"));
    writer.write_event(Event::Start(start))?;

    write_text_element(writer, "name", &package.name)?;
    write_text_element(writer, "arch", &package.arch)?;
    write_version(writer, package)?;

    let mut checksum = BytesStart::new("checksum");
    checksum.push_attribute(("type", package.checksum.algorithm().xml_name()));
    checksum.push_attribute(("pkgid", "YES"));
    writer.write_event(Event::Start(checksum))?;
    writer.write_event(Event::Text(BytesText::new(&package.pkgid())))?;
    writer.write_event(Event::End(BytesEnd::new("checksum")))?;

    write_text_element(writer, "summary", &package.summary)?;
    write_text_element(writer, "description", &package.description)?;
    write_text_element(writer, "packager", &package.packager)?;
    write_text_element(writer, "url", &package.url)?;

    let (time_file, time_build) = (package.time_file.to_string(), package.time_build.to_string());
    let mut time = BytesStart::new("time");
    time.push_attribute(("file", time_file.as_str()));
    time.push_attribute(("build", time_build.as_str()));
    writer.write_event(Event::Empty(time))?;

    let sizes = [
        ("package", package.size_package.to_string()),
        ("installed", package.size_installed.to_string()),
        ("archive", package.size_archive.to_string()),
    ];
    let mut size = BytesStart::new("size");
    for (key, value) in &sizes {
        size.push_attribute((*key, value.as_str()));
    }
    writer.write_event(Event::Empty(size))?;

    let mut location = BytesStart::new("location");
    location.push_attribute(("href", package.location.as_str()));
    writer.write_event(Event::Empty(location))?;

    writer.write_event(Event::Start(BytesStart::new("format")))?;

    write_text_element(writer, "rpm:license", &package.license)?;
    write_text_element(writer, "rpm:vendor", &package.vendor)?;
    write_text_element(writer, "rpm:group", &package.group)?;
    write_text_element(writer, "rpm:buildhost", &package.build_host)?;
    write_text_element(writer, "rpm:sourcerpm", &package.source_rpm)?;

    let (header_start, header_end) = (package.header_start.to_string(), package.header_end.to_string());
    let mut range = BytesStart::new("rpm:header-range");
    range.push_attribute(("start", header_start.as_str()));
    range.push_attribute(("end", header_end.as_str()));
    writer.write_event(Event::Empty(range))?;

    write_dependencies(writer, "rpm:provides", &dedupe(&package.provides), false)?;
    write_dependencies(writer, "rpm:requires", &filter_requires(&package.requires), true)?;
    write_dependencies(writer, "rpm:obsoletes", &package.obsoletes, false)?;
    write_dependencies(writer, "rpm:conflicts", &package.conflicts, false)?;

    for (path, is_dir) in listed_files(package) {
        if is_primary_file(path) {
            write_file(writer, path, is_dir)?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("format")))?;
    writer.write_event(Event::End(BytesEnd::new("package")))?;

    Ok(())
}

fn write_other<W: Write>(writer: &mut Writer<W>, package: &PackageMeta) -> Result<()> {
    writer.write_event(Event::Start(identity_start(package)))?;
    write_version(writer, package)?;

    for text in &package.changelog {
        let entry = match ChangelogEntry::from_str(text) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{}: skipping changelog entry: {}", package.location, e);
                continue;
            }
        };

        let date = entry.date.to_string();
        let mut changelog = BytesStart::new("changelog");
        changelog.push_attribute(("author", entry.author.as_str()));
        changelog.push_attribute(("date", date.as_str()));
        writer.write_event(Event::Start(changelog))?;
        writer.write_event(Event::Text(BytesText::new(&entry.content)))?;
        writer.write_event(Event::End(BytesEnd::new("changelog")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("package")))?;

    Ok(())
}

fn write_filelists<W: Write>(writer: &mut Writer<W>, package: &PackageMeta) -> Result<()> {
    writer.write_event(Event::Start(identity_start(package)))?;
    write_version(writer, package)?;

    for (path, is_dir) in listed_files(package) {
        write_file(writer, path, is_dir)?;
    }

    writer.write_event(Event::End(BytesEnd::new("package")))?;

    Ok(())
}

fn write_file<W: Write>(writer: &mut Writer<W>, path: &str, is_dir: bool) -> Result<()> {
    let mut file = BytesStart::new("file");
    if is_dir {
        file.push_attribute(("type", "dir"));
    }
    writer.write_event(Event::Start(file))?;
    writer.write_event(Event::Text(BytesText::new(path)))?;
    writer.write_event(Event::End(BytesEnd::new("file")))?;

    Ok(())
}

fn write_dependencies<W: Write>(
    writer: &mut Writer<W>,
    section: &str,
    entries: &[Dependency],
    with_pre: bool,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    writer.write_event(Event::Start(BytesStart::new(section)))?;

    for dep in entries {
        let mut entry = BytesStart::new("rpm:entry");
        entry.push_attribute(("name", dep.name.as_str()));

        if let Some(flags) = dep.flags {
            entry.push_attribute(("flags", flags.as_str()));

            if let Some(epoch) = &dep.epoch {
                entry.push_attribute(("epoch", epoch.as_str()));
            }
            if let Some(version) = &dep.version {
                entry.push_attribute(("ver", version.as_str()));
            }
            if let Some(release) = &dep.release {
                entry.push_attribute(("rel", release.as_str()));
            }
        }

        if with_pre && dep.pre {
            entry.push_attribute(("pre", "1"));
        }

        writer.write_event(Event::Empty(entry))?;
    }

    writer.write_event(Event::End(BytesEnd::new(section)))?;

    Ok(())
}

/// Files of a package that appear in the indices, paired with whether they are directories.
///
/// Entries with an empty base name or a base name starting with `.` are not listed.
/// A path is a directory when the path followed by `/` is one of the package's
/// directory names.
pub fn listed_files(package: &PackageMeta) -> impl Iterator<Item = (&str, bool)> {
    let dirnames = package
        .dirnames
        .iter()
        .map(|s| s.as_str())
        .collect::<HashSet<_>>();

    package.files.iter().filter_map(move |path| {
        let basename = path.rsplit('/').next().unwrap_or_default();

        if basename.is_empty() || basename.starts_with('.') {
            None
        } else {
            let is_dir = dirnames.contains(format!("{}/", path).as_str());
            Some((path.as_str(), is_dir))
        }
    })
}

/// Whether a file is listed in the primary index in addition to filelists.
fn is_primary_file(path: &str) -> bool {
    path.starts_with("/etc/") || path.contains("bin/") || path == "/usr/lib/sendmail"
}

/// Drop exact duplicates, preserving order.
fn dedupe(entries: &[Dependency]) -> Vec<Dependency> {
    let mut res: Vec<Dependency> = Vec::with_capacity(entries.len());

    for dep in entries {
        if !res.contains(dep) {
            res.push(dep.clone());
        }
    }

    res
}

/// Normalize `requires` entries for the primary index.
///
/// * `rpmlib(...)` and `config(...)` entries are dropped.
/// * Entries with the same name, version and pre marker are collapsed into the
///   first. Entries differing in any of them are kept.
/// * A versioned entry lacking flags reuses the flags of an earlier entry of the
///   same name, falling back to `EQ`.
/// * All `libc.so.*` entries collapse into the greatest of them, at the position of
///   the first.
pub fn filter_requires(entries: &[Dependency]) -> Vec<Dependency> {
    let mut res: Vec<Dependency> = Vec::with_capacity(entries.len());
    let mut libc: Option<usize> = None;

    for dep in entries {
        if dep.name.starts_with("rpmlib(") || dep.name.starts_with("config(") {
            continue;
        }

        if dep.name.starts_with("libc.so.") {
            match libc {
                Some(index) => {
                    if compare_versions(&dep.name, &res[index].name) == Ordering::Greater {
                        res[index] = dep.clone();
                    }
                }
                None => {
                    libc = Some(res.len());
                    res.push(dep.clone());
                }
            }
            continue;
        }

        if res.iter().any(|other| {
            other.name == dep.name && other.pre == dep.pre && other.version == dep.version
        }) {
            continue;
        }

        let mut dep = dep.clone();
        if dep.version.is_some() && dep.flags.is_none() {
            dep.flags = Some(
                res.iter()
                    .rev()
                    .find_map(|other| other.flags.filter(|_| other.name == dep.name))
                    .unwrap_or(DependencyFlag::Eq),
            );
        }

        res.push(dep);
    }

    res
}

/// Compare two version-like strings segment by segment.
///
/// Runs of digits compare numerically and rank above runs of letters. Other
/// characters only separate segments.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let segments = |s: &str| -> Vec<String> {
        let mut res = vec![];
        let mut current = String::new();

        for c in s.chars() {
            let same_class = current
                .chars()
                .last()
                .map(|last| last.is_ascii_digit() == c.is_ascii_digit())
                .unwrap_or(true);

            if !c.is_ascii_alphanumeric() || !same_class {
                if !current.is_empty() {
                    res.push(std::mem::take(&mut current));
                }
            }
            if c.is_ascii_alphanumeric() {
                current.push(c);
            }
        }
        if !current.is_empty() {
            res.push(current);
        }

        res
    };

    let (a, b) = (segments(a), segments(b));

    for (x, y) in a.iter().zip(b.iter()) {
        let x_digit = x.chars().all(|c| c.is_ascii_digit());
        let y_digit = y.chars().all(|c| c.is_ascii_digit());

        let ordering = match (x_digit, y_digit) {
            (true, true) => {
                let x = x.trim_start_matches('0');
                let y = y.trim_start_matches('0');
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => x.cmp(y),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a.len().cmp(&b.len())
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        crate::io::DigestAlgorithm,
    };

    pub fn sample_package(name: &str, location: &str) -> PackageMeta {
        PackageMeta {
            name: name.to_string(),
            arch: "x86_64".to_string(),
            epoch: 0,
            version: "1.0".to_string(),
            release: "1".to_string(),
            summary: format!("{} summary", name),
            description: "A <sample> package".to_string(),
            packager: "Packager".to_string(),
            url: "https://example.org".to_string(),
            license: "MIT".to_string(),
            vendor: String::new(),
            group: "Unspecified".to_string(),
            build_host: "builder".to_string(),
            source_rpm: format!("{}-1.0-1.src.rpm", name),
            time_file: 1,
            time_build: 2,
            size_package: 3,
            size_installed: 4,
            size_archive: 5,
            header_start: 280,
            header_end: 1000,
            checksum: DigestAlgorithm::Sha256.digest_bytes(location.as_bytes()),
            location: location.to_string(),
            provides: vec![Dependency::with_evr(name, DependencyFlag::Eq, "1.0-1")],
            requires: vec![Dependency::new("/bin/sh")],
            obsoletes: vec![],
            conflicts: vec![],
            files: vec![
                "/usr/bin/tool".to_string(),
                "/usr/share/doc/tool".to_string(),
                "/usr/share/doc/tool/README".to_string(),
            ],
            dirnames: vec!["/usr/bin/".to_string(), "/usr/share/doc/tool/".to_string()],
            changelog: vec!["* Wed May 13 2020 John Doe <jd@example.org> - 1.0-1\n- Initial".to_string()],
        }
    }

    fn render_str(kind: XmlPackage, package: &PackageMeta) -> Result<String> {
        Ok(String::from_utf8_lossy(&render_record(kind, package)?).to_string())
    }

    #[test]
    fn primary_record() -> Result<()> {
        let package = sample_package("tool", "tool-1.0-1.x86_64.rpm");
        let xml = render_str(XmlPackage::Primary, &package)?;

        assert!(xml.starts_with("<package type=\"rpm\">\n  <name>tool</name>\n"));
        assert!(xml.contains("  <version epoch=\"0\" ver=\"1.0\" rel=\"1\"/>\n"));
        assert!(xml.contains(&format!(
            "<checksum type=\"sha256\" pkgid=\"YES\">{}</checksum>",
            package.pkgid()
        )));
        assert!(xml.contains("<description>A &lt;sample&gt; package</description>"));
        assert!(xml.contains("<rpm:vendor></rpm:vendor>"));
        assert!(xml.contains("<location href=\"tool-1.0-1.x86_64.rpm\"/>"));
        assert!(xml.contains("<rpm:header-range start=\"280\" end=\"1000\"/>"));
        assert!(xml.contains("<rpm:entry name=\"tool\" flags=\"EQ\" epoch=\"0\" ver=\"1.0\" rel=\"1\"/>"));
        assert!(xml.contains("<rpm:entry name=\"/bin/sh\"/>"));
        assert!(xml.contains("<file>/usr/bin/tool</file>"));
        assert!(!xml.contains("README"));
        assert!(!xml.contains("rpm:obsoletes"));
        assert!(xml.ends_with("</format>\n</package>"));

        Ok(())
    }

    #[test]
    fn filelists_record() -> Result<()> {
        let mut package = sample_package("tool", "tool.rpm");
        package.files.push("/etc/tool/.hidden".to_string());
        package.files.push("/".to_string());

        let xml = render_str(XmlPackage::Filelists, &package)?;

        assert!(xml.starts_with(&format!(
            "<package pkgid=\"{}\" name=\"tool\" arch=\"x86_64\">",
            package.pkgid()
        )));
        assert!(xml.contains("<file>/usr/bin/tool</file>"));
        assert!(xml.contains("<file type=\"dir\">/usr/share/doc/tool</file>"));
        assert!(xml.contains("<file>/usr/share/doc/tool/README</file>"));
        assert!(!xml.contains(".hidden"));
        assert!(!xml.contains("<file>/</file>"));

        Ok(())
    }

    #[test]
    fn other_record() -> Result<()> {
        let mut package = sample_package("tool", "tool.rpm");
        package.changelog.push("garbage".to_string());

        let xml = render_str(XmlPackage::Other, &package)?;

        assert!(xml.contains(
            "<changelog author=\"John Doe &lt;jd@example.org&gt;\" date=\"1589328000\">1.0-1\n- Initial</changelog>"
        ));
        assert_eq!(xml.matches("<changelog").count(), 1);

        Ok(())
    }

    #[test]
    fn requires_filtering() {
        let entries = vec![
            Dependency::with_evr("rpmlib(CompressedFileNames)", DependencyFlag::Le, "3.0.4-1"),
            Dependency::new("config(tool)"),
            Dependency::with_evr("libfoo", DependencyFlag::Ge, "1.0"),
            Dependency::new("libfoo"),
            Dependency::with_evr("libfoo", DependencyFlag::Ge, "1.0"),
            Dependency::new("libc.so.6(GLIBC_2.17)(64bit)"),
            Dependency::new("/bin/sh").pre(),
            Dependency::new("libc.so.6(GLIBC_2.28)(64bit)"),
            Dependency::new("libc.so.6(GLIBC_2.3)(64bit)"),
            Dependency {
                version: Some("2.0".to_string()),
                ..Dependency::new("libfoo")
            },
            Dependency::new("/bin/sh").pre(),
        ];

        let res = filter_requires(&entries);
        let names = res.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();

        assert_eq!(
            names,
            vec!["libfoo", "libfoo", "libc.so.6(GLIBC_2.28)(64bit)", "/bin/sh", "libfoo"]
        );
        assert_eq!(res[0].flags, Some(DependencyFlag::Ge));
        assert_eq!(res[1].version, None);
        assert_eq!(res[1].flags, None);
        assert_eq!(res[4].flags, Some(DependencyFlag::Ge));
        assert_eq!(res[4].version.as_deref(), Some("2.0"));
        assert!(res[3].pre);
    }

    #[test]
    fn requires_unflagged_version_defaults_to_eq() {
        let res = filter_requires(&[Dependency {
            version: Some("3".to_string()),
            ..Dependency::new("libbar")
        }]);

        assert_eq!(res[0].flags, Some(DependencyFlag::Eq));
    }

    #[test]
    fn version_comparison() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.28", "2.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.0a", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1a", "12"), Ordering::Less);
        assert_eq!(compare_versions("001", "1"), Ordering::Equal);
    }
}
