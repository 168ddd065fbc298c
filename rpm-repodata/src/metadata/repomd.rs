// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `repomd.xml` file format.

[RepoMd] is the parsed form of a manifest. [write_repomd()] produces a new
manifest from an existing one without disturbing entries it doesn't manage.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ContentDigest, DigestAlgorithm},
        xml::{is_whitespace, write_text_element, xml_reader, XML_NS_REPO, XML_NS_RPM},
    },
    quick_xml::{
        events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
        Writer,
    },
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        io::{BufRead, Read, Write},
        str::FromStr,
    },
};

/// A `repomd.xml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMd {
    /// Revision of the repository.
    ///
    /// Often an integer-like value.
    pub revision: String,
    /// Describes additional primary data files constituting this repository.
    pub data: Vec<RepoMdData>,
}

impl RepoMd {
    /// Construct an instance by parsing XML from a reader.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_xml_rs::from_reader(reader)?)
    }

    /// Construct an instance by parsing XML from a string.
    pub fn from_xml(s: &str) -> Result<Self> {
        Ok(serde_xml_rs::from_str(s)?)
    }

    /// Find the entry of a data type.
    pub fn find(&self, data_type: &str) -> Option<&RepoMdData> {
        self.data.iter().find(|entry| entry.data_type == data_type)
    }
}

/// A `<data>` element in a `repomd.xml` file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RepoMdData {
    /// The type of data.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Content checksum of this file.
    pub checksum: Checksum,
    /// Where the file is located.
    pub location: Location,
    /// Size in bytes of the file as stored in the repository.
    pub size: Option<u64>,
    /// Time file was created/modified.
    pub timestamp: Option<u64>,
    /// Content checksum of the decoded (often decompressed) file.
    #[serde(rename = "open-checksum")]
    pub open_checksum: Option<Checksum>,
    /// Size in bytes of the decoded (often decompressed) file.
    #[serde(rename = "open-size")]
    pub open_size: Option<u64>,
    /// Content checksum of header data.
    #[serde(rename = "header-checksum")]
    pub header_checksum: Option<Checksum>,
    /// Size in bytes of the header.
    #[serde(rename = "header-size")]
    pub header_size: Option<u64>,
}

/// The content checksum of a `<data>` element.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checksum {
    /// The name of the content digest.
    #[serde(rename = "type")]
    pub name: String,
    /// The hex encoded content digest.
    #[serde(rename = "$value")]
    pub value: String,
}

impl TryFrom<Checksum> for ContentDigest {
    type Error = RpmRepositoryError;

    fn try_from(v: Checksum) -> std::result::Result<Self, Self::Error> {
        ContentDigest::from_hex_digest(DigestAlgorithm::from_str(&v.name)?, &v.value)
    }
}

/// The location of a `<data>` element.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Location {
    pub href: String,
}

/// Describes a metadata file to be listed in a new manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataEntry {
    /// Value of the `type` attribute. e.g. `primary`.
    pub data_type: String,
    /// Digest of the file as stored.
    pub checksum: ContentDigest,
    /// Digest of the decompressed file.
    pub open_checksum: ContentDigest,
    /// Repository relative location of the file.
    pub location: String,
    pub timestamp: u64,
    /// Size of the file as stored.
    pub size: u64,
    /// Size of the decompressed file.
    pub open_size: u64,
}

impl DataEntry {
    fn write<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut data = BytesStart::new("data");
        data.push_attribute(("type", self.data_type.as_str()));
        writer.write_event(Event::Start(data))?;

        for (name, digest) in [
            ("checksum", &self.checksum),
            ("open-checksum", &self.open_checksum),
        ] {
            let mut checksum = BytesStart::new(name);
            checksum.push_attribute(("type", digest.algorithm().xml_name()));
            writer.write_event(Event::Start(checksum))?;
            writer.write_event(Event::Text(BytesText::new(&digest.digest_hex())))?;
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }

        let mut location = BytesStart::new("location");
        location.push_attribute(("href", self.location.as_str()));
        writer.write_event(Event::Empty(location))?;

        write_text_element(writer, "timestamp", &self.timestamp.to_string())?;
        write_text_element(writer, "size", &self.size.to_string())?;
        write_text_element(writer, "open-size", &self.open_size.to_string())?;

        writer.write_event(Event::End(BytesEnd::new("data")))?;

        Ok(())
    }

    /// Render as an indented `<data>` element nested one level in `<repomd>`.
    fn render(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write(&mut writer)?;

        let mut res = vec![];
        for line in writer.into_inner().split(|b| *b == b'\n') {
            res.extend_from_slice(b"  ");
            res.extend_from_slice(line);
            res.push(b'\n');
        }

        Ok(res)
    }
}

fn data_type(element: &BytesStart) -> Result<Option<String>> {
    crate::xml::attribute_value(element, "type")
}

/// Write a `repomd.xml` manifest.
///
/// When `existing` is given, its content is carried over except for `<data>` entries
/// whose type is in `entries` or `removed`, and the text of `<revision>`. New entries
/// are appended before `</repomd>` in the order given.
pub fn write_repomd<R: BufRead, W: Write>(
    existing: Option<R>,
    output: W,
    revision: &str,
    entries: &[DataEntry],
    removed: &[&str],
) -> Result<()> {
    let mut writer = Writer::new(output);

    let rendered = entries
        .iter()
        .map(|entry| entry.render())
        .collect::<Result<Vec<_>>>()?;

    let existing = if let Some(existing) = existing {
        existing
    } else {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

        let mut root = BytesStart::new("repomd");
        root.push_attribute(("xmlns", XML_NS_REPO));
        root.push_attribute(("xmlns:rpm", XML_NS_RPM));
        writer.write_event(Event::Start(root))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n  ")))?;
        write_text_element(&mut writer, "revision", revision)?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

        for data in &rendered {
            writer.get_mut().write_all(data)?;
        }

        writer.write_event(Event::End(BytesEnd::new("repomd")))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
        writer.into_inner().flush()?;

        return Ok(());
    };

    let replaced = entries
        .iter()
        .map(|entry| entry.data_type.as_str())
        .chain(removed.iter().copied())
        .collect::<HashSet<_>>();

    let mut reader = xml_reader(existing);
    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    let mut in_revision = false;
    let mut pending_whitespace: Option<Event<'static>> = None;
    let mut closed = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;

        if let Event::Eof = event {
            break;
        }

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                _ => {}
            }
            buf.clear();
            continue;
        }

        let dropped = match &event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"data" => data_type(e)?
                .map(|t| replaced.contains(t.as_str()))
                .unwrap_or(false),
            _ => false,
        };

        if dropped {
            if let Event::Start(_) = event {
                skip_depth = 1;
            }
            pending_whitespace = None;
            buf.clear();
            continue;
        }

        match event {
            Event::Start(e) if e.name().as_ref() == b"revision" => {
                in_revision = true;
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                writer.write_event(Event::Start(e))?;
                writer.write_event(Event::Text(BytesText::new(revision)))?;
            }
            Event::End(e) if e.name().as_ref() == b"revision" => {
                in_revision = false;
                writer.write_event(Event::End(e))?;
            }
            _ if in_revision => {}
            Event::End(e) if e.name().as_ref() == b"repomd" => {
                closed = true;
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                for data in &rendered {
                    writer.get_mut().write_all(data)?;
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Text(t) if is_whitespace(&t) => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                pending_whitespace = Some(Event::Text(t.into_owned()));
            }
            event => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                writer.write_event(event)?;
            }
        }

        buf.clear();
    }

    if let Some(ws) = pending_whitespace.take() {
        writer.write_event(ws)?;
    }

    if !closed {
        return Err(RpmRepositoryError::MalformedIndex(
            "repomd",
            "missing </repomd>".to_string(),
        ));
    }

    writer.into_inner().flush()?;

    Ok(())
}
