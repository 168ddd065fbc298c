// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Streaming transforms over repository index XML.

The index files (`primary.xml`, `other.xml` and `filelists.xml`) can be very
large. Everything in this module operates on them as event streams: an
existing document is read one event at a time, `<package>` elements are
buffered individually while a decision about them is made, and output is
written as soon as it is known.

* [event] renders [crate::package::PackageMeta] into `<package>` records.
* [merge] combines an existing index with new packages.
* [maid] removes packages from an existing index.
* [alter] patches the `packages` count attribute of a finished document.
*/

pub mod alter;
pub mod event;
pub mod maid;
pub mod merge;

use {
    crate::error::{Result, RpmRepositoryError},
    quick_xml::{
        events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
        Reader, Writer,
    },
    std::io::{BufRead, Write},
};

pub const XML_NS_COMMON: &str = "http://linux.duke.edu/metadata/common";
pub const XML_NS_FILELISTS: &str = "http://linux.duke.edu/metadata/filelists";
pub const XML_NS_OTHER: &str = "http://linux.duke.edu/metadata/other";
pub const XML_NS_REPO: &str = "http://linux.duke.edu/metadata/repo";
pub const XML_NS_RPM: &str = "http://linux.duke.edu/metadata/rpm";

/// Name of the attribute on index roots holding the number of packages.
pub const PACKAGES_ATTRIBUTE: &str = "packages";

/// Count written into index roots before the real count is known.
pub const PLACEHOLDER_COUNT: &str = "-1";

pub(crate) const TAG_PACKAGE: &[u8] = b"package";

/// The kinds of package index documents.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum XmlPackage {
    Primary,
    Other,
    Filelists,
}

impl XmlPackage {
    /// Every kind, primary first.
    pub const ALL: [XmlPackage; 3] = [Self::Primary, Self::Other, Self::Filelists];

    /// Name of the root element.
    pub fn root_tag(&self) -> &'static str {
        match self {
            Self::Primary => "metadata",
            Self::Other => "otherdata",
            Self::Filelists => "filelists",
        }
    }

    /// Namespace declarations carried by the root element.
    pub fn namespaces(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Primary => &[("xmlns", XML_NS_COMMON), ("xmlns:rpm", XML_NS_RPM)],
            Self::Other => &[("xmlns", XML_NS_OTHER)],
            Self::Filelists => &[("xmlns", XML_NS_FILELISTS)],
        }
    }

    /// Value of the `type` attribute of this kind's `<data>` entry in `repomd.xml`.
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Other => "other",
            Self::Filelists => "filelists",
        }
    }

    /// Plain file name of the uncompressed document.
    pub fn filename(&self) -> String {
        format!("{}.xml", self.data_type())
    }

    /// Resolve a kind from its `repomd.xml` data type.
    pub fn from_data_type(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.data_type() == value)
    }
}

impl std::fmt::Display for XmlPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.data_type())
    }
}

/// Construct an event reader that preserves all whitespace.
pub(crate) fn xml_reader<R: BufRead>(input: R) -> Reader<R> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(false);
    reader.expand_empty_elements(false);

    reader
}

/// Obtain the unescaped value of an attribute on an element.
pub(crate) fn attribute_value(element: &BytesStart, key: &str) -> Result<Option<String>> {
    Ok(match element.try_get_attribute(key)? {
        Some(attr) => Some(attr.unescape_value()?.into_owned()),
        None => None,
    })
}

/// Whether a text event consists only of whitespace.
pub(crate) fn is_whitespace(text: &BytesText) -> bool {
    text.iter().all(|b| b.is_ascii_whitespace())
}

/// Write `<name>text</name>`.
pub(crate) fn write_text_element<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;

    Ok(())
}

/// Write the XML declaration and the opening root element of an index document.
pub(crate) fn write_document_start<W: Write>(
    writer: &mut Writer<W>,
    kind: XmlPackage,
    count: &str,
) -> Result<()> {
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

    let mut root = BytesStart::new(kind.root_tag());
    for (key, value) in kind.namespaces() {
        root.push_attribute((*key, *value));
    }
    root.push_attribute((PACKAGES_ATTRIBUTE, count));

    writer.write_event(Event::Start(root))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

    Ok(())
}

/// Write the closing root element of an index document.
pub(crate) fn write_document_end<W: Write>(writer: &mut Writer<W>, kind: XmlPackage) -> Result<()> {
    writer.write_event(Event::End(BytesEnd::new(kind.root_tag())))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

    Ok(())
}

/// Decides the fate of `<package>` elements of an existing document.
///
/// Implementations see the opening tag, then every nested event, and finally decide
/// whether the buffered element is emitted.
pub(crate) trait RecordFilter {
    /// Called with the opening `<package>` tag.
    fn start(&mut self, element: &BytesStart) -> Result<()>;

    /// Called with every event nested in the current `<package>`.
    fn observe(&mut self, event: &Event) -> Result<()>;

    /// Called on `</package>`. Returns whether the element is kept.
    fn finish(&mut self) -> Result<bool>;
}

/// Classification of a read event relative to the document structure.
enum Position {
    RecordStart,
    RecordEmpty,
    RecordEnd,
    RootStart,
    RootEmpty,
    RootEnd,
    Whitespace,
    Other,
}

fn classify(event: &Event, root: &[u8], in_record: bool) -> Position {
    match event {
        Event::Start(e) if !in_record && e.name().as_ref() == TAG_PACKAGE => Position::RecordStart,
        Event::Empty(e) if !in_record && e.name().as_ref() == TAG_PACKAGE => Position::RecordEmpty,
        Event::End(e) if in_record && e.name().as_ref() == TAG_PACKAGE => Position::RecordEnd,
        _ if in_record => Position::Other,
        Event::Start(e) if e.name().as_ref() == root => Position::RootStart,
        Event::Empty(e) if e.name().as_ref() == root => Position::RootEmpty,
        Event::End(e) if e.name().as_ref() == root => Position::RootEnd,
        Event::Text(t) if is_whitespace(t) => Position::Whitespace,
        _ => Position::Other,
    }
}

/// Stream an existing index document through a [RecordFilter].
///
/// Kept `<package>` elements are re-emitted byte for byte. Whitespace preceding a
/// dropped element is dropped with it. Immediately before the closing root tag,
/// `append` is called to write additional content; it returns how many records
/// it wrote.
///
/// Returns `(kept, appended)`.
pub(crate) fn filter_records<R, W, F, A>(
    kind: XmlPackage,
    input: R,
    writer: &mut Writer<W>,
    filter: &mut F,
    append: A,
) -> Result<(usize, usize)>
where
    R: BufRead,
    W: Write,
    F: RecordFilter,
    A: FnOnce(&mut Writer<W>) -> Result<usize>,
{
    let root = kind.root_tag().as_bytes();
    let mut reader = xml_reader(input);
    let mut buf = Vec::new();

    let mut record: Vec<Event<'static>> = Vec::new();
    let mut in_record = false;
    let mut pending_whitespace: Option<Event<'static>> = None;
    let mut kept = 0;
    let mut appended = None;
    let mut append = Some(append);
    let mut seen_root = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;

        if let Event::Eof = event {
            break;
        }

        match classify(&event, root, in_record) {
            Position::RecordStart => {
                if let Event::Start(e) = &event {
                    filter.start(e)?;
                }
                record.push(event.into_owned());
                in_record = true;
            }
            Position::RecordEmpty => {
                if let Event::Empty(e) = &event {
                    filter.start(e)?;
                }
                record.push(event.into_owned());

                if filter.finish()? {
                    if let Some(ws) = pending_whitespace.take() {
                        writer.write_event(ws)?;
                    }
                    for event in record.drain(..) {
                        writer.write_event(event)?;
                    }
                    kept += 1;
                } else {
                    pending_whitespace = None;
                    record.clear();
                }
            }
            Position::RecordEnd => {
                record.push(event.into_owned());
                in_record = false;

                if filter.finish()? {
                    if let Some(ws) = pending_whitespace.take() {
                        writer.write_event(ws)?;
                    }
                    for event in record.drain(..) {
                        writer.write_event(event)?;
                    }
                    kept += 1;
                } else {
                    pending_whitespace = None;
                    record.clear();
                }
            }
            Position::Other if in_record => {
                filter.observe(&event)?;
                record.push(event.into_owned());
            }
            Position::RootStart => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                seen_root = true;
                writer.write_event(event)?;
            }
            Position::RootEmpty => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                seen_root = true;

                if let Event::Empty(e) = event {
                    let end = e.to_end().into_owned();
                    writer.write_event(Event::Start(e))?;
                    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;

                    if let Some(append) = append.take() {
                        appended = Some(append(writer)?);
                    }
                    writer.write_event(Event::End(end))?;
                }
            }
            Position::RootEnd => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                if let Some(append) = append.take() {
                    appended = Some(append(writer)?);
                }
                writer.write_event(event)?;
            }
            Position::Whitespace => {
                if let Some(ws) = pending_whitespace.take() {
                    writer.write_event(ws)?;
                }
                pending_whitespace = Some(event.into_owned());
            }
            Position::Other => {
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

    if in_record {
        return Err(RpmRepositoryError::MalformedIndex(
            kind.data_type(),
            "document ends inside a <package> element".to_string(),
        ));
    }

    match appended {
        Some(appended) if seen_root => Ok((kept, appended)),
        _ => Err(RpmRepositoryError::MalformedIndex(
            kind.data_type(),
            format!("missing <{}> root element", kind.root_tag()),
        )),
    }
}

/// Write pre-rendered records, each followed by a newline.
pub(crate) fn write_rendered<W: Write>(writer: &mut Writer<W>, records: &[Vec<u8>]) -> Result<usize> {
    for record in records {
        writer.get_mut().write_all(record)?;
        writer.get_mut().write_all(b"\n")?;
    }

    Ok(records.len())
}


#[cfg(test)]
mod test {
    use {
        super::*,
        super::test_support::{OTHER_TWO, PRIMARY_TWO},
    };

    struct KeepAll;

    impl RecordFilter for KeepAll {
        fn start(&mut self, _: &BytesStart) -> Result<()> {
            Ok(())
        }

        fn observe(&mut self, _: &Event) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    fn keep_all(kind: XmlPackage, document: &str) -> Result<(String, usize)> {
        let mut writer = Writer::new(Vec::new());
        let (kept, _) = filter_records(kind, document.as_bytes(), &mut writer, &mut KeepAll, |_| Ok(0))?;

        Ok((String::from_utf8_lossy(&writer.into_inner()).to_string(), kept))
    }

    #[test]
    fn filter_preserves_document() -> Result<()> {
        assert_eq!(keep_all(XmlPackage::Primary, PRIMARY_TWO)?, (PRIMARY_TWO.to_string(), 2));
        assert_eq!(keep_all(XmlPackage::Other, OTHER_TWO)?, (OTHER_TWO.to_string(), 2));

        Ok(())
    }

    #[test]
    fn filter_expands_empty_root() -> Result<()> {
        let (xml, kept) = keep_all(
            XmlPackage::Other,
            "<?xml version=\"1.0\"?>\n<otherdata packages=\"0\"/>\n",
        )?;

        assert_eq!(kept, 0);
        assert_eq!(
            xml,
            "<?xml version=\"1.0\"?>\n<otherdata packages=\"0\">\n</otherdata>\n"
        );

        Ok(())
    }

    #[test]
    fn kind_properties() {
        assert_eq!(XmlPackage::Primary.root_tag(), "metadata");
        assert_eq!(XmlPackage::Other.root_tag(), "otherdata");
        assert_eq!(XmlPackage::Filelists.root_tag(), "filelists");
        assert_eq!(XmlPackage::Filelists.filename(), "filelists.xml");
        assert_eq!(XmlPackage::from_data_type("other"), Some(XmlPackage::Other));
        assert_eq!(XmlPackage::from_data_type("updateinfo"), None);
        assert_eq!(XmlPackage::Primary.namespaces().len(), 2);
    }

    #[test]
    fn document_start() -> Result<()> {
        let mut writer = Writer::new(Vec::new());
        write_document_start(&mut writer, XmlPackage::Filelists, PLACEHOLDER_COUNT)?;
        write_document_end(&mut writer, XmlPackage::Filelists)?;

        assert_eq!(
            String::from_utf8_lossy(&writer.into_inner()),
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                "<filelists xmlns=\"http://linux.duke.edu/metadata/filelists\" packages=\"-1\">\n",
                "</filelists>\n"
            )
        );

        Ok(())
    }
}
