// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Attribute patching of finished documents. */

use {
    crate::{error::Result, xml::xml_reader},
    quick_xml::{
        events::{BytesStart, Event},
        Writer,
    },
    std::io::{BufRead, Write},
};

/// Copy of `element` with the value of `attribute` replaced.
///
/// Returns [None] if the element has no such attribute. Other attributes keep their
/// original (escaped) form.
fn replace_attribute(
    element: &BytesStart,
    attribute: &str,
    value: &str,
) -> Result<Option<BytesStart<'static>>> {
    let mut res = element.clone().into_owned();
    res.clear_attributes();

    let mut found = false;

    for attr in element.attributes() {
        let attr = attr?;

        if attr.key.as_ref() == attribute.as_bytes() {
            res.push_attribute((attribute, value));
            found = true;
        } else {
            res.push_attribute(attr);
        }
    }

    Ok(if found { Some(res) } else { None })
}

/// Copy a document, replacing an attribute value on the first element named `tag`.
///
/// All other content is copied unchanged. If the first `tag` element lacks
/// `attribute`, or there is no such element, the document is copied unchanged.
///
/// Returns whether an attribute was replaced.
pub fn patch_attribute<R: BufRead, W: Write>(
    input: R,
    output: W,
    tag: &str,
    attribute: &str,
    value: &str,
) -> Result<bool> {
    let mut reader = xml_reader(input);
    let mut writer = Writer::new(output);
    let mut buf = Vec::new();
    let mut visited = false;
    let mut patched = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;

        if let Event::Eof = event {
            break;
        }

        let replacement = match &event {
            Event::Start(e) | Event::Empty(e) if !visited && e.name().as_ref() == tag.as_bytes() => {
                visited = true;
                replace_attribute(e, attribute, value)?
            }
            _ => None,
        };

        match (replacement, event) {
            (Some(replaced), Event::Start(_)) => {
                patched = true;
                writer.write_event(Event::Start(replaced))?;
            }
            (Some(replaced), Event::Empty(_)) => {
                patched = true;
                writer.write_event(Event::Empty(replaced))?;
            }
            (_, event) => writer.write_event(event)?,
        }

        buf.clear();
    }

    writer.into_inner().flush()?;

    Ok(patched)
}
