//! Event-stream plumbing shared by the XML editors.
//!
//! Documents are rewritten by replaying every event from the reader into a
//! writer and splicing new events in at the right spots, so untouched markup
//! keeps its original bytes.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{PatcherError, Result};

pub(crate) struct Rewriter<'a> {
    reader: Reader<&'a [u8]>,
    writer: Writer<Vec<u8>>,
    context: &'static str,
    /// Whitespace-only text most recently written, used to indent insertions.
    trailing_ws: Option<String>,
}

impl<'a> Rewriter<'a> {
    pub fn new(xml: &'a str, context: &'static str) -> Self {
        Self {
            reader: Reader::from_str(xml),
            writer: Writer::new(Vec::with_capacity(xml.len() + 256)),
            context,
            trailing_ws: None,
        }
    }

    pub fn next(&mut self) -> Result<Event<'a>> {
        let pos = self.reader.buffer_position();
        self.reader
            .read_event()
            .map_err(|e| PatcherError::xml(self.context, format!("at byte {pos}: {e}")))
    }

    pub fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.trailing_ws = match &event {
            Event::Text(text) if text.iter().all(u8::is_ascii_whitespace) => {
                Some(String::from_utf8_lossy(text).into_owned())
            }
            _ => None,
        };
        self.writer
            .write_event(event)
            .map_err(|e| PatcherError::xml(self.context, e))
    }

    /// Write `elements` as children just before a closing tag, matching the
    /// indentation the document already uses.
    pub fn insert_children(&mut self, elements: Vec<Event<'static>>) -> Result<()> {
        let closing_ws = self.trailing_ws.take();
        for (i, element) in elements.into_iter().enumerate() {
            if let Some(ws) = &closing_ws {
                // The closing tag's own indentation is already written.
                let indent = if i == 0 { "    ".to_string() } else { format!("{ws}    ") };
                self.write(text(&indent))?;
            }
            self.write(element)?;
        }
        if let Some(ws) = closing_ws {
            self.write(text(&ws))?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner()).map_err(|e| PatcherError::xml(self.context, e))
    }
}

pub(crate) fn text(s: &str) -> Event<'static> {
    Event::Text(BytesText::from_escaped(s.to_string()))
}

pub(crate) fn end(name: &str) -> Event<'static> {
    Event::End(BytesEnd::new(name.to_string()))
}

/// Unescaped value of the attribute whose qualified name is `key`.
pub(crate) fn attr_value(element: &BytesStart<'_>, key: &[u8], context: &'static str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| PatcherError::xml(context, e))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| PatcherError::xml(context, e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Copy of `element` with `key` set to `value`. An existing `key` is replaced,
/// otherwise the attribute is appended and the original layout kept.
pub(crate) fn with_attribute(element: &BytesStart<'_>, key: &str, value: &str) -> BytesStart<'static> {
    let present = element
        .attributes()
        .flatten()
        .any(|attr| attr.key.as_ref() == key.as_bytes());
    if !present {
        let mut copy = element.to_owned();
        copy.push_attribute((key, value));
        return copy;
    }

    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut copy = BytesStart::new(name);
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() != key.as_bytes() {
            copy.push_attribute(attr);
        }
    }
    copy.push_attribute((key, value));
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_preserves_bytes() {
        let xml = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!-- c -->\n<a x=\"1 &amp; 2\">\n  <b/>\n</a>\n";
        let mut rw = Rewriter::new(xml, "test");
        loop {
            match rw.next().unwrap() {
                Event::Eof => break,
                event => rw.write(event).unwrap(),
            }
        }
        assert_eq!(rw.finish().unwrap(), xml);
    }

    #[test]
    fn setting_an_attribute_replaces_the_old_value() {
        let mut reader = Reader::from_str(r#"<application a:label="x" a:cfg=""/>"#);
        let Event::Empty(e) = reader.read_event().unwrap() else {
            panic!("expected empty element");
        };
        let updated = with_attribute(&e, "a:cfg", "@xml/policy");
        assert_eq!(attr_value(&updated, b"a:cfg", "test").unwrap().as_deref(), Some("@xml/policy"));
        assert_eq!(attr_value(&updated, b"a:label", "test").unwrap().as_deref(), Some("x"));
        assert_eq!(updated.attributes().count(), 2);

        let appended = with_attribute(&e, "a:extra", "1");
        assert_eq!(appended.attributes().count(), 3);
    }

    #[test]
    fn attr_lookup_unescapes() {
        let mut reader = Reader::from_str("<a key=\"a &amp; b\"/>");
        match reader.read_event().unwrap() {
            Event::Empty(e) => {
                assert_eq!(attr_value(&e, b"key", "t").unwrap().as_deref(), Some("a & b"));
                assert_eq!(attr_value(&e, b"other", "t").unwrap(), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_input_is_an_xml_error() {
        let mut rw = Rewriter::new("<a></b>", "broken.xml");
        let mut result = Ok(());
        for _ in 0..4 {
            match rw.next() {
                Ok(Event::Eof) => break,
                Ok(event) => rw.write(event).unwrap(),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        assert!(matches!(result, Err(PatcherError::Xml { .. })));
    }
}
