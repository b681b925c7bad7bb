//! XML parsing into two representations
//!
//! - `application/xml`: the document re-serialized with two-space indentation
//! - `application/json`: the element tree as nested objects. Attributes are
//!   keyed `@name`, text next to child elements is kept under `#text`, leaf
//!   elements become strings and repeated sibling tags become arrays.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub pretty: String,
    pub tree: Value,
}

pub fn parse_xml(identifier: &str, xml: &str) -> Result<XmlDocument> {
    let pretty = pretty_print(identifier, xml)?;
    let tree = to_json_tree(identifier, xml)?;
    Ok(XmlDocument { pretty, tree })
}

fn malformed(identifier: &str, reader: &Reader<&[u8]>, e: impl std::fmt::Display) -> Error {
    Error::extraction_failed(
        identifier,
        format!("malformed XML at byte {}: {}", reader.buffer_position(), e),
    )
}

fn pretty_print(identifier: &str, xml: &str) -> Result<String> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(identifier, &reader, e))?;
        match event {
            Event::Eof => break,
            event => writer
                .write_event(event)
                .map_err(|e| Error::encoding(format!("XML writer: {}", e)))?,
        }
    }

    String::from_utf8(writer.into_inner())
        .map_err(|e| Error::encoding(format!("XML output is not UTF-8: {}", e)))
}

struct Frame {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(identifier: &str, start: &BytesStart<'_>) -> Result<Self> {
        let mut children = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| {
                Error::extraction_failed(identifier, format!("malformed XML attribute: {}", e))
            })?;
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = attr.unescape_value().map_err(|e| {
                Error::extraction_failed(identifier, format!("malformed XML attribute: {}", e))
            })?;
            children.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            children,
            text: String::new(),
        })
    }

    fn append_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(text);
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.children.is_empty() {
            Value::String(text)
        } else {
            let mut children = self.children;
            if !text.is_empty() {
                children.insert("#text".to_string(), Value::String(text));
            }
            Value::Object(children)
        };
        (self.name, value)
    }
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

fn to_json_tree(identifier: &str, xml: &str) -> Result<Value> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root = Map::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(identifier, &reader, e))?;
        match event {
            Event::Start(start) => stack.push(Frame::open(identifier, &start)?),
            Event::Empty(start) => {
                let (name, value) = Frame::open(identifier, &start)?.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => insert_child(&mut root, name, value),
                }
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| malformed(identifier, &reader, "unbalanced end tag"))?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => insert_child(&mut root, name, value),
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| malformed(identifier, &reader, e))?;
                    frame.append_text(&text);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.append_text(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(Error::extraction_failed(
            identifier,
            format!("malformed XML: unclosed element <{}>", open.name),
        ));
    }
    if root.is_empty() {
        return Err(Error::extraction_failed(identifier, "XML document has no root element"));
    }

    Ok(Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_tree() {
        let xml = r#"<?xml version="1.0"?>
<filing form="10-K">
  <company>Acme &amp; Co</company>
  <item>one</item>
  <item>two</item>
  <note lang="en">See <![CDATA[attached]]></note>
  <empty/>
</filing>"#;

        let doc = parse_xml("f.xml", xml).unwrap();
        assert_eq!(
            doc.tree,
            json!({
                "filing": {
                    "@form": "10-K",
                    "company": "Acme & Co",
                    "item": ["one", "two"],
                    "note": {"@lang": "en", "#text": "See attached"},
                    "empty": ""
                }
            })
        );
    }

    #[test]
    fn test_pretty_print_indents() {
        let doc = parse_xml("f.xml", "<a><b>x</b><c/></a>").unwrap();
        assert_eq!(doc.pretty, "<a>\n  <b>x</b>\n  <c/>\n</a>");
    }

    #[test]
    fn test_malformed_xml() {
        let err = parse_xml("bad.xml", "<a><b></a>").unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed { .. }));

        let err = parse_xml("open.xml", "<a><b>text</b>").unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed { .. }));
    }
}
