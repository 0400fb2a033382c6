use std::borrow::Cow;
use std::collections::BTreeMap;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::error::CwmpError;

#[derive(Debug, Clone, PartialEq)]
enum TextPart {
    Escaped(String),
    CData(String),
}

/// A loosely parsed XML element.
///
/// Element names are stored without their namespace prefix so that
/// `cwmp:Inform`, `soap-env:Body` and friends can be matched by local name.
/// Attribute keys keep their prefix (`xsi:type`).
///
/// Character data is kept as written and only unescaped through [`XmlNode::text`],
/// so a bad entity in one element never spoils the rest of the tree.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<XmlNode>,
    /// Character data exactly as it appears in the source document.
    pub raw_text: String,
    parts: Vec<TextPart>,
}

impl XmlNode {
    /// Parse an XML fragment into a tree rooted at an unnamed node.
    ///
    /// The fragment does not need to be a complete document: several top-level
    /// elements are fine, and elements still open at end of input are closed.
    /// Only structural errors (such as mismatched end tags) are reported.
    pub fn parse_fragment(xml: &str) -> Result<XmlNode, CwmpError> {
        let mut reader = Reader::from_str(xml);
        let mut stack = vec![XmlNode::default()];

        loop {
            match reader.read_event().map_err(CwmpError::malformed)? {
                Event::Start(start) => stack.push(XmlNode::from_start(&start)),
                Event::Empty(start) => {
                    let node = XmlNode::from_start(&start);
                    attach(&mut stack, node);
                }
                Event::End(_) => {
                    if stack.len() > 1 {
                        if let Some(node) = stack.pop() {
                            attach(&mut stack, node);
                        }
                    }
                }
                Event::Text(text) => {
                    let raw = String::from_utf8_lossy(&text).into_owned();
                    if let Some(current) = stack.last_mut() {
                        current.raw_text.push_str(&raw);
                        current.parts.push(TextPart::Escaped(raw));
                    }
                }
                Event::CData(data) => {
                    let content = String::from_utf8_lossy(&data).into_owned();
                    if let Some(current) = stack.last_mut() {
                        current.raw_text.push_str(&content);
                        current.parts.push(TextPart::CData(content));
                    }
                }
                Event::Eof => break,
                // Comments, declarations, processing instructions, doctype.
                _ => {}
            }
        }

        while stack.len() > 1 {
            if let Some(node) = stack.pop() {
                attach(&mut stack, node);
            }
        }

        Ok(stack.pop().unwrap_or_default())
    }

    fn from_start(start: &BytesStart<'_>) -> XmlNode {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();

        // Broken attributes are skipped, values with bad entities kept raw.
        let mut attributes = BTreeMap::new();
        for attribute in start.attributes().flatten() {
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = match attribute.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&attribute.value).into_owned(),
            };

            attributes.insert(key, value);
        }

        XmlNode {
            name,
            attributes,
            ..Default::default()
        }
    }

    /// Unescaped character data directly inside this element, CDATA included.
    /// Text that cannot be unescaped is returned as written.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                TextPart::Escaped(raw) => unescape(raw)
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| raw.clone()),
                TextPart::CData(content) => content.clone(),
            })
            .collect()
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Every element below this one with the given local name, depth-first in
    /// document order.
    pub fn descendants(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        collect_descendants(self, name, &mut found);
        found
    }
}

fn attach(stack: &mut [XmlNode], node: XmlNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn collect_descendants<'a>(node: &'a XmlNode, name: &str, found: &mut Vec<&'a XmlNode>) {
    for child in &node.children {
        if child.name == name {
            found.push(child);
        }
        collect_descendants(child, name, found);
    }
}
