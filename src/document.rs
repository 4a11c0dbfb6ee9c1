use crate::element::{Element, ElementData};
use crate::error::{Error, Result};
use crate::parser::{DocumentParser, ReadOptions};
use crate::query::Query;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    CData(String),
    PI(String),
    DocType(String),
}

impl Node {
    pub fn as_element(&self) -> Option<Element> {
        match self {
            Self::Element(elem) => Some(*elem),
            _ => None,
        }
    }

    pub(crate) fn build_text_content(&self, document: &Document, buf: &mut String) {
        match self {
            Node::Element(elem) => {
                for child in elem.children(document) {
                    child.build_text_content(document, buf);
                }
            }
            Node::Text(text) | Node::CData(text) => buf.push_str(text),
            _ => {}
        }
    }

    /// Returns content if node is `Text` or `CData`.
    /// If node is `Element`, return [`Element::text_content()`]
    pub fn text_content(&self, document: &Document) -> String {
        let mut buf = String::new();
        self.build_text_content(document, &mut buf);
        buf
    }
}

/// Represents a XML document.
///
/// Use [`Document::parse_str()`], [`Document::parse_reader()`], or [`Document::from_str()`] to parse xml
/// without validation. [`crate::DocumentLoader`] adds DTD or schema validation.
///
/// # Examples
/// ```
/// use xml_attr_filter::Document;
/// use std::str::FromStr;
///
/// let doc = Document::from_str(r#"<?xml version="1.0" encoding="UTF-8"?>
/// <package>
///     <metadata>
///         <author>Lewis Carroll</author>
///     </metadata>
/// </package>
/// "#).unwrap();
/// let authors = doc.select("//author").unwrap();
/// assert_eq!(authors[0].text_content(&doc), "Lewis Carroll");
/// ```
#[derive(Debug)]
pub struct Document {
    pub(crate) store: Vec<ElementData>,
    container: Element,

    pub(crate) version: String,
    pub(crate) standalone: bool,
}

impl Document {
    /// Create a blank new xml document.
    pub fn new() -> Document {
        let (container, container_data) = Element::container();
        Document {
            store: vec![container_data],
            container,
            version: String::new(),
            standalone: false,
        }
    }

    pub fn container(&self) -> Element {
        self.container
    }

    pub fn is_empty(&self) -> bool {
        !self.container.has_children(self)
    }

    /// Get first element of document.
    pub fn root_element(&self) -> Option<Element> {
        self.container.child_elements(self).first().copied()
    }

    /// Get root nodes of document.
    pub fn root_nodes(&self) -> &Vec<Node> {
        self.container.children(self)
    }

    /// Push a node to the container.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedXML`]: The document already has a root element.
    pub fn push_root_node(&mut self, node: Node) -> Result<()> {
        if node.as_element().is_some() && self.root_element().is_some() {
            return Err(Error::MalformedXML(
                "Document can only have one root element".to_string(),
            ));
        }
        let container = self.container;
        container.push_child(self, node)
    }

    /// Content of the `<!DOCTYPE ...>` declaration, if the document has one.
    pub fn doctype(&self) -> Option<&str> {
        self.root_nodes().iter().find_map(|node| match node {
            Node::DocType(content) => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Compile `query` and select the matching elements, in document order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidQuery`]: `query` is not a valid expression.
    pub fn select(&self, query: &str) -> Result<Vec<Element>> {
        Ok(Query::compile(query)?.select(self))
    }
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

// Read and write
impl Document {
    /// Parses xml string without validation.
    pub fn parse_str(str: &str) -> Result<Document> {
        DocumentParser::parse_reader(str.as_bytes(), ReadOptions::default())
    }

    pub fn parse_str_with_opts(str: &str, opts: ReadOptions) -> Result<Document> {
        DocumentParser::parse_reader(str.as_bytes(), opts)
    }

    /// Parses xml from reader without validation. The encoding is detected
    /// from the byte order mark and the xml declaration.
    ///
    /// # Errors
    ///
    /// - [`Error::CannotDecode`]: Could not decode XML.
    /// - [`Error::MalformedXML`]: Could not read XML.
    /// - [`Error::Io`]: IO Error
    pub fn parse_reader<R: Read>(reader: R) -> Result<Document> {
        DocumentParser::parse_reader(reader, ReadOptions::default())
    }

    pub fn parse_reader_with_opts<R: Read>(reader: R, opts: ReadOptions) -> Result<Document> {
        DocumentParser::parse_reader(reader, opts)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Document> {
        let file = File::open(path)?;
        DocumentParser::parse_reader(file, ReadOptions::default())
    }

    /// Writes document as xml string.
    pub fn write_str(&self) -> Result<String> {
        let mut buf: Vec<u8> = Vec::with_capacity(200);
        self.write(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Write document to writer. Will be written in UTF-8.
    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        let container = self.container();
        let mut writer = Writer::new_with_indent(writer, b' ', 2);
        self.write_decl(&mut writer)?;
        self.write_nodes(&mut writer, container.children(self))?;
        writer.write_event(Event::Eof)?;
        Ok(())
    }

    fn write_decl(&self, writer: &mut Writer<impl Write>) -> Result<()> {
        let standalone = match self.standalone {
            true => Some("yes".as_bytes()),
            false => None,
        };
        let version = if self.version.is_empty() {
            "1.0"
        } else {
            &self.version
        };
        writer.write_event(Event::Decl(BytesDecl::new(
            version.as_bytes(),
            Some("UTF-8".as_bytes()),
            standalone,
        )))?;
        Ok(())
    }

    fn write_nodes(&self, writer: &mut Writer<impl Write>, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            match node {
                Node::Element(eid) => self.write_element(writer, *eid)?,
                Node::Text(text) => {
                    writer.write_event(Event::Text(BytesText::from_plain_str(text)))?
                }
                // DocType, Comment, CData, and PI content is not escaped.
                Node::DocType(text) => {
                    writer.write_event(Event::DocType(BytesText::from_escaped_str(text)))?
                }
                Node::Comment(text) => {
                    writer.write_event(Event::Comment(BytesText::from_escaped_str(text)))?
                }
                Node::CData(text) => {
                    writer.write_event(Event::CData(BytesText::from_escaped_str(text)))?
                }
                Node::PI(text) => {
                    writer.write_event(Event::PI(BytesText::from_escaped_str(text)))?
                }
            };
        }
        Ok(())
    }

    fn write_element(&self, writer: &mut Writer<impl Write>, element: Element) -> Result<()> {
        let name_bytes = element.full_name(self).as_bytes();
        let mut start = BytesStart::borrowed_name(name_bytes);
        for (key, val) in element.attributes(self) {
            start.push_attribute((key.as_bytes(), val.as_bytes()));
        }
        for (prefix, val) in element.namespace_decls(self) {
            let attr_name = if prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{}", prefix)
            };
            start.push_attribute((attr_name.as_bytes(), val.as_bytes()));
        }
        if element.has_children(self) {
            writer.write_event(Event::Start(start))?;
            self.write_nodes(writer, element.children(self))?;
            writer.write_event(Event::End(BytesEnd::borrowed(name_bytes)))?;
        } else {
            writer.write_event(Event::Empty(start))?;
        }
        Ok(())
    }
}

impl FromStr for Document {
    type Err = Error;

    fn from_str(s: &str) -> Result<Document> {
        Document::parse_str(s)
    }
}
