use crate::document::{Document, Node};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::validation::parse_doctype;
use encoding_rs::Decoder;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use indexmap::IndexMap;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{BufRead, Read};

pub(crate) struct DecodeReader<R: Read> {
    decoder: Option<Decoder>,
    inner: R,
    undecoded: [u8; 4096],
    undecoded_pos: usize,
    undecoded_cap: usize,
    remaining: [u8; 32], // Is there an encoding with > 32 bytes for a char?
    decoded: [u8; 12288],
    decoded_pos: usize,
    decoded_cap: usize,
    done: bool,
}

impl<R: Read> DecodeReader<R> {
    // If Decoder is not set, don't decode.
    pub(crate) fn new(reader: R, decoder: Option<Decoder>) -> DecodeReader<R> {
        DecodeReader {
            decoder,
            inner: reader,
            undecoded: [0; 4096],
            undecoded_pos: 0,
            undecoded_cap: 0,
            remaining: [0; 32],
            decoded: [0; 12288],
            decoded_pos: 0,
            decoded_cap: 0,
            done: false,
        }
    }

    pub(crate) fn set_decoder(&mut self, dec: Option<Decoder>) {
        self.decoder = dec;
        self.done = false;
    }

    // Call this only when decoder is Some
    fn fill_buf_decode(&mut self) -> std::io::Result<&[u8]> {
        if self.decoded_pos >= self.decoded_cap {
            debug_assert!(self.decoded_pos == self.decoded_cap);
            if self.done {
                return Ok(&[]);
            }
            let remaining = self.undecoded_cap - self.undecoded_pos;
            if remaining <= 32 {
                // Move remaining undecoded bytes at the end to start
                self.remaining[..remaining]
                    .copy_from_slice(&self.undecoded[self.undecoded_pos..self.undecoded_cap]);
                self.undecoded[..remaining].copy_from_slice(&self.remaining[..remaining]);
                // Fill undecoded buffer
                let read = self.inner.read(&mut self.undecoded[remaining..])?;
                self.done = read == 0;
                self.undecoded_pos = 0;
                self.undecoded_cap = remaining + read;
            }

            let decoder = match self.decoder.as_mut() {
                Some(decoder) => decoder,
                None => return Ok(&[]),
            };
            let (_res, read, written, _replaced) = decoder.decode_to_utf8(
                &self.undecoded[self.undecoded_pos..self.undecoded_cap],
                &mut self.decoded,
                self.done,
            );
            self.undecoded_pos += read;
            self.decoded_cap = written;
            self.decoded_pos = 0;
        }
        Ok(&self.decoded[self.decoded_pos..self.decoded_cap])
    }

    fn fill_buf_without_decode(&mut self) -> std::io::Result<&[u8]> {
        if self.undecoded_pos >= self.undecoded_cap {
            debug_assert!(self.undecoded_pos == self.undecoded_cap);
            self.undecoded_cap = self.inner.read(&mut self.undecoded)?;
            self.undecoded_pos = 0;
        }
        Ok(&self.undecoded[self.undecoded_pos..self.undecoded_cap])
    }
}

impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = self.fill_buf()?;
        let amt = std::cmp::min(available.len(), buf.len());
        buf[..amt].copy_from_slice(&available[..amt]);
        self.consume(amt);
        Ok(amt)
    }
}

impl<R: Read> BufRead for DecodeReader<R> {
    // Decoder may change from None to Some.
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match &self.decoder {
            Some(_) => self.fill_buf_decode(),
            None => self.fill_buf_without_decode(),
        }
    }
    fn consume(&mut self, amt: usize) {
        match &self.decoder {
            Some(_) => {
                self.decoded_pos = std::cmp::min(self.decoded_pos + amt, self.decoded_cap);
            }
            None => {
                self.undecoded_pos = std::cmp::min(self.undecoded_pos + amt, self.undecoded_cap);
            }
        }
    }
}

/// Options when parsing xml.
///
/// `empty_text_node`: <tag></tag> will have a Node::Text("") as its children, while <tag /> won't.
///
/// `require_decl`: fail with [`Error::CannotDecode`] when the input does not start
/// with a byte order mark or an xml declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub empty_text_node: bool,
    pub require_decl: bool,
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions {
            empty_text_node: true,
            require_decl: false,
        }
    }
}

pub(crate) struct DocumentParser {
    document: Document,
    read_opts: ReadOptions,
    encoding: Option<String>,
    element_stack: Vec<Element>,
    /// General entities declared by a DTD. `None` outside DTD mode, where
    /// only the predefined entities are recognized.
    entities: Option<HashMap<Vec<u8>, Vec<u8>>>,
}

impl DocumentParser {
    pub(crate) fn new(opts: ReadOptions) -> DocumentParser {
        let document = Document::new();
        let container = document.container();
        DocumentParser {
            document,
            read_opts: opts,
            encoding: None,
            element_stack: vec![container],
            entities: None,
        }
    }

    pub(crate) fn parse_reader<R: Read>(reader: R, opts: ReadOptions) -> Result<Document> {
        let mut parser = DocumentParser::new(opts);
        parser.parse_start(reader)?;
        Ok(parser.document)
    }

    /// Parse with entity references resolved against `entities`, extended by
    /// the entity declarations of the document's internal subset.
    pub(crate) fn parse_reader_with_entities<R: Read>(
        reader: R,
        opts: ReadOptions,
        entities: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Document> {
        let mut parser = DocumentParser::new(opts);
        parser.entities = Some(entities);
        parser.parse_start(reader)?;
        Ok(parser.document)
    }

    fn handle_decl(&mut self, ev: &BytesDecl) -> Result<()> {
        self.document.version = String::from_utf8(ev.version()?.to_vec())?;
        self.encoding = match ev.encoding() {
            Some(res) => Some(String::from_utf8(res?.to_vec())?),
            None => None,
        };
        self.document.standalone = match ev.standalone() {
            Some(res) => {
                let val = std::str::from_utf8(&res?)?.to_lowercase();
                if val == "yes" {
                    true
                } else if val == "no" {
                    false
                } else {
                    return Err(Error::MalformedXML(
                        "Standalone Document Declaration has non boolean value".to_string(),
                    ));
                }
            }
            None => false,
        };
        Ok(())
    }

    fn current(&self) -> Element {
        // container never leaves the stack
        self.element_stack[self.element_stack.len() - 1]
    }

    fn push_node(&mut self, node: Node) -> Result<()> {
        let parent = self.current();
        parent.push_child(&mut self.document, node)
    }

    fn handle_bytes_start(&mut self, ev: &BytesStart) -> Result<Element> {
        let parent = self.current();
        if parent.is_container() && self.document.root_element().is_some() {
            return Err(Error::MalformedXML(
                "Document can only have one root element".to_string(),
            ));
        }
        let full_name = String::from_utf8(ev.name().to_vec())?;
        let mut attributes = IndexMap::new();
        let mut namespaces = IndexMap::new();
        for attr in ev.attributes() {
            let attr = attr?;
            let key = String::from_utf8(attr.key.to_vec())?;
            let value = match &self.entities {
                Some(entities) => attr.unescaped_value_with_custom_entities(entities)?,
                None => attr.unescaped_value()?,
            };
            let value = String::from_utf8(value.to_vec())?;
            if key == "xmlns" {
                namespaces.insert(String::new(), value);
                continue;
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                namespaces.insert(prefix.to_owned(), value);
                continue;
            }
            attributes.insert(key, value);
        }
        let element = Element::with_data(&mut self.document, full_name, attributes, namespaces);
        parent.push_child(&mut self.document, Node::Element(element))?;
        Ok(element)
    }

    // Look at the document decl and figure out the document encoding
    fn parse_start<B: Read>(&mut self, reader: B) -> Result<()> {
        let mut bufreader = DecodeReader::new(reader, None);

        let (bom_len, init_encoding) = match bufreader.fill_buf()? {
            [0xfe, 0xff, ..] => (2, Some(UTF_16BE)),
            [0xff, 0xfe, ..] => (2, Some(UTF_16LE)),
            [0xef, 0xbb, 0xbf, ..] => (3, None),
            [0x00, 0x3c, 0x00, 0x3f, ..] => (0, Some(UTF_16BE)),
            [0x3c, 0x00, 0x3f, 0x00, ..] => (0, Some(UTF_16LE)),
            [0x3c, 0x3f, ..] => (0, None),
            _ if !self.read_opts.require_decl => (0, None),
            _ => return Err(Error::CannotDecode),
        };
        bufreader.consume(bom_len);
        bufreader.set_decoder(init_encoding.map(|e| e.new_decoder_without_bom_handling()));
        // the text trimming below would hide whitespace before a declaration
        let leading_space = match bufreader.fill_buf()?.first() {
            Some(b) => b.is_ascii_whitespace(),
            None => false,
        };
        let mut xmlreader = Reader::from_reader(bufreader);
        xmlreader.trim_text(true);
        let mut buf = Vec::with_capacity(150);
        let has_decl = match xmlreader.read_event(&mut buf)? {
            Event::Decl(_) if leading_space => {
                return Err(Error::MalformedXML(
                    "XML Declaration is only allowed at the start of file".to_string(),
                ));
            }
            Event::Decl(ev) => {
                self.handle_decl(&ev)?;
                true
            }
            _ if self.read_opts.require_decl => {
                return Err(Error::MalformedXML(
                    "Didn't find XML Declaration at the start of file".to_string(),
                ));
            }
            ev => {
                if self.handle_event(ev)? {
                    return self.finish();
                }
                false
            }
        };
        if has_decl {
            if let Some(encoding_str) = &self.encoding {
                let encoding =
                    Encoding::for_label(encoding_str.as_bytes()).ok_or(Error::CannotDecode)?;
                let encoding = if encoding == UTF_8 {
                    None
                } else {
                    Some(encoding)
                };
                // Encoding::for_label("UTF-16") defaults to UTF-16 LE, even though it could be UTF-16 BE
                if encoding != init_encoding
                    && !(encoding == Some(UTF_16LE) && init_encoding == Some(UTF_16BE))
                {
                    let mut decode_reader = xmlreader.into_underlying_reader();
                    decode_reader
                        .set_decoder(encoding.map(|e| e.new_decoder_without_bom_handling()));
                    xmlreader = Reader::from_reader(decode_reader);
                    xmlreader.trim_text(true);
                }
            }
        }
        self.parse_content(xmlreader)
    }

    // Returns if document parsing is finished.
    fn handle_event(&mut self, event: Event) -> Result<bool> {
        tracing::trace!(?event, "xml event");
        match event {
            Event::Start(ref ev) => {
                let element = self.handle_bytes_start(ev)?;
                self.element_stack.push(element);
                Ok(false)
            }
            Event::End(_) => {
                if self.element_stack.len() == 1 {
                    return Err(Error::MalformedXML(
                        "Closing tag without an opening tag".to_string(),
                    ));
                }
                // quick-xml checks if tag names match for us
                let elem = self.element_stack.pop().ok_or(Error::NotFound)?;
                if self.read_opts.empty_text_node {
                    // distinguish <tag></tag> and <tag />
                    if !elem.has_children(&self.document) {
                        elem.push_child(&mut self.document, Node::Text(String::new()))?;
                    }
                }
                Ok(false)
            }
            Event::Empty(ref ev) => {
                self.handle_bytes_start(ev)?;
                Ok(false)
            }
            Event::Text(ev) => {
                if self.current().is_container() {
                    return Err(Error::MalformedXML(
                        "Text is not allowed outside the root element".to_string(),
                    ));
                }
                let content = match &self.entities {
                    Some(entities) => ev.unescaped_with_custom_entities(entities)?,
                    None => ev.unescaped()?,
                };
                let content = String::from_utf8(content.to_vec())?;
                self.push_node(Node::Text(content))?;
                Ok(false)
            }
            Event::DocType(ev) => {
                let content = String::from_utf8(ev.to_vec())?;
                if let Some(entities) = &mut self.entities {
                    if let (_, Some(subset)) = parse_doctype(&content)? {
                        // internal declarations override external ones
                        for (name, value) in subset.general_entities() {
                            entities.insert(name.as_bytes().to_vec(), value.as_bytes().to_vec());
                        }
                    }
                }
                self.push_node(Node::DocType(content))?;
                Ok(false)
            }
            // Comment, CData, and PI content is not escaped.
            Event::Comment(ev) => {
                let content = String::from_utf8(ev.to_vec())?;
                self.push_node(Node::Comment(content))?;
                Ok(false)
            }
            Event::CData(ev) => {
                let content = String::from_utf8(ev.to_vec())?;
                self.push_node(Node::CData(content))?;
                Ok(false)
            }
            Event::PI(ev) => {
                let content = String::from_utf8(ev.to_vec())?;
                self.push_node(Node::PI(content))?;
                Ok(false)
            }
            Event::Decl(_) => Err(Error::MalformedXML(
                "XML Declaration is only allowed at the start of file".to_string(),
            )),
            Event::Eof => Ok(true),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.element_stack.len() > 1 {
            let unclosed = self.current().full_name(&self.document).to_string();
            return Err(Error::MalformedXML(format!(
                "Element <{}> is not closed",
                unclosed
            )));
        }
        if self.document.root_element().is_none() {
            return Err(Error::MalformedXML("Document has no root element".to_string()));
        }
        Ok(())
    }

    fn parse_content<B: BufRead>(&mut self, mut reader: Reader<B>) -> Result<()> {
        let mut buf = Vec::with_capacity(200); // reduce time increasing capacity at start.
        loop {
            let ev = reader.read_event(&mut buf)?;
            if self.handle_event(ev)? {
                return self.finish();
            }
            buf.clear();
        }
    }
}
