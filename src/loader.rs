use crate::document::Document;
use crate::error::{Error, Result};
use crate::parser::{DocumentParser, ReadOptions};
use crate::validation::{DtdValidator, EntityResolver, Schema, Validator};
use encoding_rs::Encoding;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Which grammar, if any, documents are validated against while loading.
///
/// The source streams are read at most once, by the first validating load.
#[derive(Default)]
pub enum ValidationSpec {
    /// Well-formedness only.
    #[default]
    None,
    /// W3C XML Schema read from the stream.
    Schema(Box<dyn Read>),
    /// DTD read from the stream. Every external reference in a document's
    /// `<!DOCTYPE>` resolves to it; `entity_key` is the identifier it is
    /// published under, reported in logs and errors.
    Dtd {
        source: Box<dyn Read>,
        entity_key: String,
    },
}

impl ValidationSpec {
    pub fn schema<R: Read + 'static>(source: R) -> ValidationSpec {
        ValidationSpec::Schema(Box::new(source))
    }

    pub fn dtd<R: Read + 'static, S: Into<String>>(source: R, entity_key: S) -> ValidationSpec {
        ValidationSpec::Dtd {
            source: Box::new(source),
            entity_key: entity_key.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ValidationSpec::None)
    }
}

impl fmt::Debug for ValidationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationSpec::None => f.write_str("None"),
            ValidationSpec::Schema(_) => f.write_str("Schema(..)"),
            ValidationSpec::Dtd { entity_key, .. } => f
                .debug_struct("Dtd")
                .field("entity_key", entity_key)
                .finish_non_exhaustive(),
        }
    }
}

enum Source {
    Unread(Box<dyn Read>),
    Cached(String),
}

impl Source {
    fn text(&mut self) -> Result<&str> {
        if let Source::Unread(reader) = self {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            let text = decode_source(bytes)?;
            tracing::debug!(len = text.len(), "cached validation source");
            *self = Source::Cached(text);
        }
        match self {
            Source::Cached(text) => Ok(text),
            Source::Unread(_) => unreachable!("source was cached above"),
        }
    }
}

fn decode_source(bytes: Vec<u8>) -> Result<String> {
    match Encoding::for_bom(&bytes) {
        Some((encoding, bom_len)) => {
            let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
            match had_errors {
                true => Err(Error::CannotDecode),
                false => Ok(text.into_owned()),
            }
        }
        None => Ok(String::from_utf8(bytes)?),
    }
}

enum GrammarKind {
    Schema,
    Dtd { entity_key: String },
}

enum Strategy {
    NonValidating,
    Validating {
        kind: GrammarKind,
        source: Source,
        validator: Option<Validator>,
    },
}

impl Strategy {
    fn new(spec: ValidationSpec) -> Strategy {
        let (kind, source) = match spec {
            ValidationSpec::None => return Strategy::NonValidating,
            ValidationSpec::Schema(source) => (GrammarKind::Schema, source),
            ValidationSpec::Dtd { source, entity_key } => (GrammarKind::Dtd { entity_key }, source),
        };
        Strategy::Validating {
            kind,
            source: Source::Unread(source),
            validator: None,
        }
    }

    /// Compiles the grammar on first use. `None` when not validating.
    fn validator(&mut self) -> Result<Option<&Validator>> {
        let (kind, source, validator) = match self {
            Strategy::NonValidating => return Ok(None),
            Strategy::Validating {
                kind,
                source,
                validator,
            } => (kind, source, validator),
        };
        if validator.is_none() {
            let text = source.text()?;
            let compiled = match kind {
                GrammarKind::Schema => Validator::Schema(Schema::parse(text)?),
                GrammarKind::Dtd { entity_key } => {
                    let resolver = EntityResolver::new(entity_key.clone(), text.to_string());
                    Validator::Dtd(DtdValidator::new(resolver)?)
                }
            };
            tracing::debug!("compiled validation grammar");
            *validator = Some(compiled);
        }
        Ok(validator.as_ref())
    }
}

/// Builds [`Document`]s from xml text, validating them when configured to.
///
/// ```
/// use xml_attr_filter::{DocumentLoader, ValidationSpec};
///
/// let dtd = "<!ELEMENT list (item*)><!ELEMENT item EMPTY>";
/// let mut loader = DocumentLoader::new(ValidationSpec::dtd(dtd.as_bytes(), "list.dtd"));
/// assert!(loader.load_str("<list><item/></list>").is_ok());
/// assert!(loader.load_str("<list><other/></list>").is_err());
/// ```
pub struct DocumentLoader {
    strategy: Strategy,
    read_opts: ReadOptions,
}

impl Default for DocumentLoader {
    fn default() -> DocumentLoader {
        DocumentLoader::new(ValidationSpec::None)
    }
}

impl DocumentLoader {
    pub fn new(spec: ValidationSpec) -> DocumentLoader {
        DocumentLoader::with_options(spec, ReadOptions::default())
    }

    pub fn with_options(spec: ValidationSpec, read_opts: ReadOptions) -> DocumentLoader {
        DocumentLoader {
            strategy: Strategy::new(spec),
            read_opts,
        }
    }

    /// Replace the validation spec. The cached source text and compiled
    /// grammar of the previous spec are dropped.
    pub fn set_validation(&mut self, spec: ValidationSpec) {
        tracing::debug!(?spec, "validation spec replaced");
        self.strategy = Strategy::new(spec);
    }

    pub fn is_validating(&self) -> bool {
        matches!(self.strategy, Strategy::Validating { .. })
    }

    pub fn read_options(&self) -> &ReadOptions {
        &self.read_opts
    }

    pub fn load_str(&mut self, text: &str) -> Result<Document> {
        self.load_reader(text.as_bytes())
    }

    /// Parse a document from `reader`, then validate it if a grammar is configured.
    ///
    /// With a DTD, entity references resolve against the DTD's entity
    /// declarations, and attributes the DTD gives a default value are added
    /// to the elements that omit them.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedXML`], [`Error::CannotDecode`]: The document is not well-formed.
    /// - [`Error::Validation`]: The document is well-formed but invalid.
    /// - [`Error::Grammar`]: The schema or DTD could not be compiled.
    /// - [`Error::Io`]: Reading the document or the validation source failed.
    pub fn load_reader<R: Read>(&mut self, reader: R) -> Result<Document> {
        let opts = self.read_opts;
        let validator = match self.strategy.validator()? {
            Some(validator) => validator,
            None => {
                tracing::debug!("loading without validation");
                return Document::parse_reader_with_opts(reader, opts);
            }
        };
        tracing::debug!("loading with validation");
        let mut document = match validator.entities() {
            Some(entities) => {
                DocumentParser::parse_reader_with_entities(reader, opts, entities.clone())?
            }
            None => Document::parse_reader_with_opts(reader, opts)?,
        };
        validator.validate(&mut document)?;
        Ok(document)
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Document> {
        let file = File::open(path)?;
        self.load_reader(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;
    use std::rc::Rc;

    const XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
        <xs:element name="a">
            <xs:complexType>
                <xs:attribute name="n" type="xs:int" use="required"/>
            </xs:complexType>
        </xs:element>
    </xs:schema>"#;

    /// Counts how many times the inner reader is read from.
    struct CountingReader {
        inner: io::Cursor<Vec<u8>>,
        reads: Rc<Cell<usize>>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read(buf)
        }
    }

    fn counting(text: &str) -> (CountingReader, Rc<Cell<usize>>) {
        let reads = Rc::new(Cell::new(0));
        let reader = CountingReader {
            inner: io::Cursor::new(text.as_bytes().to_vec()),
            reads: Rc::clone(&reads),
        };
        (reader, reads)
    }

    #[test]
    fn test_non_validating() {
        let mut loader = DocumentLoader::default();
        assert!(!loader.is_validating());
        let doc = loader.load_str("<a><b/></a>").unwrap();
        assert_eq!(doc.root_element().unwrap().full_name(&doc), "a");
        assert!(matches!(
            loader.load_str("<a><b></a>"),
            Err(Error::MalformedXML(_))
        ));
    }

    #[test]
    fn test_schema_source_read_once() {
        let (reader, reads) = counting(XSD);
        let mut loader = DocumentLoader::new(ValidationSpec::schema(reader));
        assert!(loader.is_validating());
        assert_eq!(reads.get(), 0);

        loader.load_str(r#"<a n="1"/>"#).unwrap();
        let after_first = reads.get();
        assert!(after_first > 0);
        assert!(matches!(
            loader.load_str(r#"<a n="x"/>"#),
            Err(Error::Validation(_))
        ));
        assert!(matches!(loader.load_str("<a>"), Err(Error::MalformedXML(_))));
        loader.load_str(r#"<a n="2"/>"#).unwrap();
        assert_eq!(reads.get(), after_first);
    }

    #[test]
    fn test_set_validation_drops_cache() {
        let mut loader = DocumentLoader::new(ValidationSpec::schema(XSD.as_bytes()));
        assert!(loader.load_str("<a/>").is_err());

        let (reader, reads) = counting("<!ELEMENT a EMPTY>");
        loader.set_validation(ValidationSpec::dtd(reader, "a.dtd"));
        loader.load_str("<a/>").unwrap();
        assert!(reads.get() > 0);
        assert!(matches!(
            loader.load_str(r#"<a n="1"/>"#),
            Err(Error::Validation(_))
        ));

        loader.set_validation(ValidationSpec::None);
        assert!(!loader.is_validating());
        loader.load_str(r#"<a n="1"><b/></a>"#).unwrap();
    }

    #[test]
    fn test_dtd_serves_every_reference() {
        let dtd = "<!ELEMENT a (b*)><!ELEMENT b EMPTY>";
        let mut loader = DocumentLoader::new(ValidationSpec::dtd(dtd.as_bytes(), "urn:a"));
        loader
            .load_str(r#"<!DOCTYPE a SYSTEM "http://example.invalid/a.dtd"><a><b/></a>"#)
            .unwrap();
        loader
            .load_str(r#"<!DOCTYPE a PUBLIC "-//A//EN" "other.dtd"><a/>"#)
            .unwrap();
        assert!(loader
            .load_str(r#"<!DOCTYPE a SYSTEM "a.dtd"><a><c/></a>"#)
            .is_err());
    }

    #[test]
    fn test_dtd_defaults_and_entities() {
        let dtd = r#"<!ELEMENT root (item*)>
            <!ELEMENT item (#PCDATA)>
            <!ATTLIST item attr1 (true|false) "true">
            <!ENTITY co "ACME">"#;
        let mut loader = DocumentLoader::new(ValidationSpec::dtd(dtd.as_bytes(), "x.dtd"));
        let doc = loader
            .load_str(r#"<!DOCTYPE root SYSTEM "x.dtd"><root><item>&co;</item><item attr1="false"/></root>"#)
            .unwrap();
        let items = doc.root_element().unwrap().child_elements(&doc);
        assert_eq!(items[0].attribute(&doc, "attr1"), Some("true"));
        assert_eq!(items[0].text_content(&doc), "ACME");
        assert_eq!(items[1].attribute(&doc, "attr1"), Some("false"));

        assert!(matches!(
            loader.load_str("<root><item>&nope;</item></root>"),
            Err(Error::MalformedXML(_))
        ));
        // entities only resolve in DTD mode
        loader.set_validation(ValidationSpec::None);
        assert!(matches!(
            loader.load_str("<root><item>&co;</item></root>"),
            Err(Error::MalformedXML(_))
        ));
    }

    #[test]
    fn test_invalid_grammar() {
        let mut loader = DocumentLoader::new(ValidationSpec::schema("<xs:schema".as_bytes()));
        assert!(matches!(loader.load_str("<a/>"), Err(Error::Grammar(_))));
        // the failed compile is retried from the cached text
        assert!(matches!(loader.load_str("<a/>"), Err(Error::Grammar(_))));
    }

    #[test]
    fn test_utf16_source() {
        let mut bytes = vec![0xff, 0xfe];
        for unit in "<!ELEMENT a EMPTY>".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let mut loader = DocumentLoader::new(ValidationSpec::dtd(io::Cursor::new(bytes), "a"));
        loader.load_str("<a/>").unwrap();
    }

    #[test]
    fn test_debug() {
        let spec = ValidationSpec::dtd("".as_bytes(), "key");
        assert_eq!(format!("{:?}", spec), r#"Dtd { entity_key: "key", .. }"#);
        assert_eq!(format!("{:?}", ValidationSpec::default()), "None");
    }
}
