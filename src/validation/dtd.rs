use super::content::{child_names_and_text, describe, Particle, Term};
use crate::document::Document;
use crate::element::Element;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashSet;

/// Content of an `<!ELEMENT>` declaration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ContentModel {
    Empty,
    Any,
    /// `(#PCDATA | a | b)*`
    Mixed(Vec<String>),
    Children(Particle),
}

#[derive(Debug, Clone, PartialEq)]
enum AttributeType {
    CData,
    Id,
    IdRef,
    IdRefs,
    NmToken,
    NmTokens,
    Entity,
    Entities,
    Enumeration(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum DefaultDecl {
    Required,
    Implied,
    Fixed(String),
    Value(String),
}

#[derive(Debug, Clone, PartialEq)]
struct AttributeDef {
    kind: AttributeType,
    default: DefaultDecl,
}

/// A parsed document type definition.
///
/// Only markup declarations are understood. Parameter entities and external
/// general entities are skipped, so grammars built out of parameter entities
/// are not supported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dtd {
    elements: IndexMap<String, ContentModel>,
    attlists: IndexMap<String, IndexMap<String, AttributeDef>>,
    entities: IndexMap<String, String>,
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn error(&self, msg: &str) -> Error {
        let near: String = self.rest().chars().take(20).collect();
        Error::Grammar(format!("{} near {:?}", msg, near))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        self.skip_ws();
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", token)))
        }
    }

    fn skip_past(&mut self, token: &str) -> Result<()> {
        match self.rest().find(token) {
            Some(i) => {
                self.pos += i + token.len();
                Ok(())
            }
            None => Err(self.error(&format!("missing {:?}", token))),
        }
    }

    /// Skip to the closing `>` of a declaration, ignoring `>` inside quotes.
    fn skip_decl(&mut self) -> Result<()> {
        let mut quote = None;
        for (i, c) in self.rest().char_indices() {
            match (quote, c) {
                (None, '"') | (None, '\'') => quote = Some(c),
                (Some(q), c) if q == c => quote = None,
                (None, '>') => {
                    self.pos += i + 1;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.error("unterminated declaration"))
    }

    fn name(&mut self) -> Result<String> {
        self.skip_ws();
        let len = self
            .rest()
            .find(|c: char| !is_name_char(c))
            .unwrap_or_else(|| self.rest().len());
        if len == 0 {
            return Err(self.error("expected a name"));
        }
        let name = self.rest()[..len].to_string();
        self.pos += len;
        Ok(name)
    }

    fn quoted(&mut self) -> Result<String> {
        self.skip_ws();
        let quote = match self.rest().chars().next() {
            Some(q) if q == '"' || q == '\'' => q,
            _ => return Err(self.error("expected a quoted value")),
        };
        self.pos += 1;
        match self.rest().find(quote) {
            Some(end) => {
                let value = self.rest()[..end].to_string();
                self.pos += end + 1;
                Ok(value)
            }
            None => Err(self.error("unterminated quoted value")),
        }
    }

    fn occurrence(&mut self, term: Term) -> Particle {
        if self.eat("?") {
            Particle::new(term, 0, Some(1))
        } else if self.eat("*") {
            Particle::new(term, 0, None)
        } else if self.eat("+") {
            Particle::new(term, 1, None)
        } else {
            Particle::once(term)
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':'
}

impl Dtd {
    /// Parse markup declarations, as found in an external DTD or an internal subset.
    ///
    /// # Errors
    ///
    /// - [`Error::Grammar`]: Declarations could not be parsed.
    pub fn parse(src: &str) -> Result<Dtd> {
        let mut dtd = Dtd::default();
        let mut cursor = Cursor { src, pos: 0 };
        loop {
            cursor.skip_ws();
            if cursor.is_eof() {
                break;
            }
            if cursor.eat("<!--") {
                cursor.skip_past("-->")?;
            } else if cursor.eat("<?") {
                cursor.skip_past("?>")?;
            } else if cursor.eat("<!ELEMENT") {
                dtd.parse_element(&mut cursor)?;
            } else if cursor.eat("<!ATTLIST") {
                dtd.parse_attlist(&mut cursor)?;
            } else if cursor.eat("<!ENTITY") {
                dtd.parse_entity(&mut cursor)?;
            } else if cursor.eat("<!NOTATION") {
                cursor.skip_decl()?;
            } else if cursor.eat("%") {
                tracing::warn!("skipping parameter entity reference in DTD");
                cursor.skip_past(";")?;
            } else {
                return Err(cursor.error("unexpected content in DTD"));
            }
        }
        tracing::debug!(
            elements = dtd.elements.len(),
            attlists = dtd.attlists.len(),
            entities = dtd.entities.len(),
            "parsed DTD"
        );
        Ok(dtd)
    }

    fn parse_element(&mut self, cursor: &mut Cursor) -> Result<()> {
        let name = cursor.name()?;
        cursor.skip_ws();
        let model = if cursor.eat("EMPTY") {
            ContentModel::Empty
        } else if cursor.eat("ANY") {
            ContentModel::Any
        } else {
            cursor.expect("(")?;
            cursor.skip_ws();
            if cursor.eat("#PCDATA") {
                parse_mixed(cursor)?
            } else {
                ContentModel::Children(parse_group(cursor)?)
            }
        };
        cursor.expect(">")?;
        if self.elements.contains_key(&name) {
            return Err(Error::Grammar(format!(
                "Element <{}> is declared more than once",
                name
            )));
        }
        self.elements.insert(name, model);
        Ok(())
    }

    fn parse_attlist(&mut self, cursor: &mut Cursor) -> Result<()> {
        let element = cursor.name()?;
        loop {
            cursor.skip_ws();
            if cursor.eat(">") {
                return Ok(());
            }
            let name = cursor.name()?;
            cursor.skip_ws();
            let kind = if cursor.eat("(") {
                AttributeType::Enumeration(parse_enumeration(cursor)?)
            } else if cursor.eat("NOTATION") {
                cursor.expect("(")?;
                AttributeType::Enumeration(parse_enumeration(cursor)?)
            } else {
                match cursor.name()?.as_str() {
                    "CDATA" => AttributeType::CData,
                    "ID" => AttributeType::Id,
                    "IDREF" => AttributeType::IdRef,
                    "IDREFS" => AttributeType::IdRefs,
                    "NMTOKEN" => AttributeType::NmToken,
                    "NMTOKENS" => AttributeType::NmTokens,
                    "ENTITY" => AttributeType::Entity,
                    "ENTITIES" => AttributeType::Entities,
                    other => {
                        return Err(Error::Grammar(format!(
                            "Unknown attribute type {} for {}/@{}",
                            other, element, name
                        )))
                    }
                }
            };
            cursor.skip_ws();
            let default = if cursor.eat("#REQUIRED") {
                DefaultDecl::Required
            } else if cursor.eat("#IMPLIED") {
                DefaultDecl::Implied
            } else if cursor.eat("#FIXED") {
                DefaultDecl::Fixed(cursor.quoted()?)
            } else {
                DefaultDecl::Value(cursor.quoted()?)
            };
            // the first declaration of an attribute is binding
            self.attlists
                .entry(element.clone())
                .or_default()
                .entry(name)
                .or_insert(AttributeDef { kind, default });
        }
    }

    fn parse_entity(&mut self, cursor: &mut Cursor) -> Result<()> {
        cursor.skip_ws();
        if cursor.eat("%") {
            return cursor.skip_decl();
        }
        let name = cursor.name()?;
        cursor.skip_ws();
        if !cursor.rest().starts_with(|c: char| c == '"' || c == '\'') {
            tracing::debug!(entity = %name, "skipping external entity");
            return cursor.skip_decl();
        }
        let value = cursor.quoted()?;
        cursor.expect(">")?;
        self.entities.entry(name).or_insert(value);
        Ok(())
    }

    /// Internal general entities, by name.
    pub(crate) fn general_entities(&self) -> &IndexMap<String, String> {
        &self.entities
    }

    /// Declarations of `other` that are not declared here are added.
    pub(crate) fn merge(&mut self, other: &Dtd) {
        for (name, model) in &other.elements {
            self.elements
                .entry(name.clone())
                .or_insert_with(|| model.clone());
        }
        for (element, attrs) in &other.attlists {
            let own = self.attlists.entry(element.clone()).or_default();
            for (name, def) in attrs {
                own.entry(name.clone()).or_insert_with(|| def.clone());
            }
        }
        for (name, value) in &other.entities {
            self.entities
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Add the declared default of every defaulted or `#FIXED` attribute
    /// missing from an element of `document`.
    pub fn apply_defaults(&self, document: &mut Document) {
        let root = match document.root_element() {
            Some(root) => root,
            None => return,
        };
        let mut elements = vec![root];
        elements.extend(root.child_elements_recursive(document));
        let mut added = 0;
        for element in elements {
            let defs = match self.attlists.get(element.full_name(document)) {
                Some(defs) => defs,
                None => continue,
            };
            for (attr, def) in defs {
                let value = match &def.default {
                    DefaultDecl::Value(value) | DefaultDecl::Fixed(value) => value,
                    DefaultDecl::Required | DefaultDecl::Implied => continue,
                };
                if element.attribute(document, attr).is_none() {
                    element.set_attribute(document, attr.as_str(), value.as_str());
                    added += 1;
                }
            }
        }
        tracing::trace!(added, "applied DTD attribute defaults");
    }

    pub fn is_declared(&self, element: &str) -> bool {
        self.elements.contains_key(element)
    }

    /// Validate every element of the document against the declarations.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`]: The first violation found, in document order.
    pub fn validate(&self, document: &Document) -> Result<()> {
        let root = document.root_element().ok_or(Error::InvalidDocument)?;
        let mut ids = HashSet::new();
        let mut idrefs = Vec::new();
        self.validate_element(document, root, &mut ids, &mut idrefs)?;
        for idref in idrefs {
            if !ids.contains(&idref) {
                return Err(Error::Validation(format!(
                    "IDREF {:?} does not match any ID",
                    idref
                )));
            }
        }
        Ok(())
    }

    fn validate_element(
        &self,
        document: &Document,
        element: Element,
        ids: &mut HashSet<String>,
        idrefs: &mut Vec<String>,
    ) -> Result<()> {
        let name = element.full_name(document);
        let model = self
            .elements
            .get(name)
            .ok_or_else(|| Error::Validation(format!("Element <{}> is not declared", name)))?;
        let (children, has_text) = child_names_and_text(document, element, true);
        let valid = match model {
            ContentModel::Empty => children.is_empty() && !has_text,
            ContentModel::Any => true,
            ContentModel::Mixed(allowed) => children
                .iter()
                .all(|child| allowed.iter().any(|a| a == child)),
            ContentModel::Children(particle) => !has_text && particle.matches(&children),
        };
        if !valid {
            return Err(Error::Validation(format!(
                "Content of <{}> does not match {}: found ({})",
                name,
                describe_model(model),
                children.join(", "),
            )));
        }
        self.validate_attributes(document, element, ids, idrefs)?;
        for child in element.child_elements(document) {
            self.validate_element(document, child, ids, idrefs)?;
        }
        Ok(())
    }

    fn validate_attributes(
        &self,
        document: &Document,
        element: Element,
        ids: &mut HashSet<String>,
        idrefs: &mut Vec<String>,
    ) -> Result<()> {
        let name = element.full_name(document);
        let empty = IndexMap::new();
        let defs = self.attlists.get(name).unwrap_or(&empty);
        for (attr, value) in element.attributes(document) {
            let def = defs.get(attr).ok_or_else(|| {
                Error::Validation(format!(
                    "Attribute {:?} is not declared for <{}>",
                    attr, name
                ))
            })?;
            let invalid = |reason: &str| {
                Error::Validation(format!(
                    "Attribute {:?} of <{}> {}: {:?}",
                    attr, name, reason, value
                ))
            };
            match &def.kind {
                AttributeType::CData | AttributeType::Entity | AttributeType::Entities => {}
                AttributeType::Id => {
                    if !is_xml_name(value) {
                        return Err(invalid("is not a valid ID"));
                    }
                    if !ids.insert(value.clone()) {
                        return Err(invalid("repeats an ID"));
                    }
                }
                AttributeType::IdRef => idrefs.push(value.clone()),
                AttributeType::IdRefs => {
                    idrefs.extend(value.split_whitespace().map(|s| s.to_string()))
                }
                AttributeType::NmToken => {
                    if value.is_empty() || !value.chars().all(is_name_char) {
                        return Err(invalid("is not a NMTOKEN"));
                    }
                }
                AttributeType::NmTokens => {
                    if !value
                        .split_whitespace()
                        .all(|token| token.chars().all(is_name_char))
                    {
                        return Err(invalid("is not a list of NMTOKENs"));
                    }
                }
                AttributeType::Enumeration(values) => {
                    if !values.iter().any(|v| v == value) {
                        return Err(invalid(&format!("must be one of {}", values.join("|"))));
                    }
                }
            }
            if let DefaultDecl::Fixed(fixed) = &def.default {
                if fixed != value {
                    return Err(invalid(&format!("must be {:?}", fixed)));
                }
            }
        }
        for (attr, def) in defs {
            if def.default == DefaultDecl::Required && element.attribute(document, attr).is_none()
            {
                return Err(Error::Validation(format!(
                    "Required attribute {:?} is missing on <{}>",
                    attr, name
                )));
            }
        }
        Ok(())
    }
}

fn is_xml_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == ':' => chars.all(is_name_char),
        _ => false,
    }
}

fn describe_model(model: &ContentModel) -> String {
    match model {
        ContentModel::Empty => "EMPTY".to_string(),
        ContentModel::Any => "ANY".to_string(),
        ContentModel::Mixed(names) if names.is_empty() => "(#PCDATA)".to_string(),
        ContentModel::Mixed(names) => format!("(#PCDATA|{})*", names.join("|")),
        ContentModel::Children(particle) => describe(particle),
    }
}

// After "(#PCDATA"
fn parse_mixed(cursor: &mut Cursor) -> Result<ContentModel> {
    let mut names = Vec::new();
    loop {
        cursor.skip_ws();
        if cursor.eat(")") {
            // "(#PCDATA)" may omit the star, "(#PCDATA|a)*" must not
            if !cursor.eat("*") && !names.is_empty() {
                return Err(cursor.error("mixed content with elements must end with ')*'"));
            }
            return Ok(ContentModel::Mixed(names));
        }
        cursor.expect("|")?;
        names.push(cursor.name()?);
    }
}

// After "(", up to and including the occurrence indicator after ")"
fn parse_group(cursor: &mut Cursor) -> Result<Particle> {
    let mut particles = vec![parse_cp(cursor)?];
    let mut separator = None;
    loop {
        cursor.skip_ws();
        if cursor.eat(")") {
            break;
        }
        let sep = if cursor.eat(",") {
            ','
        } else if cursor.eat("|") {
            '|'
        } else {
            return Err(cursor.error("expected ',', '|' or ')'"));
        };
        if separator.map_or(false, |s| s != sep) {
            return Err(cursor.error("cannot mix ',' and '|' in one group"));
        }
        separator = Some(sep);
        particles.push(parse_cp(cursor)?);
    }
    let term = match separator {
        Some('|') => Term::Choice(particles),
        _ => Term::Sequence(particles),
    };
    Ok(cursor.occurrence(term))
}

fn parse_cp(cursor: &mut Cursor) -> Result<Particle> {
    cursor.skip_ws();
    if cursor.eat("(") {
        parse_group(cursor)
    } else {
        let name = cursor.name()?;
        Ok(cursor.occurrence(Term::Element(name)))
    }
}

fn parse_enumeration(cursor: &mut Cursor) -> Result<Vec<String>> {
    let mut values = vec![cursor.name()?];
    loop {
        cursor.skip_ws();
        if cursor.eat(")") {
            return Ok(values);
        }
        cursor.expect("|")?;
        values.push(cursor.name()?);
    }
}

/// The parts of a `<!DOCTYPE ...>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocTypeDecl {
    pub name: String,
    pub public_id: Option<String>,
    pub system_id: Option<String>,
    pub internal_subset: Option<String>,
}

impl DocTypeDecl {
    /// Parse the content between `<!DOCTYPE` and the closing `>`.
    pub(crate) fn parse(content: &str) -> Result<DocTypeDecl> {
        let mut cursor = Cursor {
            src: content,
            pos: 0,
        };
        let name = cursor.name()?;
        cursor.skip_ws();
        let (public_id, system_id) = if cursor.eat("PUBLIC") {
            let public_id = cursor.quoted()?;
            (Some(public_id), Some(cursor.quoted()?))
        } else if cursor.eat("SYSTEM") {
            (None, Some(cursor.quoted()?))
        } else {
            (None, None)
        };
        cursor.skip_ws();
        let internal_subset = if cursor.eat("[") {
            match cursor.rest().rfind(']') {
                Some(end) => Some(cursor.rest()[..end].to_string()),
                None => return Err(cursor.error("unterminated internal subset")),
            }
        } else {
            None
        };
        Ok(DocTypeDecl {
            name,
            public_id,
            system_id,
            internal_subset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const NOTE: &str = r#"
    <!-- a note -->
    <!ELEMENT note (to+, from, body?)>
    <!ELEMENT to (#PCDATA)>
    <!ELEMENT from (#PCDATA|b)*>
    <!ELEMENT b (#PCDATA)>
    <!ELEMENT body ANY>
    <!ELEMENT br EMPTY>
    <!ATTLIST note
        id ID #REQUIRED
        lang (en|fr) "en"
        version CDATA #FIXED "1">
    <!ATTLIST to ref IDREF #IMPLIED>
    <!ENTITY writer "Donald Duck.">
    "#;

    fn validate(xml: &str) -> Result<()> {
        let dtd = Dtd::parse(NOTE).unwrap();
        dtd.validate(&Document::from_str(xml).unwrap())
    }

    #[test]
    fn test_parse() {
        let dtd = Dtd::parse(NOTE).unwrap();
        assert!(dtd.is_declared("note"));
        assert!(dtd.is_declared("br"));
        assert!(!dtd.is_declared("writer"));
        assert_eq!(
            describe_model(&dtd.elements["note"]),
            "(to+, from, body?)"
        );
        assert_eq!(describe_model(&dtd.elements["from"]), "(#PCDATA|b)*");
        assert_eq!(dtd.attlists["note"].len(), 3);
    }

    #[test]
    fn test_valid() {
        validate(r#"<note id="n1"><to>a</to><to ref="n1">b</to><from>x<b>y</b></from></note>"#)
            .unwrap();
        validate(r#"<note id="n1" lang="fr" version="1"><to/><from/><body><br/></body></note>"#)
            .unwrap();
    }

    #[test]
    fn test_invalid() {
        for xml in [
            r#"<note><to/><from/></note>"#,
            r#"<note id="n1"><from/></note>"#,
            r#"<note id="n1"><to/><from/><x/></note>"#,
            r#"<note id="n1" lang="de"><to/><from/></note>"#,
            r#"<note id="n1" version="2"><to/><from/></note>"#,
            r#"<note id="n1" other="1"><to/><from/></note>"#,
            r#"<note id="n1">text<to/><from/></note>"#,
            r#"<note id="n1"><to ref="n2"/><from/></note>"#,
            r#"<note id="n1"><to><b/></to><from/></note>"#,
            r#"<note id="n1"><to/><from/><body><br>x</br></body></note>"#,
            r#"<note id="1n"><to/><from/></note>"#,
        ] {
            let err = validate(xml).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{}: {:?}", xml, err);
        }
    }

    #[test]
    fn test_malformed_dtd() {
        for dtd in [
            "<!ELEMENT a (b, c | d)>",
            "<!ELEMENT a (b>",
            "<!ELEMENT a (#PCDATA|b)>",
            "<!ATTLIST a x FOO #IMPLIED>",
            "<!ELEMENT a EMPTY><!ELEMENT a ANY>",
            "garbage",
        ] {
            let err = Dtd::parse(dtd).unwrap_err();
            assert!(matches!(err, Error::Grammar(_)), "{}: {:?}", dtd, err);
        }
    }

    #[test]
    fn test_doctype_decl() {
        let decl = DocTypeDecl::parse(r#" note SYSTEM "note.dtd" [ <!ELEMENT x EMPTY> ]"#).unwrap();
        assert_eq!(decl.name, "note");
        assert_eq!(decl.system_id.as_deref(), Some("note.dtd"));
        assert_eq!(decl.internal_subset.unwrap().trim(), "<!ELEMENT x EMPTY>");

        let decl =
            DocTypeDecl::parse(r#"html PUBLIC "-//W3C//DTD XHTML 1.0//EN" "x.dtd""#).unwrap();
        assert_eq!(decl.public_id.as_deref(), Some("-//W3C//DTD XHTML 1.0//EN"));
        assert_eq!(decl.system_id.as_deref(), Some("x.dtd"));
        assert!(decl.internal_subset.is_none());
    }

    #[test]
    fn test_entities() {
        let dtd = Dtd::parse(
            r#"<!ENTITY co "ACME"><!ENTITY co "other"><!ENTITY % p "x">
               <!ENTITY logo SYSTEM "logo.gif" NDATA gif><!ENTITY q '"q"'>"#,
        )
        .unwrap();
        let entities: Vec<(&str, &str)> = dtd
            .general_entities()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(entities, vec![("co", "ACME"), ("q", "\"q\"")]);
        assert_eq!(Dtd::parse(NOTE).unwrap().general_entities()["writer"], "Donald Duck.");
    }

    #[test]
    fn test_apply_defaults() {
        let dtd = Dtd::parse(NOTE).unwrap();
        let mut doc =
            Document::from_str(r#"<note id="n1" lang="fr"><to/><from/></note>"#).unwrap();
        dtd.validate(&doc).unwrap();
        dtd.apply_defaults(&mut doc);
        let note = doc.root_element().unwrap();
        let attrs: Vec<(&str, &str)> = note
            .attributes(&doc)
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(attrs, vec![("id", "n1"), ("lang", "fr"), ("version", "1")]);
        // #IMPLIED adds nothing
        assert!(note.child_elements(&doc)[0].attributes(&doc).is_empty());
    }

    #[test]
    fn test_merge_prefers_own() {
        let mut internal = Dtd::parse("<!ELEMENT to EMPTY>").unwrap();
        internal.merge(&Dtd::parse(NOTE).unwrap());
        assert_eq!(internal.elements["to"], ContentModel::Empty);
        assert!(internal.is_declared("note"));
    }
}
