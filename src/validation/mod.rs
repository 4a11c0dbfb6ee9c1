//! Grammar-based validation of parsed documents.
//!
//! Documents are first parsed for well-formedness, then checked against a
//! compiled [`Schema`] or [`Dtd`].
mod content;
mod dtd;
mod schema;

pub use dtd::Dtd;
pub use schema::Schema;

use crate::document::Document;
use crate::error::{Error, Result};
use dtd::DocTypeDecl;
use std::borrow::Cow;
use std::collections::HashMap;

/// Serves external DTD references from text supplied up front.
///
/// Every reference resolves to the same text, whatever its public or system
/// identifier. Nothing is fetched from disk or the network.
#[derive(Debug, Clone)]
pub(crate) struct EntityResolver {
    entity_key: String,
    text: String,
}

impl EntityResolver {
    pub fn new(entity_key: String, text: String) -> EntityResolver {
        EntityResolver { entity_key, text }
    }

    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }

    pub fn resolve(&self, public_id: Option<&str>, system_id: Option<&str>) -> &str {
        tracing::trace!(
            entity_key = %self.entity_key,
            public_id,
            system_id,
            "resolving external DTD reference"
        );
        &self.text
    }
}

/// Split a `<!DOCTYPE>` into its declaration and compiled internal subset.
///
/// # Errors
///
/// - [`Error::MalformedXML`]: The declaration itself could not be parsed.
/// - [`Error::Validation`]: The internal subset could not be parsed.
pub(crate) fn parse_doctype(content: &str) -> Result<(DocTypeDecl, Option<Dtd>)> {
    let decl = DocTypeDecl::parse(content).map_err(|err| match err {
        Error::Grammar(msg) => Error::MalformedXML(format!("Invalid DOCTYPE: {}", msg)),
        other => other,
    })?;
    let subset = match &decl.internal_subset {
        Some(subset) => Some(Dtd::parse(subset).map_err(|err| match err {
            Error::Grammar(msg) => {
                Error::Validation(format!("Invalid internal DTD subset: {}", msg))
            }
            other => other,
        })?),
        None => None,
    };
    Ok((decl, subset))
}

/// DTD compiled from the resolver text, checked together with the internal
/// subset of each document.
#[derive(Debug, Clone)]
pub(crate) struct DtdValidator {
    resolver: EntityResolver,
    dtd: Dtd,
    entities: HashMap<Vec<u8>, Vec<u8>>,
}

impl DtdValidator {
    pub fn new(resolver: EntityResolver) -> Result<DtdValidator> {
        let dtd = Dtd::parse(resolver.resolve(None, None)).map_err(|err| match err {
            Error::Grammar(msg) => {
                Error::Grammar(format!("DTD {:?}: {}", resolver.entity_key(), msg))
            }
            other => other,
        })?;
        let entities = dtd
            .general_entities()
            .iter()
            .map(|(name, value)| (name.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect();
        Ok(DtdValidator {
            resolver,
            dtd,
            entities,
        })
    }

    /// Entities declared by the external DTD, for resolving references while parsing.
    pub fn entities(&self) -> &HashMap<Vec<u8>, Vec<u8>> {
        &self.entities
    }

    /// Check `document`, then add the attribute defaults it omits.
    pub fn validate(&self, document: &mut Document) -> Result<()> {
        let subset = match document.doctype() {
            Some(content) => {
                let (decl, subset) = parse_doctype(content)?;
                let root = document.root_element().ok_or(Error::InvalidDocument)?;
                if decl.name != root.full_name(document) {
                    return Err(Error::Validation(format!(
                        "DOCTYPE names <{}> but the root element is <{}>",
                        decl.name,
                        root.full_name(document)
                    )));
                }
                if decl.public_id.is_some() || decl.system_id.is_some() {
                    tracing::trace!(
                        entity_key = self.resolver.entity_key(),
                        public_id = decl.public_id.as_deref(),
                        system_id = decl.system_id.as_deref(),
                        "external DTD reference served from the compiled DTD"
                    );
                }
                subset
            }
            None => None,
        };
        let dtd = match subset {
            Some(mut subset) => {
                subset.merge(&self.dtd);
                Cow::Owned(subset)
            }
            None => Cow::Borrowed(&self.dtd),
        };
        dtd.validate(document)?;
        dtd.apply_defaults(document);
        Ok(())
    }
}

/// A compiled grammar, ready to check any number of documents.
#[derive(Debug, Clone)]
pub(crate) enum Validator {
    Schema(Schema),
    Dtd(DtdValidator),
}

impl Validator {
    pub fn validate(&self, document: &mut Document) -> Result<()> {
        match self {
            Validator::Schema(schema) => schema.validate(document),
            Validator::Dtd(dtd) => dtd.validate(document),
        }
    }

    /// Entities to resolve while parsing. `None` for grammars that declare none.
    pub fn entities(&self) -> Option<&HashMap<Vec<u8>, Vec<u8>>> {
        match self {
            Validator::Schema(_) => None,
            Validator::Dtd(dtd) => Some(dtd.entities()),
        }
    }
}
