//! Load xml documents, optionally validated against a W3C XML Schema or a DTD,
//! and pull out the elements whose boolean flag attributes match a filter.
//!
//! ```
//! use xml_attr_filter::{AttributeFilter, DocumentLoader, FilteringParser};
//!
//! let filter = AttributeFilter::new().with_required("enabled");
//! let mut parser = FilteringParser::new(DocumentLoader::default(), filter, "feature");
//! let result = parser
//!     .parse_str(r#"<features><feature enabled="true"/><feature enabled="false"/></features>"#)
//!     .unwrap();
//! let root = result.root_element().unwrap();
//! assert_eq!(root.child_elements(&result).len(), 1);
//! ```
mod document;
mod element;
mod error;
mod filter;
mod loader;
mod parser;
mod query;
mod validation;

pub use crate::document::{Document, Node};
pub use crate::element::{Element, ElementData};
pub use crate::error::{Error, Result};
pub use crate::filter::{AttributeFilter, FilteringParser};
pub use crate::loader::{DocumentLoader, ValidationSpec};
pub use crate::parser::ReadOptions;
pub use crate::query::Query;
pub use crate::validation::{Dtd, Schema};
