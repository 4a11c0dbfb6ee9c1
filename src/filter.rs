use crate::document::{Document, Node};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::loader::DocumentLoader;
use crate::query::Query;
use indexmap::{IndexMap, IndexSet};
use std::io::Read;

/// Bindings `element`'s subtree uses but inherits from ancestors above it.
fn inherited_namespaces(document: &Document, element: Element) -> IndexMap<String, String> {
    let mut subtree = vec![element];
    subtree.extend(element.child_elements_recursive(document));
    let mut prefixes = IndexSet::new();
    for elem in subtree {
        prefixes.insert(elem.prefix(document));
        for attr in elem.attributes(document).keys() {
            match Element::separate_prefix_name(attr) {
                ("", _) => {}
                (prefix, _) => {
                    prefixes.insert(prefix);
                }
            }
        }
    }
    let own = element.namespace_decls(document);
    prefixes
        .into_iter()
        .filter(|prefix| *prefix != "xml" && !own.contains_key(*prefix))
        .filter_map(|prefix| {
            let uri = element.namespace_for_prefix(document, prefix)?;
            Some((prefix.to_string(), uri.to_string()))
        })
        .collect()
}

enum CachedQuery {
    Stale,
    Fresh { target: String, query: Query },
}

/// Selects elements by boolean flag attributes.
///
/// An element passes when every *required* attribute has the value `true`
/// and every *rejected* attribute has the value `false`. Names keep their
/// insertion order.
///
/// The compiled query is cached, and dropped by every mutation.
///
/// ```
/// use xml_attr_filter::{AttributeFilter, Document};
/// use std::str::FromStr;
///
/// let mut doc = Document::from_str(
///     r#"<shop><item paid="true" sent="false"/><item paid="false"/></shop>"#,
/// ).unwrap();
/// let mut filter = AttributeFilter::new().with_required("paid").with_rejected("sent");
/// let result = filter.filter(&mut doc, "item").unwrap();
/// assert_eq!(
///     result.write_str().unwrap(),
///     "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<shop>\n  <item paid=\"true\" sent=\"false\"/>\n</shop>"
/// );
/// ```
pub struct AttributeFilter {
    required: IndexSet<String>,
    rejected: IndexSet<String>,
    cached: CachedQuery,
}

impl Default for AttributeFilter {
    fn default() -> AttributeFilter {
        AttributeFilter::new()
    }
}

impl AttributeFilter {
    pub fn new() -> AttributeFilter {
        AttributeFilter {
            required: IndexSet::new(),
            rejected: IndexSet::new(),
            cached: CachedQuery::Stale,
        }
    }

    pub fn with_required<S: Into<String>>(mut self, name: S) -> AttributeFilter {
        self.add_required(name);
        self
    }

    pub fn with_rejected<S: Into<String>>(mut self, name: S) -> AttributeFilter {
        self.add_rejected(name);
        self
    }

    pub fn required(&self) -> &IndexSet<String> {
        &self.required
    }

    pub fn rejected(&self) -> &IndexSet<String> {
        &self.rejected
    }

    /// Require `name="true"`. Empty and already required names are ignored.
    pub fn add_required<S: Into<String>>(&mut self, name: S) {
        let name = name.into();
        if !name.is_empty() && self.required.insert(name) {
            self.invalidate();
        }
    }

    /// Require `name="false"`. Empty and already rejected names are ignored.
    pub fn add_rejected<S: Into<String>>(&mut self, name: S) {
        let name = name.into();
        if !name.is_empty() && self.rejected.insert(name) {
            self.invalidate();
        }
    }

    pub fn remove_required(&mut self, name: &str) {
        self.required.shift_remove(name);
        self.invalidate();
    }

    pub fn remove_rejected(&mut self, name: &str) {
        self.rejected.shift_remove(name);
        self.invalidate();
    }

    pub fn clear_required(&mut self) {
        self.required.clear();
        self.invalidate();
    }

    pub fn clear_rejected(&mut self) {
        self.rejected.clear();
        self.invalidate();
    }

    fn invalidate(&mut self) {
        if let CachedQuery::Fresh { query, .. } = &self.cached {
            tracing::trace!(query = query.as_str(), "filter query invalidated");
        }
        self.cached = CachedQuery::Stale;
    }

    /// Whether the next [`query`](Self::query) call will recompile.
    pub fn is_stale(&self) -> bool {
        matches!(self.cached, CachedQuery::Stale)
    }

    /// The predicate over the current sets, e.g. `@a='true' and @b='false'`.
    /// Empty when both sets are empty.
    pub fn predicate(&self) -> String {
        let required = self.required.iter().map(|name| format!("@{}='true'", name));
        let rejected = self.rejected.iter().map(|name| format!("@{}='false'", name));
        required.chain(rejected).collect::<Vec<_>>().join(" and ")
    }

    pub fn query_text(&self, target: &str) -> String {
        match self.predicate() {
            predicate if predicate.is_empty() => format!("//{}", target),
            predicate => format!("//{}[{}]", target, predicate),
        }
    }

    /// Compiled query selecting `target` elements that pass the filter.
    /// Compiled on first use and whenever the sets or the target changed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidQuery`]: `target` or an attribute name is not a valid name.
    pub fn query(&mut self, target: &str) -> Result<&Query> {
        let fresh = matches!(
            &self.cached,
            CachedQuery::Fresh { target: cached, .. } if cached == target
        );
        if !fresh {
            let text = self.query_text(target);
            let query = Query::compile(&text)?;
            tracing::debug!(query = %text, "compiled filter query");
            self.cached = CachedQuery::Fresh {
                target: target.to_string(),
                query,
            };
        }
        match &self.cached {
            CachedQuery::Fresh { query, .. } => Ok(query),
            CachedQuery::Stale => unreachable!("query was compiled above"),
        }
    }

    /// Move every `target` element that passes the filter out of `document`
    /// and into a new document, under a root named after the original root.
    ///
    /// Matches keep their subtrees and are appended in document order. A
    /// match nested inside another match becomes its sibling in the result.
    /// Namespace bindings a match inherited from its old ancestors are
    /// declared on the moved element. Everything else stays in `document`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidQuery`]: See [`query`](Self::query).
    /// - [`Error::InvalidDocument`]: `document` has no root element.
    pub fn filter(&mut self, document: &mut Document, target: &str) -> Result<Document> {
        let matches = self.query(target)?.select(document);
        let root = document.root_element().ok_or(Error::InvalidDocument)?;
        tracing::debug!(target, matches = matches.len(), "filtered document");

        let mut result = Document::new();
        result.version = document.version.clone();
        let new_root = Element::new(&mut result, root.full_name(document));
        result.push_root_node(Node::Element(new_root))?;

        let inherited: Vec<_> = matches
            .iter()
            .map(|elem| inherited_namespaces(document, *elem))
            .collect();
        for elem in &matches {
            elem.detatch(document)?;
        }
        for (elem, namespaces) in matches.into_iter().zip(inherited) {
            let moved = elem.transplant(document, &mut result)?;
            moved.mut_namespace_decls(&mut result).extend(namespaces);
            new_root.push_child(&mut result, Node::Element(moved))?;
        }
        Ok(result)
    }
}

/// Loads documents and filters them in one call.
pub struct FilteringParser {
    loader: DocumentLoader,
    filter: AttributeFilter,
    target: String,
}

impl FilteringParser {
    pub fn new<S: Into<String>>(
        loader: DocumentLoader,
        filter: AttributeFilter,
        target: S,
    ) -> FilteringParser {
        FilteringParser {
            loader,
            filter,
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target<S: Into<String>>(&mut self, target: S) {
        self.target = target.into();
    }

    pub fn loader_mut(&mut self) -> &mut DocumentLoader {
        &mut self.loader
    }

    pub fn filter(&self) -> &AttributeFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut AttributeFilter {
        &mut self.filter
    }

    pub fn parse_str(&mut self, text: &str) -> Result<Document> {
        let mut document = self.loader.load_str(text)?;
        self.filter.filter(&mut document, &self.target)
    }

    pub fn parse_reader<R: Read>(&mut self, reader: R) -> Result<Document> {
        let mut document = self.loader.load_reader(reader)?;
        self.filter.filter(&mut document, &self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ValidationSpec;
    use std::str::FromStr;

    fn names(doc: &Document, elems: &[Element]) -> Vec<String> {
        elems
            .iter()
            .map(|e| format!("{}#{}", e.full_name(doc), e.attribute(doc, "id").unwrap_or("")))
            .collect()
    }

    #[test]
    fn test_query_text() {
        let mut filter = AttributeFilter::new();
        assert_eq!(filter.query_text("X"), "//X");
        filter.add_required("a");
        filter.add_required("b");
        filter.add_rejected("c");
        assert_eq!(filter.predicate(), "@a='true' and @b='true' and @c='false'");
        assert_eq!(
            filter.query_text("X"),
            "//X[@a='true' and @b='true' and @c='false']"
        );
        filter.remove_required("a");
        assert_eq!(filter.query_text("X"), "//X[@b='true' and @c='false']");
        filter.add_required("a");
        assert_eq!(filter.query_text("X"), "//X[@b='true' and @a='true' and @c='false']");
    }

    #[test]
    fn test_mutators() {
        let mut filter = AttributeFilter::new();
        filter.add_required("");
        filter.add_rejected("");
        assert!(filter.required().is_empty() && filter.rejected().is_empty());

        filter.add_required("a");
        filter.add_required("a");
        assert_eq!(filter.required().len(), 1);
        filter.remove_required("missing");
        assert_eq!(filter.required().len(), 1);

        filter.add_rejected("b");
        filter.clear_required();
        assert!(filter.required().is_empty());
        assert_eq!(filter.rejected().len(), 1);
        filter.clear_rejected();
        assert!(filter.rejected().is_empty());
    }

    #[test]
    fn test_cache() {
        let mut filter = AttributeFilter::new().with_required("a");
        assert!(filter.is_stale());
        assert_eq!(filter.query("X").unwrap().as_str(), "//X[@a='true']");
        assert!(!filter.is_stale());

        // no-op adds keep the cache
        filter.add_required("a");
        filter.add_rejected("");
        assert!(!filter.is_stale());

        // removals invalidate even when nothing was removed
        filter.remove_rejected("missing");
        assert!(filter.is_stale());
        filter.query("X").unwrap();

        filter.add_rejected("b");
        assert!(filter.is_stale());
        assert_eq!(
            filter.query("X").unwrap().as_str(),
            "//X[@a='true' and @b='false']"
        );
        assert_eq!(
            filter.query("Y").unwrap().as_str(),
            "//Y[@a='true' and @b='false']"
        );

        filter.clear_required();
        assert!(filter.is_stale());
        filter.query("Y").unwrap();
        filter.clear_rejected();
        assert!(filter.is_stale());
    }

    #[test]
    fn test_invalid_query() {
        let mut doc = Document::from_str("<a/>").unwrap();
        let mut filter = AttributeFilter::new();
        assert!(matches!(filter.query(""), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            filter.filter(&mut doc, "a b"),
            Err(Error::InvalidQuery(_))
        ));
        filter.add_required("bad name");
        assert!(matches!(filter.query("a"), Err(Error::InvalidQuery(_))));
        assert!(filter.is_stale());
    }

    #[test]
    fn test_filter() {
        let mut doc = Document::from_str(
            r#"<root>
                <X id="1" a="true"/>
                <group>
                    <X id="2" a="true" b="false"><child/></X>
                    <X id="3" a="false"/>
                </group>
                <X id="4" b="true"/>
            </root>"#,
        )
        .unwrap();
        let mut filter = AttributeFilter::new().with_required("a");
        let result = filter.filter(&mut doc, "X").unwrap();

        let root = result.root_element().unwrap();
        assert_eq!(root.full_name(&result), "root");
        assert!(root.attributes(&result).is_empty());
        let children = root.child_elements(&result);
        assert_eq!(names(&result, &children), vec!["X#1", "X#2"]);
        assert_eq!(children[1].child_elements(&result).len(), 1);

        let left = doc.select("//X").unwrap();
        assert_eq!(names(&doc, &left), vec!["X#3", "X#4"]);
        assert_eq!(doc.select("//group").unwrap().len(), 1);
    }

    #[test]
    fn test_filter_nested() {
        let mut doc = Document::from_str(
            r#"<r><X id="1"><X id="2"><X id="3"/></X></X><X id="4"/></r>"#,
        )
        .unwrap();
        let mut filter = AttributeFilter::new();
        let result = filter.filter(&mut doc, "X").unwrap();
        let root = result.root_element().unwrap();
        let children = root.child_elements(&result);
        assert_eq!(names(&result, &children), vec!["X#1", "X#2", "X#3", "X#4"]);
        assert!(children.iter().all(|c| c.child_elements(&result).is_empty()));
        assert!(doc.root_element().unwrap().child_elements(&doc).is_empty());
    }

    #[test]
    fn test_filter_keeps_namespaces() {
        let mut doc = Document::from_str(
            r#"<r xmlns:p="urn:p" xmlns="urn:d" xmlns:q="urn:q">
                <p:item a="true" q:note="x"><child/></p:item>
                <g xmlns:p="urn:other"><p:item a="true"/></g>
            </r>"#,
        )
        .unwrap();
        let mut filter = AttributeFilter::new().with_required("a");
        let result = filter.filter(&mut doc, "p:item").unwrap();
        let items = result.root_element().unwrap().child_elements(&result);
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].namespace(&result), Some("urn:p"));
        let decls: Vec<(&str, &str)> = items[0]
            .namespace_decls(&result)
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(decls, vec![("p", "urn:p"), ("q", "urn:q"), ("", "urn:d")]);
        let child = items[0].child_elements(&result)[0];
        assert_eq!(child.namespace(&result), Some("urn:d"));
        assert_eq!(items[1].namespace(&result), Some("urn:other"));

        // unused bindings are not copied
        let mut doc = Document::from_str(r#"<r xmlns:p="urn:p"><X a="true"/></r>"#).unwrap();
        let result = filter.filter(&mut doc, "X").unwrap();
        let x = result.root_element().unwrap().child_elements(&result)[0];
        assert!(x.namespace_decls(&result).is_empty());

        let reparsed = Document::from_str(&result.write_str().unwrap()).unwrap();
        assert_eq!(reparsed.select("/r/X").unwrap().len(), 1);
    }

    #[test]
    fn test_filter_contradiction() {
        let mut doc = Document::from_str(r#"<r><X a="true"/><X a="false"/></r>"#).unwrap();
        let mut filter = AttributeFilter::new().with_required("a").with_rejected("a");
        let result = filter.filter(&mut doc, "X").unwrap();
        assert!(!result.root_element().unwrap().has_children(&result));
        assert_eq!(doc.select("//X").unwrap().len(), 2);
    }

    #[test]
    fn test_filter_no_root() {
        let mut doc = Document::new();
        let mut filter = AttributeFilter::new();
        assert!(matches!(
            filter.filter(&mut doc, "X"),
            Err(Error::InvalidDocument)
        ));
    }

    #[test]
    fn test_filtering_parser() {
        let dtd = "<!ELEMENT list (entry*)>\n<!ELEMENT entry EMPTY>\n\
                   <!ATTLIST entry on (true|false) #REQUIRED>";
        let loader = DocumentLoader::new(ValidationSpec::dtd(dtd.as_bytes(), "list"));
        let filter = AttributeFilter::new().with_required("on");
        let mut parser = FilteringParser::new(loader, filter, "entry");
        assert_eq!(parser.target(), "entry");

        let result = parser
            .parse_str(r#"<list><entry on="true"/><entry on="false"/></list>"#)
            .unwrap();
        assert_eq!(result.select("/list/entry").unwrap().len(), 1);

        assert!(matches!(
            parser.parse_str(r#"<list><entry on="maybe"/></list>"#),
            Err(Error::Validation(_))
        ));

        parser.filter_mut().clear_required();
        parser.filter_mut().add_rejected("on");
        let result = parser
            .parse_reader(r#"<list><entry on="true"/><entry on="false"/></list>"#.as_bytes())
            .unwrap();
        assert_eq!(result.select("//entry[@on='false']").unwrap().len(), 1);
        assert!(parser.filter().required().is_empty());

        parser.loader_mut().set_validation(ValidationSpec::None);
        parser.set_target("other");
        let result = parser.parse_str("<list><other on=\"false\"/></list>").unwrap();
        assert_eq!(result.root_element().unwrap().child_elements(&result).len(), 1);
    }
}
