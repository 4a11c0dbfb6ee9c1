use crate::document::{Document, Node};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::mem;

/// Data of an [`Element`], owned by the [`Document`] store.
#[derive(Debug, Default)]
pub struct ElementData {
    full_name: String,
    attributes: IndexMap<String, String>, // q:attr="val" => {"q:attr": "val"}
    namespace_decls: IndexMap<String, String>, // local namespace newly defined in attributes
    parent: Option<Element>,
    children: Vec<Node>,
}

/// Represents an Xml Element.
///
/// This struct only contains a unique usize id and implements trait `Copy`.
/// So you do not need to bother with having a reference.
///
/// Because the actual data of the element is stored in [`Document`],
/// most methods takes `&Document` or `&mut Document` as its first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Element {
    id: usize,
}

impl Element {
    /// Create a new empty element with name.
    pub fn new<S: Into<String>>(document: &mut Document, name: S) -> Element {
        Self::with_data(document, name.into(), IndexMap::new(), IndexMap::new())
    }

    pub(crate) fn with_data(
        document: &mut Document,
        full_name: String,
        attributes: IndexMap<String, String>,
        namespace_decls: IndexMap<String, String>,
    ) -> Element {
        let elem = Element {
            id: document.store.len(),
        };
        document.store.push(ElementData {
            full_name,
            attributes,
            namespace_decls,
            parent: None,
            children: vec![],
        });
        elem
    }

    pub(crate) fn container() -> (Element, ElementData) {
        (Element { id: 0 }, ElementData::default())
    }

    /// The container is the nameless element that holds the root element,
    /// and top level comments, doctypes and processing instructions.
    pub fn is_container(&self) -> bool {
        self.id == 0
    }

    pub fn separate_prefix_name(full_name: &str) -> (&str, &str) {
        match full_name.split_once(':') {
            Some((prefix, name)) => (prefix, name),
            None => ("", full_name),
        }
    }
}

impl Element {
    fn data<'a>(&self, document: &'a Document) -> &'a ElementData {
        &document.store[self.id]
    }

    fn mut_data<'a>(&self, document: &'a mut Document) -> &'a mut ElementData {
        &mut document.store[self.id]
    }

    /// Get raw name of element, including its namespace prefix.
    pub fn full_name<'a>(&self, document: &'a Document) -> &'a str {
        &self.data(document).full_name
    }

    /// Get prefix and name of element.
    ///
    /// `<prefix:name` -> `("prefix", "name")`
    pub fn prefix_name<'a>(&self, document: &'a Document) -> (&'a str, &'a str) {
        Self::separate_prefix_name(self.full_name(document))
    }

    /// Get namespace prefix of element, without name.
    ///
    /// `<prefix:name>` -> `"prefix"`.
    pub fn prefix<'a>(&self, document: &'a Document) -> &'a str {
        self.prefix_name(document).0
    }

    /// Get local name of element, without its prefix.
    pub fn name<'a>(&self, document: &'a Document) -> &'a str {
        self.prefix_name(document).1
    }

    /// Get attributes of element, in the order they were written.
    ///
    /// The attribute names may have namespace prefix. To strip the prefix and only its name, call [`Element::separate_prefix_name`].
    pub fn attributes<'a>(&self, document: &'a Document) -> &'a IndexMap<String, String> {
        &self.data(document).attributes
    }

    pub fn mut_attributes<'a>(
        &self,
        document: &'a mut Document,
    ) -> &'a mut IndexMap<String, String> {
        &mut self.mut_data(document).attributes
    }

    /// Get attribute value by its full name.
    pub fn attribute<'a>(&self, document: &'a Document, name: &str) -> Option<&'a str> {
        self.attributes(document).get(name).map(|v| v.as_str())
    }

    /// Set attribute, returning the old value if there was one.
    pub fn set_attribute<S, T>(&self, document: &mut Document, name: S, value: T) -> Option<String>
    where
        S: Into<String>,
        T: Into<String>,
    {
        self.mut_attributes(document)
            .insert(name.into(), value.into())
    }

    /// Gets the namespace of this element.
    ///
    /// Shorthand for `self.namespace_for_prefix(document, self.prefix(document))`.
    pub fn namespace<'a>(&self, document: &'a Document) -> Option<&'a str> {
        self.namespace_for_prefix(document, self.prefix(document))
    }

    /// Gets map of `prefix:namespace` declared in its attributes.
    pub fn namespace_decls<'a>(&self, document: &'a Document) -> &'a IndexMap<String, String> {
        &self.data(document).namespace_decls
    }

    pub fn mut_namespace_decls<'a>(
        &self,
        document: &'a mut Document,
    ) -> &'a mut IndexMap<String, String> {
        &mut self.mut_data(document).namespace_decls
    }

    /// Get namespace value given prefix, for this element.
    pub fn namespace_for_prefix<'a>(
        &self,
        document: &'a Document,
        prefix: &str,
    ) -> Option<&'a str> {
        let mut elem = *self;
        loop {
            let data = elem.data(document);
            if let Some(value) = data.namespace_decls.get(prefix) {
                return Some(value);
            }
            elem = elem.parent(document)?;
        }
    }

    pub fn parent(&self, document: &Document) -> Option<Element> {
        self.data(document).parent
    }

    pub fn has_parent(&self, document: &Document) -> bool {
        self.parent(document).is_some()
    }

    pub fn children<'a>(&self, document: &'a Document) -> &'a Vec<Node> {
        &self.data(document).children
    }

    fn children_recursive_into<'a>(&self, document: &'a Document, nodes: &mut Vec<&'a Node>) {
        for node in self.children(document) {
            nodes.push(node);
            if let Node::Element(elem) = &node {
                elem.children_recursive_into(document, nodes);
            }
        }
    }

    /// All descendant nodes, in document order.
    pub fn children_recursive<'a>(&self, document: &'a Document) -> Vec<&'a Node> {
        let mut nodes = Vec::new();
        self.children_recursive_into(document, &mut nodes);
        nodes
    }

    pub fn has_children(&self, document: &Document) -> bool {
        !self.children(document).is_empty()
    }

    pub fn child_elements(&self, document: &Document) -> Vec<Element> {
        self.children(document)
            .iter()
            .filter_map(|node| node.as_element())
            .collect()
    }

    /// All descendant elements, in document order.
    pub fn child_elements_recursive(&self, document: &Document) -> Vec<Element> {
        self.children_recursive(document)
            .iter()
            .filter_map(|node| node.as_element())
            .collect()
    }

    /// Concatenated text of all descendant text and cdata nodes.
    pub fn text_content(&self, document: &Document) -> String {
        let mut buf = String::new();
        for node in self.children(document) {
            node.build_text_content(document, &mut buf);
        }
        buf
    }

    /// Equivalent to `vec.push()`.
    ///
    /// # Errors
    ///
    /// - [`Error::HasAParent`]: If node is an element, it must not have a parent.
    /// Call `elem.detatch()` before.
    /// - [`Error::ContainerCannotMove`]: The container element cannot be a child.
    pub fn push_child(&self, document: &mut Document, node: Node) -> Result<()> {
        if let Node::Element(elem) = node {
            if elem.is_container() {
                return Err(Error::ContainerCannotMove);
            }
            let data = elem.mut_data(document);
            if data.parent.is_some() {
                return Err(Error::HasAParent);
            }
            data.parent = Some(*self);
        }
        self.mut_data(document).children.push(node);
        Ok(())
    }

    /// Remove child element by value.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`]: Element was not found among its children.
    pub fn remove_child_elem(&self, document: &mut Document, element: Element) -> Result<()> {
        let children = &mut self.mut_data(document).children;
        let pos = children
            .iter()
            .position(|n| n.as_element() == Some(element))
            .ok_or(Error::NotFound)?;
        children.remove(pos);
        element.mut_data(document).parent = None;
        Ok(())
    }

    /// Remove this element from its parent. The element keeps its own children.
    pub fn detatch(&self, document: &mut Document) -> Result<()> {
        if self.is_container() {
            return Err(Error::ContainerCannotMove);
        }
        match self.parent(document) {
            Some(parent) => parent.remove_child_elem(document, *self),
            None => Ok(()),
        }
    }

    /// Move this detached element and its subtree from `from` into the store of `to`.
    ///
    /// The data is moved, not cloned. The old slot in `from` is left empty and
    /// unreachable. Returns the element's id in `to`, which has no parent yet.
    pub(crate) fn transplant(&self, from: &mut Document, to: &mut Document) -> Result<Element> {
        if self.is_container() {
            return Err(Error::ContainerCannotMove);
        }
        if self.has_parent(from) {
            return Err(Error::HasAParent);
        }
        let data = mem::take(self.mut_data(from));
        let moved = Element::with_data(to, data.full_name, data.attributes, data.namespace_decls);
        for node in data.children {
            let node = match node {
                Node::Element(child) => {
                    child.mut_data(from).parent = None;
                    Node::Element(child.transplant(from, to)?)
                }
                other => other,
            };
            moved.push_child(to, node)?;
        }
        Ok(moved)
    }
}
