use super::content::{child_names_and_text, describe, Particle, Term};
use crate::document::Document;
use crate::element::Element;
use crate::error::{Error, Result};
use indexmap::IndexMap;

const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    AnyType,
    String,
    Boolean,
    Integer,
    Long,
    Int,
    Short,
    Byte,
    NonNegativeInteger,
    PositiveInteger,
    UnsignedLong,
    UnsignedInt,
    UnsignedShort,
    Decimal,
    Double,
}

impl Builtin {
    fn from_name(name: &str) -> Builtin {
        match name {
            "anyType" | "anySimpleType" => Builtin::AnyType,
            "boolean" => Builtin::Boolean,
            "integer" => Builtin::Integer,
            "long" => Builtin::Long,
            "int" => Builtin::Int,
            "short" => Builtin::Short,
            "byte" => Builtin::Byte,
            "nonNegativeInteger" => Builtin::NonNegativeInteger,
            "positiveInteger" => Builtin::PositiveInteger,
            "unsignedLong" => Builtin::UnsignedLong,
            "unsignedInt" => Builtin::UnsignedInt,
            "unsignedShort" => Builtin::UnsignedShort,
            "decimal" => Builtin::Decimal,
            "double" | "float" => Builtin::Double,
            "string" => Builtin::String,
            other => {
                // dates, URIs, names and the like are checked as plain strings
                tracing::trace!(schema_type = other, "checking schema type as string");
                Builtin::String
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Builtin::AnyType => "anyType",
            Builtin::String => "string",
            Builtin::Boolean => "boolean",
            Builtin::Integer => "integer",
            Builtin::Long => "long",
            Builtin::Int => "int",
            Builtin::Short => "short",
            Builtin::Byte => "byte",
            Builtin::NonNegativeInteger => "nonNegativeInteger",
            Builtin::PositiveInteger => "positiveInteger",
            Builtin::UnsignedLong => "unsignedLong",
            Builtin::UnsignedInt => "unsignedInt",
            Builtin::UnsignedShort => "unsignedShort",
            Builtin::Decimal => "decimal",
            Builtin::Double => "double",
        }
    }

    fn accepts(&self, value: &str) -> bool {
        let v = value.trim();
        match self {
            Builtin::AnyType | Builtin::String => true,
            Builtin::Boolean => matches!(v, "true" | "false" | "1" | "0"),
            Builtin::Integer => v.parse::<i128>().is_ok(),
            Builtin::Long => v.parse::<i64>().is_ok(),
            Builtin::Int => v.parse::<i32>().is_ok(),
            Builtin::Short => v.parse::<i16>().is_ok(),
            Builtin::Byte => v.parse::<i8>().is_ok(),
            Builtin::NonNegativeInteger => v.parse::<i128>().map_or(false, |n| n >= 0),
            Builtin::PositiveInteger => v.parse::<i128>().map_or(false, |n| n > 0),
            Builtin::UnsignedLong => v.parse::<u64>().is_ok(),
            Builtin::UnsignedInt => v.parse::<u32>().is_ok(),
            Builtin::UnsignedShort => v.parse::<u16>().is_ok(),
            Builtin::Decimal => {
                let digits = v.strip_prefix(&['+', '-'][..]).unwrap_or(v);
                digits.chars().any(|c| c.is_ascii_digit())
                    && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
                    && digits.matches('.').count() <= 1
            }
            Builtin::Double => {
                matches!(v, "INF" | "-INF" | "+INF" | "NaN")
                    || (v
                        .chars()
                        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
                        && v.parse::<f64>().is_ok())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TypeRef {
    Builtin(Builtin),
    Named(String),
    Simple(SimpleType),
    Complex(Box<ComplexType>),
}

#[derive(Debug, Clone, PartialEq)]
struct SimpleType {
    base: Box<TypeRef>,
    enumeration: Vec<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct ElementDecl {
    name: String,
    ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq)]
enum ChildDecl {
    Local(ElementDecl),
    Global(String),
}

#[derive(Debug, Clone, PartialEq)]
struct AttributeDecl {
    ty: TypeRef,
    required: bool,
    prohibited: bool,
    fixed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ComplexType {
    mixed: bool,
    content: Option<Particle>,
    children: IndexMap<String, ChildDecl>,
    attributes: IndexMap<String, AttributeDecl>,
    any_attribute: bool,
    simple_content: Option<TypeRef>,
}

#[derive(Debug, Clone, PartialEq)]
enum NamedType {
    Simple(SimpleType),
    Complex(ComplexType),
}

enum Resolved<'a> {
    Builtin(Builtin),
    Simple(&'a SimpleType),
    Complex(&'a ComplexType),
}

/// A compiled W3C XML Schema, covering the structural subset most
/// configuration and data files use: global and local element declarations,
/// `sequence`/`choice`/`all` with occurrence bounds, attributes,
/// simple content, enumerations and the common built-in types.
///
/// Element and type names are matched by local name; target namespaces are
/// not checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    elements: IndexMap<String, ElementDecl>,
    types: IndexMap<String, NamedType>,
}

struct SchemaParser<'a> {
    doc: &'a Document,
}

impl<'a> SchemaParser<'a> {
    fn is_xsd(&self, elem: Element) -> bool {
        elem.namespace(self.doc) == Some(XSD_NAMESPACE)
    }

    fn xsd_children(&self, elem: Element) -> Vec<Element> {
        elem.child_elements(self.doc)
            .into_iter()
            .filter(|child| self.is_xsd(*child) && child.name(self.doc) != "annotation")
            .collect()
    }

    fn xsd_child(&self, elem: Element, name: &str) -> Option<Element> {
        self.xsd_children(elem)
            .into_iter()
            .find(|child| child.name(self.doc) == name)
    }

    fn required_attr(&self, elem: Element, attr: &str) -> Result<&'a str> {
        elem.attribute(self.doc, attr).ok_or_else(|| {
            Error::Grammar(format!(
                "<{}> is missing the {:?} attribute",
                elem.full_name(self.doc),
                attr
            ))
        })
    }

    fn type_ref(&self, elem: Element, qname: &str) -> TypeRef {
        let (prefix, local) = Element::separate_prefix_name(qname);
        if elem.namespace_for_prefix(self.doc, prefix) == Some(XSD_NAMESPACE) {
            TypeRef::Builtin(Builtin::from_name(local))
        } else {
            TypeRef::Named(local.to_string())
        }
    }

    fn occurs(&self, elem: Element) -> Result<(u32, Option<u32>)> {
        let invalid = |attr: &str, value: &str| {
            Error::Grammar(format!("Invalid {} value {:?}", attr, value))
        };
        let min = match elem.attribute(self.doc, "minOccurs") {
            Some(v) => v.trim().parse().map_err(|_| invalid("minOccurs", v))?,
            None => 1,
        };
        let max = match elem.attribute(self.doc, "maxOccurs") {
            Some("unbounded") => None,
            Some(v) => Some(v.trim().parse().map_err(|_| invalid("maxOccurs", v))?),
            None => Some(1),
        };
        if max.map_or(false, |max| max < min) {
            return Err(Error::Grammar(format!(
                "maxOccurs is less than minOccurs on <{}>",
                elem.full_name(self.doc)
            )));
        }
        Ok((min, max))
    }

    fn element_decl(&self, elem: Element) -> Result<ElementDecl> {
        let name = self.required_attr(elem, "name")?.to_string();
        let ty = if let Some(qname) = elem.attribute(self.doc, "type") {
            self.type_ref(elem, qname)
        } else if let Some(complex) = self.xsd_child(elem, "complexType") {
            TypeRef::Complex(Box::new(self.complex_type(complex)?))
        } else if let Some(simple) = self.xsd_child(elem, "simpleType") {
            TypeRef::Simple(self.simple_type(simple)?)
        } else {
            TypeRef::Builtin(Builtin::AnyType)
        };
        Ok(ElementDecl { name, ty })
    }

    fn complex_type(&self, elem: Element) -> Result<ComplexType> {
        let mut ct = ComplexType {
            mixed: elem.attribute(self.doc, "mixed") == Some("true"),
            ..ComplexType::default()
        };
        for child in self.xsd_children(elem) {
            match child.name(self.doc) {
                "sequence" | "choice" | "all" => {
                    ct.content = Some(self.particle(child, &mut ct.children)?);
                }
                "attribute" => {
                    let (name, decl) = self.attribute_decl(child)?;
                    ct.attributes.insert(name, decl);
                }
                "anyAttribute" => ct.any_attribute = true,
                "simpleContent" => {
                    let derivation = self
                        .xsd_children(child)
                        .into_iter()
                        .find(|d| matches!(d.name(self.doc), "extension" | "restriction"))
                        .ok_or_else(|| {
                            Error::Grammar("simpleContent without extension".to_string())
                        })?;
                    let base = self.required_attr(derivation, "base")?;
                    ct.simple_content = Some(self.type_ref(derivation, base));
                    for attr in self.xsd_children(derivation) {
                        match attr.name(self.doc) {
                            "attribute" => {
                                let (name, decl) = self.attribute_decl(attr)?;
                                ct.attributes.insert(name, decl);
                            }
                            "anyAttribute" => ct.any_attribute = true,
                            _ => {}
                        }
                    }
                }
                other => {
                    return Err(Error::Grammar(format!(
                        "Unsupported schema component <{}> in complexType",
                        other
                    )))
                }
            }
        }
        Ok(ct)
    }

    fn particle(
        &self,
        elem: Element,
        children: &mut IndexMap<String, ChildDecl>,
    ) -> Result<Particle> {
        let (min, max) = self.occurs(elem)?;
        let term = match elem.name(self.doc) {
            group @ ("sequence" | "choice" | "all") => {
                let members = self
                    .xsd_children(elem)
                    .into_iter()
                    .map(|member| self.particle(member, children))
                    .collect::<Result<Vec<_>>>()?;
                match group {
                    "sequence" => Term::Sequence(members),
                    "choice" => Term::Choice(members),
                    _ => Term::All(members),
                }
            }
            "element" => {
                if let Some(reference) = elem.attribute(self.doc, "ref") {
                    let name = Element::separate_prefix_name(reference).1.to_string();
                    children.insert(name.clone(), ChildDecl::Global(name.clone()));
                    Term::Element(name)
                } else {
                    let decl = self.element_decl(elem)?;
                    let name = decl.name.clone();
                    children.insert(name.clone(), ChildDecl::Local(decl));
                    Term::Element(name)
                }
            }
            "any" => Term::Any,
            other => {
                return Err(Error::Grammar(format!(
                    "Unsupported schema particle <{}>",
                    other
                )))
            }
        };
        Ok(Particle::new(term, min, max))
    }

    fn attribute_decl(&self, elem: Element) -> Result<(String, AttributeDecl)> {
        let name = match elem.attribute(self.doc, "ref") {
            Some(reference) => reference.to_string(),
            None => self.required_attr(elem, "name")?.to_string(),
        };
        let ty = if let Some(qname) = elem.attribute(self.doc, "type") {
            self.type_ref(elem, qname)
        } else if let Some(simple) = self.xsd_child(elem, "simpleType") {
            TypeRef::Simple(self.simple_type(simple)?)
        } else {
            TypeRef::Builtin(Builtin::String)
        };
        let usage = elem.attribute(self.doc, "use").unwrap_or("optional");
        let decl = AttributeDecl {
            ty,
            required: usage == "required",
            prohibited: usage == "prohibited",
            fixed: elem.attribute(self.doc, "fixed").map(|v| v.to_string()),
        };
        Ok((name, decl))
    }

    fn simple_type(&self, elem: Element) -> Result<SimpleType> {
        let restriction = match self.xsd_child(elem, "restriction") {
            Some(restriction) => restriction,
            None => {
                tracing::warn!("simpleType without restriction is checked as string");
                return Ok(SimpleType {
                    base: Box::new(TypeRef::Builtin(Builtin::String)),
                    enumeration: Vec::new(),
                    min_length: None,
                    max_length: None,
                });
            }
        };
        let base = self.required_attr(restriction, "base")?;
        let mut simple = SimpleType {
            base: Box::new(self.type_ref(restriction, base)),
            enumeration: Vec::new(),
            min_length: None,
            max_length: None,
        };
        for facet in self.xsd_children(restriction) {
            let value = self.required_attr(facet, "value")?;
            let length = || {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::Grammar(format!("Invalid length facet {:?}", value)))
            };
            match facet.name(self.doc) {
                "enumeration" => simple.enumeration.push(value.to_string()),
                "minLength" => simple.min_length = Some(length()?),
                "maxLength" => simple.max_length = Some(length()?),
                "length" => {
                    simple.min_length = Some(length()?);
                    simple.max_length = simple.min_length;
                }
                other => tracing::warn!(facet = other, "ignoring unsupported schema facet"),
            }
        }
        Ok(simple)
    }
}

impl Schema {
    /// Compile a schema from its xml text.
    ///
    /// # Errors
    ///
    /// - [`Error::Grammar`]: The text is not a well-formed schema, or uses
    /// components that are not supported.
    pub fn parse(text: &str) -> Result<Schema> {
        let doc = Document::parse_str(text)
            .map_err(|err| Error::Grammar(format!("Schema is not well-formed: {}", err)))?;
        let root = doc
            .root_element()
            .ok_or_else(|| Error::Grammar("Schema has no root element".to_string()))?;
        let parser = SchemaParser { doc: &doc };
        if !parser.is_xsd(root) || root.name(&doc) != "schema" {
            return Err(Error::Grammar(format!(
                "Expected a <schema> in namespace {}, found <{}>",
                XSD_NAMESPACE,
                root.full_name(&doc)
            )));
        }
        let mut schema = Schema::default();
        for child in parser.xsd_children(root) {
            match child.name(&doc) {
                "element" => {
                    let decl = parser.element_decl(child)?;
                    schema.elements.insert(decl.name.clone(), decl);
                }
                "complexType" => {
                    let name = parser.required_attr(child, "name")?.to_string();
                    let ct = parser.complex_type(child)?;
                    schema.types.insert(name, NamedType::Complex(ct));
                }
                "simpleType" => {
                    let name = parser.required_attr(child, "name")?.to_string();
                    let st = parser.simple_type(child)?;
                    schema.types.insert(name, NamedType::Simple(st));
                }
                other => tracing::warn!(component = other, "ignoring unsupported schema component"),
            }
        }
        tracing::debug!(
            elements = schema.elements.len(),
            types = schema.types.len(),
            "parsed schema"
        );
        Ok(schema)
    }

    fn resolve<'a>(&'a self, ty: &'a TypeRef) -> Result<Resolved<'a>> {
        match ty {
            TypeRef::Builtin(builtin) => Ok(Resolved::Builtin(*builtin)),
            TypeRef::Simple(simple) => Ok(Resolved::Simple(simple)),
            TypeRef::Complex(complex) => Ok(Resolved::Complex(complex.as_ref())),
            TypeRef::Named(name) => match self.types.get(name) {
                Some(NamedType::Simple(simple)) => Ok(Resolved::Simple(simple)),
                Some(NamedType::Complex(complex)) => Ok(Resolved::Complex(complex)),
                None => Err(Error::Grammar(format!("Type {:?} is not defined", name))),
            },
        }
    }

    /// Fails with [`Error::Validation`] carrying only the reason; callers add context.
    fn check_value(&self, ty: &TypeRef, value: &str) -> Result<()> {
        match self.resolve(ty)? {
            Resolved::Builtin(builtin) => match builtin.accepts(value) {
                true => Ok(()),
                false => Err(Error::Validation(format!(
                    "is not a valid {}",
                    builtin.name()
                ))),
            },
            Resolved::Simple(simple) => {
                self.check_value(&simple.base, value)?;
                if !simple.enumeration.is_empty() && !simple.enumeration.iter().any(|e| e == value)
                {
                    return Err(Error::Validation(format!(
                        "must be one of {}",
                        simple.enumeration.join("|")
                    )));
                }
                let len = value.chars().count();
                if simple.min_length.map_or(false, |min| len < min)
                    || simple.max_length.map_or(false, |max| len > max)
                {
                    return Err(Error::Validation("has an invalid length".to_string()));
                }
                Ok(())
            }
            Resolved::Complex(_) => Err(Error::Grammar(
                "A complex type cannot describe an attribute or text value".to_string(),
            )),
        }
    }

    /// Validate the document against the global element declarations.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`]: The first violation found, in document order.
    /// - [`Error::Grammar`]: The schema references a type it does not define.
    pub fn validate(&self, document: &Document) -> Result<()> {
        let root = document.root_element().ok_or(Error::InvalidDocument)?;
        let decl = self.elements.get(root.name(document)).ok_or_else(|| {
            Error::Validation(format!(
                "Root element <{}> is not declared in the schema",
                root.full_name(document)
            ))
        })?;
        self.validate_element(document, root, decl)
    }

    fn validate_element(
        &self,
        document: &Document,
        element: Element,
        decl: &ElementDecl,
    ) -> Result<()> {
        let name = element.full_name(document);
        let in_context = |err: Error| match err {
            Error::Validation(reason) => {
                Error::Validation(format!("Content of <{}> {}", name, reason))
            }
            other => other,
        };
        match self.resolve(&decl.ty)? {
            Resolved::Builtin(Builtin::AnyType) => Ok(()),
            Resolved::Builtin(_) | Resolved::Simple(_) => {
                if !element.child_elements(document).is_empty() {
                    return Err(Error::Validation(format!(
                        "Element <{}> has a simple type and cannot have child elements",
                        name
                    )));
                }
                if let Some(attr) = self.instance_attributes(document, element).next() {
                    return Err(Error::Validation(format!(
                        "Element <{}> has a simple type and cannot have attribute {:?}",
                        name, attr.0
                    )));
                }
                self.check_value(&decl.ty, &element.text_content(document))
                    .map_err(in_context)
            }
            Resolved::Complex(ct) => self.validate_complex(document, element, ct),
        }
    }

    fn instance_attributes<'d>(
        &self,
        document: &'d Document,
        element: Element,
    ) -> impl Iterator<Item = (&'d String, &'d String)> + 'd {
        element
            .attributes(document)
            .iter()
            .filter(move |(attr, _)| {
                let prefix = Element::separate_prefix_name(attr).0;
                prefix.is_empty()
                    || element.namespace_for_prefix(document, prefix) != Some(XSI_NAMESPACE)
            })
    }

    fn validate_complex(
        &self,
        document: &Document,
        element: Element,
        ct: &ComplexType,
    ) -> Result<()> {
        let name = element.full_name(document);
        for (attr, value) in self.instance_attributes(document, element) {
            let decl = match ct.attributes.get(attr) {
                Some(decl) => decl,
                None if ct.any_attribute => continue,
                None => {
                    return Err(Error::Validation(format!(
                        "Attribute {:?} is not declared for <{}>",
                        attr, name
                    )))
                }
            };
            let invalid = |reason: String| {
                Error::Validation(format!(
                    "Attribute {:?} of <{}> {}: {:?}",
                    attr, name, reason, value
                ))
            };
            if decl.prohibited {
                return Err(invalid("is prohibited".to_string()));
            }
            if let Some(fixed) = &decl.fixed {
                if fixed != value {
                    return Err(invalid(format!("must be {:?}", fixed)));
                }
            }
            self.check_value(&decl.ty, value).map_err(|err| match err {
                Error::Validation(reason) => invalid(reason),
                other => other,
            })?;
        }
        for (attr, decl) in &ct.attributes {
            if decl.required && element.attribute(document, attr).is_none() {
                return Err(Error::Validation(format!(
                    "Required attribute {:?} is missing on <{}>",
                    attr, name
                )));
            }
        }

        if let Some(base) = &ct.simple_content {
            if !element.child_elements(document).is_empty() {
                return Err(Error::Validation(format!(
                    "Element <{}> has simple content and cannot have child elements",
                    name
                )));
            }
            return self
                .check_value(base, &element.text_content(document))
                .map_err(|err| match err {
                    Error::Validation(reason) => {
                        Error::Validation(format!("Content of <{}> {}", name, reason))
                    }
                    other => other,
                });
        }

        let (children, has_text) = child_names_and_text(document, element, false);
        if has_text && !ct.mixed {
            return Err(Error::Validation(format!(
                "Element <{}> cannot contain text",
                name
            )));
        }
        let valid = match &ct.content {
            Some(particle) => particle.matches(&children),
            None => children.is_empty(),
        };
        if !valid {
            let expected = ct
                .content
                .as_ref()
                .map_or_else(|| "EMPTY".to_string(), describe);
            return Err(Error::Validation(format!(
                "Content of <{}> does not match {}: found ({})",
                name,
                expected,
                children.join(", ")
            )));
        }

        for child in element.child_elements(document) {
            match ct.children.get(child.name(document)) {
                Some(ChildDecl::Local(decl)) => self.validate_element(document, child, decl)?,
                Some(ChildDecl::Global(global)) => {
                    let decl = self.elements.get(global).ok_or_else(|| {
                        Error::Grammar(format!("Element {:?} is not declared globally", global))
                    })?;
                    self.validate_element(document, child, decl)?;
                }
                // matched by a wildcard
                None => {}
            }
        }
        Ok(())
    }
}
