use std::fs::File;
use xml_attr_filter::{
    AttributeFilter, DocumentLoader, Error, FilteringParser, ReadOptions, ValidationSpec,
};

const DOCS: &str = "tests/documents";

fn open(name: &str) -> File {
    File::open(format!("{}/{}", DOCS, name)).unwrap()
}

fn schema() -> ValidationSpec {
    ValidationSpec::schema(open("orders.xsd"))
}

fn dtd() -> ValidationSpec {
    ValidationSpec::dtd(open("orders.dtd"), "-//Example//DTD Orders//EN")
}

#[test]
fn test_schema_validation() {
    let mut loader = DocumentLoader::new(schema());
    assert!(loader.is_validating());
    let doc = loader.load_file(format!("{}/orders.xml", DOCS)).unwrap();
    assert_eq!(doc.select("//order").unwrap().len(), 5);

    // well-formed but invalid
    let err = loader
        .load_file(format!("{}/orders_invalid.xml", DOCS))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{:?}", err);

    // the cached schema keeps serving later loads
    loader.load_file(format!("{}/orders.xml", DOCS)).unwrap();
    let err = loader
        .load_str(r#"<orders><order id="1" paid="true"><customer/></order></orders>"#)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{:?}", err);
}

#[test]
fn test_invalid_loads_without_validation() {
    let mut loader = DocumentLoader::new(ValidationSpec::None);
    let doc = loader
        .load_file(format!("{}/orders_invalid.xml", DOCS))
        .unwrap();
    assert_eq!(doc.select("//item[@qty='two']").unwrap().len(), 1);

    loader.set_validation(schema());
    assert!(matches!(
        loader.load_file(format!("{}/orders_invalid.xml", DOCS)),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_dtd_validation() {
    let mut loader = DocumentLoader::new(dtd());
    let doc = loader
        .load_file(format!("{}/orders_doctype.xml", DOCS))
        .unwrap();
    assert_eq!(doc.select("//order").unwrap().len(), 2);
    assert!(doc.doctype().unwrap().contains("orders.dtd"));

    // xsi attributes and numeric ids are not declared by the DTD
    assert!(matches!(
        loader.load_file(format!("{}/orders.xml", DOCS)),
        Err(Error::Validation(_))
    ));

    let duplicate_id = r#"<!DOCTYPE orders SYSTEM "orders.dtd">
        <orders>
            <order id="o1" paid="true"><customer/><item sku="a" qty="1"/></order>
            <order id="o1" paid="true"><customer/><item sku="b" qty="1"/></order>
        </orders>"#;
    assert!(matches!(
        loader.load_str(duplicate_id),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_dtd_defaults_reach_the_filter() {
    let dtd = r#"<!ELEMENT root (item*)>
        <!ELEMENT item EMPTY>
        <!ATTLIST item attr1 (true|false) "true" on CDATA #IMPLIED>"#;
    let loader = DocumentLoader::new(ValidationSpec::dtd(dtd.as_bytes(), "items.dtd"));
    let filter = AttributeFilter::new().with_required("attr1");
    let mut parser = FilteringParser::new(loader, filter, "item");

    let result = parser
        .parse_str(r#"<root><item on="a"/><item attr1="false"/></root>"#)
        .unwrap();
    let matched = result.select("/root/item").unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].attribute(&result, "on"), Some("a"));

    // defaults declared in the internal subset apply too
    parser.filter_mut().clear_required();
    parser.filter_mut().add_required("on");
    let result = parser
        .parse_str(r#"<!DOCTYPE root [<!ATTLIST item on CDATA "true">]><root><item/><item on="x"/></root>"#)
        .unwrap();
    assert_eq!(result.select("/root/item").unwrap().len(), 1);
}

#[test]
fn test_dtd_entities() {
    let mut loader = DocumentLoader::new(dtd());
    let doc = loader
        .load_str(
            r#"<!DOCTYPE orders SYSTEM "orders.dtd">
            <orders>
                <order id="o1" paid="true"><customer>&company;</customer><item sku="a" qty="1"/></order>
            </orders>"#,
        )
        .unwrap();
    let customer = doc.select("//customer").unwrap();
    assert_eq!(customer[0].text_content(&doc), "Example Ltd");

    let doc = loader
        .load_str(
            r#"<!DOCTYPE orders SYSTEM "orders.dtd" [<!ENTITY company "Acme">]>
            <orders>
                <order id="o1" paid="true"><customer>&company;</customer><item sku="a" qty="&company;"/></order>
            </orders>"#,
        )
        .unwrap();
    let item = doc.select("//item").unwrap();
    assert_eq!(item[0].attribute(&doc, "qty"), Some("Acme"));

    let mut plain = DocumentLoader::default();
    assert!(matches!(
        plain.load_str("<orders>&company;</orders>"),
        Err(Error::MalformedXML(_))
    ));
}

#[test]
fn test_malformed() {
    for spec in [ValidationSpec::None, schema(), dtd()] {
        let mut loader = DocumentLoader::new(spec);
        for xml in ["<orders>", "<orders></order>", "<a/><b/>", "text<orders/>", ""] {
            let err = loader.load_str(xml).unwrap_err();
            assert!(matches!(err, Error::MalformedXML(_)), "{}: {:?}", xml, err);
        }
    }
}

#[test]
fn test_missing_file() {
    let mut loader = DocumentLoader::default();
    assert!(matches!(
        loader.load_file(format!("{}/missing.xml", DOCS)),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_read_options() {
    let opts = ReadOptions {
        require_decl: true,
        ..ReadOptions::default()
    };
    let mut loader = DocumentLoader::with_options(ValidationSpec::None, opts);
    assert!(loader.read_options().require_decl);
    loader.load_file(format!("{}/orders.xml", DOCS)).unwrap();
    assert!(loader.load_str("<orders/>").is_err());
}

#[test]
fn test_filtering_parser() {
    let filter = AttributeFilter::new()
        .with_required("paid")
        .with_rejected("shipped");
    let mut parser = FilteringParser::new(DocumentLoader::new(schema()), filter, "order");

    let result = parser.parse_reader(open("orders.xml")).unwrap();
    let root = result.root_element().unwrap();
    assert_eq!(root.full_name(&result), "orders");
    let ids: Vec<&str> = root
        .child_elements(&result)
        .iter()
        .filter_map(|order| order.attribute(&result, "id"))
        .collect();
    assert_eq!(ids, vec!["1"]);

    assert!(matches!(
        parser.parse_reader(open("orders_invalid.xml")),
        Err(Error::Validation(_))
    ));

    parser.loader_mut().set_validation(dtd());
    parser.filter_mut().clear_rejected();
    let result = parser.parse_reader(open("orders_doctype.xml")).unwrap();
    assert_eq!(result.select("/orders/order[@id='o1']").unwrap().len(), 1);
    assert_eq!(result.select("/orders/order").unwrap().len(), 1);
}
