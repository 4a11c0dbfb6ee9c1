use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fmt::Write;
use xml_attr_filter::{AttributeFilter, DocumentLoader, ValidationSpec};

const SCHEMA: &str = include_str!("../tests/documents/orders.xsd");

fn orders(count: usize) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<orders>\n");
    for i in 1..=count {
        write!(
            xml,
            "  <order id=\"{}\" paid=\"{}\" shipped=\"{}\"><customer>c{}</customer>\
             <item sku=\"SKU-{}\" qty=\"{}\"/></order>\n",
            i,
            i % 2 == 0,
            i % 3 == 0,
            i,
            i % 100,
            i % 7
        )
        .unwrap();
    }
    xml.push_str("</orders>\n");
    xml
}

macro_rules! bench {
    ($count:literal, $load:ident, $validate:ident, $filter:ident) => {
        fn $load(c: &mut Criterion) {
            let xml = orders($count);
            let mut loader = DocumentLoader::default();
            c.bench_function(stringify!($load), |b| {
                b.iter(|| black_box(loader.load_str(&xml).unwrap()))
            });
        }

        fn $validate(c: &mut Criterion) {
            let xml = orders($count);
            let mut loader = DocumentLoader::new(ValidationSpec::schema(SCHEMA.as_bytes()));
            c.bench_function(stringify!($validate), |b| {
                b.iter(|| black_box(loader.load_str(&xml).unwrap()))
            });
        }

        fn $filter(c: &mut Criterion) {
            let xml = orders($count);
            let mut loader = DocumentLoader::default();
            let mut filter = AttributeFilter::new()
                .with_required("paid")
                .with_rejected("shipped");
            c.bench_function(stringify!($filter), |b| {
                b.iter(|| {
                    let mut doc = loader.load_str(&xml).unwrap();
                    black_box(filter.filter(&mut doc, "order").unwrap())
                })
            });
        }
    };
}

bench!(10, tiny_load, tiny_validate, tiny_filter);
bench!(1000, medium_load, medium_validate, medium_filter);
bench!(20000, large_load, large_validate, large_filter);

criterion_group! {
    name = tiny;
    config = Criterion::default().sample_size(200);
    targets = tiny_load, tiny_validate, tiny_filter
}

criterion_group!(medium, medium_load, medium_validate, medium_filter);

criterion_group! {
    name = large;
    config = Criterion::default().sample_size(20);
    targets = large_load, large_validate, large_filter
}

criterion_main!(tiny, medium, large);
