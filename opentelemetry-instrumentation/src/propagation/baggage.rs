use crate::baggage::{Baggage, KeyValueMetadata};
use crate::otel_warn;
use crate::propagation::{CarrierContext, Extractor, FieldIter, Injector, TextMapPropagator};
use once_cell::sync::Lazy;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::iter;

static BAGGAGE_HEADER: &str = "baggage";
const FRAGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b';').add(b',').add(b'=');

static BAGGAGE_FIELDS: Lazy<[String; 1]> = Lazy::new(|| [BAGGAGE_HEADER.to_owned()]);

/// Propagates name/value pairs in [W3C Baggage] format under the `baggage`
/// key.
///
/// Names and values are percent-encoded. When the carrier holds several
/// `baggage` values, or one value repeats a name, the entries are read in
/// carrier order and the first occurrence of each name wins.
///
/// # Examples
///
/// ```
/// use opentelemetry_instrumentation::propagation::{BaggagePropagator, ContextPropagators};
/// use std::collections::HashMap;
///
/// let mut headers = HashMap::new();
/// headers.insert("baggage".to_string(), "user_id=1,user_id=2".to_string());
///
/// let propagators = ContextPropagators::new(BaggagePropagator::new());
/// let cx = propagators.extract(&headers);
///
/// assert_eq!(cx.baggage().get("user_id"), Some("1"));
/// ```
///
/// [W3C Baggage]: https://w3c.github.io/baggage
#[derive(Debug, Default)]
pub struct BaggagePropagator {
    _private: (),
}

impl BaggagePropagator {
    /// Construct a new baggage propagator.
    pub fn new() -> Self {
        BaggagePropagator { _private: () }
    }

    fn parse_entry(header_value: &str, entry: &str) -> Option<KeyValueMetadata> {
        let mut parts = entry.split(';');
        let name_and_value = parts.next()?;
        let mut kv = name_and_value.splitn(2, '=');
        let (name, value) = match (kv.next(), kv.next()) {
            (Some(name), Some(value)) => (name, value),
            _ => {
                otel_warn!(
                    name: "BaggagePropagator.Extract.InvalidKeyValueFormat",
                    message = "Invalid baggage key-value format",
                    baggage_header = header_value,
                );
                return None;
            }
        };

        match (
            percent_decode_str(name).decode_utf8(),
            percent_decode_str(value).decode_utf8(),
        ) {
            (Ok(name), Ok(value)) => {
                // The first `;` separates the value from its properties and is
                // not part of the metadata.
                let decoded_props = parts
                    .flat_map(|prop| percent_decode_str(prop).decode_utf8())
                    .map(|prop| prop.trim().to_string())
                    .collect::<Vec<String>>()
                    .join(";");
                Some(KeyValueMetadata::new(
                    name.trim().to_owned(),
                    value.trim().to_owned(),
                    decoded_props,
                ))
            }
            _ => {
                otel_warn!(
                    name: "BaggagePropagator.Extract.InvalidUTF8",
                    message = "Invalid UTF8 string in key values",
                    baggage_header = header_value,
                );
                None
            }
        }
    }
}

impl TextMapPropagator for BaggagePropagator {
    /// Encodes the baggage of the snapshot, replacing any previous `baggage`
    /// value. Nothing is injected for empty baggage.
    fn inject(&self, cx: &CarrierContext, injector: &mut dyn Injector) {
        let baggage = cx.baggage();
        if !baggage.is_empty() {
            let header_value = baggage
                .iter()
                .map(|(name, (value, metadata))| {
                    let metadata_str = metadata.as_str().trim();
                    let metadata_prefix = if metadata_str.is_empty() { "" } else { ";" };
                    utf8_percent_encode(name.as_str().trim(), FRAGMENT)
                        .chain(iter::once("="))
                        .chain(utf8_percent_encode(value.trim(), FRAGMENT))
                        .chain(iter::once(metadata_prefix))
                        .chain(iter::once(metadata_str))
                        .collect()
                })
                .collect::<Vec<String>>()
                .join(",");
            injector.set(BAGGAGE_HEADER, header_value);
        }
    }

    /// Replaces the baggage of `cx` with the carrier's, when present.
    fn extract(&self, cx: CarrierContext, extractor: &dyn Extractor) -> CarrierContext {
        let Some(header_values) = extractor.get_all(BAGGAGE_HEADER) else {
            return cx;
        };

        let baggage: Baggage = header_values
            .iter()
            .flat_map(|header_value| {
                header_value
                    .split(',')
                    .filter(|entry| !entry.trim().is_empty())
                    .filter_map(move |entry| Self::parse_entry(header_value, entry))
            })
            .collect();
        cx.with_baggage(baggage)
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&*BAGGAGE_FIELDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baggage::BaggageMetadata;
    use crate::KeyValue;
    use rstest::rstest;
    use std::collections::HashMap;

    fn extract(header_value: &str) -> Baggage {
        let mut extractor: HashMap<String, String> = HashMap::new();
        extractor.insert(BAGGAGE_HEADER.to_string(), header_value.to_string());
        BaggagePropagator::new()
            .extract(CarrierContext::default(), &extractor)
            .baggage()
            .clone()
    }

    #[rstest]
    #[case("key1=val1,key2=val2", &[("key1", "val1"), ("key2", "val2")])]
    #[case("key1 =   val1,  key2 =val2   ", &[("key1", "val1"), ("key2", "val2")])]
    #[case("key1=val1,key2=val2%2Cval3", &[("key1", "val1"), ("key2", "val2,val3")])]
    #[case("key1=val1,key2=val2,a,val3", &[("key1", "val1"), ("key2", "val2")])]
    #[case("key1=,key2=val2", &[("key1", ""), ("key2", "val2")])]
    #[case("key1=first,key1=second", &[("key1", "first")])]
    fn extract_baggage(#[case] header_value: &str, #[case] expected: &[(&str, &str)]) {
        let baggage = extract(header_value);
        assert_eq!(baggage.len(), expected.len(), "{}", header_value);
        for (key, value) in expected {
            assert_eq!(baggage.get(key), Some(*value));
        }
    }

    #[test]
    fn extract_baggage_with_metadata() {
        let baggage = extract(
            "key1=value1;property1;property2, key2 = value2, key3=value3; propertyKey=propertyValue",
        );
        assert_eq!(
            baggage.get_with_metadata("key1"),
            Some(&("value1".to_string(), BaggageMetadata::from("property1;property2")))
        );
        assert_eq!(
            baggage.get_with_metadata("key2"),
            Some(&("value2".to_string(), BaggageMetadata::default()))
        );
        assert_eq!(
            baggage.get_with_metadata("key3"),
            Some(&("value3".to_string(), BaggageMetadata::from("propertyKey=propertyValue")))
        );
    }

    #[test]
    fn multi_valued_carrier_first_value_wins() {
        let mut extractor: HashMap<String, Vec<String>> = HashMap::new();
        extractor.insert(
            BAGGAGE_HEADER.to_string(),
            vec!["a=1,b=2".to_string(), "a=3,c=4".to_string()],
        );
        let cx = BaggagePropagator::new().extract(CarrierContext::default(), &extractor);
        let baggage = cx.baggage();
        assert_eq!(baggage.get("a"), Some("1"));
        assert_eq!(baggage.get("b"), Some("2"));
        assert_eq!(baggage.get("c"), Some("4"));
    }

    #[test]
    fn absent_header_keeps_existing_baggage() {
        let existing: Baggage = [KeyValue::new("k", "v")].into_iter().collect();
        let extractor: HashMap<String, String> = HashMap::new();
        let cx = BaggagePropagator::new().extract(
            CarrierContext::default().with_baggage(existing.clone()),
            &extractor,
        );
        assert_eq!(cx.baggage(), &existing);
    }

    #[rstest]
    #[case(vec![KeyValue::new("key1", "val1"), KeyValue::new("key2", "val2")], "key1=val1,key2=val2")]
    #[case(vec![KeyValue::new("key1", "val1,val2"), KeyValue::new("key2", "val3=4")], "key1=val1%2Cval2,key2=val3%3D4")]
    #[case(vec![KeyValue::new("key1", true), KeyValue::new("key2", 123i64)], "key1=true,key2=123")]
    fn inject_baggage(#[case] entries: Vec<KeyValue>, #[case] expected: &str) {
        let mut injector: HashMap<String, String> = HashMap::new();
        let cx = CarrierContext::default().with_baggage(entries.into_iter().collect());
        BaggagePropagator::new().inject(&cx, &mut injector);
        assert_eq!(injector.get(BAGGAGE_HEADER).map(String::as_str), Some(expected));
    }

    #[test]
    fn inject_baggage_with_metadata() {
        let entries = vec![
            KeyValueMetadata::new("key1", "val1", "prop1"),
            KeyValue::new("key2", "val2").into(),
            KeyValueMetadata::new("key3", "val3", "anykey=anyvalue"),
        ];
        let mut injector: HashMap<String, String> = HashMap::new();
        let cx = CarrierContext::default().with_baggage(entries.into_iter().collect());
        BaggagePropagator::new().inject(&cx, &mut injector);
        assert_eq!(
            injector.get(BAGGAGE_HEADER).map(String::as_str),
            Some("key1=val1;prop1,key2=val2,key3=val3;anykey=anyvalue")
        );
    }

    #[test]
    fn empty_baggage_injects_nothing() {
        let mut injector: HashMap<String, String> = HashMap::new();
        BaggagePropagator::new().inject(&CarrierContext::default(), &mut injector);
        assert!(injector.is_empty());
    }
}
