//! Explicit bucket histograms for operation metrics.
//!
//! A [`Histogram`] aggregates measurements per distinct attribute set into
//! cumulative bucket counts, a sum, a minimum and a maximum. It is what an
//! [`OperationListener`] records durations into; collecting the data points
//! and exporting them is left to the application.
//!
//! [`OperationListener`]: crate::OperationListener
use crate::{otel_debug, KeyValue, Value};
use dashmap::DashMap;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Attributes identifying one data point: sorted by key, one value per key.
#[derive(Clone, Debug)]
struct AttributeSet(Vec<KeyValue>);

impl From<&[KeyValue]> for AttributeSet {
    fn from(values: &[KeyValue]) -> Self {
        let mut sorted = values.to_vec();
        // Stable: of several values for a key, the last one recorded wins.
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        let mut set: Vec<KeyValue> = Vec::with_capacity(sorted.len());
        for kv in sorted {
            match set.last_mut() {
                Some(last) if last.key == kv.key => *last = kv,
                _ => set.push(kv),
            }
        }
        AttributeSet(set)
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.key == b.key && value_eq(&a.value, &b.value))
    }
}

impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for kv in &self.0 {
            kv.key.hash(state);
            hash_value(&kv.value, state);
        }
    }
}

/// Floats compare by bit pattern so that every value, NaN included, equals
/// itself.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
        _ => a == b,
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Bool(v) => {
            state.write_u8(0);
            v.hash(state);
        }
        Value::I64(v) => {
            state.write_u8(1);
            v.hash(state);
        }
        Value::F64(v) => {
            state.write_u8(2);
            v.to_bits().hash(state);
        }
        Value::String(v) => {
            state.write_u8(3);
            v.hash(state);
        }
        Value::StringArray(v) => {
            state.write_u8(4);
            v.hash(state);
        }
    }
}

#[derive(Debug)]
struct Buckets {
    counts: Vec<u64>,
    count: u64,
    total: f64,
    min: f64,
    max: f64,
}

impl Buckets {
    /// Buckets with `n` bins.
    fn new(n: usize) -> Buckets {
        Buckets {
            counts: vec![0; n],
            count: 0,
            total: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn bin(&mut self, index: usize, value: f64) {
        self.counts[index] += 1;
        self.count += 1;
        self.total += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// The aggregate of one attribute set.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramDataPoint {
    /// Attributes of the measurements, sorted by key.
    pub attributes: Vec<KeyValue>,
    /// Number of measurements.
    pub count: u64,
    /// Sum of the measurements.
    pub sum: f64,
    /// Smallest measurement.
    pub min: f64,
    /// Largest measurement.
    pub max: f64,
    /// Upper bounds of the buckets, the last bucket being unbounded.
    pub bounds: Vec<f64>,
    /// Count per bucket, one more than there are bounds.
    pub bucket_counts: Vec<u64>,
}

impl HistogramDataPoint {
    /// Value of an attribute of the data point.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// A cumulative histogram with explicit bucket bounds.
///
/// ```
/// use opentelemetry_instrumentation::metrics::Histogram;
/// use opentelemetry_instrumentation::KeyValue;
///
/// let histogram = Histogram::new("db.operation.duration", "s", vec![0.1, 1.0]);
/// histogram.record(0.05, &[KeyValue::new("db.operation", "SELECT")]);
/// histogram.record(0.5, &[KeyValue::new("db.operation", "SELECT")]);
///
/// let points = histogram.collect();
/// assert_eq!(points[0].count, 2);
/// assert_eq!(points[0].bucket_counts, vec![1, 1, 0]);
/// ```
pub struct Histogram {
    name: Cow<'static, str>,
    unit: Cow<'static, str>,
    bounds: Vec<f64>,
    points: DashMap<AttributeSet, Mutex<Buckets>>,
}

impl Histogram {
    /// Create a histogram. NaN bounds are dropped and the rest sorted.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        unit: impl Into<Cow<'static, str>>,
        mut bounds: Vec<f64>,
    ) -> Self {
        bounds.retain(|bound| !bound.is_nan());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        Histogram {
            name: name.into(),
            unit: unit.into(),
            bounds,
            points: DashMap::new(),
        }
    }

    /// Name of the instrument.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit of the measurements.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Upper bounds of the buckets.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Records `value` for `attributes`. Non-finite values are ignored.
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        if !value.is_finite() {
            otel_debug!(name: "Histogram.NonFiniteValue", histogram = &*self.name);
            return;
        }
        // In `[0, bounds.len()]`, the last index being the unbounded bucket.
        let index = self.bounds.partition_point(|&bound| bound < value);
        let attributes = AttributeSet::from(attributes);

        if let Some(buckets) = self.points.get(&attributes) {
            bin(&buckets, index, value);
            return;
        }
        let buckets = self
            .points
            .entry(attributes)
            .or_insert_with(|| Mutex::new(Buckets::new(self.bounds.len() + 1)));
        bin(&buckets, index, value);
    }

    /// A data point per attribute set recorded so far, in no particular
    /// order.
    pub fn collect(&self) -> Vec<HistogramDataPoint> {
        self.points
            .iter()
            .map(|entry| {
                let buckets = entry.value().lock().unwrap_or_else(|err| err.into_inner());
                HistogramDataPoint {
                    attributes: entry.key().0.clone(),
                    count: buckets.count,
                    sum: buckets.total,
                    min: buckets.min,
                    max: buckets.max,
                    bounds: self.bounds.clone(),
                    bucket_counts: buckets.counts.clone(),
                }
            })
            .collect()
    }

    /// The data point of `attributes`, if anything was recorded for them.
    pub fn data_point(&self, attributes: &[KeyValue]) -> Option<HistogramDataPoint> {
        let wanted = AttributeSet::from(attributes);
        self.collect()
            .into_iter()
            .find(|point| AttributeSet(point.attributes.clone()) == wanted)
    }
}

fn bin(buckets: &Mutex<Buckets>, index: usize, value: f64) {
    buckets
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .bin(index, value);
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("bounds", &self.bounds)
            .field("data_points", &self.points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;

    #[rstest]
    #[case(0.0, 0)]
    #[case(0.1, 0)]
    #[case(0.10001, 1)]
    #[case(1.0, 1)]
    #[case(7.5, 2)]
    fn value_lands_in_bucket(#[case] value: f64, #[case] bucket: usize) {
        let histogram = Histogram::new("test", "s", vec![1.0, 0.1, f64::NAN]);
        assert_eq!(histogram.bounds(), &[0.1, 1.0]);

        histogram.record(value, &[]);
        let point = histogram.data_point(&[]).unwrap();
        let mut expected = vec![0; 3];
        expected[bucket] = 1;
        assert_eq!(point.bucket_counts, expected);
    }

    #[test]
    fn aggregates_per_attribute_set() {
        let histogram = Histogram::new("test", "s", vec![1.0]);
        let get = [KeyValue::new("method", "GET"), KeyValue::new("status", 200i64)];
        let reordered = [KeyValue::new("status", 200i64), KeyValue::new("method", "GET")];

        histogram.record(0.5, &get);
        histogram.record(2.0, &reordered);
        histogram.record(0.25, &[KeyValue::new("method", "PUT")]);
        histogram.record(f64::NAN, &get);

        assert_eq!(histogram.collect().len(), 2);
        let point = histogram.data_point(&get).unwrap();
        assert_eq!(point.count, 2);
        assert_eq!(point.sum, 2.5);
        assert_eq!(point.min, 0.5);
        assert_eq!(point.max, 2.0);
        assert_eq!(point.bucket_counts, vec![1, 1]);
        assert_eq!(point.attribute("status"), Some(&Value::I64(200)));
        assert!(histogram
            .data_point(&[KeyValue::new("method", "DELETE")])
            .is_none());
    }

    #[test]
    fn last_value_of_a_key_wins() {
        let histogram = Histogram::new("test", "s", vec![]);
        histogram.record(
            1.0,
            &[KeyValue::new("status", 500i64), KeyValue::new("status", 200i64)],
        );
        let points = histogram.collect();
        assert_eq!(points[0].attributes, vec![KeyValue::new("status", 200i64)]);
    }

    #[test]
    fn concurrent_records() {
        let histogram = Arc::new(Histogram::new("test", "s", vec![0.5]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let histogram = Arc::clone(&histogram);
                thread::spawn(move || {
                    for i in 0..100 {
                        histogram.record(f64::from(i % 2), &[KeyValue::new("k", "v")]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let point = histogram.data_point(&[KeyValue::new("k", "v")]).unwrap();
        assert_eq!(point.count, 400);
        assert_eq!(point.bucket_counts, vec![200, 200]);
    }
}
