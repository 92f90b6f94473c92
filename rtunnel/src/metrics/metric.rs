use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::{counter, gauge};

#[derive(Clone, Debug, PartialEq)]
pub struct Tag(String, String);

impl Tag {
    pub fn new<F, C>(field: F, context: C) -> Self
    where
        F: ToString,
        C: ToString,
    {
        Tag(field.to_string(), context.to_string())
    }
}

struct CounterMeta {
    name: String,
    tags: Vec<Tag>,
    old_value: AtomicU64,
    value: Arc<AtomicU64>,
}

struct GaugeMeta {
    name: String,
    tags: Vec<Tag>,
    value: Arc<AtomicI64>,
}

lazy_static! {
    static ref COUNTER: RwLock<Vec<CounterMeta>> = RwLock::new(Vec::new());
    static ref GAUGE: RwLock<Vec<GaugeMeta>> = RwLock::new(Vec::new());
    static ref ENGINE_ID: RwLock<String> = RwLock::new("local".to_string());
}

// metric values stay valid after a panic in an unrelated reader, so poisoning is ignored
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn set_engine_id(engine_id: &str) {
    *write(&*ENGINE_ID) = engine_id.to_string();
}

pub fn get_engine_id() -> String {
    read(&*ENGINE_ID).clone()
}

#[derive(Clone, Default, Debug)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    fn new(value: Arc<AtomicU64>) -> Self {
        Counter { value }
    }

    pub fn fetch_add(&self, v: u64) -> u64 {
        self.value.fetch_add(v, Ordering::Relaxed)
    }

    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Default, Debug)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    fn new(value: Arc<AtomicI64>) -> Self {
        Gauge { value }
    }

    pub fn store(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn fetch_add(&self, v: i64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn fetch_sub(&self, v: i64) {
        self.value.fetch_sub(v, Ordering::Relaxed);
    }

    pub fn load(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub fn register_counter<K>(name: K, tags: Vec<Tag>) -> Counter
where
    K: ToString,
{
    let value = Arc::new(AtomicU64::new(0));
    let meta = CounterMeta {
        name: name.to_string(),
        tags,
        old_value: AtomicU64::new(0),
        value: value.clone(),
    };

    write(&*COUNTER).push(meta);
    Counter::new(value)
}

pub fn register_gauge<K>(name: K, tags: Vec<Tag>) -> Gauge
where
    K: ToString,
{
    let value = Arc::new(AtomicI64::new(0));
    let meta = GaugeMeta {
        name: name.to_string(),
        tags,
        value: value.clone(),
    };

    write(&*GAUGE).push(meta);
    Gauge::new(value)
}

/// Drop every metric carrying `tag`, used when a job leaves the server.
pub fn unregister(tag: &Tag) {
    write(&*COUNTER).retain(|meta| !meta.tags.contains(tag));
    write(&*GAUGE).retain(|meta| !meta.tags.contains(tag));
}

/// Publish the registry to the installed `metrics` recorder.
pub(crate) fn compute() {
    compute_counter();
    compute_gauge();
}

fn labels_of(engine_id: &str, tags: &[Tag]) -> Vec<(String, String)> {
    let mut labels = Vec::with_capacity(tags.len() + 1);
    labels.push(("engine_id".to_string(), engine_id.to_string()));
    for tag in tags {
        labels.push((tag.0.clone(), tag.1.clone()));
    }
    labels
}

pub(crate) fn compute_counter() {
    let engine_id = get_engine_id();
    let metrics = read(&*COUNTER);
    for meta in &*metrics {
        let name = meta.name.clone();

        let value: u64 = meta.value.load(Ordering::Relaxed);
        let old_value: u64 = meta.old_value.swap(value, Ordering::Relaxed);
        let incr = value.saturating_sub(old_value);

        let labels = labels_of(engine_id.as_str(), &meta.tags);
        counter!(name, incr, &labels);
    }
}

pub(crate) fn compute_gauge() {
    let engine_id = get_engine_id();
    let metrics = read(&*GAUGE);
    for meta in &*metrics {
        let name = meta.name.clone();

        let labels = labels_of(engine_id.as_str(), &meta.tags);
        let val = meta.value.load(Ordering::Relaxed) as f64;
        gauge!(name, val, &labels);
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::metric::{compute, register_counter, register_gauge, unregister, Tag};

    #[test]
    pub fn register_and_unregister_test() {
        let tag = Tag::new("job_id", "metric-test-job");
        let counter = register_counter("metric_test_counter", vec![tag.clone()]);
        let gauge = register_gauge("metric_test_gauge", vec![tag.clone()]);

        counter.fetch_add(3);
        gauge.store(7);
        gauge.fetch_sub(2);
        assert_eq!(counter.load(), 3);
        assert_eq!(gauge.load(), 5);

        // no recorder installed, publishing is a no-op
        compute();

        unregister(&tag);
        counter.fetch_add(1);
        assert_eq!(counter.load(), 4);
    }
}
