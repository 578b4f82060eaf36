use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Running summary of numeric observations: total, min, max, sum of squares, count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub t: f64,
    pub min: f64,
    pub max: f64,
    pub sos: f64,
    pub c: u64,
}

impl Stats {
    pub fn observe(value: f64) -> Self {
        Self {
            t: value,
            min: value,
            max: value,
            sos: value * value,
            c: 1,
        }
    }

    pub fn combine(&mut self, other: &Stats) {
        self.t += other.t;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sos += other.sos;
        self.c += other.c;
    }
}

/// A single named metric. Both shapes combine associatively and commutatively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metric {
    Count(u64),
    Stats(Stats),
}

impl Metric {
    pub fn value(value: f64) -> Self {
        Metric::Stats(Stats::observe(value))
    }

    pub fn combine(&mut self, other: &Metric) {
        match (self, other) {
            (Metric::Count(a), Metric::Count(b)) => *a += b,
            (Metric::Stats(a), Metric::Stats(b)) => a.combine(b),
            // Mixing shapes under one name is a caller bug; newest shape wins.
            (slot, other) => *slot = other.clone(),
        }
    }
}

/// Per-bucket metrics. `count` is the number of `store` calls folded in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub count: u64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Metric>,
}

impl Metrics {
    fn absorb(&mut self, other: &Metrics) {
        self.count += other.count;
        combine_fields(&mut self.fields, &other.fields);
    }
}

fn combine_fields(into: &mut BTreeMap<String, Metric>, from: &BTreeMap<String, Metric>) {
    for (name, metric) in from {
        match into.get_mut(name) {
            Some(existing) => existing.combine(metric),
            None => {
                into.insert(name.clone(), metric.clone());
            }
        }
    }
}

fn fill_missing(into: &mut Attributes, from: Attributes) {
    for (name, value) in from {
        into.entry(name).or_insert(value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(skip)]
    pub key: String,
    pub params: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Attributes>,
}

impl Bucket {
    fn empty(key: &str) -> Self {
        Self {
            key: key.to_string(),
            params: Attributes::new(),
            metrics: None,
            stats: None,
            custom: None,
        }
    }
}

/// In-memory accumulator keyed by (type, bucket key). One instance is shared
/// by every feature of an agent.
#[derive(Debug, Default)]
pub struct Aggregator {
    data: HashMap<String, BTreeMap<String, Bucket>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&mut self, kind: &str, key: &str) -> &mut Bucket {
        self.data
            .entry(kind.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Bucket::empty(key))
    }

    /// Create or accumulate. Params and custom are last-write-wins; metrics
    /// combine per field and the bucket count goes up by one.
    pub fn store(
        &mut self,
        kind: &str,
        key: &str,
        params: Attributes,
        metrics: &BTreeMap<String, Metric>,
        custom: Option<Attributes>,
    ) -> &Bucket {
        let bucket = self.bucket(kind, key);
        bucket.params = params;
        if custom.is_some() {
            bucket.custom = custom;
        }
        let acc = bucket.metrics.get_or_insert_with(Metrics::default);
        acc.count += 1;
        combine_fields(&mut acc.fields, metrics);
        bucket
    }

    /// Fold one numeric observation into the bucket's summary stats.
    pub fn store_metric(&mut self, kind: &str, key: &str, params: Attributes, value: f64) -> &Bucket {
        let bucket = self.bucket(kind, key);
        bucket.params = params;
        let observed = Stats::observe(value);
        match bucket.stats.as_mut() {
            Some(stats) => stats.combine(&observed),
            None => bucket.stats = Some(observed),
        }
        bucket
    }

    /// Put back data that was taken but not delivered. Anything stored since
    /// the take is newer, so attributes already on the bucket are kept and
    /// only the missing ones are filled from the taken data.
    pub fn merge(
        &mut self,
        kind: &str,
        key: &str,
        metrics: Option<&Metrics>,
        params: Attributes,
        custom: Option<Attributes>,
    ) {
        let bucket = self.bucket(kind, key);
        fill_missing(&mut bucket.params, params);
        if let Some(taken) = custom {
            match bucket.custom.as_mut() {
                Some(existing) => fill_missing(existing, taken),
                None => bucket.custom = Some(taken),
            }
        }
        if let Some(metrics) = metrics {
            match bucket.metrics.as_mut() {
                Some(existing) => existing.absorb(metrics),
                None => bucket.metrics = Some(metrics.clone()),
            }
        }
    }

    /// `merge` for a whole taken bucket, including its summary stats.
    pub fn merge_bucket(&mut self, kind: &str, taken: Bucket) {
        let Bucket { key, params, metrics, stats, custom } = taken;
        self.merge(kind, &key, metrics.as_ref(), params, custom);
        if let Some(taken_stats) = stats {
            let bucket = self.bucket(kind, &key);
            match bucket.stats.as_mut() {
                Some(existing) => existing.combine(&taken_stats),
                None => bucket.stats = Some(taken_stats),
            }
        }
    }

    pub fn get(&self, kind: &str, key: &str) -> Option<&Bucket> {
        self.data.get(kind).and_then(|buckets| buckets.get(key))
    }

    pub fn len(&self, kind: &str) -> usize {
        self.data.get(kind).map_or(0, |buckets| buckets.len())
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(|buckets| buckets.is_empty())
    }

    /// Remove and return every bucket of the listed types. Types without
    /// buckets are left out of the result.
    pub fn take(&mut self, kinds: &[&str]) -> BTreeMap<String, Vec<Bucket>> {
        let mut taken = BTreeMap::new();
        for kind in kinds {
            if let Some(buckets) = self.data.remove(*kind) {
                if !buckets.is_empty() {
                    taken.insert(kind.to_string(), buckets.into_values().collect());
                }
            }
        }
        taken
    }
}
