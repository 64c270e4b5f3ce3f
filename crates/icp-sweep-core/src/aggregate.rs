//! Entity aggregation.
//!
//! Groups canonical assets by the organization responsible for them. Buckets
//! are kept in first-seen order; inside a bucket the IP, URL, and port sets
//! are sorted and deduplicated while the asset list keeps source order.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::models::CanonicalAsset;

/// Everything discovered for one responsible entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityBucket {
    pub name: String,
    pub ips: BTreeSet<String>,
    pub urls: BTreeSet<String>,
    pub ports: BTreeSet<String>,
    pub assets: Vec<CanonicalAsset>,
}

impl EntityBucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build a single bucket from `assets` regardless of their entity.
    pub fn collect<I>(name: &str, assets: I) -> Self
    where
        I: IntoIterator<Item = CanonicalAsset>,
    {
        let mut bucket = Self::new(name);
        for asset in assets {
            bucket.push(asset);
        }
        bucket
    }

    fn push(&mut self, asset: CanonicalAsset) {
        if !asset.ip.is_empty() {
            self.ips.insert(asset.ip.clone());
        }
        if !asset.url.is_empty() {
            self.urls.insert(asset.url.clone());
        }
        if !asset.port.is_empty() {
            self.ports.insert(asset.port.clone());
        }
        self.assets.push(asset);
    }
}

/// Entity buckets in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct EntityBuckets {
    buckets: Vec<EntityBucket>,
    index: HashMap<String, usize>,
}

impl EntityBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route an asset into its entity's bucket, creating it if needed.
    pub fn add(&mut self, asset: CanonicalAsset) {
        let key = asset.entity_key().to_string();
        let pos = match self.index.get(&key) {
            Some(&pos) => pos,
            None => {
                self.buckets.push(EntityBucket::new(&key));
                self.index.insert(key, self.buckets.len() - 1);
                self.buckets.len() - 1
            }
        };
        self.buckets[pos].push(asset);
    }

    pub fn get(&self, name: &str) -> Option<&EntityBucket> {
        self.index.get(name).map(|&pos| &self.buckets[pos])
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityBucket> {
        self.buckets.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.buckets.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn into_vec(self) -> Vec<EntityBucket> {
        self.buckets
    }
}

impl<'a> IntoIterator for &'a EntityBuckets {
    type Item = &'a EntityBucket;
    type IntoIter = std::slice::Iter<'a, EntityBucket>;

    fn into_iter(self) -> Self::IntoIter {
        self.buckets.iter()
    }
}

/// Group assets by responsible entity.
pub fn aggregate<I>(assets: I) -> EntityBuckets
where
    I: IntoIterator<Item = CanonicalAsset>,
{
    let mut buckets = EntityBuckets::new();
    for asset in assets {
        buckets.add(asset);
    }
    buckets
}
