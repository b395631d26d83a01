use crate::api::{record_id, Record};
use std::collections::HashMap;

/// Last-known payload of every record of one collection, keyed by id and
/// kept in arrival order.
#[derive(Clone, Debug, Default)]
pub struct RecordCache {
    records: HashMap<String, Record>,
    order: Vec<String>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache. Records without an id are skipped.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = Record>) {
        self.clear();
        for record in records {
            self.upsert(record);
        }
    }

    /// Insert or overwrite by id. Returns the id, or `None` if the record
    /// has none.
    pub fn upsert(&mut self, record: Record) -> Option<String> {
        let Some(id) = record_id(&record) else {
            log::warn!("Ignoring record without id: {:?}", record);
            return None;
        };
        if self.records.insert(id.clone(), record).is_none() {
            self.order.push(id.clone());
        }
        Some(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let removed = self.records.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> Vec<Record> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn upsert_keeps_first_position() {
        let mut cache = RecordCache::new();
        cache.upsert(rec(json!({"_id": "a", "n": 1})));
        cache.upsert(rec(json!({"_id": "b", "n": 2})));
        cache.upsert(rec(json!({"_id": "a", "n": 3})));

        assert_eq!(cache.ids(), ["a", "b"]);
        assert_eq!(cache.get("a").unwrap()["n"], json!(3));
    }

    #[test]
    fn same_update_twice_is_idempotent() {
        let mut once = RecordCache::new();
        once.upsert(rec(json!({"_id": "a", "n": 1})));
        let mut twice = once.clone();

        let update = rec(json!({"_id": "a", "n": 2}));
        once.upsert(update.clone());
        twice.upsert(update.clone());
        twice.upsert(update);

        assert_eq!(once.records(), twice.records());
    }

    #[test]
    fn replace_all_drops_previous_entries() {
        let mut cache = RecordCache::new();
        cache.upsert(rec(json!({"_id": "old"})));
        cache.replace_all(vec![rec(json!({"_id": "a"})), rec(json!({"name": "no id"}))]);

        assert!(!cache.contains("old"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_absent_is_none() {
        let mut cache = RecordCache::new();
        cache.upsert(rec(json!({"_id": 7})));
        assert!(cache.remove("8").is_none());
        assert!(cache.remove("7").is_some());
        assert!(cache.is_empty());
        assert!(cache.ids().is_empty());
    }
}
