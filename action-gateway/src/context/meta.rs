use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::json_ext::Object;
use crate::json_ext::Value;

/// Free form entries attached to a request.
///
/// Entries are shared by every clone, which lets a guard predicate or a field resolver hand
/// data to the steps that run after it. Value sources read them under `#.meta`.
#[derive(Clone, Debug, Default)]
pub struct Meta {
    entries: Arc<DashMap<String, Value>>,
}

impl Meta {
    /// Reads an entry as `V`. A missing entry is `Ok(None)`.
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>, serde_json::Error>
    where
        K: AsRef<str>,
        V: DeserializeOwned,
    {
        match self.entries.get(key.as_ref()) {
            Some(entry) => serde_json::from_value(entry.value().clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Stores an entry, returning the value it replaced.
    pub fn insert<K, V>(&self, key: K, value: V) -> Result<Option<Value>, serde_json::Error>
    where
        K: Into<String>,
        V: Serialize,
    {
        let value = serde_json::to_value(value)?;
        Ok(self.entries.insert(key.into(), value))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, in no particular order.
    pub fn to_object(&self) -> Object {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entries_are_shared_by_clones() {
        let meta = Meta::default();
        let handed_out = meta.clone();
        handed_out.insert("tenant", "acme").unwrap();

        assert!(meta.contains_key("tenant"));
        assert_eq!(meta.get::<_, String>("tenant").unwrap(), Some("acme".to_string()));
        assert_eq!(meta.get::<_, String>("missing").unwrap(), None);
    }

    #[test]
    fn insert_returns_the_replaced_value() {
        let meta = Meta::default();
        assert_eq!(meta.insert("attempt", 1).unwrap(), None);
        assert_eq!(meta.insert("attempt", 2).unwrap(), Some(json!(1)));
        assert_eq!(meta.to_object(), json!({"attempt": 2}).as_object().cloned().unwrap());
    }

    #[test]
    fn typed_reads_fail_on_mismatch() {
        let meta = Meta::default();
        meta.insert("roles", ["admin"]).unwrap();

        assert!(meta.get::<_, u64>("roles").is_err());
        assert_eq!(meta.remove("roles"), Some(json!(["admin"])));
        assert!(meta.is_empty());
    }
}
